use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use zone_ipc::{EventPoll, IpcError, MethodId, PeerId, Service};

use crate::config::{validate_zone_id, DaemonConfig, ZoneConfig};
use crate::error::ZoneError;
use crate::store::Store;
use crate::zone::{RequestedState, SchedulerLevel, Zone};

/// In-zone helpers announce themselves with their zone id.
pub const ZONE_HELLO_METHOD: MethodId = 1;

const RECONNECT_RETRIES: u32 = 10;
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

struct Shared {
    config: DaemonConfig,
    store: Arc<Store>,
    zones: Mutex<HashMap<String, Arc<Zone>>>,
    foreground: Mutex<Option<String>>,
    /// connected in-zone helpers
    peers: Mutex<HashMap<PeerId, String>>,
    /// one reconnect worker per troubled zone, joined before destroy
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
}

/// Owns every zone, elects the single foreground zone, and tracks in-zone
/// helper connections over the runtime socket.
pub struct ZonesManager {
    shared: Arc<Shared>,
    service: Mutex<Service>,
}

impl ZonesManager {
    pub fn new(poll: Arc<EventPoll>, config: DaemonConfig) -> Result<Self, ZoneError> {
        let store = Arc::new(Store::open(&config.db_path)?);
        let shared = Arc::new(Shared {
            config,
            store,
            zones: Mutex::new(HashMap::new()),
            foreground: Mutex::new(None),
            peers: Mutex::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
        });

        let mut service = Service::new(poll, &shared.config.runtime_socket)?;
        {
            let hello_shared = Arc::downgrade(&shared);
            service.set_method(
                ZONE_HELLO_METHOD,
                move |peer_id, zone_id: String, result: zone_ipc::MethodResult<()>| {
                    let Some(shared) = hello_shared.upgrade() else {
                        return Err(IpcError::Closing);
                    };
                    if !shared.zones.lock().unwrap().contains_key(&zone_id) {
                        result.set_error(libc::ENOENT, &format!("unknown zone {}", zone_id));
                        return Ok(());
                    }
                    info!("zone {} connected as {}", zone_id, peer_id);
                    shared.peers.lock().unwrap().insert(peer_id, zone_id);
                    result.set_void();
                    Ok(())
                },
            );
        }
        {
            let removed_shared = Arc::downgrade(&shared);
            service.set_removed_peer_callback(Arc::new(move |peer_id, _fd| {
                if let Some(shared) = removed_shared.upgrade() {
                    Shared::on_peer_removed(&shared, peer_id);
                }
            }));
        }
        service.start()?;

        Ok(ZonesManager {
            shared,
            service: Mutex::new(service),
        })
    }

    /// Loads the zone definition from `<zones_path>/<id>/config.json` and
    /// registers the zone. Does not start it.
    pub fn create_zone(&self, id: &str) -> Result<(), ZoneError> {
        validate_zone_id(id)?;
        let mut zones = self.shared.zones.lock().unwrap();
        if zones.contains_key(id) {
            return Err(ZoneError::Config(format!("zone {} already exists", id)));
        }

        let config_path = self.shared.config.zones_path.join(id).join("config.json");
        let config = if config_path.exists() {
            ZoneConfig::load(&config_path)?
        } else {
            ZoneConfig::default()
        };

        let zone = Zone::new(
            id.to_string(),
            config,
            &self.shared.config.zones_path,
            &self.shared.config.run_mount_point_prefix,
            Arc::clone(&self.shared.store),
        )?;
        zones.insert(id.to_string(), Arc::new(zone));
        info!("zone {} defined", id);
        Ok(())
    }

    pub fn zone_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.zones.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn zone(&self, id: &str) -> Result<Arc<Zone>, ZoneError> {
        self.shared.zone(id)
    }

    fn vt_held_by_other(&self, id: &str, vt: i32) -> bool {
        if vt < 0 {
            return false;
        }
        let zones = self.shared.zones.lock().unwrap();
        zones
            .values()
            .any(|other| other.id() != id && other.vt() == vt && !other.is_stopped())
    }

    fn refuse_vt(&self, id: &str, vt: i32) -> Result<(), ZoneError> {
        if self.vt_held_by_other(id, vt) {
            return Err(ZoneError::Operation(format!(
                "vt{} is held by another zone",
                vt
            )));
        }
        Ok(())
    }

    /// Refuses to start a zone whose VT is held by another non-stopped zone.
    pub fn start_zone(&self, id: &str) -> Result<(), ZoneError> {
        let zone = self.shared.zone(id)?;
        self.refuse_vt(id, zone.vt())?;
        zone.start()
    }

    /// Drives one zone to its persisted requested state. The VT-uniqueness
    /// check applies here exactly as it does to an explicit start.
    pub fn restore_zone(&self, id: &str) -> Result<(), ZoneError> {
        let zone = self.shared.zone(id)?;
        if zone.requested_state() != RequestedState::Stopped {
            self.refuse_vt(id, zone.vt())?;
        }
        zone.restore()
    }

    pub fn stop_zone(&self, id: &str, save_state: bool) -> Result<(), ZoneError> {
        let zone = self.shared.zone(id)?;
        self.clear_foreground(id);
        zone.stop(save_state)
    }

    /// Stops and forgets a zone; its persisted records are purged.
    pub fn destroy_zone(&self, id: &str) -> Result<(), ZoneError> {
        // a reconnect worker may still hold the zone; wait for it first
        let worker = self.shared.workers.lock().unwrap().remove(id);
        if let Some(worker) = worker {
            let _ = worker.join();
        }

        let zone = self.shared.zone(id)?;
        self.clear_foreground(id);
        zone.stop(false)?;
        self.shared.store.remove_prefix(&format!("zone.{}.", id))?;
        self.shared.zones.lock().unwrap().remove(id);
        info!("zone {} destroyed", id);
        Ok(())
    }

    fn clear_foreground(&self, id: &str) {
        let mut foreground = self.shared.foreground.lock().unwrap();
        if foreground.as_deref() == Some(id) {
            *foreground = None;
        }
    }

    /// Elects `id` the foreground zone: the previous holder drops to the
    /// background quota, the new one gets the foreground quota and, when
    /// configured, its VT activated.
    pub fn set_active(&self, id: &str) -> Result<(), ZoneError> {
        let zone = self.shared.zone(id)?;
        if !zone.is_running() {
            return Err(ZoneError::Operation(format!("zone {} is not running", id)));
        }

        let previous = {
            let foreground = self.shared.foreground.lock().unwrap();
            foreground.clone()
        };
        if previous.as_deref() == Some(id) {
            return Ok(());
        }

        if let Some(previous) = previous {
            if let Ok(old) = self.shared.zone(&previous) {
                if let Err(e) = old.set_scheduler_level(SchedulerLevel::Background) {
                    warn!("demoting {} failed: {}", previous, e);
                }
            }
        }

        zone.set_scheduler_level(SchedulerLevel::Foreground)?;
        if !zone.activate_vt() {
            warn!("activating vt for {} failed", id);
        }
        *self.shared.foreground.lock().unwrap() = Some(id.to_string());
        info!("zone {} is now the foreground zone", id);
        Ok(())
    }

    pub fn foreground_zone(&self) -> Option<String> {
        self.shared.foreground.lock().unwrap().clone()
    }

    /// Defines every zone found under the zones path and drives each to its
    /// persisted requested state; the most privileged running zone becomes
    /// the foreground.
    pub fn restore_all(&self) -> Result<(), ZoneError> {
        let entries = match std::fs::read_dir(&self.shared.config.zones_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            if let Err(e) = self.create_zone(&id) {
                error!("defining zone {} failed: {}", id, e);
            }
        }

        let snapshot: Vec<(String, RequestedState, i32)> = {
            let zones = self.shared.zones.lock().unwrap();
            let mut ids: Vec<&String> = zones.keys().collect();
            ids.sort();
            ids.iter()
                .map(|id| {
                    let zone = &zones[*id];
                    (zone.id().to_string(), zone.requested_state(), zone.vt())
                })
                .collect()
        };
        let plan = plan_restore(&snapshot);
        for id in &plan.refused {
            error!("not restoring zone {}: its vt is claimed by another zone", id);
        }
        for id in &plan.restore {
            if let Err(e) = self.restore_zone(id) {
                error!("restoring zone {} failed: {}", id, e);
            }
        }

        let focus = {
            let zones = self.shared.zones.lock().unwrap();
            zones
                .values()
                .filter(|z| z.is_running())
                .min_by_key(|z| z.privilege())
                .map(|z| z.id().to_string())
        };
        if let Some(focus) = focus {
            if let Err(e) = self.set_active(&focus) {
                warn!("focusing {} failed: {}", focus, e);
            }
        }
        Ok(())
    }

    /// Stops everything, least important zones first, then the service.
    pub fn shutdown(&self) {
        info!("stopping all zones");
        let mut order: Vec<(String, i32)> = {
            let zones = self.shared.zones.lock().unwrap();
            zones
                .values()
                .map(|z| (z.id().to_string(), z.privilege()))
                .collect()
        };
        // highest privilege value = least important, goes first
        order.sort_by_key(|(_, privilege)| std::cmp::Reverse(*privilege));
        for (id, _) in order {
            if let Err(e) = self.stop_zone(&id, true) {
                error!("stopping zone {} failed: {}", id, e);
            }
        }

        let workers: Vec<JoinHandle<()>> = {
            let mut map = self.shared.workers.lock().unwrap();
            map.drain().map(|(_, handle)| handle).collect()
        };
        for worker in workers {
            let _ = worker.join();
        }

        self.service.lock().unwrap().stop(true);
    }
}

impl Shared {
    fn zone(&self, id: &str) -> Result<Arc<Zone>, ZoneError> {
        self.zones
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ZoneError::Operation(format!("no such zone: {}", id)))
    }

    /// A helper connection dropped: try to see it come back from a detached
    /// worker, and stop the zone if its runtime directory is gone.
    fn on_peer_removed(shared: &Arc<Shared>, peer_id: PeerId) {
        let zone_id = match shared.peers.lock().unwrap().remove(&peer_id) {
            Some(zone_id) => zone_id,
            None => return,
        };
        warn!("lost connection to zone {}", zone_id);

        let weak = Arc::downgrade(shared);
        let worker_id = zone_id.clone();
        let handle = std::thread::spawn(move || reconnect_worker(weak, worker_id));
        // runs on the processor thread, so a stale worker is detached rather
        // than joined here; destroy and shutdown still join the latest one
        drop(shared.workers.lock().unwrap().insert(zone_id, handle));
    }

    fn run_dir(&self, zone_id: &str) -> PathBuf {
        self.config.run_mount_point_prefix.join(zone_id)
    }
}

struct RestorePlan {
    restore: Vec<String>,
    refused: Vec<String>,
}

/// A VT may only be claimed once across everything about to come up: the
/// first claimant wins, later ones are refused before any start is
/// attempted. Zones staying stopped claim nothing.
fn plan_restore(zones: &[(String, RequestedState, i32)]) -> RestorePlan {
    let mut claimed: HashSet<i32> = HashSet::new();
    let mut plan = RestorePlan {
        restore: Vec::new(),
        refused: Vec::new(),
    };
    for (id, requested, vt) in zones {
        if *requested != RequestedState::Stopped && *vt >= 0 && !claimed.insert(*vt) {
            plan.refused.push(id.clone());
        } else {
            plan.restore.push(id.clone());
        }
    }
    plan
}

fn reconnect_worker(weak: Weak<Shared>, zone_id: String) {
    for _ in 0..RECONNECT_RETRIES {
        std::thread::sleep(RECONNECT_DELAY);
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let reconnected = shared
            .peers
            .lock()
            .unwrap()
            .values()
            .any(|id| *id == zone_id);
        if reconnected {
            debug!("zone {} reconnected", zone_id);
            return;
        }
        if !shared.run_dir(&zone_id).exists() {
            // runtime dir gone: the zone is not coming back
            break;
        }
    }

    let Some(shared) = weak.upgrade() else {
        return;
    };
    warn!("zone {} did not reconnect, stopping it", zone_id);
    if let Ok(zone) = shared.zone(&zone_id) {
        if let Err(e) = zone.stop(true) {
            error!("stopping unresponsive zone {} failed: {}", zone_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zone_ipc::ThreadDispatcher;

    fn manager(dir: &tempfile::TempDir) -> (ZonesManager, ThreadDispatcher) {
        let poll = Arc::new(EventPoll::new().unwrap());
        let dispatcher = ThreadDispatcher::new(Arc::clone(&poll)).unwrap();
        let config = DaemonConfig {
            zones_path: dir.path().join("zones"),
            db_path: dir.path().join("state.json"),
            run_mount_point_prefix: dir.path().join("run"),
            runtime_socket: dir.path().join("daemon.socket"),
            run_as: "zoned".to_string(),
        };
        (ZonesManager::new(poll, config).unwrap(), dispatcher)
    }

    #[test]
    fn zones_register_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _dispatcher) = manager(&dir);
        manager.create_zone("alpha").unwrap();
        manager.create_zone("beta").unwrap();
        assert!(manager.create_zone("alpha").is_err());
        assert_eq!(manager.zone_ids(), vec!["alpha", "beta"]);
        manager.shutdown();
    }

    #[test]
    fn bad_zone_ids_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _dispatcher) = manager(&dir);
        assert!(manager.create_zone("../escape").is_err());
        assert!(manager.create_zone("").is_err());
        manager.shutdown();
    }

    #[test]
    fn foreground_requires_running_zone() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _dispatcher) = manager(&dir);
        manager.create_zone("idle").unwrap();
        assert!(manager.set_active("idle").is_err());
        assert_eq!(manager.foreground_zone(), None);
        manager.shutdown();
    }

    #[test]
    fn restore_plan_lets_only_one_zone_claim_a_vt() {
        let zones = vec![
            ("a".to_string(), RequestedState::Running, 4),
            ("b".to_string(), RequestedState::Running, 4),
            ("c".to_string(), RequestedState::Paused, 5),
            ("d".to_string(), RequestedState::Stopped, 4),
            ("e".to_string(), RequestedState::Running, -1),
        ];
        let plan = plan_restore(&zones);
        assert_eq!(plan.restore, vec!["a", "c", "d", "e"]);
        assert_eq!(plan.refused, vec!["b"]);
    }

    #[test]
    fn paused_zones_claim_their_vt_too() {
        let zones = vec![
            ("a".to_string(), RequestedState::Paused, 7),
            ("b".to_string(), RequestedState::Running, 7),
        ];
        let plan = plan_restore(&zones);
        assert_eq!(plan.restore, vec!["a"]);
        assert_eq!(plan.refused, vec!["b"]);
    }

    // needs root: real zone starts with rootfs bind mounts and cgroups
    #[test]
    #[ignore]
    fn restart_restore_leaves_one_vt_holder_running() {
        use nix::mount::{mount, umount2, MntFlags, MsFlags};

        let dir = tempfile::tempdir().unwrap();
        let zones_path = dir.path().join("zones");
        for id in ["vta", "vtb"] {
            let rootfs = zones_path.join(id).join("rootfs");
            std::fs::create_dir_all(&rootfs).unwrap();
            mount(
                Some("/"),
                &rootfs,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )
            .unwrap();
            std::fs::write(
                zones_path.join(id).join("config.json"),
                r#"{"initWithArgs": ["/bin/sleep", "1000"], "vt": 63}"#,
            )
            .unwrap();
        }
        {
            let store = Store::open(dir.path().join("state.json")).unwrap();
            for id in ["vta", "vtb"] {
                store
                    .set(&crate::store::zone_key(id, "requestedState"), &"running")
                    .unwrap();
            }
        }

        let (manager, _dispatcher) = manager(&dir);
        manager.restore_all().unwrap();

        let running: Vec<String> = manager
            .zone_ids()
            .into_iter()
            .filter(|id| manager.zone(id).unwrap().is_running())
            .collect();
        assert_eq!(running.len(), 1);

        manager.shutdown();
        for id in ["vta", "vtb"] {
            umount2(&zones_path.join(id).join("rootfs"), MntFlags::MNT_DETACH).unwrap();
        }
    }

    #[test]
    fn destroy_purges_store_records() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _dispatcher) = manager(&dir);
        manager.create_zone("gone").unwrap();
        manager.destroy_zone("gone").unwrap();
        assert!(manager.zone("gone").is_err());
        assert_eq!(manager.zone_ids(), Vec::<String>::new());
        manager.shutdown();
    }
}
