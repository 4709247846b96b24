use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zone_runtime::attach::{self, AttachConfig};
use zone_runtime::container::{Container, ContainerConfig, ContainerState};
use zone_runtime::netdev::{self, InetAddr, MacVlanMode, NetDevKind, Route};
use zone_runtime::process::ExitResult;

use crate::config::{NetDevEntry, ZoneConfig};
use crate::error::ZoneError;
use crate::provision::{Declaration, Provisioner};
use crate::store::{zone_key, Store};
use crate::vt;

pub const DEFAULT_CPU_SHARES: u64 = 1024;
pub const DEFAULT_CPU_PERIOD_US: u64 = 100_000;

// the graphical stack activates the VT itself once it is up
const GRAPHICS_STACK_WAIT: Duration = Duration::from_millis(4000);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SchedulerLevel {
    Foreground,
    Background,
}

/// What the user last asked for; survives daemon restarts.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestedState {
    Stopped,
    Running,
    Paused,
}

struct Inner {
    container: Container,
    requested_state: RequestedState,
    /// zone-side netdev names created by us
    netdevs: Vec<String>,
    /// host-side veth ends, destroyed on stop
    host_veths: Vec<String>,
}

/// One zone: persistent definition plus the live lifecycle state machine.
/// All lifecycle transitions serialize on the inner mutex.
pub struct Zone {
    id: String,
    config: ZoneConfig,
    rootfs: PathBuf,
    run_mount_point: PathBuf,
    store: Arc<Store>,
    provision: Provisioner,
    inner: Mutex<Inner>,
}

pub(crate) fn validate_scheduler_params(period: u64, quota: i64) -> Result<(), ZoneError> {
    if !(1000..=1_000_000).contains(&period) {
        return Err(ZoneError::Config(format!("bad cpu period: {}", period)));
    }
    if quota != -1 && !(1000..=(u64::MAX / 1000) as i64).contains(&quota) {
        return Err(ZoneError::Config(format!("bad cpu quota: {}", quota)));
    }
    Ok(())
}

impl Zone {
    pub fn new(
        id: String,
        config: ZoneConfig,
        zones_path: &Path,
        run_mount_prefix: &Path,
        store: Arc<Store>,
    ) -> Result<Self, ZoneError> {
        debug!("{}: instantiating zone", id);
        config.validate()?;

        let zone_path = zones_path.join(&id);
        let rootfs = zone_path.join("rootfs");
        let run_mount_point = run_mount_prefix.join(&id);

        let requested_state = store
            .get::<RequestedState>(&zone_key(&id, "requestedState"))?
            .unwrap_or(RequestedState::Stopped);

        let provision = Provisioner::new(
            rootfs.clone(),
            Arc::clone(&store),
            &id,
            config.valid_link_prefixes.clone(),
        )?;

        let container = Container::new(ContainerConfig {
            name: id.clone(),
            rootfs: rootfs.clone(),
            namespaces: config.namespaces.clone(),
            uid_maps: config.uid_maps.clone(),
            gid_maps: config.gid_maps.clone(),
            hostname: config.hostname.clone(),
        });

        Ok(Zone {
            id,
            config,
            rootfs,
            run_mount_point,
            store,
            provision,
            inner: Mutex::new(Inner {
                container,
                requested_state,
                netdevs: Vec::new(),
                host_veths: Vec::new(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn privilege(&self) -> i32 {
        self.config.privilege
    }

    pub fn vt(&self) -> i32 {
        self.config.vt
    }

    pub fn root_path(&self) -> &Path {
        &self.rootfs
    }

    pub fn is_switch_to_default_after_timeout_allowed(&self) -> bool {
        self.config.switch_to_default_after_timeout
    }

    pub fn requested_state(&self) -> RequestedState {
        self.inner.lock().unwrap().requested_state
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().container.state() == ContainerState::Running
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().unwrap().container.state() == ContainerState::Stopped
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().unwrap().container.state() == ContainerState::Frozen
    }

    pub fn init_pid(&self) -> Option<i32> {
        self.inner.lock().unwrap().container.init_pid()
    }

    fn update_requested_state(
        &self,
        inner: &mut Inner,
        state: RequestedState,
    ) -> Result<(), ZoneError> {
        if inner.requested_state != state {
            debug!("{}: requested state -> {:?}", self.id, state);
            inner.requested_state = state;
            self.store
                .set(&zone_key(&self.id, "requestedState"), &state)?;
        }
        Ok(())
    }

    pub fn start(&self) -> Result<(), ZoneError> {
        let mut inner = self.inner.lock().unwrap();
        info!("{}: starting", self.id);

        self.update_requested_state(&mut inner, RequestedState::Running)?;
        self.provision.start()?;

        if inner.container.state() == ContainerState::Running {
            debug!("{}: already running", self.id);
            return Ok(());
        }

        self.mount_run_dir();
        inner.container.start(&self.config.init_with_args)?;

        if let Err(e) = self.setup_netdevs(&mut inner) {
            warn!("{}: network setup failed, stopping: {}", self.id, e);
            let _ = inner.container.stop();
            self.teardown(&mut inner);
            return Err(e);
        }

        // wait for the graphical stack; it activates the VT on its own
        if self.config.vt > 0 {
            std::thread::sleep(GRAPHICS_STACK_WAIT);
        }

        info!("{}: started", self.id);

        // increase cpu quota right away; the manager refocuses afterwards
        self.set_scheduler_level_locked(&mut inner, SchedulerLevel::Foreground)?;
        Ok(())
    }

    pub fn stop(&self, save_state: bool) -> Result<(), ZoneError> {
        let mut inner = self.inner.lock().unwrap();
        info!("{}: stopping", self.id);

        if save_state {
            self.update_requested_state(&mut inner, RequestedState::Stopped)?;
        }

        if inner.container.state() == ContainerState::Running {
            // boost the zone so the shutdown does not crawl in background quota
            if let Err(e) = self.set_scheduler_level_locked(&mut inner, SchedulerLevel::Foreground)
            {
                warn!("{}: could not boost for shutdown: {}", self.id, e);
            }
        }

        if inner.container.state() != ContainerState::Stopped {
            let timeout = Duration::from_secs(self.config.shutdown_timeout);
            let graceful = inner.container.shutdown(timeout)?;
            if !graceful {
                warn!("{}: graceful shutdown timed out, killing", self.id);
                inner.container.stop()?;
            }
        }

        self.teardown(&mut inner);
        info!("{}: stopped", self.id);
        Ok(())
    }

    fn teardown(&self, inner: &mut Inner) {
        for host_veth in inner.host_veths.drain(..) {
            if let Err(e) = netdev::destroy(&host_veth, 0) {
                debug!("{}: destroying {} failed: {}", self.id, host_veth, e);
            }
        }
        inner.netdevs.clear();
        // declarations always roll back on stop, saved state or not
        self.provision.stop();
        self.unmount_run_dir();
    }

    pub fn suspend(&self) -> Result<(), ZoneError> {
        let mut inner = self.inner.lock().unwrap();
        debug!("{}: pausing", self.id);
        inner.container.freeze()?;
        self.update_requested_state(&mut inner, RequestedState::Paused)?;
        debug!("{}: paused", self.id);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), ZoneError> {
        let mut inner = self.inner.lock().unwrap();
        debug!("{}: resuming", self.id);
        inner.container.thaw()?;
        self.update_requested_state(&mut inner, RequestedState::Running)?;
        debug!("{}: resumed", self.id);
        Ok(())
    }

    /// Drives the zone to its persisted requested state after a daemon
    /// restart.
    pub fn restore(&self) -> Result<(), ZoneError> {
        let requested = self.requested_state();
        debug!("{}: restoring to {:?}", self.id, requested);
        match requested {
            RequestedState::Running => self.start(),
            RequestedState::Stopped => Ok(()),
            RequestedState::Paused => {
                self.start()?;
                self.suspend()
            }
        }
    }

    pub fn set_scheduler_level(&self, level: SchedulerLevel) -> Result<(), ZoneError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.container.state() != ContainerState::Running {
            return Err(ZoneError::Operation(format!(
                "{}: scheduler level needs a running zone",
                self.id
            )));
        }
        self.set_scheduler_level_locked(&mut inner, level)
    }

    fn set_scheduler_level_locked(
        &self,
        inner: &mut Inner,
        level: SchedulerLevel,
    ) -> Result<(), ZoneError> {
        let quota = match level {
            SchedulerLevel::Foreground => self.config.cpu_quota_foreground,
            SchedulerLevel::Background => self.config.cpu_quota_background,
        };
        debug!("{}: scheduler -> {:?}", self.id, level);
        self.set_scheduler_params(inner, DEFAULT_CPU_SHARES, DEFAULT_CPU_PERIOD_US, quota)
    }

    fn set_scheduler_params(
        &self,
        inner: &mut Inner,
        shares: u64,
        period: u64,
        quota: i64,
    ) -> Result<(), ZoneError> {
        validate_scheduler_params(period, quota)?;
        let cpu = inner.container.cpu_cgroup();
        cpu.set_param("cpu.shares", &shares.to_string())?;
        cpu.set_param("cpu.cfs_period_us", &period.to_string())?;
        cpu.set_param("cpu.cfs_quota_us", &quota.to_string())?;
        Ok(())
    }

    pub fn scheduler_quota(&self) -> Result<i64, ZoneError> {
        let inner = self.inner.lock().unwrap();
        let raw = inner.container.cpu_cgroup().get_param("cpu.cfs_quota_us")?;
        raw.parse()
            .map_err(|_| ZoneError::Operation(format!("unreadable cpu quota: {:?}", raw)))
    }

    pub fn activate_vt(&self) -> bool {
        if self.config.vt >= 0 {
            return vt::activate_vt(self.config.vt);
        }
        true
    }

    fn setup_netdevs(&self, inner: &mut Inner) -> Result<(), ZoneError> {
        let init_pid = inner
            .container
            .init_pid()
            .ok_or_else(|| ZoneError::Operation("no init pid".to_string()))?;

        for entry in &self.config.netdevs {
            self.create_netdev(inner, init_pid, entry)?;
        }

        // convenience addressing straight from the zone definition
        if let (Some(ipv4), Some(first)) = (&self.config.ipv4, self.config.netdevs.first()) {
            let (ip, prefix) = netdev::parse_cidr(ipv4)?;
            netdev::add_ip(&first.name, init_pid, &InetAddr::new(ip, prefix))?;
            if let Some(gateway) = &self.config.ipv4_gateway {
                let gateway = gateway
                    .parse()
                    .map_err(|_| ZoneError::Config(format!("bad gateway: {:?}", gateway)))?;
                let route = Route {
                    destination: None,
                    gateway: Some(gateway),
                };
                netdev::add_route(&first.name, init_pid, &route)?;
            }
        }
        Ok(())
    }

    fn create_netdev(
        &self,
        inner: &mut Inner,
        init_pid: i32,
        entry: &NetDevEntry,
    ) -> Result<(), ZoneError> {
        match entry.kind {
            NetDevKind::Veth => {
                let bridge = entry.host_dev.as_deref().ok_or_else(|| {
                    ZoneError::Config(format!("veth {} needs a bridge", entry.name))
                })?;
                let host = netdev::create_veth(init_pid, &entry.name, bridge)?;
                inner.host_veths.push(host);
            }
            NetDevKind::MacVlan => {
                let master = entry.host_dev.as_deref().ok_or_else(|| {
                    ZoneError::Config(format!("macvlan {} needs a master", entry.name))
                })?;
                let mode = entry.mode.unwrap_or(MacVlanMode::Private);
                netdev::create_macvlan(init_pid, &entry.name, master, mode)?;
            }
            NetDevKind::Phys | NetDevKind::Move => {
                netdev::move_phys(init_pid, &entry.name)?;
            }
            NetDevKind::Bridge => {
                return Err(ZoneError::Config(format!(
                    "bridge {} cannot be attached to a zone",
                    entry.name
                )));
            }
        }
        inner.netdevs.push(entry.name.clone());

        for cidr in &entry.addrs {
            let (ip, prefix) = netdev::parse_cidr(cidr)?;
            netdev::add_ip(&entry.name, init_pid, &InetAddr::new(ip, prefix))?;
        }
        Ok(())
    }

    fn with_init_pid<T>(
        &self,
        op: impl FnOnce(i32) -> Result<T, ZoneError>,
    ) -> Result<T, ZoneError> {
        let pid = self
            .init_pid()
            .ok_or_else(|| ZoneError::Operation(format!("{}: not running", self.id)))?;
        op(pid)
    }

    pub fn create_netdev_veth(&self, zone_dev: &str, bridge: &str) -> Result<String, ZoneError> {
        let mut inner = self.inner.lock().unwrap();
        let pid = inner
            .container
            .init_pid()
            .ok_or_else(|| ZoneError::Operation(format!("{}: not running", self.id)))?;
        let host = netdev::create_veth(pid, zone_dev, bridge)?;
        inner.netdevs.push(zone_dev.to_string());
        inner.host_veths.push(host.clone());
        Ok(host)
    }

    pub fn create_netdev_macvlan(
        &self,
        zone_dev: &str,
        master: &str,
        mode: MacVlanMode,
    ) -> Result<(), ZoneError> {
        let mut inner = self.inner.lock().unwrap();
        let pid = inner
            .container
            .init_pid()
            .ok_or_else(|| ZoneError::Operation(format!("{}: not running", self.id)))?;
        netdev::create_macvlan(pid, zone_dev, master, mode)?;
        inner.netdevs.push(zone_dev.to_string());
        Ok(())
    }

    pub fn move_netdev(&self, dev: &str) -> Result<(), ZoneError> {
        self.with_init_pid(|pid| Ok(netdev::move_phys(pid, dev)?))
    }

    pub fn destroy_netdev(&self, dev: &str) -> Result<(), ZoneError> {
        let mut inner = self.inner.lock().unwrap();
        let pid = inner
            .container
            .init_pid()
            .ok_or_else(|| ZoneError::Operation(format!("{}: not running", self.id)))?;
        netdev::destroy(dev, pid)?;
        inner.netdevs.retain(|name| name != dev);
        Ok(())
    }

    pub fn netdev_list(&self) -> Result<Vec<String>, ZoneError> {
        self.with_init_pid(|pid| Ok(netdev::list(pid)?))
    }

    pub fn netdev_attrs(&self, dev: &str) -> Result<netdev::Attrs, ZoneError> {
        self.with_init_pid(|pid| Ok(netdev::get_attrs(dev, pid)?))
    }

    pub fn set_netdev_attrs(&self, dev: &str, attrs: &netdev::Attrs) -> Result<(), ZoneError> {
        self.with_init_pid(|pid| Ok(netdev::set_attrs(dev, pid, attrs)?))
    }

    pub fn delete_netdev_ip(&self, dev: &str, cidr: &str) -> Result<(), ZoneError> {
        self.with_init_pid(|pid| Ok(netdev::del_ip(dev, pid, cidr)?))
    }

    /// Runs a command inside the zone and waits for it.
    pub fn attach(
        &self,
        argv: Vec<String>,
        uid: u32,
        gid: u32,
        workdir: String,
        env_to_keep: Vec<String>,
        env_to_set: Vec<(String, String)>,
    ) -> Result<ExitResult, ZoneError> {
        let init_pid = self
            .init_pid()
            .ok_or_else(|| ZoneError::Operation(format!("{}: not running", self.id)))?;
        let config = AttachConfig {
            argv,
            init_pid,
            namespaces: self.config.namespaces.clone(),
            uid,
            gid,
            supplementary_gids: vec![gid],
            caps_to_keep: 0,
            workdir,
            env_to_keep,
            env_to_set,
            has_tty: false,
        };
        Ok(attach::attach(&config, None)?)
    }

    pub fn declare(&self, declaration: Declaration) -> Result<String, ZoneError> {
        self.provision.declare(declaration)
    }

    pub fn declarations(&self) -> Vec<String> {
        self.provision.list()
    }

    pub fn remove_declaration(&self, id: &str) -> Result<(), ZoneError> {
        self.provision.remove(id)
    }

    /// Runtime socket directory: a small tmpfs while the zone runs.
    fn mount_run_dir(&self) {
        if let Err(e) = std::fs::create_dir_all(&self.run_mount_point) {
            warn!("{}: run dir creation failed: {}", self.id, e);
            return;
        }
        let outcome = mount(
            Some("tmpfs"),
            &self.run_mount_point,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            Some("mode=0755"),
        );
        if let Err(e) = outcome {
            // fine on development hosts without privileges
            debug!("{}: run tmpfs mount failed: {}", self.id, e);
        }
    }

    fn unmount_run_dir(&self) {
        if let Err(e) = umount2(&self.run_mount_point, MntFlags::MNT_DETACH) {
            debug!("{}: run tmpfs unmount failed: {}", self.id, e);
        }
        if let Err(e) = std::fs::remove_dir(&self.run_mount_point) {
            debug!("{}: run dir removal failed: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_constraints() {
        assert!(validate_scheduler_params(100_000, -1).is_ok());
        assert!(validate_scheduler_params(100_000, 50_000).is_ok());
        assert!(validate_scheduler_params(999, -1).is_err());
        assert!(validate_scheduler_params(1_000_001, -1).is_err());
        assert!(validate_scheduler_params(100_000, 0).is_err());
        assert!(validate_scheduler_params(100_000, 999).is_err());
        assert!(validate_scheduler_params(100_000, -2).is_err());
    }

    #[test]
    fn requested_state_defaults_to_stopped_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("state.json")).unwrap());
        let zone = Zone::new(
            "web".to_string(),
            ZoneConfig::default(),
            dir.path(),
            &dir.path().join("run"),
            Arc::clone(&store),
        )
        .unwrap();
        assert_eq!(zone.requested_state(), RequestedState::Stopped);

        {
            let mut inner = zone.inner.lock().unwrap();
            zone.update_requested_state(&mut inner, RequestedState::Running)
                .unwrap();
        }
        let reloaded: Option<RequestedState> =
            store.get(&zone_key("web", "requestedState")).unwrap();
        assert_eq!(reloaded, Some(RequestedState::Running));
    }

    // needs root: real zone start plus the cpu cgroup hierarchy
    #[test]
    #[ignore]
    fn scheduler_levels_switch_cpu_quota() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("state.json")).unwrap());
        let rootfs = dir.path().join("sched/rootfs");
        std::fs::create_dir_all(&rootfs).unwrap();
        mount(
            Some("/"),
            &rootfs,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .unwrap();

        let mut config = ZoneConfig::default();
        config.init_with_args = vec!["/bin/sleep".to_string(), "1000".to_string()];
        config.cpu_quota_foreground = 50_000;
        config.cpu_quota_background = 10_000;

        let zone = Zone::new(
            "sched".to_string(),
            config,
            dir.path(),
            &dir.path().join("run"),
            store,
        )
        .unwrap();
        zone.start().unwrap();

        zone.set_scheduler_level(SchedulerLevel::Background).unwrap();
        assert_eq!(zone.scheduler_quota().unwrap(), 10_000);
        zone.set_scheduler_level(SchedulerLevel::Foreground).unwrap();
        assert_eq!(zone.scheduler_quota().unwrap(), 50_000);

        zone.stop(true).unwrap();
        umount2(&rootfs, MntFlags::MNT_DETACH).unwrap();
    }

    #[test]
    fn fresh_zone_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("state.json")).unwrap());
        let zone = Zone::new(
            "idle".to_string(),
            ZoneConfig::default(),
            dir.path(),
            &dir.path().join("run"),
            store,
        )
        .unwrap();
        assert!(zone.is_stopped());
        assert!(!zone.is_running());
        assert_eq!(zone.init_pid(), None);
    }
}
