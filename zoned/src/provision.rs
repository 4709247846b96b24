use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ZoneError;
use crate::store::{zone_key, Store};

/// A declared piece of zone filesystem state, applied on start and rolled
/// back on stop.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Declaration {
    File {
        path: String,
        mode: u32,
    },
    Mount {
        source: String,
        target: String,
        fstype: String,
        flags: u64,
        data: String,
    },
    Link {
        source: String,
        target: String,
    },
}

impl Declaration {
    pub fn id(&self) -> String {
        match self {
            Declaration::File { path, .. } => format!("file {}", path),
            Declaration::Mount { source, target, .. } => format!("mount {} {}", source, target),
            Declaration::Link { source, target } => format!("link {} {}", source, target),
        }
    }

    fn target_in_rootfs(&self, rootfs: &Path) -> Result<PathBuf, ZoneError> {
        let target = match self {
            Declaration::File { path, .. } => path,
            Declaration::Mount { target, .. } => target,
            Declaration::Link { target, .. } => target,
        };
        let relative = target.strip_prefix('/').ok_or_else(|| {
            ZoneError::Provision(format!("target must be absolute: {:?}", target))
        })?;
        Ok(rootfs.join(relative))
    }
}

/// Per-zone declarations, persisted beside the zone's dynamic state.
pub struct Provisioner {
    rootfs: PathBuf,
    store: Arc<Store>,
    store_key: String,
    valid_link_prefixes: Vec<String>,
    declarations: Mutex<Vec<Declaration>>,
    applied: Mutex<Vec<Declaration>>,
}

impl Provisioner {
    pub fn new(
        rootfs: impl Into<PathBuf>,
        store: Arc<Store>,
        zone_id: &str,
        valid_link_prefixes: Vec<String>,
    ) -> Result<Self, ZoneError> {
        let store_key = zone_key(zone_id, "declarations");
        let declarations = store.get::<Vec<Declaration>>(&store_key)?.unwrap_or_default();
        Ok(Provisioner {
            rootfs: rootfs.into(),
            store,
            store_key,
            valid_link_prefixes,
            declarations: Mutex::new(declarations),
            applied: Mutex::new(Vec::new()),
        })
    }

    /// Re-declaring an existing id is an error.
    pub fn declare(&self, declaration: Declaration) -> Result<String, ZoneError> {
        if let Declaration::Link { source, .. } = &declaration {
            let allowed = self
                .valid_link_prefixes
                .iter()
                .any(|prefix| source.starts_with(prefix));
            if !allowed {
                return Err(ZoneError::Provision(format!(
                    "link source not permitted: {}",
                    source
                )));
            }
        }

        let id = declaration.id();
        let mut declarations = self.declarations.lock().unwrap();
        if declarations.iter().any(|d| d.id() == id) {
            return Err(ZoneError::Provision(format!(
                "declaration already exists: {}",
                id
            )));
        }
        declarations.push(declaration);
        self.store.set(&self.store_key, &*declarations)?;
        Ok(id)
    }

    /// Removing an id that was never declared is an error.
    pub fn remove(&self, id: &str) -> Result<(), ZoneError> {
        let mut declarations = self.declarations.lock().unwrap();
        let index = declarations
            .iter()
            .position(|d| d.id() == id)
            .ok_or_else(|| ZoneError::Provision(format!("no such declaration: {}", id)))?;
        declarations.remove(index);
        if declarations.is_empty() {
            // the last declaration takes the persisted record with it
            self.store.remove(&self.store_key)?;
        } else {
            self.store.set(&self.store_key, &*declarations)?;
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<String> {
        self.declarations
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.id())
            .collect()
    }

    /// Applies all declarations; ones already applied stay applied. A
    /// failure rolls back what this call had applied so far.
    pub fn start(&self) -> Result<(), ZoneError> {
        let declarations = self.declarations.lock().unwrap().clone();
        let mut applied = self.applied.lock().unwrap();

        let mut fresh: Vec<Declaration> = Vec::new();
        for declaration in declarations {
            if applied.contains(&declaration) {
                continue;
            }
            if let Err(e) = self.apply(&declaration) {
                for undo in fresh.iter().rev() {
                    if let Err(rollback) = self.rollback(undo) {
                        warn!("rollback of {} failed: {}", undo.id(), rollback);
                    }
                }
                return Err(e);
            }
            fresh.push(declaration);
        }
        applied.extend(fresh);
        Ok(())
    }

    /// Rolls everything back, in reverse application order.
    pub fn stop(&self) {
        let mut applied = self.applied.lock().unwrap();
        for declaration in applied.iter().rev() {
            if let Err(e) = self.rollback(declaration) {
                warn!("rollback of {} failed: {}", declaration.id(), e);
            }
        }
        applied.clear();
    }

    fn apply(&self, declaration: &Declaration) -> Result<(), ZoneError> {
        let target = declaration.target_in_rootfs(&self.rootfs)?;
        debug!("provisioning {}", declaration.id());
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match declaration {
            Declaration::File { mode, .. } => {
                std::fs::File::create(&target)?;
                std::fs::set_permissions(&target, std::fs::Permissions::from_mode(*mode))?;
            }
            Declaration::Mount {
                source,
                fstype,
                flags,
                data,
                ..
            } => {
                std::fs::create_dir_all(&target)?;
                mount(
                    Some(source.as_str()),
                    &target,
                    Some(fstype.as_str()),
                    MsFlags::from_bits_truncate(*flags),
                    if data.is_empty() {
                        None
                    } else {
                        Some(data.as_str())
                    },
                )
                .map_err(|e| {
                    ZoneError::Provision(format!("mounting {}: {}", declaration.id(), e))
                })?;
            }
            Declaration::Link { source, .. } => {
                std::fs::hard_link(source, &target)?;
            }
        }
        Ok(())
    }

    fn rollback(&self, declaration: &Declaration) -> Result<(), ZoneError> {
        let target = declaration.target_in_rootfs(&self.rootfs)?;
        match declaration {
            Declaration::File { .. } | Declaration::Link { .. } => {
                std::fs::remove_file(&target)?;
            }
            Declaration::Mount { .. } => {
                umount2(&target, MntFlags::MNT_DETACH)
                    .map_err(|e| ZoneError::Provision(format!("unmounting: {}", e)))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provisioner(dir: &tempfile::TempDir) -> Provisioner {
        let store = Arc::new(Store::open(dir.path().join("state.json")).unwrap());
        Provisioner::new(
            dir.path().join("rootfs"),
            store,
            "test",
            vec!["/tmp".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn file_applies_and_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let prov = provisioner(&dir);
        prov.declare(Declaration::File {
            path: "/etc/motd".to_string(),
            mode: 0o644,
        })
        .unwrap();

        prov.start().unwrap();
        let target = dir.path().join("rootfs/etc/motd");
        assert!(target.is_file());

        // idempotent: the second start changes nothing
        prov.start().unwrap();
        assert!(target.is_file());

        prov.stop();
        assert!(!target.exists());
    }

    #[test]
    fn duplicate_declaration_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let prov = provisioner(&dir);
        let declaration = Declaration::File {
            path: "/etc/motd".to_string(),
            mode: 0o644,
        };
        prov.declare(declaration.clone()).unwrap();
        assert!(matches!(
            prov.declare(declaration),
            Err(ZoneError::Provision(_))
        ));
    }

    #[test]
    fn removing_unknown_declaration_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let prov = provisioner(&dir);
        assert!(matches!(
            prov.remove("file /never"),
            Err(ZoneError::Provision(_))
        ));
    }

    #[test]
    fn link_sources_must_match_a_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let prov = provisioner(&dir);
        assert!(matches!(
            prov.declare(Declaration::Link {
                source: "/etc/shadow".to_string(),
                target: "/stolen".to_string(),
            }),
            Err(ZoneError::Provision(_))
        ));
        prov.declare(Declaration::Link {
            source: "/tmp/shared".to_string(),
            target: "/shared".to_string(),
        })
        .unwrap();
    }

    #[test]
    fn removing_the_last_declaration_drops_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("state.json")).unwrap());
        let prov = Provisioner::new(
            dir.path().join("rootfs"),
            Arc::clone(&store),
            "test",
            vec![],
        )
        .unwrap();

        let id = prov
            .declare(Declaration::File {
                path: "/etc/motd".to_string(),
                mode: 0o644,
            })
            .unwrap();
        let key = crate::store::zone_key("test", "declarations");
        assert!(store.get::<Vec<Declaration>>(&key).unwrap().is_some());

        prov.remove(&id).unwrap();
        assert!(prov.list().is_empty());
        assert_eq!(store.get::<Vec<Declaration>>(&key).unwrap(), None);
    }

    #[test]
    fn declarations_persist_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("state.json")).unwrap());
        {
            let prov = Provisioner::new(
                dir.path().join("rootfs"),
                Arc::clone(&store),
                "test",
                vec![],
            )
            .unwrap();
            prov.declare(Declaration::File {
                path: "/etc/motd".to_string(),
                mode: 0o600,
            })
            .unwrap();
        }
        let prov =
            Provisioner::new(dir.path().join("rootfs"), store, "test", vec![]).unwrap();
        assert_eq!(prov.list(), vec!["file /etc/motd".to_string()]);
    }
}
