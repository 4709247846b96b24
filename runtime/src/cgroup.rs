use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::RuntimeError;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const FREEZE_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

/// One named group in one v1 hierarchy, e.g. cpu:/zone-foo.
pub struct Cgroup {
    subsystem: String,
    name: String,
}

impl Cgroup {
    pub fn new(subsystem: impl Into<String>, name: impl Into<String>) -> Self {
        Cgroup {
            subsystem: subsystem.into(),
            name: name.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        PathBuf::from(CGROUP_ROOT)
            .join(&self.subsystem)
            .join(&self.name)
    }

    pub fn exists(&self) -> bool {
        self.path().is_dir()
    }

    pub fn create(&self) -> Result<(), RuntimeError> {
        std::fs::create_dir_all(self.path())?;
        Ok(())
    }

    /// The group must be empty; tasks still inside make this fail.
    pub fn remove(&self) -> Result<(), RuntimeError> {
        match std::fs::remove_dir(self.path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn add_pid(&self, pid: i32) -> Result<(), RuntimeError> {
        std::fs::write(self.path().join("cgroup.procs"), pid.to_string())?;
        Ok(())
    }

    pub fn set_param(&self, key: &str, value: &str) -> Result<(), RuntimeError> {
        trace!("cgroup {}:{} {} = {}", self.subsystem, self.name, key, value);
        std::fs::write(self.path().join(key), value)?;
        Ok(())
    }

    pub fn get_param(&self, key: &str) -> Result<String, RuntimeError> {
        Ok(std::fs::read_to_string(self.path().join(key))?
            .trim_end()
            .to_string())
    }

    /// Writes freezer.state and waits for the kernel to settle; FREEZING is
    /// a transient state that must be polled away.
    pub fn freeze(&self) -> Result<(), RuntimeError> {
        self.set_freezer_state("FROZEN")
    }

    pub fn thaw(&self) -> Result<(), RuntimeError> {
        self.set_freezer_state("THAWED")
    }

    pub fn is_frozen(&self) -> Result<bool, RuntimeError> {
        Ok(self.get_param("freezer.state")? == "FROZEN")
    }

    fn set_freezer_state(&self, state: &str) -> Result<(), RuntimeError> {
        self.set_param("freezer.state", state)?;
        let deadline = Instant::now() + FREEZE_SETTLE_TIMEOUT;
        loop {
            if self.get_param("freezer.state")? == state {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RuntimeError::Cgroup(format!(
                    "{}:{} did not reach {}",
                    self.subsystem, self.name, state
                )));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_rooted_in_the_hierarchy() {
        let cg = Cgroup::new("cpu", "zone-web");
        assert_eq!(cg.path(), PathBuf::from("/sys/fs/cgroup/cpu/zone-web"));
    }

    #[test]
    fn removing_a_missing_group_is_fine() {
        let cg = Cgroup::new("cpu", "zone-test-definitely-missing");
        cg.remove().unwrap();
    }
}
