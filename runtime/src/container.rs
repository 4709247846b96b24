//! The OS container handle: clones init into fresh namespaces, enters the
//! rootfs, and later signals, freezes or reaps it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::mount::{mount, MsFlags};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{chdir, chroot, execv, Pid};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cgroup::Cgroup;
use crate::error::RuntimeError;
use crate::namespace::{self, Namespace};
use crate::process::{self, Channel, ExitResult};
use crate::sys;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdMap {
    pub inside: u32,
    pub outside: u32,
    pub count: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub name: String,
    pub rootfs: PathBuf,
    pub namespaces: Vec<Namespace>,
    pub uid_maps: Vec<IdMap>,
    pub gid_maps: Vec<IdMap>,
    pub hostname: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerState {
    Stopped,
    Running,
    Frozen,
}

pub struct Container {
    config: ContainerConfig,
    init_pid: Option<Pid>,
    cpu: Cgroup,
    freezer: Cgroup,
}

impl Container {
    pub fn new(config: ContainerConfig) -> Self {
        let group = format!("zone-{}", config.name);
        Container {
            cpu: Cgroup::new("cpu", &group),
            freezer: Cgroup::new("freezer", &group),
            config,
            init_pid: None,
        }
    }

    pub fn init_pid(&self) -> Option<i32> {
        self.init_pid.map(|p| p.as_raw())
    }

    pub fn cpu_cgroup(&self) -> &Cgroup {
        &self.cpu
    }

    pub fn state(&mut self) -> ContainerState {
        let pid = match self.init_pid {
            Some(pid) => pid,
            None => return ContainerState::Stopped,
        };
        // reap if init died behind our back
        match process::wait_with_timeout(pid, Duration::ZERO) {
            Ok(Some(_)) | Err(_) => {
                self.init_pid = None;
                return ContainerState::Stopped;
            }
            Ok(None) => {}
        }
        if self.freezer.is_frozen().unwrap_or(false) {
            ContainerState::Frozen
        } else {
            ContainerState::Running
        }
    }

    /// Clones init into the configured namespaces. The child blocks on a
    /// channel barrier until uid/gid maps and cgroup placement are written,
    /// then enters the rootfs and execs `argv`.
    pub fn start(&mut self, argv: &[String]) -> Result<(), RuntimeError> {
        if self.state() != ContainerState::Stopped {
            debug!("{}: already running", self.config.name);
            return Ok(());
        }
        if argv.is_empty() {
            return Err(RuntimeError::ProcessSetup("empty init argv".to_string()));
        }
        if !self.config.rootfs.is_dir() {
            return Err(RuntimeError::ProcessSetup(format!(
                "rootfs {} is not a directory",
                self.config.rootfs.display()
            )));
        }

        let (parent_ch, child_ch) = Channel::pair()?;
        let flags = namespace::clone_flags(&self.config.namespaces);

        let config = self.config.clone();
        let argv = argv.to_vec();
        let child = Box::new(move || init_entry(&config, &argv, &child_ch));
        let pid = process::clone_process(child, flags)?;
        info!("{}: init cloned as pid {}", self.config.name, pid);

        let prepared = self.prepare_child(pid);
        if let Err(e) = prepared {
            let _ = kill(pid, Signal::SIGKILL);
            let _ = process::wait_for_exit(pid);
            return Err(e);
        }

        // release the barrier
        parent_ch.send(&true)?;
        self.init_pid = Some(pid);
        Ok(())
    }

    fn prepare_child(&self, pid: Pid) -> Result<(), RuntimeError> {
        if self.config.namespaces.contains(&Namespace::User) {
            write_id_maps(pid, &self.config.uid_maps, &self.config.gid_maps)?;
        }
        self.cpu.create()?;
        self.freezer.create()?;
        self.cpu.add_pid(pid.as_raw())?;
        self.freezer.add_pid(pid.as_raw())?;
        Ok(())
    }

    /// Graceful: SIGTERM and wait up to `timeout`. Returns whether init
    /// actually exited.
    pub fn shutdown(&mut self, timeout: Duration) -> Result<bool, RuntimeError> {
        let pid = match self.init_pid {
            Some(pid) => pid,
            None => return Ok(true),
        };
        debug!("{}: requesting shutdown of pid {}", self.config.name, pid);
        kill(pid, Signal::SIGTERM)?;
        match process::wait_with_timeout(pid, timeout)? {
            Some(_) => {
                self.init_pid = None;
                self.cleanup_groups();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Forceful: SIGKILL and reap.
    pub fn stop(&mut self) -> Result<(), RuntimeError> {
        if let Some(pid) = self.init_pid.take() {
            debug!("{}: killing pid {}", self.config.name, pid);
            // thawed processes die faster
            let _ = self.freezer.thaw();
            kill(pid, Signal::SIGKILL)?;
            process::wait_for_exit(pid)?;
            self.cleanup_groups();
        }
        Ok(())
    }

    pub fn freeze(&self) -> Result<(), RuntimeError> {
        self.freezer.freeze()
    }

    pub fn thaw(&self) -> Result<(), RuntimeError> {
        self.freezer.thaw()
    }

    /// Reaps init after it exited on its own.
    pub fn reap(&mut self) -> Result<Option<ExitResult>, RuntimeError> {
        match self.init_pid {
            Some(pid) => {
                let result = process::wait_with_timeout(pid, Duration::ZERO)?;
                if result.is_some() {
                    self.init_pid = None;
                    self.cleanup_groups();
                }
                Ok(result)
            }
            None => Ok(None),
        }
    }

    fn cleanup_groups(&self) {
        if let Err(e) = self.cpu.remove() {
            warn!("{}: cpu cgroup removal failed: {}", self.config.name, e);
        }
        if let Err(e) = self.freezer.remove() {
            warn!("{}: freezer cgroup removal failed: {}", self.config.name, e);
        }
    }
}

fn write_id_maps(pid: Pid, uid_maps: &[IdMap], gid_maps: &[IdMap]) -> Result<(), RuntimeError> {
    let render = |maps: &[IdMap]| {
        maps.iter()
            .map(|m| format!("{} {} {}", m.inside, m.outside, m.count))
            .collect::<Vec<_>>()
            .join("\n")
    };
    if !gid_maps.is_empty() {
        // setgroups must be denied before an unprivileged gid_map write
        std::fs::write(format!("/proc/{}/setgroups", pid), "deny")?;
        std::fs::write(format!("/proc/{}/gid_map", pid), render(gid_maps))?;
    }
    if !uid_maps.is_empty() {
        std::fs::write(format!("/proc/{}/uid_map", pid), render(uid_maps))?;
    }
    Ok(())
}

/// Runs in the cloned child; the return value is its exit code.
fn init_entry(config: &ContainerConfig, argv: &[String], channel: &Channel) -> isize {
    match init_setup(config, argv, channel) {
        Ok(never) => match never {},
        Err(e) => {
            // no logger is safe here; stderr still points at the daemon's
            eprintln!("zone {} init setup failed: {}", config.name, e);
            1
        }
    }
}

enum Never {}

fn init_setup(
    config: &ContainerConfig,
    argv: &[String],
    channel: &Channel,
) -> Result<Never, RuntimeError> {
    // barrier: parent writes id maps and cgroups first
    let go: bool = channel.recv()?;
    if !go {
        return Err(RuntimeError::ProcessSetup("start aborted".to_string()));
    }

    if config.namespaces.contains(&Namespace::Uts) {
        let hostname = config.hostname.as_deref().unwrap_or(&config.name);
        sys::set_host_name(hostname)?;
    }

    enter_rootfs(&config.rootfs)?;

    if config.namespaces.contains(&Namespace::Pid)
        && config.namespaces.contains(&Namespace::Mnt)
        && Path::new("/proc").is_dir()
    {
        mount(
            Some("proc"),
            "/proc",
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            None::<&str>,
        )?;
    }

    process::reset_signal_mask()?;

    let argv_cstrs: Vec<std::ffi::CString> = argv
        .iter()
        .map(|a| std::ffi::CString::new(a.as_str()))
        .collect::<Result<_, _>>()
        .map_err(|_| RuntimeError::ProcessSetup("NUL in init argv".to_string()))?;
    execv(&argv_cstrs[0], &argv_cstrs)?;
    unreachable!()
}

fn enter_rootfs(rootfs: &Path) -> Result<(), RuntimeError> {
    chdir(rootfs)?;
    chroot(".")?;
    chdir("/")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ContainerConfig {
        ContainerConfig {
            name: "test".to_string(),
            rootfs: PathBuf::from("/definitely/not/there"),
            namespaces: vec![Namespace::Pid, Namespace::Mnt],
            uid_maps: vec![],
            gid_maps: vec![],
            hostname: None,
        }
    }

    #[test]
    fn fresh_container_is_stopped() {
        let mut container = Container::new(config());
        assert_eq!(container.state(), ContainerState::Stopped);
        assert_eq!(container.init_pid(), None);
    }

    #[test]
    fn start_refuses_missing_rootfs() {
        let mut container = Container::new(config());
        let res = container.start(&["/sbin/init".to_string()]);
        assert!(matches!(res, Err(RuntimeError::ProcessSetup(_))));
    }

    #[test]
    fn start_refuses_empty_argv() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.rootfs = dir.path().to_path_buf();
        let mut container = Container::new(cfg);
        assert!(matches!(
            container.start(&[]),
            Err(RuntimeError::ProcessSetup(_))
        ));
    }

    #[test]
    fn shutdown_of_stopped_container_succeeds() {
        let mut container = Container::new(config());
        assert!(container.shutdown(Duration::from_millis(10)).unwrap());
    }

    // needs root: pid/mount namespaces and cgroup directories
    #[test]
    #[ignore]
    fn sigterm_deaf_init_falls_back_to_kill() {
        let mut cfg = config();
        cfg.rootfs = PathBuf::from("/");
        let mut container = Container::new(cfg);
        container
            .start(&[
                "/bin/sh".to_string(),
                "-c".to_string(),
                "trap '' TERM; while true; do sleep 1; done".to_string(),
            ])
            .unwrap();
        assert_eq!(container.state(), ContainerState::Running);

        let graceful = container.shutdown(Duration::from_secs(2)).unwrap();
        assert!(!graceful);
        container.stop().unwrap();
        assert_eq!(container.state(), ContainerState::Stopped);
    }

    // needs root: freezer cgroup
    #[test]
    #[ignore]
    fn freeze_and_thaw_cycle() {
        let mut cfg = config();
        cfg.rootfs = PathBuf::from("/");
        let mut container = Container::new(cfg);
        container
            .start(&["/bin/sleep".to_string(), "1000".to_string()])
            .unwrap();
        container.freeze().unwrap();
        assert_eq!(container.state(), ContainerState::Frozen);
        container.thaw().unwrap();
        assert_eq!(container.state(), ContainerState::Running);
        container.stop().unwrap();
    }
}
