use std::fs::File;

use nix::sched::{setns, CloneFlags};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::RuntimeError;

/// The namespace kinds a zone can be built from.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    User,
    Mnt,
    Pid,
    Uts,
    Ipc,
    Net,
    Cgroup,
}

impl Namespace {
    pub const ALL: [Namespace; 7] = [
        Namespace::User,
        Namespace::Mnt,
        Namespace::Pid,
        Namespace::Uts,
        Namespace::Ipc,
        Namespace::Net,
        Namespace::Cgroup,
    ];

    pub fn clone_flag(self) -> CloneFlags {
        match self {
            Namespace::User => CloneFlags::CLONE_NEWUSER,
            Namespace::Mnt => CloneFlags::CLONE_NEWNS,
            Namespace::Pid => CloneFlags::CLONE_NEWPID,
            Namespace::Uts => CloneFlags::CLONE_NEWUTS,
            Namespace::Ipc => CloneFlags::CLONE_NEWIPC,
            Namespace::Net => CloneFlags::CLONE_NEWNET,
            Namespace::Cgroup => CloneFlags::CLONE_NEWCGROUP,
        }
    }

    /// Entry name under `/proc/<pid>/ns/`.
    pub fn proc_name(self) -> &'static str {
        match self {
            Namespace::User => "user",
            Namespace::Mnt => "mnt",
            Namespace::Pid => "pid",
            Namespace::Uts => "uts",
            Namespace::Ipc => "ipc",
            Namespace::Net => "net",
            Namespace::Cgroup => "cgroup",
        }
    }
}

pub fn clone_flags(namespaces: &[Namespace]) -> CloneFlags {
    namespaces
        .iter()
        .fold(CloneFlags::empty(), |acc, ns| acc | ns.clone_flag())
}

/// Joins the given namespaces of `pid`, one kind at a time. Switching into a
/// USER namespace this way is refused; the first failure is reported after
/// every kind has been attempted.
pub fn setns_of_pid(pid: Pid, namespaces: &[Namespace]) -> Result<(), RuntimeError> {
    if namespaces.contains(&Namespace::User) {
        return Err(RuntimeError::ProcessSetup(
            "cannot setns into a user namespace".to_string(),
        ));
    }

    let mut first_failure = None;
    for ns in namespaces {
        let path = format!("/proc/{}/ns/{}", pid, ns.proc_name());
        trace!("joining {}", path);
        let outcome = File::open(&path)
            .map_err(RuntimeError::from)
            .and_then(|file| setns(&file, ns.clone_flag()).map_err(RuntimeError::from));
        if let Err(e) = outcome {
            if first_failure.is_none() {
                first_failure = Some(RuntimeError::ProcessSetup(format!(
                    "joining {} failed: {}",
                    path, e
                )));
            }
        }
    }
    match first_failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine() {
        let flags = clone_flags(&[Namespace::Pid, Namespace::Net]);
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(!flags.contains(CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn user_namespace_is_refused() {
        let res = setns_of_pid(Pid::from_raw(1), &[Namespace::User]);
        assert!(matches!(res, Err(RuntimeError::ProcessSetup(_))));
    }

    #[test]
    fn proc_names_are_kernel_names() {
        assert_eq!(Namespace::Mnt.proc_name(), "mnt");
        assert_eq!(Namespace::Net.proc_name(), "net");
        assert_eq!(Namespace::Cgroup.proc_name(), "cgroup");
    }
}
