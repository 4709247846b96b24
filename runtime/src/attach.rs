//! Runs a command inside a running zone: an intermediate process joins the
//! zone's namespaces and forks the payload, which applies credentials,
//! capabilities, tty, cwd and environment before exec. Everything the
//! helpers need travels over the channel as a serialized config blob, never
//! as inherited pointers.

use std::collections::HashMap;
use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;

use nix::unistd::{
    chdir, execvpe, fork, setgroups, setresgid, setresuid, setsid, ForkResult, Gid, Pid, Uid,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::capability;
use crate::err;
use crate::error::RuntimeError;
use crate::namespace::{self, Namespace};
use crate::process::{self, Channel, ExitResult};

/// Everything the attach helpers need, streamed over the channel.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AttachConfig {
    /// argv[0] is the binary's path inside the zone
    pub argv: Vec<String>,
    pub init_pid: i32,
    pub namespaces: Vec<Namespace>,
    pub uid: u32,
    pub gid: u32,
    pub supplementary_gids: Vec<u32>,
    /// bounding-set mask of capabilities left available
    pub caps_to_keep: u64,
    pub workdir: String,
    /// names of caller environment variables to keep
    pub env_to_keep: Vec<String>,
    /// set or overwrite after filtering
    pub env_to_set: Vec<(String, String)>,
    /// a controlling tty follows the config over the channel
    pub has_tty: bool,
}

#[derive(Serialize, Deserialize, Debug)]
enum SetupStatus {
    Ready,
    Failed(String),
}

/// Filter to the keep-list, then apply the set-list on top.
fn filter_env(
    current: impl Iterator<Item = (String, String)>,
    keep: &[String],
    set: &[(String, String)],
) -> Vec<(String, String)> {
    let mut env: HashMap<String, String> = current
        .filter(|(name, _)| keep.iter().any(|k| k == name))
        .collect();
    for (name, value) in set {
        env.insert(name.clone(), value.clone());
    }
    let mut out: Vec<_> = env.into_iter().collect();
    out.sort();
    out
}

/// Runs `config.argv` inside the zone owning `config.init_pid` and returns
/// its exit result. `tty` becomes the payload's controlling terminal and
/// stdio when given.
pub fn attach(config: &AttachConfig, tty: Option<OwnedFd>) -> Result<ExitResult, RuntimeError> {
    if config.argv.is_empty() {
        return Err(RuntimeError::Attach("empty argv".to_string()));
    }
    if !config.workdir.starts_with('/') {
        return Err(RuntimeError::Attach("workdir must be absolute".to_string()));
    }

    let (caller_ch, helper_ch) = Channel::pair()?;

    // SAFE: single-threaded at this point by contract of the caller
    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            drop(helper_ch);
            caller_ch.send(config)?;
            if let Some(tty) = &tty {
                caller_ch.send_fd(tty.as_raw_fd())?;
            }
            drop(tty);

            let status: SetupStatus = caller_ch.recv()?;
            if let SetupStatus::Failed(reason) = status {
                let _ = process::wait_for_exit(child);
                return Err(RuntimeError::Attach(reason));
            }

            // blocks until the payload is gone
            let exit_code: i32 = caller_ch.recv()?;
            process::wait_for_exit(child)?;
            Ok(ExitResult::Code(exit_code))
        }
        ForkResult::Child => {
            drop(caller_ch);
            let code = intermediate_main(&helper_ch);
            unsafe { libc::_exit(code) }
        }
    }
}

/// The intermediate: joins the zone's namespaces, forks the payload, waits
/// for it and reports its exit status back to the caller.
fn intermediate_main(channel: &Channel) -> i32 {
    match run_intermediate(channel) {
        Ok(code) => {
            let _ = channel.send(&code);
            0
        }
        Err(e) => {
            debug!("attach intermediate failed: {}", e);
            let _ = channel.send(&SetupStatus::Failed(e.to_string()));
            1
        }
    }
}

fn run_intermediate(channel: &Channel) -> Result<i32, RuntimeError> {
    let config: AttachConfig = channel.recv()?;
    let tty = if config.has_tty {
        Some(channel.recv_fd()?)
    } else {
        None
    };

    process::set_death_signal()?;

    // the user namespace is never entered via setns
    let joinable: Vec<Namespace> = config
        .namespaces
        .iter()
        .copied()
        .filter(|ns| *ns != Namespace::User)
        .collect();
    namespace::setns_of_pid(Pid::from_raw(config.init_pid), &joinable)?;

    // SAFE: nothing between fork and exec allocates behind locks we share
    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            drop(tty);
            channel.send(&SetupStatus::Ready)?;
            Ok(process::wait_for_exit(child)?.code())
        }
        ForkResult::Child => {
            // exec or die; errors here become the payload's exit status
            let code = match run_payload(&config, tty) {
                Ok(never) => match never {},
                Err(e) => {
                    debug!("attach payload setup failed: {}", e);
                    libc::EXIT_FAILURE
                }
            };
            unsafe { libc::_exit(code) }
        }
    }
}

enum Never {}

fn run_payload(config: &AttachConfig, tty: Option<OwnedFd>) -> Result<Never, RuntimeError> {
    if let Some(tty) = tty {
        setsid()?;
        err(|| unsafe { libc::ioctl(tty.as_raw_fd(), libc::TIOCSCTTY, 0) })?;
        for stdio in 0..3 {
            err(|| unsafe { libc::dup2(tty.as_raw_fd(), stdio) })?;
        }
        drop(tty);
    }

    // bounding drop needs CAP_SETPCAP, so it happens before the uid change;
    // keepcaps preserves the permitted set across setresuid
    capability::keep_caps_over_setuid()?;
    capability::drop_bounding_except(config.caps_to_keep)?;

    let gids: Vec<Gid> = config
        .supplementary_gids
        .iter()
        .map(|g| Gid::from_raw(*g))
        .collect();
    setgroups(&gids)?;
    let gid = Gid::from_raw(config.gid);
    let uid = Uid::from_raw(config.uid);
    setresgid(gid, gid, gid)?;
    setresuid(uid, uid, uid)?;

    capability::apply_cap_mask(config.caps_to_keep)?;

    chdir(Path::new(&config.workdir))?;

    let env = filter_env(std::env::vars(), &config.env_to_keep, &config.env_to_set);
    let env_cstrs: Vec<CString> = env
        .iter()
        .map(|(k, v)| CString::new(format!("{}={}", k, v)))
        .collect::<Result<_, _>>()
        .map_err(|_| RuntimeError::Attach("NUL in environment".to_string()))?;
    let argv_cstrs: Vec<CString> = config
        .argv
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<Result<_, _>>()
        .map_err(|_| RuntimeError::Attach("NUL in argv".to_string()))?;

    process::reset_signal_mask()?;

    trace!("exec {:?}", config.argv);
    execvpe(&argv_cstrs[0], &argv_cstrs, &env_cstrs)?;
    unreachable!()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn keep_list_filters_everything_else() {
        let current = env(&[("TERM", "xterm"), ("SECRET", "hunter2"), ("HOME", "/root")]);
        let filtered = filter_env(current.into_iter(), &["TERM".to_string()], &[]);
        assert_eq!(filtered, env(&[("TERM", "xterm")]));
    }

    #[test]
    fn set_list_overrides_and_appends() {
        let current = env(&[("TERM", "xterm"), ("LANG", "C")]);
        let filtered = filter_env(
            current.into_iter(),
            &["TERM".to_string(), "LANG".to_string()],
            &env(&[("LANG", "C.UTF-8"), ("PATH", "/usr/bin")]),
        );
        assert_eq!(
            filtered,
            env(&[("LANG", "C.UTF-8"), ("PATH", "/usr/bin"), ("TERM", "xterm")])
        );
    }

    #[test]
    fn rejects_relative_workdir() {
        let config = AttachConfig {
            argv: vec!["/bin/true".to_string()],
            init_pid: 1,
            namespaces: vec![],
            uid: 0,
            gid: 0,
            supplementary_gids: vec![],
            caps_to_keep: 0,
            workdir: "tmp".to_string(),
            env_to_keep: vec![],
            env_to_set: vec![],
            has_tty: false,
        };
        assert!(matches!(
            attach(&config, None),
            Err(RuntimeError::Attach(_))
        ));
    }

    #[test]
    fn rejects_empty_argv() {
        let config = AttachConfig {
            argv: vec![],
            init_pid: 1,
            namespaces: vec![],
            uid: 0,
            gid: 0,
            supplementary_gids: vec![],
            caps_to_keep: 0,
            workdir: "/".to_string(),
            env_to_keep: vec![],
            env_to_set: vec![],
            has_tty: false,
        };
        assert!(matches!(
            attach(&config, None),
            Err(RuntimeError::Attach(_))
        ));
    }
}
