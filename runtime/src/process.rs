use std::mem::{size_of, zeroed};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{read, write, Pid};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::err;
use crate::error::RuntimeError;

const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// clone(2) into the given fresh namespaces; the closure's return value is
/// the child's exit code.
pub fn clone_process(
    child: Box<dyn FnMut() -> isize + '_>,
    namespaces: CloneFlags,
) -> Result<Pid, RuntimeError> {
    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    // SAFE: the child closure only execs or exits, so allocator and lock
    // state inherited over clone never gets a chance to matter
    let pid = unsafe { nix::sched::clone(child, &mut stack, namespaces, Some(libc::SIGCHLD)) }?;
    Ok(pid)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitResult {
    Code(i32),
    Signal(Signal),
}

impl ExitResult {
    /// Shell-style exit code: signals map to 128+signo.
    pub fn code(&self) -> i32 {
        match self {
            ExitResult::Code(code) => *code,
            ExitResult::Signal(sig) => 128 + *sig as i32,
        }
    }
}

/// waitpid until the process is gone, restarting on EINTR.
pub fn wait_for_exit(pid: Pid) -> Result<ExitResult, RuntimeError> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ExitResult::Code(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(ExitResult::Signal(signal)),
            Ok(_) => {}
            Err(Errno::EINTR) => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// Polls for exit up to `timeout`; None means the process is still alive.
pub fn wait_with_timeout(pid: Pid, timeout: Duration) -> Result<Option<ExitResult>, RuntimeError> {
    let deadline = Instant::now() + timeout;
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(Some(ExitResult::Code(code))),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(Some(ExitResult::Signal(signal))),
            Ok(_) => {}
            Err(Errno::EINTR) => {}
            Err(e) => return Err(e.into()),
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Kill this process when its parent dies.
pub fn set_death_signal() -> Result<(), RuntimeError> {
    err(|| unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) })?;
    Ok(())
}

/// Back to the default signal mask, for children about to exec.
pub fn reset_signal_mask() -> Result<(), RuntimeError> {
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)?;
    Ok(())
}

/// One end of a socketpair carrying length-prefixed bincode messages and,
/// via SCM_RIGHTS, file descriptors. After a fork each side keeps one end
/// and drops the other.
pub struct Channel {
    fd: OwnedFd,
}

impl Channel {
    pub fn pair() -> Result<(Channel, Channel), RuntimeError> {
        let (left, right) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;
        Ok((Channel { fd: left }, Channel { fd: right }))
    }

    fn write_all(&self, mut buf: &[u8]) -> Result<(), RuntimeError> {
        while !buf.is_empty() {
            match write(self.fd.as_fd(), buf) {
                Ok(0) => return Err(RuntimeError::ProcessSetup("channel closed".to_string())),
                Ok(n) => buf = &buf[n..],
                Err(Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn read_exact(&self, mut buf: &mut [u8]) -> Result<(), RuntimeError> {
        while !buf.is_empty() {
            match read(self.fd.as_fd(), buf) {
                Ok(0) => return Err(RuntimeError::ProcessSetup("channel closed".to_string())),
                Ok(n) => buf = &mut buf[n..],
                Err(Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn send<T: Serialize>(&self, value: &T) -> Result<(), RuntimeError> {
        let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|_| RuntimeError::Encode)?;
        trace!(len = bytes.len(), "channel send");
        self.write_all(&(bytes.len() as u32).to_be_bytes())?;
        self.write_all(&bytes)
    }

    pub fn recv<T: DeserializeOwned>(&self) -> Result<T, RuntimeError> {
        let mut len_bytes = [0u8; 4];
        self.read_exact(&mut len_bytes)?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        trace!(len, "channel recv");
        let mut bytes = vec![0u8; len];
        self.read_exact(&mut bytes)?;
        bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(|_| RuntimeError::Decode)
    }

    /// Ships a duplicate of `fd` to the other side.
    pub fn send_fd(&self, fd: RawFd) -> Result<(), RuntimeError> {
        let mut data = [0u8; 1];
        let mut iov = libc::iovec {
            iov_base: data.as_mut_ptr() as *mut libc::c_void,
            iov_len: 1,
        };
        let space = unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as u32) } as usize;
        let mut cmsg_buf = vec![0u8; space];

        let mut msg: libc::msghdr = unsafe { zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = space;

        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<RawFd>() as u32) as usize;
            std::ptr::copy_nonoverlapping(
                &fd as *const RawFd as *const u8,
                libc::CMSG_DATA(cmsg),
                size_of::<RawFd>(),
            );
        }
        err(|| unsafe { libc::sendmsg(self.fd.as_raw_fd(), &msg, 0) })?;
        Ok(())
    }

    pub fn recv_fd(&self) -> Result<OwnedFd, RuntimeError> {
        let mut data = [0u8; 1];
        let mut iov = libc::iovec {
            iov_base: data.as_mut_ptr() as *mut libc::c_void,
            iov_len: 1,
        };
        let space = unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as u32) } as usize;
        let mut cmsg_buf = vec![0u8; space];

        let mut msg: libc::msghdr = unsafe { zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = space;

        let received = err(|| unsafe { libc::recvmsg(self.fd.as_raw_fd(), &mut msg, 0) })?;
        if received == 0 {
            return Err(RuntimeError::ProcessSetup("channel closed".to_string()));
        }

        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            if cmsg.is_null()
                || (*cmsg).cmsg_level != libc::SOL_SOCKET
                || (*cmsg).cmsg_type != libc::SCM_RIGHTS
            {
                return Err(RuntimeError::Decode);
            }
            let mut fd: RawFd = -1;
            std::ptr::copy_nonoverlapping(
                libc::CMSG_DATA(cmsg) as *const u8,
                &mut fd as *mut RawFd as *mut u8,
                size_of::<RawFd>(),
            );
            if fd < 0 {
                return Err(RuntimeError::Decode);
            }
            Ok(OwnedFd::from_raw_fd(fd))
        }
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Probe {
        n: u32,
        s: String,
    }

    #[test]
    fn channel_round_trip() {
        let (a, b) = Channel::pair().unwrap();
        let sent = Probe {
            n: 7,
            s: "seven".to_string(),
        };
        a.send(&sent).unwrap();
        let got: Probe = b.recv().unwrap();
        assert_eq!(got, sent);
    }

    #[test]
    fn channel_passes_fds() {
        let (a, b) = Channel::pair().unwrap();
        let (rx, tx) = pipe().unwrap();
        a.send_fd(tx.as_raw_fd()).unwrap();
        let dup = b.recv_fd().unwrap();
        // drop the original write end; the duplicate keeps the pipe open
        drop(tx);

        write(dup.as_fd(), b"ok").unwrap();
        drop(dup);
        let mut buf = [0u8; 2];
        read(rx.as_fd(), &mut buf).unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[test]
    fn exit_codes_fold_signals() {
        assert_eq!(ExitResult::Code(3).code(), 3);
        assert_eq!(ExitResult::Signal(Signal::SIGKILL).code(), 128 + 9);
    }
}
