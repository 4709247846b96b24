use std::fs::OpenOptions;
use std::os::fd::AsRawFd;

use tracing::warn;
use zone_runtime::err;

const TTY_DEV: &str = "/dev/tty0";

// linux/vt.h
const VT_GETSTATE: libc::c_ulong = 0x5603;
const VT_ACTIVATE: libc::c_ulong = 0x5606;
const VT_WAITACTIVE: libc::c_ulong = 0x5607;

#[repr(C)]
#[derive(Default)]
struct VtStat {
    v_active: libc::c_ushort,
    v_signal: libc::c_ushort,
    v_state: libc::c_ushort,
}

/// Switches the console to `vt` and waits for the switch to finish.
/// Best-effort: failures are logged, never fatal.
pub fn activate_vt(vt: i32) -> bool {
    let console = match OpenOptions::new().write(true).open(TTY_DEV) {
        Ok(file) => file,
        Err(e) => {
            warn!("console open failed: {}", e);
            return false;
        }
    };
    let fd = console.as_raw_fd();

    let mut state = VtStat::default();
    if err(|| unsafe { libc::ioctl(fd, VT_GETSTATE, &mut state) }).is_err() {
        warn!("reading vt state failed");
        return false;
    }
    if i32::from(state.v_active) == vt {
        return true;
    }

    if err(|| unsafe { libc::ioctl(fd, VT_ACTIVATE, vt) }).is_err() {
        warn!("activating vt{} failed", vt);
        return false;
    }
    if err(|| unsafe { libc::ioctl(fd, VT_WAITACTIVE, vt) }).is_err() {
        warn!("waiting for vt{} activation failed", vt);
        return false;
    }
    true
}
