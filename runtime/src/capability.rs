use once_cell::sync::Lazy;

use crate::err;
use crate::error::RuntimeError;

// V3 added in Linux 2.6.26
const _LINUX_CAPABILITY_VERSION_3: u32 = 0x20080522;

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: i32,
}

#[repr(C)]
struct CapUserData {
    // datap[0]
    effective_lo: u32,
    permitted_lo: u32,
    inheritable_lo: u32,
    // datap[1]
    effective_hi: u32,
    permitted_hi: u32,
    inheritable_hi: u32,
}

static LAST_CAP: Lazy<u32> = Lazy::new(|| {
    std::fs::read_to_string("/proc/sys/kernel/cap_last_cap")
        .ok()
        .and_then(|s| s.trim_end().parse().ok())
        // CAP_CHECKPOINT_RESTORE, the highest cap of kernels this runs on
        .unwrap_or(40)
});

pub fn last_cap() -> u32 {
    *LAST_CAP
}

/// Drops every capability not set in `keep` from the bounding set.
/// Needs CAP_SETPCAP, so run it before giving up effective caps.
pub fn drop_bounding_except(keep: u64) -> Result<(), RuntimeError> {
    for cap in 0..=last_cap() {
        if keep & (1u64 << cap) == 0 {
            err(|| unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap as libc::c_int, 0, 0, 0) })
                .map_err(|e| {
                    RuntimeError::Capability(format!("dropping cap {} failed: {}", cap, e))
                })?;
        }
    }
    Ok(())
}

/// capset with effective, permitted and inheritable all equal to `caps`.
pub fn apply_cap_mask(caps: u64) -> Result<(), RuntimeError> {
    let header = CapUserHeader {
        version: _LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let data = CapUserData {
        effective_lo: (caps & 0xffff_ffff) as u32,
        permitted_lo: (caps & 0xffff_ffff) as u32,
        inheritable_lo: (caps & 0xffff_ffff) as u32,
        effective_hi: (caps >> 32) as u32,
        permitted_hi: (caps >> 32) as u32,
        inheritable_hi: (caps >> 32) as u32,
    };
    err(|| unsafe {
        libc::syscall(
            libc::SYS_capset,
            &header as *const CapUserHeader,
            &data as *const CapUserData,
        )
    })
    .map_err(|e| RuntimeError::Capability(format!("capset failed: {}", e)))?;
    Ok(())
}

/// Keep permitted capabilities across the coming uid transition.
pub fn keep_caps_over_setuid() -> Result<(), RuntimeError> {
    nix::sys::prctl::set_keepcaps(true)
        .map_err(|e| RuntimeError::Capability(format!("keepcaps failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_cap_is_sane() {
        // every kernel since 2.6.24 has at least the classic 34 caps
        assert!(last_cap() >= 33);
        assert!(last_cap() < 64);
    }
}
