use std::path::PathBuf;

use nix::unistd::{gethostname, sethostname};

use crate::error::RuntimeError;

fn sysctl_path(key: &str) -> PathBuf {
    PathBuf::from("/proc/sys").join(key.replace('.', "/"))
}

/// `a.b.c` maps to `/proc/sys/a/b/c`; unknown parameters are refused rather
/// than created.
pub fn write_kernel_param(key: &str, value: &str) -> Result<(), RuntimeError> {
    let path = sysctl_path(key);
    if !path.exists() {
        return Err(RuntimeError::Sysctl(format!("no such parameter: {}", key)));
    }
    std::fs::write(path, value)?;
    Ok(())
}

pub fn read_kernel_param(key: &str) -> Result<String, RuntimeError> {
    let path = sysctl_path(key);
    if !path.exists() {
        return Err(RuntimeError::Sysctl(format!("no such parameter: {}", key)));
    }
    Ok(std::fs::read_to_string(path)?.trim_end().to_string())
}

pub fn set_host_name(name: &str) -> Result<(), RuntimeError> {
    if name.is_empty() {
        return Err(RuntimeError::Hostname("empty hostname".to_string()));
    }
    sethostname(name)?;
    Ok(())
}

pub fn get_host_name() -> Result<String, RuntimeError> {
    Ok(gethostname()?.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dots_map_to_slashes() {
        assert_eq!(
            sysctl_path("net.ipv4.ip_forward"),
            PathBuf::from("/proc/sys/net/ipv4/ip_forward")
        );
    }

    #[test]
    fn unknown_parameter_is_refused() {
        assert!(matches!(
            write_kernel_param("definitely.not.a.param", "1"),
            Err(RuntimeError::Sysctl(_))
        ));
        assert!(matches!(
            read_kernel_param("definitely.not.a.param"),
            Err(RuntimeError::Sysctl(_))
        ));
    }

    #[test]
    fn reads_a_real_parameter() {
        assert_eq!(read_kernel_param("kernel.ostype").unwrap(), "Linux");
    }

    #[test]
    fn empty_hostname_is_refused() {
        assert!(matches!(
            set_host_name(""),
            Err(RuntimeError::Hostname(_))
        ));
    }
}
