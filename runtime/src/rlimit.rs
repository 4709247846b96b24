use nix::sys::resource::{getrlimit, setrlimit, Resource};

use crate::error::RuntimeError;

/// setrlimit with the kernel's own invariant checked up front.
pub fn set_rlimit(resource: Resource, soft: u64, hard: u64) -> Result<(), RuntimeError> {
    if soft > hard {
        return Err(RuntimeError::Rlimit(format!(
            "soft limit {} above hard limit {}",
            soft, hard
        )));
    }
    setrlimit(resource, soft, hard)?;
    Ok(())
}

pub fn get_rlimit(resource: Resource) -> Result<(u64, u64), RuntimeError> {
    Ok(getrlimit(resource)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_soft_above_hard() {
        assert!(matches!(
            set_rlimit(Resource::RLIMIT_NOFILE, 100, 10),
            Err(RuntimeError::Rlimit(_))
        ));
    }

    #[test]
    fn get_set_round_trip() {
        let (soft, hard) = get_rlimit(Resource::RLIMIT_NOFILE).unwrap();
        set_rlimit(Resource::RLIMIT_NOFILE, soft.min(hard), hard).unwrap();
        assert_eq!(get_rlimit(Resource::RLIMIT_NOFILE).unwrap().1, hard);
    }
}
