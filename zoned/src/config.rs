use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use zone_runtime::container::IdMap;
use zone_runtime::netdev::{MacVlanMode, NetDevKind};
use zone_runtime::Namespace;

use crate::error::ZoneError;

fn default_namespaces() -> Vec<Namespace> {
    vec![
        Namespace::Pid,
        Namespace::Mnt,
        Namespace::Uts,
        Namespace::Ipc,
        Namespace::Net,
    ]
}

fn default_init() -> Vec<String> {
    vec!["/sbin/init".to_string()]
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_quota_foreground() -> i64 {
    -1
}

fn default_quota_background() -> i64 {
    1000
}

fn default_vt() -> i32 {
    -1
}

fn default_true() -> bool {
    true
}

/// One network device the zone gets on start.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NetDevEntry {
    pub name: String,
    pub kind: NetDevKind,
    /// bridge for veth, master for macvlan, device name for phys
    #[serde(default)]
    pub host_dev: Option<String>,
    #[serde(default)]
    pub mode: Option<MacVlanMode>,
    /// CIDR addresses assigned after creation
    #[serde(default)]
    pub addrs: Vec<String>,
}

/// Immutable per-zone definition, loaded from `<zones_path>/<id>/config.json`.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ZoneConfig {
    #[serde(default = "default_init")]
    pub init_with_args: Vec<String>,

    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub ipv4: Option<String>,
    #[serde(default)]
    pub ipv4_gateway: Option<String>,

    /// >= 0 means the zone owns a graphical stack on this VT
    #[serde(default = "default_vt")]
    pub vt: i32,

    /// lower value = more important
    #[serde(default)]
    pub privilege: i32,

    #[serde(default = "default_quota_foreground")]
    pub cpu_quota_foreground: i64,
    #[serde(default = "default_quota_background")]
    pub cpu_quota_background: i64,

    /// seconds granted to a graceful shutdown before the force-stop
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    #[serde(default = "default_true")]
    pub switch_to_default_after_timeout: bool,

    /// hard-link declarations must source from below one of these
    #[serde(default)]
    pub valid_link_prefixes: Vec<String>,

    #[serde(default = "default_namespaces")]
    pub namespaces: Vec<Namespace>,

    #[serde(default)]
    pub uid_maps: Vec<IdMap>,
    #[serde(default)]
    pub gid_maps: Vec<IdMap>,

    #[serde(default)]
    pub netdevs: Vec<NetDevEntry>,
}

fn valid_quota(quota: i64) -> bool {
    quota == -1 || (1000..=(u64::MAX / 1000) as i64).contains(&quota)
}

impl ZoneConfig {
    pub fn load(path: &Path) -> Result<Self, ZoneError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ZoneError::Config(format!("{}: {}", path.display(), e)))?;
        let config: ZoneConfig = serde_json::from_str(&text)
            .map_err(|e| ZoneError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ZoneError> {
        if self.init_with_args.is_empty() {
            return Err(ZoneError::Config("empty init command".to_string()));
        }
        if !valid_quota(self.cpu_quota_foreground) {
            return Err(ZoneError::Config(format!(
                "bad foreground cpu quota: {}",
                self.cpu_quota_foreground
            )));
        }
        if !valid_quota(self.cpu_quota_background) {
            return Err(ZoneError::Config(format!(
                "bad background cpu quota: {}",
                self.cpu_quota_background
            )));
        }
        Ok(())
    }
}

impl Default for ZoneConfig {
    fn default() -> Self {
        ZoneConfig {
            init_with_args: default_init(),
            hostname: None,
            ipv4: None,
            ipv4_gateway: None,
            vt: default_vt(),
            privilege: 0,
            cpu_quota_foreground: default_quota_foreground(),
            cpu_quota_background: default_quota_background(),
            shutdown_timeout: default_shutdown_timeout(),
            switch_to_default_after_timeout: true,
            valid_link_prefixes: Vec::new(),
            namespaces: default_namespaces(),
            uid_maps: Vec::new(),
            gid_maps: Vec::new(),
            netdevs: Vec::new(),
        }
    }
}

/// Daemon-wide paths and limits.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    #[serde(default = "default_zones_path")]
    pub zones_path: PathBuf,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_run_mount_point_prefix")]
    pub run_mount_point_prefix: PathBuf,
    #[serde(default = "default_runtime_socket")]
    pub runtime_socket: PathBuf,
    /// user to switch to unless --root is given
    #[serde(default = "default_run_as")]
    pub run_as: String,
}

fn default_zones_path() -> PathBuf {
    PathBuf::from("/var/lib/zoned/zones")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/zoned/state.json")
}

fn default_run_mount_point_prefix() -> PathBuf {
    PathBuf::from("/run/zoned")
}

fn default_runtime_socket() -> PathBuf {
    PathBuf::from("/run/zoned/daemon.socket")
}

fn default_run_as() -> String {
    "zoned".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            zones_path: default_zones_path(),
            db_path: default_db_path(),
            run_mount_point_prefix: default_run_mount_point_prefix(),
            runtime_socket: default_runtime_socket(),
            run_as: default_run_as(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self, ZoneError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ZoneError::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| ZoneError::Config(format!("{}: {}", path.display(), e)))
    }
}

/// Zone ids become directory names; keep them boring.
pub fn validate_zone_id(id: &str) -> Result<(), ZoneError> {
    let ok = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !ok {
        return Err(ZoneError::Config(format!("bad zone id: {:?}", id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_ids_are_filesystem_safe() {
        assert!(validate_zone_id("web-1").is_ok());
        assert!(validate_zone_id("").is_err());
        assert!(validate_zone_id("..").is_err());
        assert!(validate_zone_id("a/b").is_err());
        assert!(validate_zone_id("a b").is_err());
    }

    #[test]
    fn quota_bounds() {
        let mut config = ZoneConfig::default();
        config.cpu_quota_foreground = 999;
        assert!(config.validate().is_err());
        config.cpu_quota_foreground = -1;
        config.cpu_quota_background = 50_000;
        assert!(config.validate().is_ok());
        config.cpu_quota_background = -2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: ZoneConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.init_with_args, vec!["/sbin/init".to_string()]);
        assert_eq!(config.vt, -1);
        assert_eq!(config.shutdown_timeout, 10);
        assert!(config.switch_to_default_after_timeout);
        assert_eq!(config.cpu_quota_background, 1000);
    }

    #[test]
    fn camel_case_keys_load() {
        let json = r#"{
            "initWithArgs": ["/bin/busybox", "init"],
            "cpuQuotaForeground": 50000,
            "cpuQuotaBackground": 10000,
            "shutdownTimeout": 3,
            "vt": 4
        }"#;
        let config: ZoneConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.cpu_quota_foreground, 50000);
        assert_eq!(config.cpu_quota_background, 10000);
        assert_eq!(config.vt, 4);
        config.validate().unwrap();
    }
}
