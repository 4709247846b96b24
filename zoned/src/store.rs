use std::path::PathBuf;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ZoneError;

/// Persisted dynamic state: a flat JSON map keyed `zone.<id>.<field>`,
/// rewritten atomically on every change.
pub struct Store {
    path: PathBuf,
    data: Mutex<Map<String, Value>>,
}

pub fn zone_key(id: &str, field: &str) -> String {
    format!("zone.{}.{}", id, field)
}

impl Store {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ZoneError> {
        let path = path.into();
        let data = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| ZoneError::Store(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(ZoneError::Store(format!("{}: {}", path.display(), e))),
        };
        Ok(Store {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ZoneError> {
        let data = self.data.lock().unwrap();
        match data.get(key) {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| ZoneError::Store(format!("{}: {}", key, e))),
            None => Ok(None),
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), ZoneError> {
        let mut data = self.data.lock().unwrap();
        let value = serde_json::to_value(value)
            .map_err(|e| ZoneError::Store(format!("{}: {}", key, e)))?;
        data.insert(key.to_string(), value);
        self.flush(&data)
    }

    pub fn remove(&self, key: &str) -> Result<(), ZoneError> {
        let mut data = self.data.lock().unwrap();
        data.remove(key);
        self.flush(&data)
    }

    /// Drops everything under `prefix`, e.g. a destroyed zone's records.
    pub fn remove_prefix(&self, prefix: &str) -> Result<(), ZoneError> {
        let mut data = self.data.lock().unwrap();
        data.retain(|key, _| !key.starts_with(prefix));
        self.flush(&data)
    }

    fn flush(&self, data: &Map<String, Value>) -> Result<(), ZoneError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ZoneError::Store(format!("{}: {}", parent.display(), e)))?;
        }
        let tmp = self.path.with_extension("tmp");
        let text = serde_json::to_string_pretty(data)
            .map_err(|e| ZoneError::Store(e.to_string()))?;
        std::fs::write(&tmp, text).map_err(|e| ZoneError::Store(format!("{}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| ZoneError::Store(format!("{}: {}", self.path.display(), e)))?;
        debug!("state store flushed to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = Store::open(&path).unwrap();
            store.set(&zone_key("web", "requestedState"), &"running").unwrap();
            store.set(&zone_key("web", "vt"), &4).unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(
            store
                .get::<String>(&zone_key("web", "requestedState"))
                .unwrap()
                .as_deref(),
            Some("running")
        );
        assert_eq!(store.get::<i32>(&zone_key("web", "vt")).unwrap(), Some(4));
        assert_eq!(store.get::<i32>(&zone_key("web", "gone")).unwrap(), None);
    }

    #[test]
    fn single_key_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = Store::open(&path).unwrap();
            store.set(&zone_key("web", "requestedState"), &"running").unwrap();
            store.remove(&zone_key("web", "requestedState")).unwrap();
            // removing a key that is not there is fine
            store.remove(&zone_key("web", "requestedState")).unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(
            store
                .get::<String>(&zone_key("web", "requestedState"))
                .unwrap(),
            None
        );
    }

    #[test]
    fn prefix_removal_spares_other_zones() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("state.json")).unwrap();
        store.set(&zone_key("a", "requestedState"), &"running").unwrap();
        store.set(&zone_key("ab", "requestedState"), &"stopped").unwrap();
        store.remove_prefix("zone.a.").unwrap();
        assert_eq!(
            store
                .get::<String>(&zone_key("a", "requestedState"))
                .unwrap(),
            None
        );
        assert_eq!(
            store
                .get::<String>(&zone_key("ab", "requestedState"))
                .unwrap()
                .as_deref(),
            Some("stopped")
        );
    }
}
