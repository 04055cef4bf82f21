//! Key-value storage adapter for usage-stat persistence
//!
//! Deliberately tiny: `get`/`set` of strings. Failures are surfaced as
//! plain strings and swallowed (with a log line) by the usage tracker.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::RwLock;

/// Storage backend for usage stats
pub trait UsageStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), String>;
}

/// In-memory storage, for tests
#[derive(Default)]
pub struct MemoryUsageStorage {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryUsageStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UsageStorage for MemoryUsageStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.entries
            .write()
            .map_err(|e| format!("lock poisoned: {e}"))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// File-backed storage: one JSON object holding all keys, written with the
/// temp-file + rename pattern so a crash never leaves a torn file.
pub struct FileUsageStorage {
    path: PathBuf,
    cache: RwLock<HashMap<String, String>>,
}

impl FileUsageStorage {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .map_err(|e| format!("failed to create storage directory: {e}"))?;
            }
        }

        let cache = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| format!("failed to parse usage storage: {e}"))?,
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            path,
            cache: RwLock::new(cache),
        })
    }

    fn flush(&self, entries: &HashMap<String, String>) -> Result<(), String> {
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| format!("failed to serialize usage storage: {e}"))?;

        let tmp = self.path.with_extension("tmp");
        {
            let mut file =
                fs::File::create(&tmp).map_err(|e| format!("failed to create temp file: {e}"))?;
            file.write_all(json.as_bytes())
                .map_err(|e| format!("failed to write temp file: {e}"))?;
            file.sync_all()
                .map_err(|e| format!("failed to sync temp file: {e}"))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| format!("failed to rename temp file: {e}"))
    }
}

impl UsageStorage for FileUsageStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.cache.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), String> {
        let mut cache = self
            .cache
            .write()
            .map_err(|e| format!("lock poisoned: {e}"))?;
        cache.insert(key.to_string(), value.to_string());
        self.flush(&cache)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn memory_storage_round_trip() {
        let storage = MemoryUsageStorage::new();
        assert!(storage.get("k").is_none());
        storage.set("k", "v").unwrap();
        assert_eq!(storage.get("k").as_deref(), Some("v"));
    }

    #[test]
    fn file_storage_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.json");

        let storage = FileUsageStorage::new(path.clone()).unwrap();
        storage.set("usage:hour", "{\"input_tokens\":5}").unwrap();
        drop(storage);

        let reopened = FileUsageStorage::new(path).unwrap();
        assert_eq!(
            reopened.get("usage:hour").as_deref(),
            Some("{\"input_tokens\":5}")
        );
    }

    #[test]
    fn file_storage_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let storage = FileUsageStorage::new(dir.path().join("usage.json")).unwrap();
        storage.set("a", "1").unwrap();
        storage.set("b", "2").unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
