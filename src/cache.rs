use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::types::OsInfo;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const KEY_SEPARATOR: &str = "|";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub response: String,
    pub timestamp: u64,
    pub expires_at: u64,
}

type Store = HashMap<String, CacheEntry>;

pub struct CacheManager {
    path: PathBuf,
    enabled: bool,
    ttl: Duration,
    max_entries: usize,
    model_id: String,
    prompt_version: String,
}

impl CacheManager {
    pub fn new(path: PathBuf, config: &CacheConfig, model_id: &str, prompt_version: &str) -> Self {
        Self {
            path,
            enabled: config.enabled,
            ttl: Duration::from_secs(config.ttl_secs),
            max_entries: config.max_entries.max(1),
            model_id: model_id.to_string(),
            prompt_version: prompt_version.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fingerprint of a request. The fields are joined without escaping.
    pub fn key(&self, input: &str, os: &OsInfo, learning_mode: bool) -> String {
        let mode = if learning_mode { "learn" } else { "standard" };
        let material = [
            input,
            os.platform.as_str(),
            os.arch.as_str(),
            os.shell.as_str(),
            mode,
            self.model_id.as_str(),
            self.prompt_version.as_str(),
        ]
        .join(KEY_SEPARATOR);
        to_hex(&Sha256::digest(material.as_bytes()))
    }

    pub fn get(&self, input: &str, os: &OsInfo, learning_mode: bool) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let key = self.key(input, os, learning_mode);
        match self.get_at(&key, now_millis()) {
            Ok(hit) => hit,
            Err(e) => {
                warn!(error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    pub fn set(&self, input: &str, os: &OsInfo, learning_mode: bool, response: &str) {
        if !self.enabled {
            return;
        }
        let key = self.key(input, os, learning_mode);
        if let Err(e) = self.set_at(&key, response, now_millis()) {
            warn!(error = %e, "cache write failed, skipping");
        }
    }

    pub fn clear(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "cache cleared"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "failed to clear cache"),
        }
    }

    pub fn entry_count(&self) -> usize {
        self.load().map(|store| store.len()).unwrap_or(0)
    }

    fn get_at(&self, key: &str, now: u64) -> Result<Option<String>, CacheError> {
        let mut store = self.load()?;
        let Some(entry) = store.get(key) else {
            debug!(key, "cache miss");
            return Ok(None);
        };

        if entry.expires_at <= now {
            debug!(key, "cache entry expired");
            store.remove(key);
            self.save(&store)?;
            return Ok(None);
        }

        debug!(key, "cache hit");
        Ok(Some(entry.response.clone()))
    }

    fn set_at(&self, key: &str, response: &str, now: u64) -> Result<(), CacheError> {
        let mut store = match self.load() {
            Ok(store) => store,
            Err(CacheError::Parse(e)) => {
                warn!(error = %e, "replacing corrupt cache file");
                Store::new()
            }
            Err(e) => return Err(e),
        };
        let ttl_ms = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX);
        store.insert(
            key.to_string(),
            CacheEntry {
                response: response.to_string(),
                timestamp: now,
                expires_at: now.saturating_add(ttl_ms),
            },
        );
        evict_oldest(&mut store, self.max_entries);
        self.save(&store)
    }

    fn load(&self) -> Result<Store, CacheError> {
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(Store::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Store::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, store: &Store) -> Result<(), CacheError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        // Write then rename so a crash never leaves a torn file.
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(serde_json::to_string(store)?.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)?;
        Ok(())
    }
}

/// Removes oldest-by-timestamp entries until at most `max` remain.
fn evict_oldest(store: &mut Store, max: usize) {
    if store.len() <= max {
        return;
    }
    let mut by_age: Vec<(u64, String)> = store
        .iter()
        .map(|(key, entry)| (entry.timestamp, key.clone()))
        .collect();
    by_age.sort();

    let excess = store.len() - max;
    for (_, key) in by_age.into_iter().take(excess) {
        store.remove(&key);
    }
    debug!(evicted = excess, "cache evicted oldest entries");
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
