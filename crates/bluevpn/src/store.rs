//! Key-value JSON document persistence.
//!
//! Profiles, credentials, settings and app state are each kept as one JSON
//! document under a fixed logical key. [`JsonFileStore`] maps every key to a
//! file in the user data directory; [`MemoryStore`] keeps them in memory.

use anyhow::Context;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Fixed logical document names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKey {
    UserProfiles,
    BrokeredProfiles,
    Credentials,
    AppState,
    Defaults,
}

impl StoreKey {
    pub fn file_name(self) -> &'static str {
        match self {
            StoreKey::UserProfiles => "user_profiles.json",
            StoreKey::BrokeredProfiles => "brokered_profiles.json",
            StoreKey::Credentials => "user_credentials.json",
            StoreKey::AppState => "app_state.json",
            StoreKey::Defaults => "settings.json",
        }
    }
}

pub trait DocumentStore: Send + Sync {
    /// Returns `None` when no document has been saved under `key` yet.
    fn load(&self, key: StoreKey) -> anyhow::Result<Option<Value>>;
    fn save(&self, key: StoreKey, doc: &Value) -> anyhow::Result<()>;
}

/// Stores each document as pretty-printed JSON in `dir`.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: StoreKey) -> PathBuf {
        self.dir.join(key.file_name())
    }
}

impl DocumentStore for JsonFileStore {
    fn load(&self, key: StoreKey) -> anyhow::Result<Option<Value>> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
        let doc = serde_json::from_str(&content).with_context(|| format!("parsing {:?}", path))?;
        Ok(Some(doc))
    }

    fn save(&self, key: StoreKey, doc: &Value) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir).with_context(|| format!("creating {:?}", self.dir))?;
        let path = self.path(key);
        let json = serde_json::to_string_pretty(doc)?;

        // Write-then-rename so a crash never leaves a truncated document.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("writing {:?}", tmp))?;
        fs::rename(&tmp, &path).with_context(|| format!("replacing {:?}", path))?;

        // The credentials document holds obscured passwords.
        #[cfg(unix)]
        if key == StoreKey::Credentials {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<StoreKey, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for MemoryStore {
    fn load(&self, key: StoreKey) -> anyhow::Result<Option<Value>> {
        let docs = self
            .docs
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?;
        Ok(docs.get(&key).cloned())
    }

    fn save(&self, key: StoreKey, doc: &Value) -> anyhow::Result<()> {
        let mut docs = self
            .docs
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?;
        docs.insert(key, doc.clone());
        Ok(())
    }
}
