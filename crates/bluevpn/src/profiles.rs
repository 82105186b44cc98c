//! Connection profiles and their bundle directories.

use crate::bundle::{self, BundleReport};
use crate::error::{ErrorKind, VpnError, VpnResult};
use crate::store::{DocumentStore, StoreKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    /// Username/password profile.
    Direct,
    /// Profile authenticated through the enterprise identity broker.
    Brokered,
}

impl ProfileKind {
    fn store_key(self) -> StoreKey {
        match self {
            ProfileKind::Direct => StoreKey::UserProfiles,
            ProfileKind::Brokered => StoreKey::BrokeredProfiles,
        }
    }

    fn dir_name(self) -> &'static str {
        match self {
            ProfileKind::Direct => "profiles",
            ProfileKind::Brokered => "brokered_profiles",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    pub id: String,
    pub name: String,
    pub kind: ProfileKind,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub bundle_dir: Option<PathBuf>,
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    /// File name of the configuration the bundle was imported from.
    #[serde(default)]
    pub source_file_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectionProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: ProfileKind) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            username: None,
            bundle_dir: None,
            config_path: None,
            source_file_name: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Bundle location handed to the supervisor at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBundle {
    pub profile_id: String,
    pub bundle_dir: PathBuf,
    pub config_path: PathBuf,
}

/// Looks up the bundle a profile connects with.
pub trait BundleResolver: Send + Sync {
    fn resolve(&self, profile_id: &str) -> VpnResult<ResolvedBundle>;
}

pub struct ProfileStore {
    store: Arc<dyn DocumentStore>,
    bundle_root: PathBuf,
    // Serializes read-modify-write cycles on the profile documents.
    write_lock: Mutex<()>,
}

impl ProfileStore {
    /// `bundle_root` hosts one base directory per profile kind.
    pub fn new(store: Arc<dyn DocumentStore>, bundle_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            bundle_root: bundle_root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn base_dir(&self, kind: ProfileKind) -> PathBuf {
        self.bundle_root.join(kind.dir_name())
    }

    pub fn list(&self, kind: ProfileKind) -> VpnResult<Vec<ConnectionProfile>> {
        match self.store.load(kind.store_key())? {
            Some(doc) => serde_json::from_value(doc).map_err(|e| {
                VpnError::new(ErrorKind::Storage, format!("bad {:?} profile list: {}", kind, e))
            }),
            None => Ok(Vec::new()),
        }
    }

    fn write_list(&self, kind: ProfileKind, profiles: &[ConnectionProfile]) -> VpnResult<()> {
        let doc = serde_json::to_value(profiles)
            .map_err(|e| VpnError::new(ErrorKind::Storage, e.to_string()))?;
        self.store.save(kind.store_key(), &doc)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        // The guarded data is `()`, so a poisoned lock carries no broken state.
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Looks a profile up by id, direct profiles first.
    pub fn get(&self, id: &str) -> VpnResult<Option<ConnectionProfile>> {
        for kind in [ProfileKind::Direct, ProfileKind::Brokered] {
            if let Some(p) = self.list(kind)?.into_iter().find(|p| p.id == id) {
                return Ok(Some(p));
            }
        }
        Ok(None)
    }

    /// Inserts or replaces `profile` in its kind's collection.
    pub fn save(&self, profile: &ConnectionProfile) -> VpnResult<()> {
        bundle::check_profile_id(&profile.id)?;
        let _guard = self.lock();
        self.upsert(profile.clone())
    }

    fn upsert(&self, mut profile: ConnectionProfile) -> VpnResult<()> {
        profile.updated_at = Utc::now();
        let kind = profile.kind;
        let mut profiles = self.list(kind)?;
        match profiles.iter_mut().find(|p| p.id == profile.id) {
            Some(existing) => *existing = profile,
            None => profiles.push(profile),
        }
        self.write_list(kind, &profiles)
    }

    /// Removes the profile and its bundle directory. Returns `false` if no
    /// such profile existed.
    pub fn delete(&self, id: &str) -> VpnResult<bool> {
        bundle::check_profile_id(id)?;
        let _guard = self.lock();
        for kind in [ProfileKind::Direct, ProfileKind::Brokered] {
            let mut profiles = self.list(kind)?;
            let before = profiles.len();
            profiles.retain(|p| p.id != id);
            if profiles.len() == before {
                continue;
            }
            self.write_list(kind, &profiles)?;

            let dir = self.base_dir(kind).join(id);
            if dir.exists() {
                if let Err(e) = fs::remove_dir_all(&dir) {
                    log::warn!("Failed to remove bundle {}: {}", dir.display(), e);
                }
            }
            log::info!("Deleted profile {}", id);
            return Ok(true);
        }
        Ok(false)
    }

    /// Bundles `source` for profile `id`, replacing any previous bundle.
    ///
    /// A direct profile must already exist; a brokered profile is created on
    /// first import.
    pub fn import_config(
        &self,
        id: &str,
        source: &Path,
        kind: ProfileKind,
    ) -> VpnResult<(ConnectionProfile, BundleReport)> {
        bundle::check_profile_id(id)?;
        let _guard = self.lock();

        let source_file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut profile = match self.list(kind)?.into_iter().find(|p| p.id == id) {
            Some(p) => p,
            None if kind == ProfileKind::Brokered => {
                ConnectionProfile::new(id, format!("Brokered {}", source_file_name), kind)
            }
            None => {
                return Err(VpnError::new(
                    ErrorKind::ProfileNotFound,
                    format!("no direct profile with id {}", id),
                ))
            }
        };

        // Bundle into a staging area first so a failed import keeps the old bundle.
        let base = self.base_dir(kind);
        let staging = base.join(".staging");
        let _ = fs::remove_dir_all(staging.join(id));
        let staged = bundle::bundle(source, id, &staging)?;

        let final_dir = base.join(id);
        if final_dir.exists() {
            fs::remove_dir_all(&final_dir).map_err(|e| {
                VpnError::new(
                    ErrorKind::ConfigInvalid,
                    format!("cannot replace {}: {}", final_dir.display(), e),
                )
            })?;
        }
        fs::rename(&staged.bundle_dir, &final_dir).map_err(|e| {
            VpnError::new(
                ErrorKind::ConfigInvalid,
                format!("cannot move bundle into {}: {}", final_dir.display(), e),
            )
        })?;
        let _ = fs::remove_dir(&staging);

        let config_path = final_dir.join(
            staged
                .config_path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new(id)),
        );
        let report = BundleReport {
            bundle_dir: final_dir.clone(),
            config_path: config_path.clone(),
            files_copied: staged.files_copied,
            missing: staged.missing,
        };

        profile.bundle_dir = Some(final_dir);
        profile.config_path = Some(config_path);
        profile.source_file_name = Some(source_file_name);
        self.upsert(profile.clone())?;

        log::info!(
            "Profile {} imported ({} file(s) copied)",
            id,
            report.files_copied
        );
        Ok((profile, report))
    }
}

impl BundleResolver for ProfileStore {
    fn resolve(&self, profile_id: &str) -> VpnResult<ResolvedBundle> {
        let profile = self.get(profile_id)?.ok_or_else(|| {
            VpnError::new(
                ErrorKind::ProfileNotFound,
                format!("no profile with id {}", profile_id),
            )
        })?;

        let (Some(bundle_dir), Some(config_path)) = (profile.bundle_dir, profile.config_path)
        else {
            return Err(VpnError::new(
                ErrorKind::BundleMissing,
                format!("profile {} has no imported configuration", profile_id),
            ));
        };
        if !bundle_dir.is_dir() || !config_path.is_file() {
            return Err(VpnError::new(
                ErrorKind::BundleMissing,
                format!("configuration not found: {}", config_path.display()),
            ));
        }

        Ok(ResolvedBundle {
            profile_id: profile_id.to_string(),
            bundle_dir,
            config_path,
        })
    }
}
