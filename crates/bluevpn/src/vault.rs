//! Saved per-profile credentials.
//!
//! The username is always kept so it can be pre-filled; the password is kept
//! only when the user opts in. Stored passwords are base64-obscured, which
//! keeps them from being read at a glance but is NOT encryption. Callers
//! that need real confidentiality must put a platform secret store behind a
//! [`DocumentStore`] of their own.

use crate::error::{ErrorKind, VpnError, VpnResult};
use crate::store::{DocumentStore, StoreKey};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    pub username: String,
    /// Obscured on disk; plain text once returned from [`CredentialVault::load`].
    pub password: String,
    pub remember_password: bool,
    pub updated_at: DateTime<Utc>,
}

pub struct CredentialVault {
    store: Arc<dyn DocumentStore>,
}

fn obscure(password: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(password.as_bytes())
}

fn reveal(obscured: &str) -> anyhow::Result<String> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(obscured)?;
    Ok(String::from_utf8(bytes)?)
}

impl CredentialVault {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    fn load_all(&self) -> VpnResult<BTreeMap<String, CredentialRecord>> {
        let doc = self.store.load(StoreKey::Credentials)?;
        match doc {
            Some(doc) => serde_json::from_value(doc).map_err(|e| {
                VpnError::new(ErrorKind::Storage, format!("bad credentials document: {}", e))
            }),
            None => Ok(BTreeMap::new()),
        }
    }

    fn save_all(&self, all: &BTreeMap<String, CredentialRecord>) -> VpnResult<()> {
        let doc = serde_json::to_value(all)
            .map_err(|e| VpnError::new(ErrorKind::Storage, e.to_string()))?;
        self.store.save(StoreKey::Credentials, &doc)?;
        Ok(())
    }

    pub fn save(
        &self,
        profile_id: &str,
        username: &str,
        password: &str,
        remember: bool,
    ) -> VpnResult<()> {
        let mut all = self.load_all()?;
        let stored_password = if remember {
            obscure(password)
        } else {
            String::new()
        };
        all.insert(
            profile_id.to_string(),
            CredentialRecord {
                username: username.to_string(),
                password: stored_password,
                remember_password: remember,
                updated_at: Utc::now(),
            },
        );
        self.save_all(&all)?;
        log::debug!(
            "Saved credentials for profile {} (password remembered: {})",
            profile_id,
            remember
        );
        Ok(())
    }

    /// Returns the record with its password revealed, or an empty password
    /// when it was not remembered.
    pub fn load(&self, profile_id: &str) -> VpnResult<Option<CredentialRecord>> {
        let Some(mut record) = self.load_all()?.remove(profile_id) else {
            return Ok(None);
        };

        record.password = if record.remember_password && !record.password.is_empty() {
            match reveal(&record.password) {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("Discarding unreadable saved password for {}: {}", profile_id, e);
                    String::new()
                }
            }
        } else {
            String::new()
        };
        Ok(Some(record))
    }

    /// Removes the saved record. Returns `true` if one existed.
    pub fn forget(&self, profile_id: &str) -> VpnResult<bool> {
        let mut all = self.load_all()?;
        let existed = all.remove(profile_id).is_some();
        if existed {
            self.save_all(&all)?;
        }
        Ok(existed)
    }
}
