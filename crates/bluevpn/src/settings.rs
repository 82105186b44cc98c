use crate::detector::{ExtraPattern, PatternSet};
use crate::launcher::{locate_openvpn, DEFAULT_OPENVPN};
use crate::session::SupervisorConfig;
use crate::store::{DocumentStore, StoreKey};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppSettings {
    pub openvpn_path: String,
    /// `"auto"`, a tool name, or `"none"` to run OpenVPN directly.
    pub escalation_tool: String,
    pub connect_timeout_secs: u64,
    pub challenge_timeout_secs: u64,
    pub kill_grace_secs: u64,
    pub log_level: String,
    pub extra_patterns: Vec<ExtraPattern>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            openvpn_path: DEFAULT_OPENVPN.to_string(),
            escalation_tool: default_escalation().to_string(),
            connect_timeout_secs: 45,
            challenge_timeout_secs: 120,
            kill_grace_secs: 5,
            log_level: "info".to_string(),
            extra_patterns: Vec::new(),
        }
    }
}

fn default_escalation() -> &'static str {
    if cfg!(windows) {
        "none"
    } else {
        "auto"
    }
}

impl AppSettings {
    /// Loads the settings document; anything unreadable yields the defaults.
    pub fn load(store: &dyn DocumentStore) -> Self {
        match store.load(StoreKey::Defaults) {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
                log::warn!("Ignoring invalid settings: {}", e);
                Self::default()
            }),
            Ok(None) => Self::default(),
            Err(e) => {
                log::warn!("Could not read settings: {:#}", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, store: &dyn DocumentStore) -> anyhow::Result<()> {
        store.save(StoreKey::Defaults, &serde_json::to_value(self)?)
    }

    /// Escalation tool to hand to the launcher, `None` for direct launch.
    pub fn escalation(&self) -> Option<String> {
        match self.escalation_tool.trim() {
            "" | "none" => None,
            tool => Some(tool.to_string()),
        }
    }

    pub fn level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }

    /// Resolved OpenVPN binary, or the configured value when nothing is found.
    pub fn openvpn_binary(&self) -> PathBuf {
        locate_openvpn(&self.openvpn_path).unwrap_or_else(|| {
            let fallback = if self.openvpn_path.trim().is_empty() {
                DEFAULT_OPENVPN
            } else {
                self.openvpn_path.as_str()
            };
            PathBuf::from(fallback)
        })
    }

    pub fn patterns(&self) -> anyhow::Result<PatternSet> {
        PatternSet::with_extra(&self.extra_patterns)
    }

    pub fn supervisor_config(&self) -> anyhow::Result<SupervisorConfig> {
        Ok(SupervisorConfig {
            openvpn_path: self.openvpn_binary(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            challenge_timeout: Duration::from_secs(self.challenge_timeout_secs.max(1)),
            kill_grace: Duration::from_secs(self.kill_grace_secs.max(1)),
            patterns: Arc::new(self.patterns()?),
            ..SupervisorConfig::default()
        })
    }
}

/// Small bits of UI state remembered between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppState {
    pub last_profile_id: Option<String>,
    pub last_username: Option<String>,
}

impl AppState {
    pub fn load(store: &dyn DocumentStore) -> Self {
        store
            .load(StoreKey::AppState)
            .ok()
            .flatten()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, store: &dyn DocumentStore) -> anyhow::Result<()> {
        store.save(StoreKey::AppState, &serde_json::to_value(self)?)
    }
}
