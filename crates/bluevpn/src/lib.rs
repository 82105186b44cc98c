//! # bluevpn
//!
//! Core library for an OpenVPN desktop client: connection profiles and their
//! self-contained configuration bundles, saved credentials, and a supervisor
//! that drives one OpenVPN process through its connection lifecycle,
//! relaying authentication challenges to the caller.

pub mod broker;
pub mod bundle;
pub mod client;
pub mod detector;
pub mod error;
pub mod launcher;
pub mod logger;
pub mod profiles;
pub mod session;
pub mod settings;
pub mod store;
pub mod utils;
pub mod vault;

// Re-export commonly used items
pub use broker::{BrokerToken, DeviceCode, IdentityBroker, StaticTokenBroker};
pub use client::{HealthReport, VpnClient};
pub use detector::{ChallengeKind, PatternSet, Signal};
pub use error::{ErrorCategory, ErrorKind, VpnError, VpnResult};
pub use launcher::{locate_openvpn, platform_launcher, ProcessLauncher};
pub use logger::init_logger;
pub use profiles::{ConnectionProfile, ProfileKind, ProfileStore};
pub use session::{
    ChallengeDescriptor, LogLine, Phase, SessionEvent, SessionInfo, Supervisor, SupervisorConfig,
};
pub use settings::{AppSettings, AppState};
pub use store::{DocumentStore, JsonFileStore, MemoryStore, StoreKey};
pub use utils::get_user_data_dir;
pub use vault::{CredentialRecord, CredentialVault};
