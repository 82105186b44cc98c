//! High-level entry point tying profiles, saved credentials, settings and
//! the session supervisor together.

use crate::broker::{DeviceCode, IdentityBroker};
use crate::bundle::BundleReport;
use crate::error::{ErrorKind, VpnError, VpnResult};
use crate::launcher::{platform_launcher, ProcessLauncher};
use crate::profiles::{ConnectionProfile, ProfileKind, ProfileStore};
use crate::session::{SessionEvent, SessionInfo, Supervisor, SupervisorConfig};
use crate::settings::{AppSettings, AppState};
use crate::store::{DocumentStore, JsonFileStore};
use crate::utils::{char_prefix, get_user_data_dir};
use crate::vault::CredentialVault;
use crossbeam_channel::Receiver;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Username sent for brokered profiles; the server identifies the user by token.
pub const BROKERED_USERNAME: &str = "user";

/// Number of token characters used as the brokered password.
pub const BROKERED_PASSWORD_LEN: usize = 16;

/// Result of [`VpnClient::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub openvpn: Option<PathBuf>,
    pub escalation_tool: Option<String>,
    pub problems: Vec<String>,
}

impl HealthReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

pub struct VpnClient {
    store: Arc<dyn DocumentStore>,
    profiles: Arc<ProfileStore>,
    vault: CredentialVault,
    supervisor: Supervisor,
    settings: AppSettings,
}

impl VpnClient {
    /// Opens the client on the user data directory with the platform launcher.
    pub fn open_default() -> anyhow::Result<(Self, Receiver<SessionEvent>)> {
        let data_dir = get_user_data_dir()?;
        let store: Arc<dyn DocumentStore> = Arc::new(JsonFileStore::new(&data_dir));
        let settings = AppSettings::load(store.as_ref());
        let config = settings.supervisor_config()?;
        let launcher = platform_launcher(settings.escalation());
        Ok(Self::new(store, &data_dir, settings, config, launcher))
    }

    /// `bundle_root` hosts the per-kind bundle directories.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        bundle_root: &Path,
        settings: AppSettings,
        config: SupervisorConfig,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> (Self, Receiver<SessionEvent>) {
        let profiles = Arc::new(ProfileStore::new(store.clone(), bundle_root));
        let vault = CredentialVault::new(store.clone());
        let (supervisor, events) = Supervisor::new(config, profiles.clone(), launcher);
        let client = Self {
            store,
            profiles,
            vault,
            supervisor,
            settings,
        };
        (client, events)
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn profiles(&self) -> &ProfileStore {
        &self.profiles
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    pub fn app_state(&self) -> AppState {
        AppState::load(self.store.as_ref())
    }

    /// Bundles `source` for the profile. Refused while that profile is connected.
    pub fn import_config(
        &self,
        profile_id: &str,
        source: &Path,
        kind: ProfileKind,
    ) -> VpnResult<(ConnectionProfile, BundleReport)> {
        self.supervisor
            .while_idle(profile_id, || self.profiles.import_config(profile_id, source, kind))
    }

    /// Removes the profile, its bundle and saved credentials. Refused while
    /// that profile is connected.
    pub fn delete_profile(&self, profile_id: &str) -> VpnResult<bool> {
        self.supervisor.while_idle(profile_id, || {
            let deleted = self.profiles.delete(profile_id)?;
            if deleted {
                self.vault.forget(profile_id)?;
            }
            Ok(deleted)
        })
    }

    /// Connects with explicit credentials. Blocks until the attempt ends.
    pub fn connect(&self, profile_id: &str, username: &str, password: &str) -> VpnResult<u32> {
        self.remember_last(profile_id, username);
        self.supervisor.connect(profile_id, username, password)
    }

    /// Logs in through `broker`, publishes the token, then connects using
    /// the token prefix as password.
    pub fn connect_brokered(
        &self,
        profile_id: &str,
        broker: &dyn IdentityBroker,
        on_device_code: &mut dyn FnMut(&DeviceCode),
    ) -> VpnResult<u32> {
        if self.profiles.get(profile_id)?.is_none() {
            return Err(VpnError::new(ErrorKind::ProfileNotFound, profile_id));
        }
        let token = broker.login(on_device_code)?;
        log::info!("Signed in as {}", token.account);
        broker.publish(&token.account, &token.access_token)?;

        let password = char_prefix(&token.access_token, BROKERED_PASSWORD_LEN);
        self.remember_last(profile_id, &token.account);
        self.supervisor
            .connect(profile_id, BROKERED_USERNAME, password)
    }

    fn remember_last(&self, profile_id: &str, username: &str) {
        let state = AppState {
            last_profile_id: Some(profile_id.to_string()),
            last_username: Some(username.to_string()),
        };
        if let Err(e) = state.save(self.store.as_ref()) {
            log::warn!("Could not save app state: {:#}", e);
        }
    }

    pub fn respond_to_challenge(&self, text: &str) -> VpnResult<()> {
        self.supervisor.respond_to_challenge(text)
    }

    pub fn disconnect(&self, pid: u32) -> VpnResult<()> {
        self.supervisor.disconnect(pid)
    }

    pub fn session(&self) -> Option<SessionInfo> {
        self.supervisor.session()
    }

    /// Verifies the OpenVPN binary, escalation tool and detector patterns.
    pub fn check(&self) -> HealthReport {
        let mut problems = Vec::new();

        let openvpn = crate::launcher::locate_openvpn(&self.settings.openvpn_path);
        if openvpn.is_none() {
            problems.push(format!(
                "OpenVPN not found (configured: {:?})",
                self.settings.openvpn_path
            ));
        }

        #[cfg(unix)]
        let escalation_tool = match self.settings.escalation() {
            Some(requested) => {
                let found = crate::launcher::resolve_escalation_tool(&requested);
                if found.is_none() && !nix::unistd::geteuid().is_root() {
                    problems.push(format!(
                        "No escalation tool available (requested {:?})",
                        requested
                    ));
                }
                found
            }
            None => None,
        };
        #[cfg(not(unix))]
        let escalation_tool = None;

        if let Err(e) = self.settings.patterns() {
            problems.push(format!("{:#}", e));
        }

        HealthReport {
            openvpn,
            escalation_tool,
            problems,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::broker::BrokerToken;
    use crate::store::MemoryStore;
    use std::ffi::OsString;
    use std::process::{Child, Command, Stdio};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Echoes the credential file and reports success.
    struct EchoLauncher;

    impl ProcessLauncher for EchoLauncher {
        fn spawn(&self, _program: &Path, args: &[OsString], cwd: &Path) -> anyhow::Result<Child> {
            Ok(Command::new("/bin/sh")
                .arg("-c")
                .arg("cat \"$4\"; echo 'Initialization Sequence Completed'; exec sleep 30")
                .arg("sh")
                .args(args)
                .current_dir(cwd)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()?)
        }

        fn terminate(&self, pid: u32) -> anyhow::Result<()> {
            Command::new("kill").arg(pid.to_string()).status()?;
            Ok(())
        }

        fn force_kill(&self, pid: u32) -> anyhow::Result<()> {
            Command::new("kill").arg("-9").arg(pid.to_string()).status()?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeBroker {
        published: Mutex<Vec<(String, String)>>,
    }

    impl IdentityBroker for FakeBroker {
        fn login(&self, on_device_code: &mut dyn FnMut(&DeviceCode)) -> VpnResult<BrokerToken> {
            on_device_code(&DeviceCode {
                verification_uri: "https://microsoft.com/devicelogin".to_string(),
                user_code: "ABCD-1234".to_string(),
            });
            Ok(BrokerToken {
                access_token: "0123456789abcdefREST-OF-TOKEN".to_string(),
                account: "alice@example.com".to_string(),
            })
        }

        fn publish(&self, account: &str, token: &str) -> VpnResult<()> {
            self.published
                .lock()
                .unwrap()
                .push((account.to_string(), token.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        client: VpnClient,
        events: Receiver<SessionEvent>,
        source: PathBuf,
        _dirs: (tempfile::TempDir, tempfile::TempDir),
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let input = tempfile::tempdir().unwrap();
        std::fs::write(input.path().join("ca.crt"), "CA").unwrap();
        let source = input.path().join("office.ovpn");
        std::fs::write(&source, "client\nca ca.crt\n").unwrap();

        let config = SupervisorConfig {
            connect_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_millis(500),
            credential_dir: Some(root.path().to_path_buf()),
            ..SupervisorConfig::default()
        };
        let (client, events) = VpnClient::new(
            Arc::new(MemoryStore::new()),
            root.path(),
            AppSettings::default(),
            config,
            Arc::new(EchoLauncher),
        );
        Fixture {
            client,
            events,
            source,
            _dirs: (root, input),
        }
    }

    fn log_lines(events: &Receiver<SessionEvent>) -> Vec<String> {
        events
            .try_iter()
            .filter_map(|e| match e {
                SessionEvent::Log(line) => Some(line.text),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn brokered_connect_uses_token_prefix() {
        let f = fixture();
        f.client
            .import_config("corp", &f.source, ProfileKind::Brokered)
            .unwrap();

        let broker = FakeBroker::default();
        let mut codes = Vec::new();
        let pid = f
            .client
            .connect_brokered("corp", &broker, &mut |code| codes.push(code.user_code.clone()))
            .unwrap();

        assert_eq!(codes, ["ABCD-1234"]);
        assert_eq!(
            broker.published.lock().unwrap()[0].0,
            "alice@example.com"
        );
        let lines = log_lines(&f.events);
        assert_eq!(lines[..2], ["user".to_string(), "0123456789abcdef".to_string()]);
        assert_eq!(
            f.client.app_state().last_username.as_deref(),
            Some("alice@example.com")
        );

        f.client.disconnect(pid).unwrap();
    }

    #[test]
    fn active_profile_cannot_be_reimported_or_deleted() {
        let f = fixture();
        f.client
            .profiles()
            .save(&ConnectionProfile::new("office", "Office", ProfileKind::Direct))
            .unwrap();
        f.client
            .import_config("office", &f.source, ProfileKind::Direct)
            .unwrap();

        let pid = f.client.connect("office", "alice", "pw").unwrap();
        let err = f
            .client
            .import_config("office", &f.source, ProfileKind::Direct)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProfileInUse);
        assert_eq!(
            f.client.delete_profile("office").unwrap_err().kind(),
            ErrorKind::ProfileInUse
        );

        f.client.disconnect(pid).unwrap();
        f.client
            .import_config("office", &f.source, ProfileKind::Direct)
            .unwrap();
        assert!(f.client.delete_profile("office").unwrap());
    }

    #[test]
    fn brokered_connect_requires_a_profile() {
        let f = fixture();
        let err = f
            .client
            .connect_brokered("missing", &FakeBroker::default(), &mut |_| {})
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProfileNotFound);
    }

    #[test]
    fn delete_forgets_saved_credentials() {
        let f = fixture();
        f.client
            .profiles()
            .save(&ConnectionProfile::new("home", "Home", ProfileKind::Direct))
            .unwrap();
        f.client.vault().save("home", "bob", "pw", true).unwrap();

        assert!(f.client.delete_profile("home").unwrap());
        assert!(f.client.vault().load("home").unwrap().is_none());
    }
}
