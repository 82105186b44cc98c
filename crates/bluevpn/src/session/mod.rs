//! OpenVPN session supervision.
//!
//! A [`Supervisor`] owns at most one OpenVPN process. Each connection attempt
//! gets its own driver thread (see [`driver`]) that reads the process output,
//! runs the timers and answers caller commands; the supervisor itself only
//! holds the slot that says which attempt is current.

mod credfile;
mod driver;

use crate::detector::{ChallengeDetector, ChallengeKind, PatternSet, Stream};
use crate::error::{ErrorKind, VpnError, VpnResult};
use crate::launcher::{ProcessLauncher, DEFAULT_OPENVPN};
use crate::profiles::BundleResolver;
use credfile::CredentialFile;
use crossbeam_channel::{Receiver, Sender};
use driver::{Driver, DriverInput, Timeouts};
use std::ffi::OsString;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Log target used for lines forwarded from the OpenVPN process.
pub const PROCESS_LOG_TARGET: &str = "bluevpn::openvpn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Launching,
    AwaitingChallengeResponse,
    Connected,
    Disconnecting,
    Failed,
}

/// A pending request for user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeDescriptor {
    pub kind: ChallengeKind,
    pub prompt: String,
    /// Whether the answer may be shown while typed.
    pub echo: bool,
    /// The attempt fails with `ChallengeTimeout` after this instant.
    pub deadline: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub stream: Stream,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Phase {
        profile_id: String,
        phase: Phase,
    },
    Challenge(ChallengeDescriptor),
    Log(LogLine),
    /// The process is gone and the supervisor is idle again.
    Disconnected {
        profile_id: String,
        pid: u32,
        exit_code: Option<i32>,
    },
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub openvpn_path: PathBuf,
    pub connect_timeout: Duration,
    pub challenge_timeout: Duration,
    /// Wait between terminate and force kill, and again before giving up.
    pub kill_grace: Duration,
    /// Quiet period before an unterminated line is checked for a prompt.
    pub prompt_settle: Duration,
    /// Where credential files are created; the system temp dir when `None`.
    pub credential_dir: Option<PathBuf>,
    pub patterns: Arc<PatternSet>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            openvpn_path: PathBuf::from(DEFAULT_OPENVPN),
            connect_timeout: Duration::from_secs(45),
            challenge_timeout: Duration::from_secs(120),
            kill_grace: Duration::from_secs(5),
            prompt_settle: Duration::from_millis(150),
            credential_dir: None,
            patterns: Arc::new(PatternSet::default()),
        }
    }
}

/// Snapshot of the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub profile_id: String,
    pub pid: u32,
    pub phase: Phase,
    pub challenge: Option<ChallengeDescriptor>,
}

/// Written by the driver, read by [`Supervisor::session`].
#[derive(Debug)]
struct SessionStatus {
    phase: Phase,
    challenge: Option<ChallengeDescriptor>,
}

struct SessionHandle {
    attempt: u64,
    pid: u32,
    profile_id: String,
    inputs: Sender<DriverInput>,
    status: Arc<Mutex<SessionStatus>>,
}

type Slot = Arc<Mutex<Option<SessionHandle>>>;

pub struct Supervisor {
    config: SupervisorConfig,
    resolver: Arc<dyn BundleResolver>,
    launcher: Arc<dyn ProcessLauncher>,
    events: Sender<SessionEvent>,
    slot: Slot,
    next_attempt: AtomicU64,
}

impl Supervisor {
    /// Returns the supervisor and the receiving end of its event stream.
    pub fn new(
        config: SupervisorConfig,
        resolver: Arc<dyn BundleResolver>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> (Self, Receiver<SessionEvent>) {
        let (events, rx) = crossbeam_channel::unbounded();
        let supervisor = Self {
            config,
            resolver,
            launcher,
            events,
            slot: Arc::new(Mutex::new(None)),
            next_attempt: AtomicU64::new(1),
        };
        (supervisor, rx)
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Starts OpenVPN for `profile_id` and blocks until the attempt
    /// succeeds or has fully ended. Returns the process id.
    pub fn connect(&self, profile_id: &str, username: &str, password: &str) -> VpnResult<u32> {
        let outcome = {
            let mut slot = self.lock_slot()?;
            if let Some(active) = slot.as_ref() {
                return Err(VpnError::new(
                    ErrorKind::SessionAlreadyActive,
                    format!("profile {} (pid {})", active.profile_id, active.pid),
                ));
            }
            let (handle, outcome) = self.launch(profile_id, username, password)?;
            *slot = Some(handle);
            outcome
        };

        outcome.recv().unwrap_or_else(|_| {
            Err(VpnError::new(
                ErrorKind::ProcessExited,
                "session ended without reporting an outcome",
            ))
        })
    }

    /// Resolves the bundle, spawns the process and starts its threads.
    /// Runs with the slot locked.
    fn launch(
        &self,
        profile_id: &str,
        username: &str,
        password: &str,
    ) -> VpnResult<(SessionHandle, Receiver<VpnResult<u32>>)> {
        let bundle = self.resolver.resolve(profile_id)?;
        let credentials =
            CredentialFile::create(self.config.credential_dir.as_deref(), username, password)
                .map_err(|e| {
                    VpnError::new(
                        ErrorKind::Storage,
                        format!("cannot write credential file: {:#}", e),
                    )
                })?;

        let args: Vec<OsString> = vec![
            "--config".into(),
            bundle.config_path.clone().into_os_string(),
            "--auth-user-pass".into(),
            credentials.path().as_os_str().to_os_string(),
            "--auth-retry".into(),
            "interact".into(),
        ];
        log::debug!(
            "Spawning {} in {}",
            self.config.openvpn_path.display(),
            bundle.bundle_dir.display()
        );
        let mut child = self
            .launcher
            .spawn(&self.config.openvpn_path, &args, &bundle.bundle_dir)
            .map_err(|e| VpnError::new(ErrorKind::ProcessSpawnFailed, format!("{:#}", e)))?;
        let pid = child.id();

        let (tx, rx) = crossbeam_channel::unbounded();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, Stream::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, Stream::Stderr, tx.clone());
        }
        let stdin = child.stdin.take();
        {
            let tx = tx.clone();
            thread::spawn(move || {
                let status = child
                    .wait()
                    .map_err(|e| log::error!("Failed waiting for openvpn: {}", e))
                    .ok();
                let _ = tx.send(DriverInput::Exited(status));
            });
        }

        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let status = Arc::new(Mutex::new(SessionStatus {
            phase: Phase::Launching,
            challenge: None,
        }));
        let (outcome_tx, outcome_rx) = crossbeam_channel::bounded(1);

        let driver = Driver {
            attempt,
            pid,
            profile_id: profile_id.to_string(),
            inputs: rx,
            stdin,
            detector: ChallengeDetector::new(self.config.patterns.clone()),
            credentials,
            launcher: self.launcher.clone(),
            events: self.events.clone(),
            status: status.clone(),
            slot: self.slot.clone(),
            outcome: Some(outcome_tx),
            timeouts: Timeouts {
                connect: self.config.connect_timeout,
                challenge: self.config.challenge_timeout,
                kill_grace: self.config.kill_grace,
                prompt_settle: self.config.prompt_settle,
            },
        };
        thread::Builder::new()
            .name(format!("session-{}", pid))
            .spawn(move || driver.run())
            .map_err(|e| {
                VpnError::new(
                    ErrorKind::ProcessSpawnFailed,
                    format!("cannot start session thread: {}", e),
                )
            })?;

        let handle = SessionHandle {
            attempt,
            pid,
            profile_id: profile_id.to_string(),
            inputs: tx,
            status,
        };
        Ok((handle, outcome_rx))
    }

    /// Sends `text` as the answer to the pending challenge. Returns once the
    /// answer is written, not when the connection completes.
    pub fn respond_to_challenge(&self, text: &str) -> VpnResult<()> {
        let inputs = self.active_inputs(None)?;
        let (reply, response) = crossbeam_channel::bounded(1);
        inputs
            .send(DriverInput::Respond {
                text: text.to_string(),
                reply,
            })
            .map_err(|_| no_session())?;
        response.recv().unwrap_or_else(|_| Err(no_session()))
    }

    /// Stops the session running as `pid` and waits until it is gone.
    pub fn disconnect(&self, pid: u32) -> VpnResult<()> {
        let inputs = self.active_inputs(Some(pid))?;
        let (reply, response) = crossbeam_channel::bounded(1);
        if inputs.send(DriverInput::Disconnect { reply }).is_err() {
            return Ok(());
        }
        // A driver that finished before answering has already torn down.
        response.recv().unwrap_or(Ok(()))
    }

    pub fn session(&self) -> Option<SessionInfo> {
        let slot = self.slot.lock().ok()?;
        let handle = slot.as_ref()?;
        let status = handle.status.lock().ok()?;
        Some(SessionInfo {
            profile_id: handle.profile_id.clone(),
            pid: handle.pid,
            phase: status.phase,
            challenge: status.challenge.clone(),
        })
    }

    /// Runs `f` with the slot locked, so no session can start until it
    /// returns. Fails with `ProfileInUse` if `profile_id` is the active
    /// session.
    pub fn while_idle<T>(&self, profile_id: &str, f: impl FnOnce() -> VpnResult<T>) -> VpnResult<T> {
        let slot = self.lock_slot()?;
        if let Some(active) = slot.as_ref().filter(|h| h.profile_id == profile_id) {
            return Err(VpnError::new(
                ErrorKind::ProfileInUse,
                format!("disconnect {} first (pid {})", active.profile_id, active.pid),
            ));
        }
        f()
    }

    /// Disconnects the active session, if any.
    pub fn shutdown(&self) {
        if let Some(info) = self.session() {
            log::info!("Shutting down session for profile {}", info.profile_id);
            if let Err(e) = self.disconnect(info.pid) {
                log::warn!("Shutdown: {}", e);
            }
        }
    }

    fn active_inputs(&self, pid: Option<u32>) -> VpnResult<Sender<DriverInput>> {
        let slot = self.lock_slot()?;
        match slot.as_ref() {
            Some(handle) if pid.map_or(true, |p| p == handle.pid) => Ok(handle.inputs.clone()),
            Some(handle) => Err(VpnError::new(
                ErrorKind::NoActiveSession,
                format!("pid {} is not the active session (pid {})", pid.unwrap_or_default(), handle.pid),
            )),
            None => Err(no_session()),
        }
    }

    fn lock_slot(&self) -> VpnResult<std::sync::MutexGuard<'_, Option<SessionHandle>>> {
        self.slot
            .lock()
            .map_err(|_| VpnError::new(ErrorKind::Storage, "session state lock poisoned"))
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn no_session() -> VpnError {
    VpnError::new(ErrorKind::NoActiveSession, "")
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R, stream: Stream, tx: Sender<DriverInput>) {
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(DriverInput::Output(stream, buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("{:?} reader stopped: {}", stream, e);
                    break;
                }
            }
        }
        let _ = tx.send(DriverInput::Closed(stream));
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::profiles::ResolvedBundle;
    use std::path::Path;
    use std::sync::atomic::AtomicBool;
    use std::process::{Child, Command, Stdio};

    /// Runs the configured shell script in place of OpenVPN. The script gets
    /// the OpenVPN arguments as `$1..$6`, so `$4` is the credential file.
    struct ScriptLauncher {
        script: String,
    }

    impl ProcessLauncher for ScriptLauncher {
        fn spawn(&self, _program: &Path, args: &[OsString], cwd: &Path) -> anyhow::Result<Child> {
            Ok(Command::new("/bin/sh")
                .arg("-c")
                .arg(&self.script)
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

    struct FixedBundle(PathBuf);

    impl BundleResolver for FixedBundle {
        fn resolve(&self, profile_id: &str) -> VpnResult<ResolvedBundle> {
            if profile_id != "work" {
                return Err(VpnError::new(ErrorKind::ProfileNotFound, profile_id));
            }
            Ok(ResolvedBundle {
                profile_id: profile_id.to_string(),
                bundle_dir: self.0.clone(),
                config_path: self.0.join("work.ovpn"),
            })
        }
    }

    struct Fixture {
        supervisor: Arc<Supervisor>,
        events: Receiver<SessionEvent>,
        creds: tempfile::TempDir,
        _bundle: tempfile::TempDir,
    }

    fn fixture(script: &str, connect_timeout: Duration) -> Fixture {
        fixture_with(script, connect_timeout, Duration::from_secs(10))
    }

    fn fixture_with(script: &str, connect_timeout: Duration, challenge_timeout: Duration) -> Fixture {
        let bundle = tempfile::tempdir().unwrap();
        let creds = tempfile::tempdir().unwrap();
        let config = SupervisorConfig {
            connect_timeout,
            challenge_timeout,
            kill_grace: Duration::from_millis(500),
            prompt_settle: Duration::from_millis(50),
            credential_dir: Some(creds.path().to_path_buf()),
            ..SupervisorConfig::default()
        };
        let (supervisor, events) = Supervisor::new(
            config,
            Arc::new(FixedBundle(bundle.path().to_path_buf())),
            Arc::new(ScriptLauncher {
                script: script.to_string(),
            }),
        );
        Fixture {
            supervisor: Arc::new(supervisor),
            events,
            creds,
            _bundle: bundle,
        }
    }

    fn cred_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    fn wait_for<F: Fn(&SessionEvent) -> bool>(events: &Receiver<SessionEvent>, pred: F) -> SessionEvent {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let event = events.recv_deadline(deadline).expect("event did not arrive");
            if pred(&event) {
                return event;
            }
        }
    }

    fn wait_idle(supervisor: &Supervisor) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while supervisor.session().is_some() {
            assert!(Instant::now() < deadline, "session did not end");
            thread::sleep(Duration::from_millis(20));
        }
    }

    const CONNECTS: &str = "cat \"$4\"; echo 'Initialization Sequence Completed'; exec sleep 30";

    #[test]
    fn connect_passes_credentials_and_scrubs_them() {
        let f = fixture(CONNECTS, Duration::from_secs(10));
        let pid = f.supervisor.connect("work", "alice", "s3cret").unwrap();

        let info = f.supervisor.session().unwrap();
        assert_eq!(info.pid, pid);
        assert_eq!(info.phase, Phase::Connected);
        assert_eq!(cred_files(f.creds.path()), 0);

        let mut lines = Vec::new();
        while let Ok(event) = f.events.try_recv() {
            if let SessionEvent::Log(line) = event {
                lines.push(line.text);
            }
        }
        assert_eq!(lines[..2], ["alice".to_string(), "s3cret".to_string()]);

        f.supervisor.disconnect(pid).unwrap();
        assert!(f.supervisor.session().is_none());
        wait_for(&f.events, |e| matches!(e, SessionEvent::Disconnected { .. }));
    }

    #[test]
    fn second_connect_is_rejected_while_connected() {
        let f = fixture(CONNECTS, Duration::from_secs(10));
        let pid = f.supervisor.connect("work", "alice", "pw").unwrap();

        let err = f.supervisor.connect("work", "alice", "pw").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionAlreadyActive);
        assert_eq!(f.supervisor.session().unwrap().phase, Phase::Connected);

        let err = f.supervisor.disconnect(pid + 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoActiveSession);
        f.supervisor.disconnect(pid).unwrap();
    }

    #[test]
    fn challenge_is_reported_once_and_answered_through_stdin() {
        let script = "echo 'CHALLENGE: Enter OTP'; echo 'CHALLENGE: Enter OTP'; \
                      read answer; echo \"got $answer\"; \
                      echo 'Initialization Sequence Completed'; exec sleep 30";
        let f = fixture(script, Duration::from_secs(10));

        let sup = f.supervisor.clone();
        let connecting = thread::spawn(move || sup.connect("work", "alice", "pw"));

        let event = wait_for(&f.events, |e| matches!(e, SessionEvent::Challenge(_)));
        let SessionEvent::Challenge(challenge) = event else {
            unreachable!()
        };
        assert_eq!(challenge.prompt, "Enter OTP");
        assert_eq!(challenge.kind, ChallengeKind::StaticToken);
        assert!(challenge.echo);
        assert_eq!(
            f.supervisor.session().unwrap().phase,
            Phase::AwaitingChallengeResponse
        );

        // The repeated prompt is logged but raises nothing.
        let next = wait_for(&f.events, |e| {
            matches!(e, SessionEvent::Log(_) | SessionEvent::Challenge(_))
        });
        assert!(matches!(next, SessionEvent::Log(ref l) if l.text.contains("CHALLENGE")));

        f.supervisor.respond_to_challenge("123456").unwrap();
        let pid = connecting.join().unwrap().unwrap();

        let mut challenges = 1;
        let mut answered = false;
        while let Ok(event) = f.events.try_recv() {
            match event {
                SessionEvent::Challenge(_) => challenges += 1,
                SessionEvent::Log(line) if line.text == "got 123456" => answered = true,
                _ => {}
            }
        }
        assert_eq!(challenges, 1);
        assert!(answered);
        assert_eq!(cred_files(f.creds.path()), 0);

        let err = f.supervisor.respond_to_challenge("again").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoPendingChallenge);
        f.supervisor.disconnect(pid).unwrap();
    }

    #[test]
    fn unterminated_elevation_prompt_is_detected() {
        let script = "printf '[sudo] password for alice: ' >&2; read pw; \
                      echo 'Initialization Sequence Completed'; exec sleep 30";
        let f = fixture(script, Duration::from_secs(10));

        let sup = f.supervisor.clone();
        let connecting = thread::spawn(move || sup.connect("work", "alice", "pw"));

        let event = wait_for(&f.events, |e| matches!(e, SessionEvent::Challenge(_)));
        let SessionEvent::Challenge(challenge) = event else {
            unreachable!()
        };
        assert_eq!(challenge.kind, ChallengeKind::PrivilegeElevation);
        assert!(!challenge.echo);

        f.supervisor.respond_to_challenge("rootpw").unwrap();
        let pid = connecting.join().unwrap().unwrap();
        f.supervisor.disconnect(pid).unwrap();
    }

    #[test]
    fn unanswered_challenge_times_out() {
        let f = fixture_with(
            "echo 'CHALLENGE: Enter OTP'; exec sleep 30",
            Duration::from_millis(200),
            Duration::from_millis(600),
        );
        let started = Instant::now();
        let err = f.supervisor.connect("work", "alice", "pw").unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ChallengeTimeout);
        // The connect budget is paused while the challenge is pending.
        assert!(started.elapsed() >= Duration::from_millis(600));
        assert!(f.supervisor.session().is_none());
        assert_eq!(cred_files(f.creds.path()), 0);
        wait_for(&f.events, |e| matches!(e, SessionEvent::Disconnected { .. }));
    }

    #[test]
    fn connect_budget_pauses_during_a_challenge() {
        let script = "echo 'CHALLENGE: Enter OTP'; read answer; \
                      echo 'Initialization Sequence Completed'; exec sleep 30";
        let f = fixture_with(script, Duration::from_millis(300), Duration::from_secs(10));

        let sup = f.supervisor.clone();
        let connecting = thread::spawn(move || sup.connect("work", "alice", "pw"));
        wait_for(&f.events, |e| matches!(e, SessionEvent::Challenge(_)));

        // Well past the connect budget, but the challenge is still pending.
        thread::sleep(Duration::from_millis(700));
        assert_eq!(
            f.supervisor.session().unwrap().phase,
            Phase::AwaitingChallengeResponse
        );

        f.supervisor.respond_to_challenge("123456").unwrap();
        let pid = connecting.join().unwrap().unwrap();
        assert_eq!(f.supervisor.session().unwrap().phase, Phase::Connected);
        f.supervisor.disconnect(pid).unwrap();
    }

    #[test]
    fn prompt_that_arrives_while_a_challenge_is_pending_is_raised_after_the_response() {
        let script = "echo 'CHALLENGE: Enter OTP'; sleep 0.2; \
                      printf '[sudo] password for alice: ' >&2; read otp; read pw; \
                      echo \"got $otp $pw\"; echo 'Initialization Sequence Completed'; exec sleep 30";
        let f = fixture(script, Duration::from_secs(10));

        let sup = f.supervisor.clone();
        let connecting = thread::spawn(move || sup.connect("work", "alice", "pw"));

        let SessionEvent::Challenge(first) =
            wait_for(&f.events, |e| matches!(e, SessionEvent::Challenge(_)))
        else {
            unreachable!()
        };
        assert_eq!(first.kind, ChallengeKind::StaticToken);

        // Let the elevation prompt land while the first challenge is pending.
        thread::sleep(Duration::from_millis(500));
        f.supervisor.respond_to_challenge("123456").unwrap();

        let SessionEvent::Challenge(second) =
            wait_for(&f.events, |e| matches!(e, SessionEvent::Challenge(_)))
        else {
            unreachable!()
        };
        assert_eq!(second.kind, ChallengeKind::PrivilegeElevation);
        assert!(!second.echo);

        f.supervisor.respond_to_challenge("rootpw").unwrap();
        let pid = connecting.join().unwrap().unwrap();
        let answered = f
            .events
            .try_iter()
            .any(|e| matches!(e, SessionEvent::Log(ref l) if l.text == "got 123456 rootpw"));
        assert!(answered);
        f.supervisor.disconnect(pid).unwrap();
    }

    #[test]
    fn silent_process_times_out_and_is_killed() {
        let f = fixture("exec sleep 30", Duration::from_millis(300));
        let err = f.supervisor.connect("work", "alice", "pw").unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConnectTimeout);
        assert!(f.supervisor.session().is_none());
        assert_eq!(cred_files(f.creds.path()), 0);
        wait_for(&f.events, |e| matches!(e, SessionEvent::Disconnected { .. }));
    }

    #[test]
    fn auth_failure_rejects_the_connect() {
        let f = fixture(
            "echo 'AUTH: Received control message: AUTH_FAILED'; exec sleep 30",
            Duration::from_secs(10),
        );
        let err = f.supervisor.connect("work", "alice", "wrong").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert!(err.is_credential_error());
        assert_eq!(cred_files(f.creds.path()), 0);
        assert!(f.supervisor.session().is_none());
    }

    #[test]
    fn missing_file_names_the_path() {
        let f = fixture(
            "echo \"Options error: --ca fails with 'ca.crt': No such file or directory\" >&2; exit 1",
            Duration::from_secs(10),
        );
        let err = f.supervisor.connect("work", "alice", "pw").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingCertificateFile);
        assert!(err.detail().contains("ca.crt"));
    }

    #[test]
    fn early_exit_reports_process_exited() {
        let f = fixture("exit 3", Duration::from_secs(10));
        let err = f.supervisor.connect("work", "alice", "pw").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProcessExited);

        let event = wait_for(&f.events, |e| matches!(e, SessionEvent::Disconnected { .. }));
        assert!(matches!(
            event,
            SessionEvent::Disconnected { exit_code: Some(3), .. }
        ));
    }

    #[test]
    fn disconnect_cancels_a_pending_connect() {
        let f = fixture("echo 'CHALLENGE: token'; exec sleep 30", Duration::from_secs(10));

        let sup = f.supervisor.clone();
        let connecting = thread::spawn(move || sup.connect("work", "alice", "pw"));
        wait_for(&f.events, |e| matches!(e, SessionEvent::Challenge(_)));

        let pid = f.supervisor.session().unwrap().pid;
        f.supervisor.disconnect(pid).unwrap();

        let err = connecting.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(cred_files(f.creds.path()), 0);
        wait_idle(&f.supervisor);
    }

    #[test]
    fn unknown_profile_fails_before_spawning() {
        let f = fixture(CONNECTS, Duration::from_secs(10));
        let err = f.supervisor.connect("home", "alice", "pw").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProfileNotFound);
        assert_eq!(cred_files(f.creds.path()), 0);
        assert!(f.events.try_recv().is_err());
    }

    #[test]
    fn commands_without_a_session_fail() {
        let f = fixture(CONNECTS, Duration::from_secs(10));
        assert_eq!(
            f.supervisor.respond_to_challenge("x").unwrap_err().kind(),
            ErrorKind::NoActiveSession
        );
        assert_eq!(
            f.supervisor.disconnect(42).unwrap_err().kind(),
            ErrorKind::NoActiveSession
        );
    }

    #[test]
    fn connect_waits_for_a_profile_mutation_to_finish() {
        let f = fixture(CONNECTS, Duration::from_secs(10));
        let done = Arc::new(AtomicBool::new(false));
        let (started_tx, started) = crossbeam_channel::bounded(1);

        let mutation = {
            let sup = f.supervisor.clone();
            let done = done.clone();
            thread::spawn(move || {
                sup.while_idle("work", || {
                    started_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(300));
                    done.store(true, Ordering::SeqCst);
                    Ok(())
                })
            })
        };
        started.recv().unwrap();

        let pid = f.supervisor.connect("work", "alice", "pw").unwrap();
        assert!(done.load(Ordering::SeqCst), "connect ran during the mutation");
        mutation.join().unwrap().unwrap();

        let err = f.supervisor.while_idle("work", || Ok(())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProfileInUse);
        assert_eq!(f.supervisor.while_idle("home", || Ok(7)).unwrap(), 7);

        f.supervisor.disconnect(pid).unwrap();
        f.supervisor.while_idle("work", || Ok(())).unwrap();
    }
}
