//! The per-session driver thread.
//!
//! Output readers, the exit waiter and caller commands all feed one channel.
//! The driver is the only code that changes session state; timers are
//! deadlines handed to `recv_deadline`.

use super::credfile::CredentialFile;
use super::{
    ChallengeDescriptor, LogLine, Phase, SessionEvent, SessionStatus, Slot, PROCESS_LOG_TARGET,
};
use crate::detector::{ChallengeDetector, Detection, Signal, Stream};
use crate::error::{ErrorKind, VpnError, VpnResult};
use crate::launcher::ProcessLauncher;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::io::Write;
use std::process::{ChildStdin, ExitStatus};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How long to wait for trailing output after the process has exited.
const EXIT_LINGER: Duration = Duration::from_millis(250);

pub(super) enum DriverInput {
    Output(Stream, Vec<u8>),
    Closed(Stream),
    /// `None` when waiting on the child failed.
    Exited(Option<ExitStatus>),
    Respond {
        text: String,
        reply: Sender<VpnResult<()>>,
    },
    Disconnect {
        reply: Sender<VpnResult<()>>,
    },
}

pub(super) struct Timeouts {
    pub connect: Duration,
    pub challenge: Duration,
    pub kill_grace: Duration,
    pub prompt_settle: Duration,
}

pub(super) struct Driver {
    pub attempt: u64,
    pub pid: u32,
    pub profile_id: String,
    pub inputs: Receiver<DriverInput>,
    pub stdin: Option<ChildStdin>,
    pub detector: ChallengeDetector,
    pub credentials: CredentialFile,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub events: Sender<SessionEvent>,
    pub status: Arc<Mutex<SessionStatus>>,
    pub slot: Slot,
    pub outcome: Option<Sender<VpnResult<u32>>>,
    pub timeouts: Timeouts,
}

/// Mutable bookkeeping that only lives on the driver thread.
struct RunState {
    phase: Phase,
    failure: Option<VpnError>,
    disconnect_waiters: Vec<Sender<VpnResult<()>>>,
    /// Connect budget left, and when it last started counting down.
    connect_remaining: Duration,
    launching_since: Option<Instant>,
    challenge_deadline: Option<Instant>,
    settle_deadline: Option<Instant>,
    kill_deadline: Option<Instant>,
    abandon_deadline: Option<Instant>,
    exit: Option<ExitStatus>,
    exit_seen_at: Option<Instant>,
    open_streams: u8,
    abandoned: bool,
}

impl RunState {
    fn connect_deadline(&self) -> Option<Instant> {
        self.launching_since.map(|since| since + self.connect_remaining)
    }

    fn pause_connect_timer(&mut self) {
        if let Some(since) = self.launching_since.take() {
            self.connect_remaining = self.connect_remaining.saturating_sub(since.elapsed());
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.connect_deadline(),
            self.challenge_deadline,
            self.settle_deadline,
            self.kill_deadline,
            self.abandon_deadline,
            self.exit_seen_at.map(|t| t + EXIT_LINGER),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn finished(&self, now: Instant) -> bool {
        if self.abandoned {
            return true;
        }
        match self.exit_seen_at {
            Some(at) => self.open_streams == 0 || now >= at + EXIT_LINGER,
            None => false,
        }
    }

    fn is_attempting(&self) -> bool {
        matches!(
            self.phase,
            Phase::Launching | Phase::AwaitingChallengeResponse
        )
    }
}

impl Driver {
    pub(super) fn run(mut self) {
        let mut state = RunState {
            phase: Phase::Launching,
            failure: None,
            disconnect_waiters: Vec::new(),
            connect_remaining: self.timeouts.connect,
            launching_since: Some(Instant::now()),
            challenge_deadline: None,
            settle_deadline: None,
            kill_deadline: None,
            abandon_deadline: None,
            exit: None,
            exit_seen_at: None,
            open_streams: 2,
            abandoned: false,
        };
        self.publish_phase(Phase::Launching, None);
        log::info!(
            "Launching openvpn for profile {} (pid {})",
            self.profile_id,
            self.pid
        );

        while !state.finished(Instant::now()) {
            let received = match state.next_deadline() {
                Some(deadline) => self.inputs.recv_deadline(deadline),
                None => self
                    .inputs
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(input) => self.handle_input(&mut state, input),
                Err(RecvTimeoutError::Timeout) => self.on_timer(&mut state, Instant::now()),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.teardown(state);
    }

    fn handle_input(&mut self, state: &mut RunState, input: DriverInput) {
        match input {
            DriverInput::Output(stream, bytes) => {
                let detections = self.detector.feed(stream, &bytes);
                self.apply(state, detections);
                state.settle_deadline = (self.detector.is_armed()
                    && self.detector.has_pending_tail())
                .then(|| Instant::now() + self.timeouts.prompt_settle);
            }
            DriverInput::Closed(stream) => {
                state.open_streams = state.open_streams.saturating_sub(1);
                let detections = self.detector.finish(stream);
                self.apply(state, detections);
            }
            DriverInput::Exited(status) => {
                match status {
                    Some(status) => log::info!("openvpn (pid {}) exited: {}", self.pid, status),
                    None => log::warn!("Lost track of openvpn (pid {})", self.pid),
                }
                state.exit = status;
                state.exit_seen_at = Some(Instant::now());
                state.kill_deadline = None;
                state.abandon_deadline = None;
            }
            DriverInput::Respond { text, reply } => {
                let _ = reply.send(self.respond(state, &text));
            }
            DriverInput::Disconnect { reply } => {
                state.disconnect_waiters.push(reply);
                if state.phase != Phase::Disconnecting {
                    if self.outcome.is_some() && state.failure.is_none() {
                        state.failure = Some(VpnError::new(
                            ErrorKind::Cancelled,
                            "disconnect requested before the connection was established",
                        ));
                    }
                    log::info!("Disconnecting profile {}", self.profile_id);
                    self.begin_shutdown(state, Phase::Disconnecting);
                }
            }
        }
    }

    fn respond(&mut self, state: &mut RunState, text: &str) -> VpnResult<()> {
        if state.phase != Phase::AwaitingChallengeResponse {
            return Err(VpnError::new(
                ErrorKind::NoPendingChallenge,
                format!("session is {:?}", state.phase),
            ));
        }

        let stdin = self.stdin.as_mut().ok_or_else(|| {
            VpnError::new(ErrorKind::ProcessExited, "openvpn input is closed")
        })?;
        stdin
            .write_all(format!("{}\n", text).as_bytes())
            .and_then(|_| stdin.flush())
            .map_err(|e| {
                VpnError::new(
                    ErrorKind::ProcessExited,
                    format!("cannot write to openvpn: {}", e),
                )
            })?;

        log::debug!("Challenge response forwarded to openvpn");
        state.challenge_deadline = None;
        state.launching_since = Some(Instant::now());
        self.detector.rearm();
        // A prompt that arrived while disarmed is checked once output settles.
        state.settle_deadline = self
            .detector
            .has_pending_tail()
            .then(|| Instant::now() + self.timeouts.prompt_settle);
        state.phase = Phase::Launching;
        self.publish_phase(Phase::Launching, None);
        Ok(())
    }

    fn apply(&mut self, state: &mut RunState, detections: Vec<Detection>) {
        for detection in detections {
            match detection {
                Detection::Line { stream, text } => self.forward_line(stream, text),
                Detection::Signal(signal) => self.on_signal(state, signal),
            }
        }
    }

    fn forward_line(&self, stream: Stream, text: String) {
        match stream {
            Stream::Stdout => log::info!(target: PROCESS_LOG_TARGET, "{}", text),
            Stream::Stderr => log::warn!(target: PROCESS_LOG_TARGET, "{}", text),
        }
        let _ = self.events.send(SessionEvent::Log(LogLine { stream, text }));
    }

    fn on_signal(&mut self, state: &mut RunState, signal: Signal) {
        if !state.is_attempting() {
            log::debug!("Ignoring {:?} in phase {:?}", signal, state.phase);
            return;
        }

        match signal {
            Signal::Connected => {
                state.phase = Phase::Connected;
                state.launching_since = None;
                state.challenge_deadline = None;
                state.settle_deadline = None;
                self.credentials.scrub();
                self.publish_phase(Phase::Connected, None);
                log::info!("Connected (profile {}, pid {})", self.profile_id, self.pid);
                if let Some(outcome) = self.outcome.take() {
                    let _ = outcome.send(Ok(self.pid));
                }
            }
            Signal::AuthFailed(line) => self.fail(state, ErrorKind::AuthenticationFailed, line),
            Signal::PermissionDenied(line) => self.fail(state, ErrorKind::PermissionDenied, line),
            Signal::MissingFile { line, path } => {
                let detail = match path {
                    Some(path) => format!(
                        "File not found: {}. Make sure every certificate file is in the profile directory.",
                        path
                    ),
                    None => line,
                };
                self.fail(state, ErrorKind::MissingCertificateFile, detail)
            }
            Signal::Challenge { kind, prompt, echo } => {
                if state.phase != Phase::Launching {
                    return;
                }
                let deadline = Instant::now() + self.timeouts.challenge;
                let descriptor = ChallengeDescriptor {
                    kind,
                    prompt,
                    echo,
                    deadline,
                };
                state.pause_connect_timer();
                state.challenge_deadline = Some(deadline);
                state.phase = Phase::AwaitingChallengeResponse;
                log::info!("openvpn requests input: {}", descriptor.prompt);
                self.publish_phase(Phase::AwaitingChallengeResponse, Some(descriptor.clone()));
                let _ = self.events.send(SessionEvent::Challenge(descriptor));
            }
        }
    }

    fn fail(&mut self, state: &mut RunState, kind: ErrorKind, detail: String) {
        if !state.is_attempting() {
            return;
        }
        let err = VpnError::new(kind, detail);
        log::error!("Connection failed: {}", err.user_message().replace("\n\n", " "));
        state.failure.get_or_insert(err);
        self.credentials.scrub();
        self.begin_shutdown(state, Phase::Failed);
    }

    /// Asks the process to stop and arms the kill timer.
    fn begin_shutdown(&mut self, state: &mut RunState, phase: Phase) {
        state.phase = phase;
        state.launching_since = None;
        state.challenge_deadline = None;
        state.settle_deadline = None;
        self.detector.disarm();
        self.publish_phase(phase, None);
        // Closing stdin also unblocks an openvpn waiting on a prompt.
        self.stdin = None;

        if state.exit_seen_at.is_some() {
            return;
        }
        if let Err(e) = self.launcher.terminate(self.pid) {
            log::warn!("Failed to terminate openvpn (pid {}): {:#}", self.pid, e);
        }
        state.kill_deadline = Some(Instant::now() + self.timeouts.kill_grace);
    }

    fn on_timer(&mut self, state: &mut RunState, now: Instant) {
        if state.settle_deadline.is_some_and(|d| now >= d) {
            state.settle_deadline = None;
            let detections = self.detector.settle();
            self.apply(state, detections);
        }

        if state.phase == Phase::AwaitingChallengeResponse
            && state.challenge_deadline.is_some_and(|d| now >= d)
        {
            let secs = self.timeouts.challenge.as_secs();
            self.fail(
                state,
                ErrorKind::ChallengeTimeout,
                format!("no response within {} seconds", secs),
            );
        }

        if state.phase == Phase::Launching && state.connect_deadline().is_some_and(|d| now >= d) {
            let secs = self.timeouts.connect.as_secs();
            self.fail(
                state,
                ErrorKind::ConnectTimeout,
                format!("openvpn did not connect within {} seconds", secs),
            );
        }

        if state.kill_deadline.is_some_and(|d| now >= d) {
            state.kill_deadline = None;
            log::warn!("openvpn (pid {}) ignored termination, killing", self.pid);
            if let Err(e) = self.launcher.force_kill(self.pid) {
                log::error!("Failed to kill openvpn (pid {}): {:#}", self.pid, e);
            }
            state.abandon_deadline = Some(now + self.timeouts.kill_grace);
        }

        if state.abandon_deadline.is_some_and(|d| now >= d) {
            log::error!(
                "openvpn (pid {}) did not exit after being killed; releasing the session",
                self.pid
            );
            state.abandoned = true;
        }
    }

    fn publish_phase(&self, phase: Phase, challenge: Option<ChallengeDescriptor>) {
        if let Ok(mut status) = self.status.lock() {
            status.phase = phase;
            status.challenge = challenge;
        }
        let _ = self.events.send(SessionEvent::Phase {
            profile_id: self.profile_id.clone(),
            phase,
        });
    }

    fn teardown(mut self, mut state: RunState) {
        self.credentials.scrub();
        self.stdin = None;

        // Release the slot before answering callers so they can reconnect at once.
        if let Ok(mut slot) = self.slot.lock() {
            if slot.as_ref().is_some_and(|h| h.attempt == self.attempt) {
                *slot = None;
            }
        }

        if let Some(outcome) = self.outcome.take() {
            let err = state.failure.take().unwrap_or_else(|| {
                let detail = match state.exit {
                    Some(status) => format!("openvpn exited ({})", status),
                    None => "openvpn stopped responding".to_string(),
                };
                VpnError::new(ErrorKind::ProcessExited, detail)
            });
            let _ = outcome.send(Err(err));
        }
        for waiter in state.disconnect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        self.publish_phase(Phase::Idle, None);
        let _ = self.events.send(SessionEvent::Disconnected {
            profile_id: self.profile_id.clone(),
            pid: self.pid,
            exit_code: state.exit.and_then(|s| s.code()),
        });
        log::info!("Session for profile {} closed", self.profile_id);
    }
}
