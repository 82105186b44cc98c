//! Classification of OpenVPN output.
//!
//! OpenVPN mixes human-oriented diagnostics with prompts on both stdout and
//! stderr, without any framing. [`PatternSet`] is the stateless classifier;
//! [`ChallengeDetector`] wraps it with per-stream line buffering and the
//! edge-triggered arming used for one connection attempt.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Prompt used when a `CHALLENGE:` marker carries no text.
pub const DEFAULT_CHALLENGE_PROMPT: &str = "Enter challenge response";

/// Upper bound for an unterminated line before it is force-flushed.
const MAX_PENDING_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    /// OpenVPN static challenge (`CHALLENGE:` marker or a token phrase).
    StaticToken,
    /// Token prompt relayed through systemd's password agent.
    SystemdInteractive,
    /// Password request from the privilege escalation tool.
    PrivilegeElevation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Connected,
    AuthFailed(String),
    PermissionDenied(String),
    /// `path` is extracted from `fails with '<path>'` when present.
    MissingFile {
        line: String,
        path: Option<String>,
    },
    Challenge {
        kind: ChallengeKind,
        prompt: String,
        echo: bool,
    },
}

impl Signal {
    pub fn is_challenge(&self) -> bool {
        matches!(self, Signal::Challenge { .. })
    }
}

/// Pattern classes that can be extended from settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternClass {
    Connected,
    AuthFailed,
    PermissionDenied,
    MissingFile,
    StaticChallenge,
    SystemdPrompt,
    ElevationPrompt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraPattern {
    pub class: PatternClass,
    pub pattern: String,
}

#[derive(Debug, Clone)]
pub struct PatternSet {
    connected: Vec<Regex>,
    auth_failed: Vec<Regex>,
    permission_denied: Vec<Regex>,
    missing_file: Vec<Regex>,
    missing_file_path: Regex,
    static_challenge: Vec<Regex>,
    systemd_prompt: Vec<Regex>,
    elevation_prompt: Vec<Regex>,
}

fn literal(s: &str) -> Regex {
    Regex::new(&regex::escape(s)).expect("escaped literal is a valid regex")
}

fn pattern(s: &str) -> Regex {
    Regex::new(s).expect("built-in pattern is valid")
}

static DEFAULT_PATTERNS: Lazy<PatternSet> = Lazy::new(|| PatternSet {
    connected: vec![literal("Initialization Sequence Completed")],
    auth_failed: vec![
        literal("AUTH_FAILED"),
        literal("auth-failure"),
        literal("incorrect password attempts"),
    ],
    permission_denied: vec![literal("Permission denied")],
    missing_file: vec![literal("No such file or directory")],
    missing_file_path: pattern(r"fails with '([^']+)'"),
    // A `prompt` group, when present and non-empty, becomes the prompt text.
    static_challenge: vec![
        pattern(r"CHALLENGE:[ \t]*(?P<prompt>[^\r\n]*)"),
        pattern(r"(?i)enter (?:your )?(?:google )?authenticator code"),
        pattern(r"(?i)enter (?:the )?challenge response"),
    ],
    systemd_prompt: vec![
        pattern(r"🔐[ \t]*(?P<prompt>[^\r\n]+)"),
        pattern(r"(?i)please enter (?:the |your )?(?:one[- ]time|otp|totp) (?:password|token|code)"),
    ],
    elevation_prompt: vec![
        pattern(r"(?i)\[sudo[^\]]*\] password"),
        pattern(r"^Password:[ \t]*$"),
    ],
});

impl Default for PatternSet {
    fn default() -> Self {
        DEFAULT_PATTERNS.clone()
    }
}

impl PatternSet {
    /// Built-in patterns extended with `extra`.
    pub fn with_extra(extra: &[ExtraPattern]) -> anyhow::Result<Self> {
        let mut set = Self::default();
        for p in extra {
            set.add(p.class, &p.pattern)?;
        }
        Ok(set)
    }

    pub fn add(&mut self, class: PatternClass, re: &str) -> anyhow::Result<()> {
        let compiled =
            Regex::new(re).map_err(|e| anyhow::anyhow!("invalid {:?} pattern {:?}: {}", class, re, e))?;
        let bucket = match class {
            PatternClass::Connected => &mut self.connected,
            PatternClass::AuthFailed => &mut self.auth_failed,
            PatternClass::PermissionDenied => &mut self.permission_denied,
            PatternClass::MissingFile => &mut self.missing_file,
            PatternClass::StaticChallenge => &mut self.static_challenge,
            PatternClass::SystemdPrompt => &mut self.systemd_prompt,
            PatternClass::ElevationPrompt => &mut self.elevation_prompt,
        };
        bucket.push(compiled);
        Ok(())
    }

    /// Classifies one line or chunk. First match wins, in priority order:
    /// success, auth failure, permission/file faults, static challenge,
    /// interactive prompts.
    pub fn classify(&self, text: &str) -> Option<Signal> {
        let any = |set: &[Regex]| set.iter().any(|re| re.is_match(text));

        if any(&self.connected) {
            return Some(Signal::Connected);
        }
        if any(&self.auth_failed) {
            return Some(Signal::AuthFailed(text.trim().to_string()));
        }
        if any(&self.permission_denied) {
            return Some(Signal::PermissionDenied(text.trim().to_string()));
        }
        if any(&self.missing_file) {
            let path = self
                .missing_file_path
                .captures(text)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string());
            return Some(Signal::MissingFile {
                line: text.trim().to_string(),
                path,
            });
        }
        self.classify_prompt(text)
    }

    /// Classifies only the prompt classes. Used for unterminated output,
    /// since prompts are not followed by a newline.
    pub fn classify_prompt(&self, text: &str) -> Option<Signal> {
        let groups: [(&[Regex], ChallengeKind, bool); 3] = [
            (&self.static_challenge, ChallengeKind::StaticToken, true),
            (&self.systemd_prompt, ChallengeKind::SystemdInteractive, false),
            (&self.elevation_prompt, ChallengeKind::PrivilegeElevation, false),
        ];

        for (set, kind, echo) in groups {
            for re in set {
                let Some(caps) = re.captures(text) else {
                    continue;
                };
                let prompt = match caps.name("prompt") {
                    Some(m) if !m.as_str().trim().is_empty() => m.as_str().trim().to_string(),
                    Some(_) => DEFAULT_CHALLENGE_PROMPT.to_string(),
                    None => text.trim().to_string(),
                };
                return Some(Signal::Challenge { kind, prompt, echo });
            }
        }
        None
    }
}

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Accumulates raw bytes and yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Appends `chunk` and returns every line it completed, without the
    /// line terminator.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let line = std::mem::replace(&mut self.pending, rest);
            lines.push(decode_line(&line));
        }

        if self.pending.len() > MAX_PENDING_BYTES {
            lines.push(decode_line(&std::mem::take(&mut self.pending)));
        }
        lines
    }

    pub fn tail(&self) -> Option<String> {
        (!self.pending.is_empty()).then(|| decode_line(&self.pending))
    }

    pub fn take_tail(&mut self) -> Option<String> {
        let tail = self.tail();
        self.pending.clear();
        tail
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\n', '\r'])
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    Line { stream: Stream, text: String },
    Signal(Signal),
}

/// Per-attempt detector over both output streams.
///
/// Challenges are edge-triggered: after one is reported, further challenge
/// matches are ignored until [`rearm`](Self::rearm). Terminal signals are
/// always reported.
pub struct ChallengeDetector {
    patterns: Arc<PatternSet>,
    stdout: LineBuffer,
    stderr: LineBuffer,
    armed: bool,
}

impl ChallengeDetector {
    pub fn new(patterns: Arc<PatternSet>) -> Self {
        Self {
            patterns,
            stdout: LineBuffer::default(),
            stderr: LineBuffer::default(),
            armed: true,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn rearm(&mut self) {
        self.armed = true;
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    fn buffer(&mut self, stream: Stream) -> &mut LineBuffer {
        match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        }
    }

    /// Feeds a raw chunk; complete lines are logged and classified.
    pub fn feed(&mut self, stream: Stream, chunk: &[u8]) -> Vec<Detection> {
        let lines = self.buffer(stream).push(chunk);
        let mut out = Vec::new();
        for text in lines {
            self.classify_line(stream, text, &mut out);
        }
        out
    }

    /// Returns `true` when either stream holds an unterminated line.
    pub fn has_pending_tail(&self) -> bool {
        !self.stdout.pending.is_empty() || !self.stderr.pending.is_empty()
    }

    /// Checks unterminated output for prompts. Called once the stream has
    /// gone quiet, so a prompt split across reads is seen whole.
    pub fn settle(&mut self) -> Vec<Detection> {
        let mut out = Vec::new();
        if !self.armed {
            return out;
        }
        for stream in [Stream::Stdout, Stream::Stderr] {
            let Some(tail) = self.buffer(stream).tail() else {
                continue;
            };
            if let Some(signal) = self.patterns.classify_prompt(&tail) {
                self.buffer(stream).take_tail();
                self.armed = false;
                out.push(Detection::Line { stream, text: tail });
                out.push(Detection::Signal(signal));
                break;
            }
        }
        out
    }

    /// Flushes a stream at end of file.
    pub fn finish(&mut self, stream: Stream) -> Vec<Detection> {
        let mut out = Vec::new();
        if let Some(text) = self.buffer(stream).take_tail() {
            self.classify_line(stream, text, &mut out);
        }
        out
    }

    fn classify_line(&mut self, stream: Stream, text: String, out: &mut Vec<Detection>) {
        let signal = self.patterns.classify(&text);
        match signal {
            Some(signal) if signal.is_challenge() && !self.armed => {
                log::debug!("Ignoring repeated prompt while a challenge is pending");
            }
            Some(signal) => {
                if signal.is_challenge() {
                    self.armed = false;
                }
                out.push(Detection::Line { stream, text });
                out.push(Detection::Signal(signal));
                return;
            }
            None => log::trace!("Unclassified {:?} line: {}", stream, text),
        }
        out.push(Detection::Line { stream, text });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge(prompt: &str) -> Signal {
        Signal::Challenge {
            kind: ChallengeKind::StaticToken,
            prompt: prompt.to_string(),
            echo: true,
        }
    }

    fn signals(detections: &[Detection]) -> Vec<Signal> {
        detections
            .iter()
            .filter_map(|d| match d {
                Detection::Signal(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn classifies_in_priority_order() {
        let p = PatternSet::default();
        assert_eq!(
            p.classify("Tue Oct 1 Initialization Sequence Completed"),
            Some(Signal::Connected)
        );
        assert!(matches!(
            p.classify("AUTH: Received control message: AUTH_FAILED"),
            Some(Signal::AuthFailed(_))
        ));
        // Success marker wins over anything else in the same chunk.
        assert_eq!(
            p.classify("CHALLENGE: x\nInitialization Sequence Completed"),
            Some(Signal::Connected)
        );
        assert!(matches!(
            p.classify("Cannot open TUN/TAP dev /dev/net/tun: Permission denied (errno=13)"),
            Some(Signal::PermissionDenied(_))
        ));
        assert_eq!(p.classify("Restart pause, 5 second(s)"), None);
    }

    #[test]
    fn extracts_missing_file_path() {
        let p = PatternSet::default();
        let signal =
            p.classify("Options error: --ca fails with 'ca.crt': No such file or directory (errno=2)");
        assert_eq!(
            signal,
            Some(Signal::MissingFile {
                line: "Options error: --ca fails with 'ca.crt': No such file or directory (errno=2)"
                    .to_string(),
                path: Some("ca.crt".to_string()),
            })
        );
    }

    #[test]
    fn extracts_challenge_prompt_or_uses_default() {
        let p = PatternSet::default();
        assert_eq!(p.classify("CHALLENGE: Enter OTP"), Some(challenge("Enter OTP")));
        assert_eq!(
            p.classify("CHALLENGE:"),
            Some(challenge(DEFAULT_CHALLENGE_PROMPT))
        );
        assert_eq!(
            p.classify("Enter Google Authenticator Code"),
            Some(challenge("Enter Google Authenticator Code"))
        );
    }

    #[test]
    fn recognizes_interactive_and_elevation_prompts() {
        let p = PatternSet::default();
        assert_eq!(
            p.classify("[sudo] password for alice: "),
            Some(Signal::Challenge {
                kind: ChallengeKind::PrivilegeElevation,
                prompt: "[sudo] password for alice:".to_string(),
                echo: false,
            })
        );
        assert_eq!(
            p.classify("🔐 Enter Auth Token:"),
            Some(Signal::Challenge {
                kind: ChallengeKind::SystemdInteractive,
                prompt: "Enter Auth Token:".to_string(),
                echo: false,
            })
        );
    }

    #[test]
    fn extra_patterns_extend_the_defaults() {
        let extra = vec![ExtraPattern {
            class: PatternClass::Connected,
            pattern: "Peer Connection Initiated".to_string(),
        }];
        let p = PatternSet::with_extra(&extra).unwrap();
        assert_eq!(p.classify("Peer Connection Initiated with [AF_INET]1.2.3.4"), Some(Signal::Connected));

        let bad = vec![ExtraPattern {
            class: PatternClass::AuthFailed,
            pattern: "(unclosed".to_string(),
        }];
        assert!(PatternSet::with_extra(&bad).is_err());
    }

    #[test]
    fn line_buffer_reassembles_split_lines() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"Initialization Seq").is_empty());
        assert_eq!(buf.tail().as_deref(), Some("Initialization Seq"));
        let lines = buf.push(b"uence Completed\r\nnext");
        assert_eq!(lines, vec!["Initialization Sequence Completed".to_string()]);
        assert_eq!(buf.take_tail().as_deref(), Some("next"));
        assert!(buf.tail().is_none());
    }

    #[test]
    fn challenge_fires_once_until_rearmed() {
        let mut d = ChallengeDetector::new(Arc::new(PatternSet::default()));

        let first = d.feed(Stream::Stdout, b"CHALLENGE: Enter OTP\n");
        assert_eq!(signals(&first), vec![challenge("Enter OTP")]);

        let repeat = d.feed(Stream::Stdout, b"CHALLENGE: Enter OTP\n");
        assert!(signals(&repeat).is_empty());
        assert_eq!(repeat.len(), 1, "the line is still reported for logging");

        // Terminal signals are not gated.
        let fail = d.feed(Stream::Stderr, b"AUTH_FAILED\n");
        assert!(matches!(signals(&fail).as_slice(), [Signal::AuthFailed(_)]));

        d.rearm();
        let again = d.feed(Stream::Stderr, b"CHALLENGE: Enter OTP\n");
        assert_eq!(signals(&again), vec![challenge("Enter OTP")]);
    }

    #[test]
    fn settle_detects_unterminated_prompt() {
        let mut d = ChallengeDetector::new(Arc::new(PatternSet::default()));
        assert!(d.feed(Stream::Stderr, b"[sudo] pass").is_empty());
        assert!(d.has_pending_tail());
        assert!(d.settle().is_empty());

        d.feed(Stream::Stderr, b"word for bob: ");
        let settled = d.settle();
        assert!(matches!(
            signals(&settled).as_slice(),
            [Signal::Challenge {
                kind: ChallengeKind::PrivilegeElevation,
                ..
            }]
        ));
        assert!(!d.has_pending_tail());
        assert!(!d.is_armed());
    }

    #[test]
    fn finish_classifies_trailing_output() {
        let mut d = ChallengeDetector::new(Arc::new(PatternSet::default()));
        d.feed(Stream::Stdout, b"Initialization Sequence Completed");
        assert_eq!(signals(&d.finish(Stream::Stdout)), vec![Signal::Connected]);
    }
}
