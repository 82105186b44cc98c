/// High-level error category for UI display purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Profile and bundle problems - missing profiles, unreadable configs
    Profile,
    /// Authentication errors - credentials, challenges, timeouts waiting for the user
    Authentication,
    /// Connection errors (OpenVPN phase) - process faults, timeouts
    Connection,
    /// Session bookkeeping - calls made in the wrong lifecycle phase
    Session,
    /// System errors - storage, identity broker, I/O
    System,
}

/// Failure kinds surfaced by the profile store, bundler and session supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ProfileNotFound,
    BundleMissing,
    ConfigInvalid,
    ProcessSpawnFailed,
    AuthenticationFailed,
    MissingCertificateFile,
    PermissionDenied,
    ChallengeTimeout,
    ConnectTimeout,
    SessionAlreadyActive,
    NoActiveSession,
    NoPendingChallenge,
    /// The attempt was cancelled by a `disconnect` call before it completed.
    Cancelled,
    /// The VPN process exited before reporting success.
    ProcessExited,
    /// The profile's bundle cannot be replaced while its session is active.
    ProfileInUse,
    Storage,
    Broker,
}

/// Error returned by every caller-facing operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnError {
    kind: ErrorKind,
    detail: String,
}

impl VpnError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Raw detail, e.g. the offending file path.
    pub fn detail(&self) -> &str {
        &self.detail
    }

    /// Returns the high-level category of this error
    pub fn category(&self) -> ErrorCategory {
        match self.kind {
            ErrorKind::ProfileNotFound
            | ErrorKind::BundleMissing
            | ErrorKind::ConfigInvalid
            | ErrorKind::ProfileInUse => ErrorCategory::Profile,
            ErrorKind::AuthenticationFailed | ErrorKind::ChallengeTimeout => {
                ErrorCategory::Authentication
            }
            ErrorKind::ProcessSpawnFailed
            | ErrorKind::MissingCertificateFile
            | ErrorKind::PermissionDenied
            | ErrorKind::ConnectTimeout
            | ErrorKind::ProcessExited => ErrorCategory::Connection,
            ErrorKind::SessionAlreadyActive
            | ErrorKind::NoActiveSession
            | ErrorKind::NoPendingChallenge
            | ErrorKind::Cancelled => ErrorCategory::Session,
            ErrorKind::Storage | ErrorKind::Broker => ErrorCategory::System,
        }
    }

    /// Returns true if re-entering credentials is the likely fix
    pub fn is_credential_error(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::AuthenticationFailed | ErrorKind::ChallengeTimeout
        )
    }

    /// Returns the user-facing error message
    pub fn user_message(&self) -> String {
        let headline = match self.kind {
            ErrorKind::ProfileNotFound => "Profile not found.",
            ErrorKind::BundleMissing => "The profile has no usable configuration bundle.",
            ErrorKind::ConfigInvalid => "The VPN configuration could not be processed.",
            ErrorKind::ProcessSpawnFailed => "Could not start OpenVPN.",
            ErrorKind::AuthenticationFailed => {
                "Authentication failed: incorrect username or password."
            }
            ErrorKind::MissingCertificateFile => "A file referenced by the configuration is missing.",
            ErrorKind::PermissionDenied => "OpenVPN was denied permission.",
            ErrorKind::ChallengeTimeout => "No response was given to the authentication challenge in time.",
            ErrorKind::ConnectTimeout => "Connection timeout. Check the logs for details.",
            ErrorKind::SessionAlreadyActive => "A VPN session is already active.",
            ErrorKind::NoActiveSession => "No VPN session is active.",
            ErrorKind::NoPendingChallenge => "There is no pending authentication challenge.",
            ErrorKind::Cancelled => "Connection cancelled.",
            ErrorKind::ProcessExited => "OpenVPN exited before the connection was established.",
            ErrorKind::ProfileInUse => "The profile is in use by the active session.",
            ErrorKind::Storage => "Could not read or write application data.",
            ErrorKind::Broker => "Identity provider error.",
        };

        if self.detail.is_empty() {
            headline.to_string()
        } else {
            format!("{}\n\n{}", headline, self.detail)
        }
    }
}

impl std::fmt::Display for VpnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for VpnError {}

impl From<anyhow::Error> for VpnError {
    fn from(err: anyhow::Error) -> Self {
        // Keep a kind that was wrapped into an anyhow chain.
        match err.downcast::<VpnError>() {
            Ok(inner) => inner,
            Err(err) => VpnError::new(ErrorKind::Storage, format!("{:#}", err)),
        }
    }
}

pub type VpnResult<T> = Result<T, VpnError>;
