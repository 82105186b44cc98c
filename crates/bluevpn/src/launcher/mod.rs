//! OpenVPN process launching.
//!
//! Platform-specific code lives in [`unix`] and [`windows`] submodules.
//! [`platform_launcher`] picks the implementation for the running platform
//! once, at startup; the supervisor only sees the [`ProcessLauncher`] trait.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::Arc;
use which::which;

#[cfg(unix)]
pub mod unix;

#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub use unix::{list_available_escalation_tools, resolve_escalation_tool, UnixLauncher};

#[cfg(windows)]
pub use windows::WindowsLauncher;

/// Name used when the configured path is empty.
pub const DEFAULT_OPENVPN: &str = "openvpn";

/// Starts and stops the external VPN process.
pub trait ProcessLauncher: Send + Sync {
    /// Spawns `program args…` in `cwd` with stdin, stdout and stderr piped.
    fn spawn(&self, program: &Path, args: &[OsString], cwd: &Path) -> anyhow::Result<Child>;

    /// Requests termination: SIGTERM on POSIX, forced termination on Windows.
    fn terminate(&self, pid: u32) -> anyhow::Result<()>;

    /// Last resort once the grace period after [`terminate`](Self::terminate) has passed.
    fn force_kill(&self, pid: u32) -> anyhow::Result<()>;
}

/// Returns the launcher for this platform.
///
/// `escalation_tool` is `None` to run OpenVPN directly, `Some("auto")` to
/// pick the first of sudo, sudo-rs and pkexec, or a tool name. It is ignored
/// on Windows and when already running as root.
pub fn platform_launcher(escalation_tool: Option<String>) -> Arc<dyn ProcessLauncher> {
    #[cfg(unix)]
    return Arc::new(UnixLauncher::new(escalation_tool));

    #[cfg(windows)]
    {
        let _ = escalation_tool;
        return Arc::new(WindowsLauncher);
    }
}

/// Attempts to locate the `openvpn` executable.
///
/// Resolution order:
/// 1. `user_path` as a literal file path.
/// 2. `user_path` looked up via `PATH`.
/// 3. Platform-specific fallback directories.
pub fn locate_openvpn(user_path: &str) -> Option<PathBuf> {
    let user_path = if user_path.trim().is_empty() {
        DEFAULT_OPENVPN
    } else {
        user_path
    };

    let candidate = Path::new(user_path);
    if candidate.is_file() {
        return Some(candidate.to_path_buf());
    }

    if let Ok(found) = which(user_path) {
        return Some(found);
    }

    platform_fallback()
}

#[cfg(unix)]
fn platform_fallback() -> Option<PathBuf> {
    let dirs = [
        "/usr/sbin",
        "/sbin",
        "/usr/local/sbin",
        "/usr/local/bin",
        "/opt/homebrew/sbin",
        "/opt/homebrew/bin",
    ];
    dirs.iter()
        .map(|dir| Path::new(dir).join("openvpn"))
        .find(|p| p.is_file())
}

#[cfg(windows)]
fn platform_fallback() -> Option<PathBuf> {
    // Check next to our own executable (bundled distribution).
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let bundled = parent.join("openvpn").join("openvpn.exe");
            if bundled.is_file() {
                return Some(bundled);
            }
        }
    }

    let common = [
        "C:\\Program Files\\OpenVPN\\bin\\openvpn.exe",
        "C:\\Program Files (x86)\\OpenVPN\\bin\\openvpn.exe",
    ];
    common
        .iter()
        .map(Path::new)
        .find(|p| p.is_file())
        .map(|p| p.to_path_buf())
}

#[cfg(not(any(unix, windows)))]
fn platform_fallback() -> Option<PathBuf> {
    None
}
