//! Unix-specific OpenVPN process management.

use super::ProcessLauncher;
use anyhow::Context;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::{geteuid, Pid};
use std::ffi::OsString;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use which::which;

const DEFAULT_TOOLS: [&str; 3] = ["sudo", "sudo-rs", "pkexec"];

/// Returns the basename of a tool path (e.g. "/usr/bin/sudo" → "sudo").
fn tool_base_name(tool: &str) -> &str {
    Path::new(tool)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(tool)
}

/// Runs `tool` (looked up via PATH) with `args`, suppressing output.
/// Returns `true` if the command exits successfully.
fn run_command_silent(tool: &str, args: &[&str]) -> bool {
    which(tool).ok().is_some_and(|p| {
        Command::new(p)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    })
}

/// Sends `signal` to `pid` through sudo, sudo-rs or pkexec (in that order).
/// Returns `true` if at least one tool succeeded.
fn try_kill_elevated(pid: u32, signal: &str) -> bool {
    let pid_str = pid.to_string();
    let via_sudo = ["sudo", "sudo-rs"]
        .iter()
        .any(|&tool| run_command_silent(tool, &["-n", "kill", signal, &pid_str]));
    via_sudo || run_command_silent("pkexec", &["kill", signal, &pid_str])
}

/// Resolves which escalation tool will be used.
/// `"auto"` falls back to `sudo`, `sudo-rs`, and `pkexec`; a named tool is
/// tried first.
pub fn resolve_escalation_tool(requested: &str) -> Option<String> {
    let mut tools: Vec<&str> = DEFAULT_TOOLS.to_vec();
    if requested != "auto" && which(requested).is_ok() {
        tools.insert(0, requested);
    }
    tools
        .iter()
        .find_map(|&t| which(t).ok().map(|_| t.to_string()))
}

/// Returns the ordered list of escalation tools that are installed on this system.
/// On macOS, `pkexec` is excluded as it is unavailable there.
pub fn list_available_escalation_tools() -> Vec<&'static str> {
    let candidates: &[&'static str] = if cfg!(target_os = "macos") {
        &["sudo", "sudo-rs"]
    } else {
        &DEFAULT_TOOLS
    };
    candidates
        .iter()
        .copied()
        .filter(|&t| which(t).is_ok())
        .collect()
}

/// Spawns OpenVPN directly or through a privilege escalation tool.
pub struct UnixLauncher {
    escalation_tool: Option<String>,
}

impl UnixLauncher {
    pub fn new(escalation_tool: Option<String>) -> Self {
        Self { escalation_tool }
    }

    /// Launcher that never escalates.
    pub fn direct() -> Self {
        Self::new(None)
    }

    fn command_for(&self, program: &Path) -> anyhow::Result<Command> {
        let Some(requested) = self.escalation_tool.as_deref() else {
            return Ok(Command::new(program));
        };
        if geteuid().is_root() {
            log::debug!("Already root, starting {} without escalation", program.display());
            return Ok(Command::new(program));
        }

        let tool = resolve_escalation_tool(requested).ok_or_else(|| {
            anyhow::anyhow!(
                "No privilege escalation tool found (sudo, sudo-rs, or pkexec). \
                 Please install one of them to run openvpn."
            )
        })?;

        let mut cmd = Command::new(&tool);
        // With -S sudo prompts on stderr and reads the password from stdin,
        // where the supervisor answers it like any other challenge.
        if matches!(tool_base_name(&tool), "sudo" | "sudo-rs") {
            cmd.arg("-S");
        }
        cmd.arg(program);
        log::info!("Starting openvpn through {}", tool);
        Ok(cmd)
    }

    fn signal(&self, pid: u32, sig: Signal, elevated_flag: &str) -> anyhow::Result<()> {
        let raw = i32::try_from(pid).context("pid out of range")?;
        match signal::kill(Pid::from_raw(raw), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(Errno::EPERM) if self.escalation_tool.is_some() => {
                // The process runs as root (e.g. pkexec does not forward signals).
                if try_kill_elevated(pid, elevated_flag) {
                    Ok(())
                } else {
                    anyhow::bail!("not permitted to signal process {}", pid)
                }
            }
            Err(e) => Err(anyhow::anyhow!("failed to signal process {}: {}", pid, e)),
        }
    }
}

impl ProcessLauncher for UnixLauncher {
    fn spawn(&self, program: &Path, args: &[OsString], cwd: &Path) -> anyhow::Result<Child> {
        let mut cmd = self.command_for(program)?;
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to start {}", program.display()))?;
        Ok(child)
    }

    fn terminate(&self, pid: u32) -> anyhow::Result<()> {
        self.signal(pid, Signal::SIGTERM, "-15")
    }

    fn force_kill(&self, pid: u32) -> anyhow::Result<()> {
        self.signal(pid, Signal::SIGKILL, "-9")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn direct_launch_pipes_stdio_and_uses_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = UnixLauncher::direct();
        let mut child = launcher
            .spawn(Path::new("pwd"), &[], dir.path())
            .unwrap();

        let mut out = String::new();
        child.stdout.take().unwrap().read_to_string(&mut out).unwrap();
        child.wait().unwrap();

        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(Path::new(out.trim()).canonicalize().unwrap(), expected);
    }

    #[test]
    fn terminate_stops_a_running_process() {
        let launcher = UnixLauncher::direct();
        let mut child = launcher
            .spawn(Path::new("sleep"), &["30".into()], Path::new("/"))
            .unwrap();

        launcher.terminate(child.id()).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());

        // Signalling an already reaped pid is not an error.
        launcher.force_kill(child.id()).unwrap();
    }

    #[test]
    fn missing_binary_fails_to_spawn() {
        let launcher = UnixLauncher::direct();
        let err = launcher
            .spawn(Path::new("/nonexistent/openvpn"), &[], Path::new("/"))
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/openvpn"));
    }
}
