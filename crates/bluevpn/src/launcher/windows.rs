//! Windows-specific OpenVPN process management.
//!
//! The OpenVPN installer's interactive service lets unprivileged users start
//! tunnels, so no elevation happens here.

use super::ProcessLauncher;
use anyhow::Context;
use std::ffi::OsString;
use std::os::windows::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};

const CREATE_NO_WINDOW: u32 = 0x08000000;

pub struct WindowsLauncher;

fn taskkill(pid: u32, tree: bool) -> anyhow::Result<()> {
    let mut cmd = Command::new("taskkill");
    cmd.creation_flags(CREATE_NO_WINDOW)
        .arg("/PID")
        .arg(pid.to_string());
    if tree {
        cmd.arg("/T");
    }
    let status = cmd
        .arg("/F")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .context("failed to run taskkill")?;
    if !status.success() {
        anyhow::bail!("taskkill failed for process {} ({})", pid, status);
    }
    Ok(())
}

impl ProcessLauncher for WindowsLauncher {
    fn spawn(&self, program: &Path, args: &[OsString], cwd: &Path) -> anyhow::Result<Child> {
        Command::new(program)
            .creation_flags(CREATE_NO_WINDOW)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start {}", program.display()))
    }

    fn terminate(&self, pid: u32) -> anyhow::Result<()> {
        taskkill(pid, false)
    }

    fn force_kill(&self, pid: u32) -> anyhow::Result<()> {
        taskkill(pid, true)
    }
}
