//! # bluevpn
//!
//! Terminal front-end: manages connection profiles and runs one OpenVPN
//! session in the foreground, prompting for challenges as they come up.

mod args;
mod prompts;

use args::{Args, Command, CredsCommand, ProfileCommand};
use bluevpn::{
    init_logger, AppSettings, ConnectionProfile, JsonFileStore, Phase, ProfileKind, SessionEvent,
    StaticTokenBroker, VpnClient, VpnError, VpnResult,
};
use clap::Parser;
use console::Style;
use crossbeam_channel::{select, Receiver};
use indicatif::ProgressBar;
use log::{error, info, warn};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn main() -> ExitCode {
    let args = Args::parse();
    init_logger(args.level.map(Into::into).unwrap_or_else(configured_level));

    let (client, events) = match VpnClient::open_default() {
        Ok(opened) => opened,
        Err(e) => {
            error!("Failed to open the data directory: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    let client = Arc::new(client);

    let result = match args.command {
        Command::Profile { command } => run_profile(&client, command),
        Command::Creds { command } => run_creds(&client, command),
        Command::Check => run_check(&client),
        Command::Connect {
            profile,
            username,
            remember,
        } => run_connect(client, events, profile, username, remember),
        Command::ConnectBrokered {
            profile,
            token,
            account,
        } => run_connect_brokered(client, events, profile, token, account),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e.user_message().replace("\n\n", ": "));
            ExitCode::FAILURE
        }
    }
}

/// Log level from settings.json, read before the logger exists.
fn configured_level() -> log::LevelFilter {
    bluevpn::get_user_data_dir()
        .map(|dir| AppSettings::load(&JsonFileStore::new(dir)).level_filter())
        .unwrap_or(log::LevelFilter::Info)
}

fn run_profile(client: &VpnClient, command: ProfileCommand) -> VpnResult<()> {
    match command {
        ProfileCommand::List => {
            let bold = Style::new().bold();
            let dim = Style::new().dim();
            let active = client.session().map(|s| s.profile_id);
            for kind in [ProfileKind::Direct, ProfileKind::Brokered] {
                println!("{}", bold.apply_to(format!("{:?} profiles", kind)));
                let profiles = client.profiles().list(kind)?;
                if profiles.is_empty() {
                    println!("  {}", dim.apply_to("(none)"));
                }
                for p in profiles {
                    let marker = if active.as_deref() == Some(p.id.as_str()) { "*" } else { " " };
                    let config = p
                        .source_file_name
                        .as_deref()
                        .unwrap_or("no configuration imported");
                    println!("{} {:<16} {:<24} {}", marker, p.id, p.name, dim.apply_to(config));
                }
            }
            Ok(())
        }
        ProfileCommand::Add {
            id,
            name,
            kind,
            username,
        } => {
            let mut profile = ConnectionProfile::new(&id, name.unwrap_or_else(|| id.clone()), kind.into());
            profile.username = username;
            client.profiles().save(&profile)?;
            info!("Profile {} saved", id);
            Ok(())
        }
        ProfileCommand::Import { id, file, kind } => {
            let (profile, report) = client.import_config(&id, &file, kind.into())?;
            info!(
                "Imported {} into {} ({} file(s) copied)",
                file.display(),
                profile.id,
                report.files_copied
            );
            for missing in &report.missing {
                warn!("Referenced file not found: {}", missing.display());
            }
            Ok(())
        }
        ProfileCommand::Remove { id } => {
            if client.delete_profile(&id)? {
                info!("Profile {} removed", id);
            } else {
                warn!("No profile named {}", id);
            }
            Ok(())
        }
    }
}

fn run_creds(client: &VpnClient, command: CredsCommand) -> VpnResult<()> {
    match command {
        CredsCommand::Save { profile, username } => {
            let known = known_username(client, &profile)?;
            let username = match username {
                Some(u) => u,
                None => prompts::read_text("Username", known.as_deref()).ok_or_else(cancelled)?,
            };
            let password = prompts::read_masked("Password").ok_or_else(cancelled)?;
            client.vault().save(&profile, &username, &password, true)?;
            info!("Credentials saved for {}", profile);
            Ok(())
        }
        CredsCommand::Forget { profile } => {
            if client.vault().forget(&profile)? {
                info!("Credentials for {} forgotten", profile);
            } else {
                warn!("No saved credentials for {}", profile);
            }
            Ok(())
        }
    }
}

fn run_check(client: &VpnClient) -> VpnResult<()> {
    let report = client.check();
    let ok = Style::new().green().bold();
    let bad = Style::new().red().bold();

    match &report.openvpn {
        Some(path) => println!("{} openvpn: {}", ok.apply_to("ok"), path.display()),
        None => println!("{} openvpn not found", bad.apply_to("!!")),
    }
    match &report.escalation_tool {
        Some(tool) => println!("{} escalation: {}", ok.apply_to("ok"), tool),
        None => println!("{} escalation: none", ok.apply_to("--")),
    }
    #[cfg(unix)]
    {
        let installed = bluevpn::launcher::list_available_escalation_tools();
        if !installed.is_empty() {
            println!("   installed tools: {}", installed.join(", "));
        }
    }
    for problem in &report.problems {
        println!("{} {}", bad.apply_to("!!"), problem);
    }

    if report.is_ok() {
        Ok(())
    } else {
        Err(VpnError::new(
            bluevpn::ErrorKind::ProcessSpawnFailed,
            format!("{} problem(s) found", report.problems.len()),
        ))
    }
}

fn cancelled() -> VpnError {
    VpnError::new(bluevpn::ErrorKind::Cancelled, "input aborted")
}

fn known_username(client: &VpnClient, profile_id: &str) -> VpnResult<Option<String>> {
    if let Some(record) = client.vault().load(profile_id)? {
        return Ok(Some(record.username));
    }
    if let Some(profile) = client.profiles().get(profile_id)? {
        if profile.username.is_some() {
            return Ok(profile.username);
        }
    }
    Ok(client.app_state().last_username)
}

fn run_connect(
    client: Arc<VpnClient>,
    events: Receiver<SessionEvent>,
    profile: Option<String>,
    username: Option<String>,
    remember: bool,
) -> VpnResult<()> {
    let profile = match profile.or_else(|| client.app_state().last_profile_id) {
        Some(p) => p,
        None => prompts::read_text("Profile", None).ok_or_else(cancelled)?,
    };

    let saved = client.vault().load(&profile)?;
    let username = match username {
        Some(u) => u,
        None => {
            let known = known_username(&client, &profile)?;
            prompts::read_text("Username", known.as_deref()).ok_or_else(cancelled)?
        }
    };
    let password = match saved.filter(|r| r.username == username && !r.password.is_empty()) {
        Some(record) => record.password,
        None => prompts::read_masked("Password").ok_or_else(cancelled)?,
    };

    let attempt = {
        let client = client.clone();
        let (profile, username, password) = (profile.clone(), username.clone(), password.clone());
        thread::spawn(move || client.connect(&profile, &username, &password))
    };
    let connected = drive_session(&client, &events, attempt)?;

    if connected && remember {
        client.vault().save(&profile, &username, &password, true)?;
        info!("Password saved for {}", profile);
    }
    Ok(())
}

fn run_connect_brokered(
    client: Arc<VpnClient>,
    events: Receiver<SessionEvent>,
    profile: String,
    token: Option<String>,
    account: String,
) -> VpnResult<()> {
    let token = match token {
        Some(t) => t,
        None => prompts::read_masked("Access token").ok_or_else(cancelled)?,
    };
    let broker = StaticTokenBroker::new(token, account);

    let attempt = {
        let client = client.clone();
        thread::spawn(move || {
            client.connect_brokered(&profile, &broker, &mut |code| prompts::show_device_code(code))
        })
    };
    drive_session(&client, &events, attempt).map(|_| ())
}

/// Follows the session until it ends, answering challenges and turning
/// Ctrl+C into a disconnect. Returns whether the connection was established.
fn drive_session(
    client: &VpnClient,
    events: &Receiver<SessionEvent>,
    attempt: thread::JoinHandle<VpnResult<u32>>,
) -> VpnResult<bool> {
    let (interrupt_tx, interrupt_rx) = crossbeam_channel::bounded(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    }) {
        warn!("Ctrl+C will not disconnect cleanly: {}", e);
    }

    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_message("Starting OpenVPN...");

    let mut attempt = Some(attempt);
    let mut connected_at: Option<Instant> = None;
    let mut outcome: VpnResult<bool> = Ok(false);

    loop {
        select! {
            recv(events) -> event => {
                let Ok(event) = event else { break };
                match event {
                    SessionEvent::Phase { phase, .. } => match phase {
                        Phase::Launching => {
                            spinner.reset();
                            spinner.enable_steady_tick(Duration::from_millis(120));
                            spinner.set_message("Connecting...");
                        }
                        Phase::Connected => {
                            connected_at = Some(Instant::now());
                            spinner.set_message("Connected, press Ctrl+C to disconnect");
                        }
                        Phase::Disconnecting => spinner.set_message("Disconnecting..."),
                        _ => {}
                    },
                    SessionEvent::Challenge(challenge) => {
                        match prompts::answer_challenge(&spinner, &challenge) {
                            Some(answer) => {
                                if let Err(e) = client.respond_to_challenge(&answer) {
                                    warn!("{}", e.user_message().replace("\n\n", ": "));
                                }
                            }
                            None => disconnect_active(client),
                        }
                    }
                    SessionEvent::Log(_) => {}
                    SessionEvent::Disconnected { exit_code, .. } => {
                        spinner.finish_and_clear();
                        if let Some(since) = connected_at {
                            info!("Disconnected after {}", prompts::format_duration(since.elapsed()));
                        } else if let Some(code) = exit_code {
                            info!("OpenVPN exited with code {}", code);
                        }
                        break;
                    }
                }
            }
            recv(interrupt_rx) -> _ => {
                spinner.set_message("Disconnecting...");
                disconnect_active(client);
            }
            default(Duration::from_millis(250)) => {}
        }

        // A connect that fails before spawning produces no events.
        if attempt.as_ref().is_some_and(|h| h.is_finished()) {
            if let Some(handle) = attempt.take() {
                outcome = join_attempt(handle);
                if outcome.is_err() && client.session().is_none() {
                    break;
                }
            }
        }
    }
    spinner.finish_and_clear();

    if let Some(handle) = attempt.take() {
        outcome = join_attempt(handle);
    }
    outcome
}

fn join_attempt(handle: thread::JoinHandle<VpnResult<u32>>) -> VpnResult<bool> {
    match handle.join() {
        Ok(Ok(pid)) => {
            info!("Connected (OpenVPN pid {})", pid);
            Ok(true)
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(VpnError::new(
            bluevpn::ErrorKind::ProcessExited,
            "connect thread panicked",
        )),
    }
}

fn disconnect_active(client: &VpnClient) {
    if let Some(info) = client.session() {
        if let Err(e) = client.disconnect(info.pid) {
            warn!("{}", e.user_message().replace("\n\n", ": "));
        }
    }
}
