use bluevpn::{ChallengeDescriptor, ChallengeKind, DeviceCode};
use console::{Key, Style, Term};
use dialoguer::Input;
use indicatif::ProgressBar;
use std::time::{Duration, Instant};

/// Format a duration into a human-readable string like "1h 23m 45s".
pub(crate) fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Reads a line without echoing it. Returns `None` on Ctrl+C or Escape.
pub(crate) fn read_masked(prompt: &str) -> Option<String> {
    let term = Term::stderr();
    let _ = term.write_str(prompt);
    let _ = term.write_str(": ");
    let _ = term.flush();

    let mut secret = String::new();
    let result = loop {
        match term.read_key() {
            Ok(Key::Enter) => break Some(secret),
            Ok(Key::Escape) | Err(_) => break None,
            Ok(Key::Backspace) => {
                if secret.pop().is_some() {
                    let _ = term.clear_chars(1);
                    let _ = term.flush();
                }
            }
            Ok(Key::Char('\x03')) => break None,
            Ok(Key::Char(c)) => {
                secret.push(c);
                let _ = term.write_str("*");
                let _ = term.flush();
            }
            Ok(_) => {}
        }
    };
    let _ = term.clear_line();
    let _ = term.write_str("\r");
    result
}

pub(crate) fn read_text(prompt: &str, default: Option<&str>) -> Option<String> {
    let mut input = Input::<String>::new().with_prompt(prompt);
    if let Some(default) = default {
        input = input.default(default.to_string());
    }
    input.interact_text().ok()
}

/// Asks the user to answer an OpenVPN challenge, pausing the spinner.
pub(crate) fn answer_challenge(spinner: &ProgressBar, challenge: &ChallengeDescriptor) -> Option<String> {
    spinner.finish_and_clear();
    let bold = Style::new().bold();
    let left = challenge.deadline.saturating_duration_since(Instant::now());
    let source = match challenge.kind {
        ChallengeKind::StaticToken => "OpenVPN",
        ChallengeKind::SystemdInteractive => "OpenVPN (interactive)",
        ChallengeKind::PrivilegeElevation => "Privilege escalation",
    };
    eprintln!(
        "{} {} asks for input ({} left)",
        bold.apply_to(">>"),
        source,
        format_duration(left)
    );

    let prompt = challenge.prompt.trim_end_matches(": ").trim_end_matches(':');
    if challenge.echo {
        read_text(prompt, None)
    } else {
        read_masked(prompt)
    }
}

pub(crate) fn show_device_code(code: &DeviceCode) {
    let bold = Style::new().bold();
    let cyan = Style::new().cyan().bold();
    eprintln!(
        "{} Open {} and enter {}",
        bold.apply_to(">>"),
        code.verification_uri,
        cyan.apply_to(&code.user_code),
    );
}
