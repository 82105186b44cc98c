use colored::Colorize;
use log::{Level, LevelFilter};
use std::io::Write;

/// Installs the colored terminal logger. `RUST_LOG` still overrides `level`
/// for individual modules.
pub fn init_logger(level: LevelFilter) {
    env_logger::Builder::new()
        .filter(None, level)
        .parse_default_env()
        .format(|buf, record| {
            let level = match record.level() {
                Level::Error => "ERROR".red(),
                Level::Warn => "WARN".yellow(),
                Level::Info => "INFO".green(),
                Level::Debug => "DEBUG".blue(),
                Level::Trace => "TRACE".purple(),
            };
            // OpenVPN output is forwarded under its own target; tag it so it
            // stands apart from supervisor messages.
            if record.target() == crate::session::PROCESS_LOG_TARGET {
                writeln!(buf, "[{}] {} {}", level, "openvpn |".dimmed(), record.args())
            } else {
                writeln!(buf, "[{}] - {}", level, record.args())
            }
        })
        .init();
}
