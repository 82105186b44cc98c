use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use std::path::PathBuf;

/// Manage OpenVPN profiles and connect from the terminal.
#[derive(Parser, Debug)]
#[command(name = "bluevpn", version, about)]
pub struct Args {
    /// Log verbosity; falls back to the level in settings.json
    #[arg(short, long, value_enum, global = true)]
    pub level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create, list, import and remove connection profiles
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },
    /// Save or forget credentials for a profile
    Creds {
        #[command(subcommand)]
        command: CredsCommand,
    },
    /// Check that OpenVPN and the escalation tool are usable
    Check,
    /// Connect a direct profile with username and password
    Connect {
        profile: Option<String>,
        #[arg(short, long)]
        username: Option<String>,
        /// Save the password after a successful connection
        #[arg(long)]
        remember: bool,
    },
    /// Connect a brokered profile with an access token acquired elsewhere
    ConnectBrokered {
        profile: String,
        #[arg(long, env = "BLUEVPN_TOKEN", hide_env_values = true)]
        token: Option<String>,
        /// Account the token was issued to
        #[arg(long, default_value = "")]
        account: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ProfileCommand {
    List,
    Add {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, value_enum, default_value_t = KindArg::Direct)]
        kind: KindArg,
        #[arg(short, long)]
        username: Option<String>,
    },
    /// Bundle an .ovpn file and the files it references into the profile
    Import {
        id: String,
        file: PathBuf,
        #[arg(long, value_enum, default_value_t = KindArg::Direct)]
        kind: KindArg,
    },
    Remove {
        id: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum CredsCommand {
    Save {
        profile: String,
        #[arg(short, long)]
        username: Option<String>,
    },
    Forget {
        profile: String,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindArg {
    Direct,
    Brokered,
}

impl From<KindArg> for bluevpn::ProfileKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Direct => bluevpn::ProfileKind::Direct,
            KindArg::Brokered => bluevpn::ProfileKind::Brokered,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connect_with_flags() {
        let args = Args::try_parse_from(["bluevpn", "-l", "debug", "connect", "office", "--remember"])
            .unwrap();
        assert!(matches!(args.level, Some(LogLevel::Debug)));
        match args.command {
            Command::Connect {
                profile,
                username,
                remember,
            } => {
                assert_eq!(profile.as_deref(), Some("office"));
                assert!(username.is_none());
                assert!(remember);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn import_defaults_to_direct_profiles() {
        let args =
            Args::try_parse_from(["bluevpn", "profile", "import", "office", "/tmp/office.ovpn"])
                .unwrap();
        let Command::Profile {
            command: ProfileCommand::Import { kind, file, .. },
        } = args.command
        else {
            panic!("expected profile import");
        };
        assert_eq!(kind, KindArg::Direct);
        assert_eq!(file, PathBuf::from("/tmp/office.ovpn"));
    }
}
