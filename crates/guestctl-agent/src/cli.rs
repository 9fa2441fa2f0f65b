use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use guestctl_proto::PROTOCOL_VERSION;

#[derive(Parser)]
#[command(
    name = "guestctl-agent",
    about = "Guest side of the host's guest control service",
    version
)]
pub(crate) struct Cli {
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// Append log output to this file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    pub logfile: Option<PathBuf>,

    /// Send log output to the system log
    #[arg(long, global = true)]
    pub syslog: bool,

    /// Path to config file (default: ./guestctl.json)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Host channel address (vsock:CID:PORT, unix:PATH or tcp:HOST:PORT)
    #[arg(long, global = true, env = "GUESTCTL_CHANNEL", value_name = "ADDRESS")]
    pub channel: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(clap::Subcommand)]
pub(crate) enum Commands {
    /// Serve the host until stopped (the default)
    Run {
        /// Pass an option to the services (e.g. control-procs-max-kept=64)
        #[arg(short = 'o', long = "option", value_name = "KEY[=VALUE]")]
        options: Vec<String>,
    },

    /// Run one guest session; started by the agent itself
    #[command(hide = true)]
    Guestsession {
        #[arg(long)]
        session_id: u32,

        #[arg(long, default_value_t = PROTOCOL_VERSION)]
        session_proto: u32,

        /// User the session was opened for
        #[arg(long)]
        user: Option<String>,

        #[arg(long, requires = "user")]
        domain: Option<String>,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Run {
            options: Vec::new(),
        }
    }
}

/// Splits `KEY[=VALUE]`.
pub(crate) fn split_option(option: &str) -> (&str, Option<&str>) {
    match option.split_once('=') {
        Some((key, value)) => (key, Some(value)),
        None => (option, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_channel_env_name() {
        let cmd = Cli::command();
        let arg = cmd
            .get_arguments()
            .find(|a| a.get_id() == "channel")
            .unwrap();
        assert_eq!(
            arg.get_env().and_then(|e| e.to_str()),
            Some(guestctl_proto::CHANNEL_ENV)
        );
    }

    #[test]
    fn test_no_subcommand_means_run() {
        let cli = Cli::try_parse_from(["guestctl-agent", "-vv"]).unwrap();
        assert!(cli.command.is_none());
        assert!(matches!(
            cli.command.unwrap_or_default(),
            Commands::Run { options } if options.is_empty()
        ));
    }

    #[test]
    fn test_session_arguments_as_spawned() {
        let cli = Cli::try_parse_from([
            "guestctl-agent",
            "guestsession",
            "--session-id=5",
            "--session-proto=2",
            "--user",
            "alice",
            "-v",
            "--logfile",
            "/tmp/s.log",
        ])
        .unwrap();
        assert_eq!(cli.logfile, Some(PathBuf::from("/tmp/s.log")));
        match cli.command {
            Some(Commands::Guestsession {
                session_id,
                session_proto,
                user,
                domain,
            }) => {
                assert_eq!(session_id, 5);
                assert_eq!(session_proto, 2);
                assert_eq!(user.as_deref(), Some("alice"));
                assert!(domain.is_none());
            }
            _ => panic!("expected guestsession"),
        }
    }

    #[test]
    fn test_run_options() {
        let cli = Cli::try_parse_from([
            "guestctl-agent",
            "run",
            "-o",
            "control-dump-stdout",
            "--option",
            "control-procs-max-kept=8",
        ])
        .unwrap();
        let Some(Commands::Run { options }) = cli.command else {
            panic!("expected run");
        };
        let split: Vec<_> = options.iter().map(|o| split_option(o)).collect();
        assert_eq!(
            split,
            [
                ("control-dump-stdout", None),
                ("control-procs-max-kept", Some("8"))
            ]
        );
    }
}
