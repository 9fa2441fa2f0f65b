use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Installs the process-wide logger. `RUST_LOG` overrides the level given
/// on the command line.
pub(crate) fn init(verbose: &Verbosity<WarnLevel>, logfile: Option<&Path>, syslog: bool) -> Result<()> {
    if syslog {
        return init_syslog(verbose.log_level_filter());
    }

    let filter = EnvFilter::builder()
        .with_default_directive(verbose.tracing_level_filter().into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match logfile {
        Some(path) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(open_logfile(path)?))
            .try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    installed.map_err(|e| anyhow!("failed to install logger: {}", e))
}

fn open_logfile(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}

/// Tracing events reach syslog through the `log` facade.
fn init_syslog(level: log::LevelFilter) -> Result<()> {
    let formatter = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_DAEMON,
        hostname: None,
        process: "guestctl-agent".into(),
        pid: std::process::id(),
    };
    let logger = syslog::unix(formatter).map_err(|e| anyhow!("cannot connect to syslog: {}", e))?;
    log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
        .map_err(|e| anyhow!("failed to install logger: {}", e))?;
    log::set_max_level(level);
    Ok(())
}

/// Number of `-v` flags that reproduce `verbose` in a child process.
pub(crate) fn verbose_count(verbose: &Verbosity<WarnLevel>) -> u8 {
    match verbose.tracing_level_filter() {
        LevelFilter::TRACE => 3,
        LevelFilter::DEBUG => 2,
        LevelFilter::INFO => 1,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Args {
        #[command(flatten)]
        verbose: Verbosity<WarnLevel>,
    }

    fn verbosity(args: &[&str]) -> Verbosity<WarnLevel> {
        let mut argv = vec!["test"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv).unwrap().verbose
    }

    #[test]
    fn test_verbose_count_round_trips() {
        assert_eq!(verbose_count(&verbosity(&[])), 0);
        assert_eq!(verbose_count(&verbosity(&["-v"])), 1);
        assert_eq!(verbose_count(&verbosity(&["-vv"])), 2);
        assert_eq!(verbose_count(&verbosity(&["-vvvvv"])), 3);
        assert_eq!(verbose_count(&verbosity(&["-q"])), 0);
    }

    #[test]
    fn test_default_level_is_warn() {
        assert_eq!(verbosity(&[]).tracing_level_filter(), LevelFilter::WARN);
    }

    #[test]
    fn test_logfile_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        std::fs::write(&path, "old\n").unwrap();
        {
            use std::io::Write;
            let mut file = open_logfile(&path).unwrap();
            file.write_all(b"new\n").unwrap();
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old\nnew\n");

        let err = open_logfile(&dir.path().join("missing/agent.log")).unwrap_err();
        assert!(err.to_string().contains("agent.log"));
    }
}
