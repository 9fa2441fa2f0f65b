mod cli;
mod config;
mod logging;

use std::os::unix::io::AsRawFd;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::Parser;

use cli::{Cli, Commands};
use config::AgentConfig;
use guestctl_proto::{ChannelAddress, StreamConnector};
use guestctl_service::{sys, CancelToken, ControlService, Harness, SessionExit, SpawnedSession};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn stop_handler(_: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

/// SIGTERM and SIGINT only set a flag; the main thread polls it.
fn install_stop_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, stop_handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGINT, stop_handler as *const () as libc::sighandler_t);
    }
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("guestctl-agent: {:#}", e);
            1
        }
    };
    process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let cfg = config::load_config(cli.config.as_deref())?;

    // Resolution: CLI flag (or env) > config file > default
    let logfile = cli.logfile.clone().or_else(|| cfg.logfile.clone());
    let syslog = cli.syslog || cfg.syslog.unwrap_or(false);
    logging::init(&cli.verbose, logfile.as_deref(), syslog)?;

    let address = match cli.channel.as_deref().or(cfg.channel.as_deref()) {
        Some(s) => s
            .parse::<ChannelAddress>()
            .map_err(|e| anyhow!("invalid channel address: {}", e))?,
        None => ChannelAddress::default(),
    };
    tracing::debug!("host channel at {}", address);

    match cli.command.unwrap_or_default() {
        Commands::Run { options } => {
            let verbosity = logging::verbose_count(&cli.verbose);
            serve(cfg, address, verbosity, logfile, &options)
        }
        Commands::Guestsession {
            session_id,
            session_proto,
            user,
            domain,
        } => {
            tracing::info!(
                "[session {}] starting for user '{}'{}",
                session_id,
                user.as_deref().unwrap_or(""),
                domain.map(|d| format!(" in domain '{}'", d)).unwrap_or_default()
            );
            Ok(guest_session(cfg, address, session_id, session_proto).code())
        }
    }
}

/// Runs the services until a stop signal or until one of them ends.
fn serve(
    cfg: AgentConfig,
    address: ChannelAddress,
    verbosity: u8,
    logfile: Option<std::path::PathBuf>,
    options: &[String],
) -> Result<i32> {
    let mut control = cfg.control;
    control.agent_exe = std::env::current_exe().ok();
    control.channel_address = Some(address.to_string());
    control.verbosity = verbosity;
    control.log_base = logfile;

    let connector = Arc::new(StreamConnector::new(address));
    let mut harness = Harness::new();
    harness.add(Box::new(ControlService::new(connector, control)));
    harness.pre_init();
    for option in options {
        let (name, value) = cli::split_option(option);
        if !harness.option(name, value)? {
            bail!("unknown option '{}'", name);
        }
    }

    install_stop_handlers();
    let running = harness.start()?;
    tracing::info!("started: {}", running.names().join(", "));

    while !STOP_REQUESTED.load(Ordering::SeqCst) && !running.any_finished() {
        std::thread::sleep(POLL_INTERVAL);
    }
    if STOP_REQUESTED.load(Ordering::SeqCst) {
        tracing::info!("stop requested");
    } else {
        tracing::warn!("a service ended on its own, shutting down");
    }
    running.stop();
    Ok(0)
}

fn guest_session(cfg: AgentConfig, address: ChannelAddress, id: u32, protocol: u32) -> SessionExit {
    let stdin = std::io::stdin();
    if !sys::is_fifo(stdin.as_raw_fd()) {
        tracing::error!("[session {}] stdin must be a pipe carrying the session key", id);
        return SessionExit::Init;
    }

    let session = SpawnedSession::new(cfg.control.session_options(id, 0), protocol);
    let connector = StreamConnector::new(address);
    let shutdown = CancelToken::new();

    install_stop_handlers();
    {
        let shutdown = shutdown.clone();
        std::thread::spawn(move || {
            while !STOP_REQUESTED.load(Ordering::SeqCst) {
                std::thread::sleep(POLL_INTERVAL);
            }
            shutdown.cancel();
        });
    }

    let exit = session.run(&connector, &mut stdin.lock(), &shutdown);
    tracing::info!("[session {}] exiting: {:?}", id, exit);
    exit
}
