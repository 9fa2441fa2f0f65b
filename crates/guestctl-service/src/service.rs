//! Runs a set of subservices, each on its own worker thread.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::cancel::CancelToken;

const START_TIMEOUT: Duration = Duration::from_secs(60);
const STOP_ATTEMPTS: u32 = 30;
const STOP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Enabled,
    /// Nothing to do on this guest; the service is skipped.
    Disabled,
}

/// Handed to a worker so it can tell the harness it is up.
pub struct StartSignal {
    tx: Sender<()>,
}

impl StartSignal {
    pub fn signal(&self) {
        if self.tx.try_send(()).is_err() {
            tracing::trace!("start already signalled");
        }
    }
}

pub trait Subservice: Send + Sync {
    fn name(&self) -> &str;

    /// Called before options are parsed.
    fn pre_init(&mut self) {}

    /// Offers an option to the service. Returns whether it was consumed.
    fn option(&mut self, _name: &str, _value: Option<&str>) -> Result<bool> {
        Ok(false)
    }

    fn init(&mut self) -> Result<InitOutcome>;

    /// Runs until `shutdown` is cancelled. Must call `ready.signal()` once
    /// it is able to serve.
    fn worker(&self, shutdown: &CancelToken, ready: &StartSignal);

    /// Wakes the worker up so it notices the shutdown.
    fn stop(&self);

    /// Releases everything after the worker ended or was given up on.
    fn term(&self);
}

#[derive(Default)]
pub struct Harness {
    services: Vec<Box<dyn Subservice>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, service: Box<dyn Subservice>) -> &mut Self {
        self.services.push(service);
        self
    }

    pub fn pre_init(&mut self) {
        for service in &mut self.services {
            service.pre_init();
        }
    }

    /// Hands the option to each service until one takes it.
    pub fn option(&mut self, name: &str, value: Option<&str>) -> Result<bool> {
        for service in &mut self.services {
            if service
                .option(name, value)
                .with_context(|| format!("{}: invalid option '{}'", service.name(), name))?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Initialises every service and starts the workers of the enabled ones.
    pub fn start(self) -> Result<Running> {
        let mut enabled = Vec::new();
        for mut service in self.services {
            match service.init() {
                Ok(InitOutcome::Enabled) => {
                    tracing::debug!("{}: initialised", service.name());
                    enabled.push(service);
                }
                Ok(InitOutcome::Disabled) => {
                    tracing::info!("{}: disabled", service.name());
                }
                Err(e) => {
                    for service in &enabled {
                        service.term();
                    }
                    return Err(e.context(format!("{}: init failed", service.name())));
                }
            }
        }

        let mut running = Running {
            workers: Vec::new(),
        };
        for service in enabled {
            let service: Arc<dyn Subservice> = Arc::from(service);
            if let Err(e) = running.spawn(service) {
                running.stop();
                return Err(e);
            }
        }
        Ok(running)
    }
}

struct Worker {
    service: Arc<dyn Subservice>,
    shutdown: CancelToken,
    thread: Option<JoinHandle<()>>,
    started: bool,
}

pub struct Running {
    workers: Vec<Worker>,
}

impl Running {
    fn spawn(&mut self, service: Arc<dyn Subservice>) -> Result<()> {
        let name = service.name().to_string();
        let shutdown = CancelToken::new();
        let (ready_tx, ready_rx): (Sender<()>, Receiver<()>) = bounded(1);

        let thread = {
            let service = service.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    let ready = StartSignal { tx: ready_tx };
                    service.worker(&shutdown, &ready);
                    tracing::debug!("{}: worker ended", service.name());
                })
                .with_context(|| format!("{}: failed to create worker thread", name))?
        };

        let mut worker = Worker {
            service,
            shutdown,
            thread: Some(thread),
            started: false,
        };
        let outcome = ready_rx.recv_timeout(START_TIMEOUT);
        worker.started = outcome.is_ok();
        self.workers.push(worker);
        match outcome {
            Ok(()) => {
                tracing::debug!("{}: started", name);
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => bail!("{}: worker did not start in time", name),
            Err(RecvTimeoutError::Disconnected) => bail!("{}: worker exited during startup", name),
        }
    }

    /// Whether a worker ended without being asked to.
    pub fn any_finished(&self) -> bool {
        self.workers.iter().any(|w| {
            !w.shutdown.is_cancelled() && w.thread.as_ref().is_some_and(|t| t.is_finished())
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.workers.iter().map(|w| w.service.name()).collect()
    }

    /// Signals all workers, stops the started ones, gives each a bounded
    /// time to finish, and terminates every service.
    pub fn stop(mut self) {
        for worker in &self.workers {
            worker.shutdown.cancel();
        }
        for worker in self.workers.iter().filter(|w| w.started) {
            tracing::debug!("{}: stopping", worker.service.name());
            worker.service.stop();
        }
        for worker in &mut self.workers {
            let Some(thread) = worker.thread.take() else {
                continue;
            };
            let mut attempts = 0;
            while !thread.is_finished() && attempts < STOP_ATTEMPTS {
                std::thread::sleep(STOP_INTERVAL);
                attempts += 1;
            }
            if thread.is_finished() {
                if thread.join().is_err() {
                    tracing::error!("{}: worker panicked", worker.service.name());
                }
            } else {
                tracing::warn!(
                    "{}: worker still running after {} seconds",
                    worker.service.name(),
                    STOP_ATTEMPTS
                );
            }
        }
        for worker in &self.workers {
            worker.service.term();
        }
    }
}
