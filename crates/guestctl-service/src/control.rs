//! The guest control subservice: the main message pump, the root session
//! and the threads of spawned sessions.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::bail;
use guestctl_proto::msg::guest_features;
use guestctl_proto::{
    context, Connector, ErrorCode, HostChannel, HostCtx, HostMessage, HostMsgKind, Result,
    SessionNotifyType, PROTOCOL_VERSION,
};
use serde::Deserialize;

use crate::cancel::CancelToken;
use crate::scratch::ScratchBuffer;
use crate::service::{InitOutcome, StartSignal, Subservice};
use crate::session::{flags, GuestSession, SessionOptions, DEFAULT_PROCS_MAX_KEPT};
use crate::session_thread::{self, SessionThread, SessionThreadConfig};

/// How long a closing or restored session may take before it is abandoned.
const SESSION_DESTROY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Settings of the guest control service. The JSON form is part of the
/// agent's config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub procs_max_kept: u32,
    /// Consecutive failed waits for host messages before the service gives up.
    pub max_peek_failures: u32,
    pub peek_retry_ms: u64,
    pub session_shutdown_secs: u64,
    pub dump_stdout: bool,
    pub dump_stderr: bool,
    pub dump_dir: Option<PathBuf>,
    /// Run instead of the system shutdown command.
    pub shutdown_program: Option<PathBuf>,
    #[serde(skip)]
    pub agent_exe: Option<PathBuf>,
    #[serde(skip)]
    pub channel_address: Option<String>,
    #[serde(skip)]
    pub verbosity: u8,
    #[serde(skip)]
    pub log_base: Option<PathBuf>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        ControlConfig {
            procs_max_kept: DEFAULT_PROCS_MAX_KEPT,
            max_peek_failures: 16,
            peek_retry_ms: 1000,
            session_shutdown_secs: 30,
            dump_stdout: false,
            dump_stderr: false,
            dump_dir: None,
            shutdown_program: None,
            agent_exe: None,
            channel_address: None,
            verbosity: 0,
            log_base: None,
        }
    }
}

impl ControlConfig {
    fn dump_flags(&self) -> u32 {
        let mut f = 0;
        if self.dump_stdout {
            f |= flags::DUMP_STDOUT;
        }
        if self.dump_stderr {
            f |= flags::DUMP_STDERR;
        }
        f
    }

    /// Options of a session run by this agent.
    pub fn session_options(&self, id: u32, session_flags: u32) -> SessionOptions {
        let mut options = SessionOptions::new(id, session_flags | self.dump_flags());
        options.procs_max_kept = self.procs_max_kept;
        if let Some(exe) = &self.agent_exe {
            options.agent_exe = exe.clone();
        }
        if let Some(dir) = &self.dump_dir {
            options.dump_dir = dir.clone();
        }
        options.shutdown_program = self.shutdown_program.clone();
        options
    }

    fn thread_config(&self) -> SessionThreadConfig {
        let mut config = SessionThreadConfig {
            verbosity: self.verbosity,
            log_base: self.log_base.clone(),
            channel_address: self.channel_address.clone(),
            shutdown_timeout: Duration::from_secs(self.session_shutdown_secs),
            ..SessionThreadConfig::default()
        };
        if let Some(exe) = &self.agent_exe {
            config.exe = exe.clone();
        }
        config
    }
}

/// Connection state shared by every dispatcher of the main pump.
pub struct ServiceContext {
    channel: Arc<dyn HostChannel>,
    host_features: u64,
    is_master: bool,
    /// VM session epoch the last peek saw.
    epoch: u64,
}

impl ServiceContext {
    fn connect(connector: &dyn Connector) -> Result<ServiceContext> {
        let channel = connector.connect()?;
        let mut svc = ServiceContext {
            channel,
            host_features: 0,
            is_master: false,
            epoch: 0,
        };
        if let Err(e) = svc.negotiate() {
            if let Err(e) = svc.channel.disconnect() {
                tracing::warn!("disconnect after failed negotiation: {}", e);
            }
            return Err(e);
        }
        Ok(svc)
    }

    /// Exchanges features and claims the master role when the host has one.
    fn negotiate(&mut self) -> Result<()> {
        self.host_features = self.channel.report_features(guest_features::ALL)?;
        let ctx = self.ctx();
        self.is_master = false;
        if ctx.supports_optimizations() {
            self.channel.make_master()?;
            self.is_master = true;
        }
        tracing::debug!(
            "client {}: host features {:#x}, master={}",
            self.channel.client_id(),
            self.host_features,
            self.is_master
        );
        Ok(())
    }

    pub fn ctx(&self) -> HostCtx {
        HostCtx::new(self.channel.clone(), PROTOCOL_VERSION, self.host_features)
    }

    pub fn host_features(&self) -> u64 {
        self.host_features
    }

    pub fn is_master(&self) -> bool {
        self.is_master
    }
}

struct PumpState {
    svc: ServiceContext,
    root: Arc<GuestSession>,
    threads: Vec<Arc<SessionThread>>,
    scratch: ScratchBuffer,
}

/// Waits for host messages and routes them to the root session or to the
/// session threads.
pub struct HostMessagePump {
    connector: Arc<dyn Connector>,
    config: ControlConfig,
    /// Current client, for waking the pump from other threads.
    channel: Mutex<Arc<dyn HostChannel>>,
    /// Taken by the running loop, `None` while it runs or after teardown.
    state: Mutex<Option<PumpState>>,
}

impl HostMessagePump {
    pub fn connect(connector: Arc<dyn Connector>, config: ControlConfig) -> Result<HostMessagePump> {
        let svc = ServiceContext::connect(connector.as_ref())?;
        let root = GuestSession::new(config.session_options(0, 0));
        Ok(HostMessagePump {
            connector,
            channel: Mutex::new(svc.channel.clone()),
            state: Mutex::new(Some(PumpState {
                svc,
                root,
                threads: Vec::new(),
                scratch: ScratchBuffer::new(),
            })),
            config,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, Option<PumpState>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_channel(&self) -> Arc<dyn HostChannel> {
        self.channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Releases a pump blocked waiting for the host.
    pub fn cancel_pending_waits(&self) {
        if let Err(e) = self.current_channel().cancel_pending_waits() {
            tracing::warn!("cancelling pending waits failed: {}", e);
        }
    }

    /// Number of spawned sessions still tracked.
    pub fn session_thread_count(&self) -> usize {
        self.lock_state().as_ref().map_or(0, |s| s.threads.len())
    }

    /// Serves host messages until the waits are cancelled, `shutdown` is
    /// set, or the host stays unreachable.
    pub fn run(&self, shutdown: &CancelToken) -> Result<()> {
        let Some(mut state) = self.lock_state().take() else {
            tracing::error!("message pump is already running or torn down");
            return Err(ErrorCode::WrongOrder);
        };
        let result = self.serve(&mut state, shutdown);
        *self.lock_state() = Some(state);
        result
    }

    fn serve(&self, state: &mut PumpState, shutdown: &CancelToken) -> Result<()> {
        let retry_delay = Duration::from_millis(self.config.peek_retry_ms);
        let mut failures = 0;

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            let channel = state.svc.channel.clone();
            match channel.peek_wait(&mut state.svc.epoch) {
                Ok(peeked) => {
                    failures = 0;
                    let mut ctx = state.svc.ctx();
                    ctx.set_peeked(peeked);
                    match HostMsgKind::from_raw(peeked.msg) {
                        Some(HostMsgKind::CancelPendingWaits) => {
                            tracing::debug!("pending waits cancelled, leaving message loop");
                            return Ok(());
                        }
                        Some(HostMsgKind::SessionCreate) => self.open_session(state, &mut ctx),
                        Some(HostMsgKind::SessionClose) => self.close_session(state, &mut ctx),
                        _ => {
                            if let Err(e) = state.root.dispatch(&mut ctx, &mut state.scratch) {
                                tracing::debug!("message {} failed: {}", peeked.msg, e);
                            }
                        }
                    }
                }
                Err(ErrorCode::VmRestored) => {
                    tracing::info!("VM restored, new session epoch {:#x}", state.svc.epoch);
                    self.restored(state)?;
                }
                Err(ErrorCode::Interrupted) => std::thread::yield_now(),
                Err(e) => {
                    failures += 1;
                    tracing::error!("waiting for host messages failed ({} in a row): {}", failures, e);
                    if self.session_changed(state)? {
                        failures = 0;
                        continue;
                    }
                    if failures >= self.config.max_peek_failures {
                        tracing::error!("giving up after {} failures", failures);
                        return Err(e);
                    }
                    shutdown.wait_timeout(retry_delay);
                }
            }
        }
    }

    fn open_session(&self, state: &mut PumpState, ctx: &mut HostCtx) {
        let info = match ctx.get_message(HostMsgKind::SessionCreate) {
            Ok(HostMessage::SessionCreate(info)) => info,
            Ok(_) => return,
            Err(rc) => {
                tracing::error!("fetching session open failed: {}", rc);
                if let Err(e) = ctx.skip(rc.to_raw()) {
                    tracing::debug!("skipping session open failed: {}", e);
                }
                return;
            }
        };
        tracing::debug!(
            "[session {}] open requested for user '{}' (protocol {})",
            info.session_id,
            info.user,
            info.protocol
        );

        let result = if info.protocol == 0 || info.protocol > PROTOCOL_VERSION {
            Err(ErrorCode::NotSupported)
        } else {
            reap_stopped(&mut state.threads);
            if state.threads.iter().any(|t| t.id() == info.session_id) {
                Err(ErrorCode::AlreadyExists)
            } else {
                SessionThread::create(ctx, &info, &self.config.thread_config())
            }
        };
        match result {
            Ok(thread) => state.threads.push(thread),
            Err(rc) => {
                tracing::error!("[session {}] open failed: {}", info.session_id, rc);
                if let Err(e) = ctx.session_notify(SessionNotifyType::Error, rc.to_raw()) {
                    tracing::error!("[session {}] reporting failure: {}", info.session_id, e);
                }
            }
        }
    }

    /// The session thread answers with its final notification.
    fn close_session(&self, state: &mut PumpState, ctx: &mut HostCtx) {
        let session_id = match ctx.get_message(HostMsgKind::SessionClose) {
            Ok(HostMessage::SessionClose { session_id, .. }) => session_id,
            Ok(_) => return,
            Err(rc) => {
                tracing::error!("fetching session close failed: {}", rc);
                if let Err(e) = ctx.skip(rc.to_raw()) {
                    tracing::debug!("skipping session close failed: {}", e);
                }
                return;
            }
        };
        let Some(pos) = state.threads.iter().position(|t| t.id() == session_id) else {
            tracing::debug!("[session {}] close for unknown session", session_id);
            let ctx = ctx.with_context(context::session_context(session_id));
            if let Err(e) = ctx.session_notify(SessionNotifyType::Error, ErrorCode::NotFound.to_raw()) {
                tracing::error!("[session {}] reporting unknown session: {}", session_id, e);
            }
            return;
        };
        let thread = state.threads.remove(pos);
        if let Err(e) = thread.destroy(SESSION_DESTROY_TIMEOUT) {
            tracing::error!("[session {}] close failed: {}", session_id, e);
        }
    }

    /// IDs handed out before a restore may be reused, so every session goes.
    fn restored(&self, state: &mut PumpState) -> Result<()> {
        self.reset_sessions(state);
        if let Err(e) = state.svc.channel.session_has_changed(state.svc.epoch) {
            tracing::warn!("acknowledging the new VM session failed: {}", e);
        }
        state.svc.negotiate()
    }

    fn reset_sessions(&self, state: &mut PumpState) {
        if let Err(e) = session_thread::destroy_all(&mut state.threads, SESSION_DESTROY_TIMEOUT) {
            tracing::error!("session threads left behind: {}", e);
        }
        if let Err(e) = state.root.close() {
            tracing::error!("closing the root session failed: {}", e);
        }
        state.root = GuestSession::new(self.config.session_options(0, 0));
    }

    /// Checks for a VM session change the host could not announce. If there
    /// was one, the sessions are reset and the client reconnected.
    fn session_changed(&self, state: &mut PumpState) -> Result<bool> {
        let current = match state.svc.channel.query_session_id() {
            Ok(id) => id,
            Err(e) => {
                tracing::debug!("querying the VM session failed: {}", e);
                return Ok(false);
            }
        };
        // Epoch 0 means no peek has completed yet.
        if state.svc.epoch == 0 || current == state.svc.epoch {
            return Ok(false);
        }
        tracing::info!(
            "VM session changed from {:#x} to {:#x}, reconnecting",
            state.svc.epoch,
            current
        );
        self.reset_sessions(state);
        if let Err(e) = state.svc.channel.disconnect() {
            tracing::debug!("disconnecting the old client: {}", e);
        }

        let mut svc = ServiceContext::connect(self.connector.as_ref()).map_err(|e| {
            tracing::error!("reconnecting after a VM session change failed: {}", e);
            e
        })?;
        svc.epoch = current;
        if let Err(e) = svc.channel.session_has_changed(current) {
            tracing::warn!("acknowledging the new VM session failed: {}", e);
        }
        *self.channel.lock().unwrap_or_else(PoisonError::into_inner) = svc.channel.clone();
        state.svc = svc;
        Ok(true)
    }

    /// Ends every session and disconnects. The pump is unusable afterwards.
    pub fn term(&self) {
        let Some(mut state) = self.lock_state().take() else {
            tracing::warn!("message pump still running or already torn down");
            return;
        };
        if let Err(e) = session_thread::destroy_all(&mut state.threads, SESSION_DESTROY_TIMEOUT) {
            tracing::error!("session threads left behind: {}", e);
        }
        if let Err(e) = state.root.close() {
            tracing::error!("closing the root session failed: {}", e);
        }
        if let Err(e) = state.svc.channel.disconnect() {
            tracing::debug!("disconnect: {}", e);
        }
    }
}

fn reap_stopped(threads: &mut Vec<Arc<SessionThread>>) {
    threads.retain(|thread| {
        if !thread.is_stopped() {
            return true;
        }
        match thread.wait(Duration::from_secs(1)) {
            Ok(()) => {
                tracing::debug!("[session {}] reaped", thread.id());
                false
            }
            Err(_) => true,
        }
    });
}

/// The guest control subservice.
pub struct ControlService {
    connector: Arc<dyn Connector>,
    config: ControlConfig,
    pump: Option<Arc<HostMessagePump>>,
}

impl ControlService {
    pub fn new(connector: Arc<dyn Connector>, config: ControlConfig) -> Self {
        ControlService {
            connector,
            config,
            pump: None,
        }
    }

    pub fn pump(&self) -> Option<&Arc<HostMessagePump>> {
        self.pump.as_ref()
    }
}

fn parse_flag(name: &str, value: Option<&str>) -> anyhow::Result<bool> {
    match value {
        None | Some("1") | Some("true") | Some("on") => Ok(true),
        Some("0") | Some("false") | Some("off") => Ok(false),
        Some(other) => bail!("{} expects a boolean, got '{}'", name, other),
    }
}

impl Subservice for ControlService {
    fn name(&self) -> &str {
        "control"
    }

    fn option(&mut self, name: &str, value: Option<&str>) -> anyhow::Result<bool> {
        match name {
            "control-procs-max-kept" => {
                let Some(value) = value else {
                    bail!("{} needs a value", name);
                };
                self.config.procs_max_kept = value.parse()?;
            }
            "control-peek-failures" => {
                let Some(value) = value else {
                    bail!("{} needs a value", name);
                };
                self.config.max_peek_failures = value.parse()?;
            }
            "control-dump-stdout" => self.config.dump_stdout = parse_flag(name, value)?,
            "control-dump-stderr" => self.config.dump_stderr = parse_flag(name, value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn init(&mut self) -> anyhow::Result<InitOutcome> {
        match HostMessagePump::connect(self.connector.clone(), self.config.clone()) {
            Ok(pump) => {
                self.pump = Some(Arc::new(pump));
                Ok(InitOutcome::Enabled)
            }
            Err(ErrorCode::NotFound | ErrorCode::FileNotFound) => {
                tracing::info!("guest control service not offered by the host");
                Ok(InitOutcome::Disabled)
            }
            Err(e) => bail!("connecting to the host failed: {}", e),
        }
    }

    fn worker(&self, shutdown: &CancelToken, ready: &StartSignal) {
        let Some(pump) = &self.pump else {
            tracing::error!("control worker started without a connection");
            return;
        };
        ready.signal();
        if let Err(e) = pump.run(shutdown) {
            tracing::error!("message pump ended: {}", e);
        }
    }

    fn stop(&self) {
        if let Some(pump) = &self.pump {
            pump.cancel_pending_waits();
        }
    }

    fn term(&self) {
        if let Some(pump) = &self.pump {
            pump.term();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_empty_json() {
        let config: ControlConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.procs_max_kept, 256);
        assert_eq!(config.max_peek_failures, 16);
        assert_eq!(config.peek_retry_ms, 1000);
        assert!(config.shutdown_program.is_none());
    }

    #[test]
    fn test_dump_flags_reach_sessions() {
        let config = ControlConfig {
            dump_stderr: true,
            procs_max_kept: 4,
            ..ControlConfig::default()
        };
        let options = config.session_options(2, flags::SPAWN);
        assert_eq!(options.flags, flags::SPAWN | flags::DUMP_STDERR);
        assert_eq!(options.procs_max_kept, 4);
    }

    #[test]
    fn test_options_are_parsed() {
        let host = guestctl_proto::LoopbackHost::new(0);
        let mut service = ControlService::new(Arc::new(host), ControlConfig::default());
        assert!(service.option("control-procs-max-kept", Some("8")).unwrap());
        assert!(service.option("control-dump-stdout", None).unwrap());
        assert!(service.option("control-dump-stderr", Some("maybe")).is_err());
        assert!(service.option("control-procs-max-kept", None).is_err());
        assert!(!service.option("timesync-interval", Some("1")).unwrap());
        assert_eq!(service.config.procs_max_kept, 8);
        assert!(service.config.dump_stdout);
    }
}
