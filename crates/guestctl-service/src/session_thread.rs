//! Supervision of guest sessions that run as separate processes.
//!
//! Each host session open starts `<agent> guestsession ...` as the target
//! user. A thread per session feeds the child its key, watches it, and
//! reports how it ended with exactly one session notification.

use std::os::unix::io::AsRawFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use guestctl_proto::msg::SESSION_KEY_SIZE;
use guestctl_proto::{
    context, ErrorCode, HostCtx, Result, SessionNotifyType, SessionStartupInfo, CHANNEL_ENV,
};

use crate::cancel::CancelToken;
use crate::session::spawned::SessionExit;
use crate::sys;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// After this long the prepared handshake is withdrawn whether or not the
/// child used it.
const PREPARED_LIFETIME: Duration = Duration::from_secs(30);
const PREPARE_ATTEMPTS: u32 = 10;
const PREPARE_RETRY: Duration = Duration::from_millis(100);
const KILL_ATTEMPTS: u32 = 3;
const KILL_WAIT: Duration = Duration::from_secs(3);
/// argv[0] of session processes, so they stand out in process listings.
pub const SESSION_ARGV0: &str = "guestctl-agent: guestsession";

#[derive(Debug, Clone)]
pub struct SessionThreadConfig {
    /// Binary started with the `guestsession` subcommand.
    pub exe: PathBuf,
    /// Number of `-v` flags passed on.
    pub verbosity: u8,
    /// Base name for per-session log files, none to log nowhere.
    pub log_base: Option<PathBuf>,
    /// Exported to the child as the channel address.
    pub channel_address: Option<String>,
    /// How long a session may take to close before it is killed.
    pub shutdown_timeout: Duration,
}

impl Default for SessionThreadConfig {
    fn default() -> Self {
        SessionThreadConfig {
            exe: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("guestctl-agent")),
            verbosity: 0,
            log_base: None,
            channel_address: None,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Log file of one session: `<stem>-<id>-<user>-<time>[.<ext>]` next to `base`.
pub fn session_log_path(base: &Path, session_id: u32, user: &str, now: SystemTime) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "guestctl".to_string());
    let user: String = user
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    let secs = now.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let mut name = format!("{}-{}-{}-{}", stem, session_id, user, secs);
    if let Some(ext) = base.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    base.with_file_name(name)
}

pub struct SessionThread {
    id: u32,
    user: String,
    pid: u32,
    shutdown: CancelToken,
    stopped: Arc<AtomicBool>,
    done: Receiver<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SessionThread {
    /// Prepares the host for a new session and starts its process.
    pub fn create(
        ctx: &HostCtx,
        info: &SessionStartupInfo,
        config: &SessionThreadConfig,
    ) -> Result<Arc<SessionThread>> {
        let id = info.session_id;
        let mut key = [0u8; SESSION_KEY_SIZE];
        getrandom::getrandom(&mut key).map_err(|e| {
            tracing::error!("[session {}] no random key: {}", id, e);
            ErrorCode::Internal
        })?;

        if ctx.supports_optimizations() {
            prepare(ctx, id, &key)?;
        }

        let mut child = match spawn(info, config) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("[session {}] starting session process failed: {}", id, e);
                if ctx.supports_optimizations() {
                    cancel_prepared(ctx, id);
                }
                return Err(e);
            }
        };
        let stdin = child.stdin.take();
        let piped = stdin
            .as_ref()
            .map_or(Ok(()), |pipe| sys::set_nonblocking(pipe.as_raw_fd()));
        if let Err(e) = piped {
            tracing::error!("[session {}] cannot set up the key pipe: {}", id, e);
            abandon(ctx, id, ctx.supports_optimizations(), &mut child);
            return Err(e.into());
        }
        tracing::debug!(
            "[session {}] process {} started for user '{}'",
            id,
            child.id(),
            info.user
        );

        let shutdown = CancelToken::new();
        let stopped = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = bounded::<()>(1);
        let supervisor = Supervisor {
            id,
            ctx: ctx.with_context(context::session_context(id)),
            child,
            stdin,
            key,
            fed: 0,
            shutdown: shutdown.clone(),
            stopped: stopped.clone(),
            shutdown_timeout: config.shutdown_timeout,
            prepared: ctx.supports_optimizations(),
            _done: done_tx,
        };
        let thread = SessionThread {
            id,
            user: info.user.clone(),
            pid: supervisor.child.id(),
            shutdown,
            stopped,
            done: done_rx,
            thread: Mutex::new(None),
        };

        // The handover channel gives the supervisor back if the thread never runs.
        let (hand_tx, hand_rx) = bounded::<Supervisor>(1);
        if hand_tx.send(supervisor).is_err() {
            return Err(ErrorCode::Internal);
        }
        let thread_rx = hand_rx.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("gctl-sess{}", id))
            .spawn(move || {
                if let Ok(supervisor) = thread_rx.recv() {
                    supervisor.run();
                }
            });
        match spawned {
            Ok(handle) => {
                *thread.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                Ok(Arc::new(thread))
            }
            Err(e) => {
                tracing::error!("[session {}] cannot create supervising thread: {}", id, e);
                if let Ok(mut supervisor) = hand_rx.try_recv() {
                    abandon(&supervisor.ctx, id, supervisor.prepared, &mut supervisor.child);
                }
                Err(e.into())
            }
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// OS PID of the session process.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Asks the session to close. Returns at once.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Waits for the supervising thread to finish.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        if let Err(RecvTimeoutError::Timeout) = self.done.recv_timeout(timeout) {
            tracing::warn!("[session {}] thread did not finish in {:?}", self.id, timeout);
            return Err(ErrorCode::Timeout);
        }
        let handle = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("[session {}] thread panicked", self.id);
            }
        }
        Ok(())
    }

    pub fn destroy(&self, timeout: Duration) -> Result<()> {
        tracing::debug!("[session {}] destroying", self.id);
        self.stop();
        self.wait(timeout)
    }
}

/// Stops all sessions first, then waits for each, so their shutdown
/// timeouts run in parallel.
pub fn destroy_all(threads: &mut Vec<Arc<SessionThread>>, timeout: Duration) -> Result<()> {
    for thread in threads.iter() {
        thread.stop();
    }
    let mut first_err = None;
    threads.retain(|thread| match thread.wait(timeout) {
        Ok(()) => false,
        Err(e) => {
            first_err.get_or_insert(e);
            true
        }
    });
    first_err.map_or(Ok(()), Err)
}

fn cancel_prepared(ctx: &HostCtx, id: u32) {
    if let Err(e) = ctx.channel().session_cancel_prepared(id) {
        tracing::warn!("[session {}] cancelling prepared session failed: {}", id, e);
    }
}

/// Cleans up after a session process that will never be supervised.
fn abandon(ctx: &HostCtx, id: u32, prepared: bool, child: &mut Child) {
    if let Err(e) = child.kill() {
        tracing::warn!("[session {}] kill failed: {}", id, e);
    }
    if let Err(e) = child.wait() {
        tracing::warn!("[session {}] reaping process failed: {}", id, e);
    }
    if prepared {
        cancel_prepared(ctx, id);
    }
}

fn prepare(ctx: &HostCtx, id: u32, key: &[u8]) -> Result<()> {
    let mut attempt = 1;
    loop {
        match ctx.channel().session_prepare(id, key) {
            Err(ErrorCode::OutOfResources) if attempt < PREPARE_ATTEMPTS => {
                tracing::debug!("[session {}] host busy preparing, retry {}", id, attempt);
                attempt += 1;
                std::thread::sleep(PREPARE_RETRY);
            }
            Err(e) => {
                tracing::error!("[session {}] preparing failed: {}", id, e);
                return Err(e);
            }
            Ok(()) => return Ok(()),
        }
    }
}

fn spawn(info: &SessionStartupInfo, config: &SessionThreadConfig) -> Result<Child> {
    Ok(command(info, config)?.spawn()?)
}

fn command(info: &SessionStartupInfo, config: &SessionThreadConfig) -> Result<Command> {
    let mut cmd = Command::new(&config.exe);
    cmd.arg0(SESSION_ARGV0)
        .arg("guestsession")
        .arg(format!("--session-id={}", info.session_id))
        .arg(format!("--session-proto={}", info.protocol));
    if !info.user.is_empty() {
        cmd.arg("--user").arg(&info.user);
        if !info.domain.is_empty() {
            cmd.arg("--domain").arg(&info.domain);
        }
    }
    for _ in 0..config.verbosity {
        cmd.arg("-v");
    }
    if let Some(base) = &config.log_base {
        let log = session_log_path(base, info.session_id, &info.user, SystemTime::now());
        cmd.arg("--logfile").arg(log);
    }
    if let Some(address) = &config.channel_address {
        cmd.env(CHANNEL_ENV, address);
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    if !info.user.is_empty() {
        let ids = sys::lookup_user(&info.user).ok_or_else(|| {
            tracing::error!("[session {}] unknown user '{}'", info.session_id, info.user);
            ErrorCode::AccessDenied
        })?;
        if ids.uid != sys::effective_uid() {
            cmd.uid(ids.uid).gid(ids.gid);
        }
        cmd.env("HOME", &ids.home)
            .env("USER", &info.user)
            .env("LOGNAME", &info.user);
    }
    Ok(cmd)
}

enum Ended {
    Exited(ExitStatus),
    /// Still running when supervision ended.
    Alive,
    /// Exit status could not be collected.
    Lost,
}

struct Supervisor {
    id: u32,
    ctx: HostCtx,
    child: Child,
    stdin: Option<ChildStdin>,
    key: [u8; SESSION_KEY_SIZE],
    fed: usize,
    shutdown: CancelToken,
    stopped: Arc<AtomicBool>,
    shutdown_timeout: Duration,
    prepared: bool,
    _done: Sender<()>,
}

impl Supervisor {
    fn run(mut self) {
        let ended = self.supervise();
        let (kind, result) = match ended {
            Ended::Exited(status) => exit_notification(self.id, status),
            Ended::Lost => (SessionNotifyType::TerminatedNormally, 0),
            Ended::Alive => {
                if self.kill() {
                    (SessionNotifyType::TimedOutKilled, 0)
                } else {
                    (SessionNotifyType::TimedOutAbnormally, 0)
                }
            }
        };
        if self.prepared {
            self.cancel_prepared();
        }
        self.stopped.store(true, Ordering::SeqCst);

        tracing::debug!("[session {}] ended: {:?} ({})", self.id, kind, result);
        if let Err(e) = self.ctx.session_notify(kind, result) {
            tracing::error!("[session {}] final notification failed: {}", self.id, e);
        }
    }

    fn supervise(&mut self) -> Ended {
        let started = Instant::now();
        let mut close_requested: Option<Instant> = None;

        loop {
            self.feed_key();

            match self.child.try_wait() {
                Ok(Some(status)) => return Ended::Exited(status),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("[session {}] waiting for process failed: {}", self.id, e);
                    return Ended::Lost;
                }
            }

            if self.shutdown.is_cancelled() {
                match close_requested {
                    None => {
                        close_requested = Some(Instant::now());
                        match self.ctx.session_close(0) {
                            Ok(()) => {}
                            Err(ErrorCode::NotSupported) => {
                                tracing::debug!("[session {}] host cannot close sessions, killing", self.id);
                                if let Err(e) = self.child.kill() {
                                    tracing::warn!("[session {}] kill failed: {}", self.id, e);
                                }
                            }
                            Err(e) => {
                                tracing::error!("[session {}] asking to close failed: {}", self.id, e);
                                return Ended::Alive;
                            }
                        }
                    }
                    Some(at) if at.elapsed() >= self.shutdown_timeout => {
                        tracing::warn!(
                            "[session {}] did not close within {:?}",
                            self.id,
                            self.shutdown_timeout
                        );
                        return Ended::Alive;
                    }
                    Some(_) => {}
                }
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }

            if self.prepared && started.elapsed() >= PREPARED_LIFETIME {
                self.cancel_prepared();
            }
            self.shutdown.wait_timeout(POLL_INTERVAL);
        }
    }

    /// Writes what is left of the key without blocking, closing stdin once
    /// everything is out.
    fn feed_key(&mut self) {
        let Some(stdin) = &self.stdin else {
            return;
        };
        match sys::write_raw(stdin.as_raw_fd(), &self.key[self.fed..]) {
            Ok(n) => self.fed += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                tracing::debug!("[session {}] feeding key failed: {}", self.id, e);
                self.stdin = None;
                return;
            }
        }
        if self.fed == self.key.len() {
            tracing::trace!("[session {}] key delivered", self.id);
            self.stdin = None;
        }
    }

    fn cancel_prepared(&mut self) {
        self.prepared = false;
        if let Err(e) = self.ctx.channel().session_cancel_prepared(self.id) {
            tracing::debug!("[session {}] cancelling prepared session: {}", self.id, e);
        }
    }

    /// Returns whether the process is gone.
    fn kill(&mut self) -> bool {
        for attempt in 1..=KILL_ATTEMPTS {
            tracing::debug!("[session {}] killing process, attempt {}", self.id, attempt);
            if let Err(e) = self.child.kill() {
                tracing::warn!("[session {}] kill failed: {}", self.id, e);
            }
            let deadline = Instant::now() + KILL_WAIT;
            while Instant::now() < deadline {
                match self.child.try_wait() {
                    Ok(Some(_)) => return true,
                    Ok(None) => std::thread::sleep(POLL_INTERVAL),
                    Err(_) => return true,
                }
            }
        }
        tracing::error!("[session {}] process could not be killed", self.id);
        false
    }
}

fn exit_notification(id: u32, status: ExitStatus) -> (SessionNotifyType, i32) {
    if let Some(code) = status.code() {
        if code == SessionExit::INIT_CODE {
            tracing::error!(
                "[session {}] session process failed to initialise; check that the log file \
                 location is writable by the session user",
                id
            );
        }
        return (SessionNotifyType::TerminatedNormally, code);
    }
    match status.signal() {
        Some(signal) => (SessionNotifyType::TerminatedSignal, signal),
        None => (SessionNotifyType::TerminatedAbnormally, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_path_keeps_extension() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let path = session_log_path(Path::new("/var/log/guestctl.log"), 3, "bob smith", now);
        assert_eq!(
            path,
            PathBuf::from("/var/log/guestctl-3-bob_smith-1700000000.log")
        );

        let path = session_log_path(Path::new("/tmp/agent"), 1, "", now);
        assert_eq!(path, PathBuf::from("/tmp/agent-1--1700000000"));
    }

    #[test]
    fn test_session_command_line() {
        let info = SessionStartupInfo {
            session_id: 4,
            protocol: 2,
            ..Default::default()
        };
        let config = SessionThreadConfig {
            exe: PathBuf::from("/usr/sbin/guestctl-agent"),
            verbosity: 2,
            ..SessionThreadConfig::default()
        };
        let cmd = command(&info, &config).unwrap();
        assert_eq!(cmd.get_program(), "/usr/sbin/guestctl-agent");
        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(args, ["guestsession", "--session-id=4", "--session-proto=2", "-v", "-v"]);
        // Unix `Command` prints a differing argv[0] next to the program.
        assert!(format!("{:?}", cmd).contains(&format!("{:?}", SESSION_ARGV0)));
    }

    #[test]
    fn test_abandon_reaps_child_and_withdraws_key() {
        use guestctl_proto::msg::host_features;
        use guestctl_proto::{HostChannel, HostEvent, LoopbackHost, PROTOCOL_VERSION};

        let host = LoopbackHost::new(host_features::OPTIMIZATIONS);
        let channel: Arc<dyn HostChannel> = host.connect_client().unwrap();
        channel.session_prepare(9, &[1u8; SESSION_KEY_SIZE]).unwrap();
        let ctx = HostCtx::new(channel, PROTOCOL_VERSION, host_features::OPTIMIZATIONS);

        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        abandon(&ctx, 9, true, &mut child);

        let status = child.try_wait().unwrap().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
        assert!(host.prepared_key(9).is_none());
        assert_eq!(
            host.count(|e| matches!(e, HostEvent::SessionCancelled { session_id: 9 })),
            1
        );
    }

    #[test]
    fn test_exit_notification_mapping() {
        let normal = ExitStatus::from_raw(7 << 8);
        assert_eq!(
            exit_notification(1, normal),
            (SessionNotifyType::TerminatedNormally, 7)
        );
        let signalled = ExitStatus::from_raw(libc::SIGKILL);
        assert_eq!(
            exit_notification(1, signalled),
            (SessionNotifyType::TerminatedSignal, libc::SIGKILL)
        );
    }
}
