use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use guestctl_proto::msg::{output_handle, proc_flags};
use guestctl_proto::{ErrorCode, ProcStatus, Result};

use super::startup::{self, EnvChange};
use super::{ChildProcess, Pipe, Request};
use crate::sys;

const POLL_INTERVAL_STDIN: Duration = Duration::from_millis(100);
const POLL_INTERVAL_IDLE: Duration = Duration::from_secs(1);
/// Poll interval once the process is gone and only output is left.
const POLL_INTERVAL_EXITED: Duration = Duration::from_secs(60);

const KILL_RETRY: Duration = Duration::from_secs(1);
const KILL_RECHECK: Duration = Duration::from_secs(10);
const KILL_GIVE_UP: Duration = Duration::from_secs(20 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitKind {
    Normal(i32),
    Signal(i32),
    Abend(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LimitCheck {
    Unlimited,
    Remaining(Duration),
    Kill,
    GiveUp,
}

/// Execution time limit and the kill attempts made once it expired.
#[derive(Debug)]
pub(crate) struct TimeLimit {
    limit: Option<Duration>,
    started: Instant,
    timed_out: bool,
    first_kill: Option<Instant>,
    last_kill: Option<Instant>,
}

impl TimeLimit {
    pub(crate) fn new(timeout_ms: u32, started: Instant) -> Self {
        let limit = match timeout_ms {
            0 | u32::MAX => None,
            ms => Some(Duration::from_millis(ms as u64)),
        };
        TimeLimit {
            limit,
            started,
            timed_out: false,
            first_kill: None,
            last_kill: None,
        }
    }

    pub(crate) fn check(&mut self, now: Instant) -> LimitCheck {
        let Some(limit) = self.limit else {
            return LimitCheck::Unlimited;
        };
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed < limit {
            return LimitCheck::Remaining(limit - elapsed);
        }

        self.timed_out = true;
        let due = match self.last_kill {
            None => true,
            Some(last) => now.saturating_duration_since(last) > KILL_RETRY,
        };
        if !due {
            return LimitCheck::Remaining(KILL_RECHECK);
        }
        if let Some(first) = self.first_kill {
            if now.saturating_duration_since(first) > KILL_GIVE_UP {
                return LimitCheck::GiveUp;
            }
        }
        self.note_kill(now);
        LimitCheck::Kill
    }

    pub(crate) fn note_kill(&mut self, now: Instant) {
        self.first_kill.get_or_insert(now);
        self.last_kill = Some(now);
    }

    pub(crate) fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub(crate) fn killed(&self) -> bool {
        self.first_kill.is_some()
    }
}

/// Status reported once the worker is done. `exit` is `None` while the
/// process is still running.
pub(crate) fn final_status(
    exit: Option<ExitKind>,
    timed_out: bool,
    killed: bool,
    startup_flags: u32,
) -> (ProcStatus, u32) {
    match (exit, timed_out, killed) {
        (Some(_), true, true) => (ProcStatus::TimedOutKilled, 0),
        (None, true, true) => (ProcStatus::TimedOutAbnormally, 0),
        (None, _, _) | (_, _, true) => (ProcStatus::Down, startup_flags),
        (Some(ExitKind::Normal(code)), _, _) => (ProcStatus::TerminatedNormally, code as u32),
        (Some(ExitKind::Signal(sig)), _, _) => (ProcStatus::TerminatedSignal, sig as u32),
        (Some(ExitKind::Abend(status)), _, _) => {
            (ProcStatus::TerminatedAbnormally, status as u32)
        }
    }
}

#[derive(Clone, Copy)]
enum Watched {
    Stdin,
    Output(u32),
    Notify,
}

pub(super) struct Worker {
    process: Arc<ChildProcess>,
    requests: Receiver<Request>,
    notify: OwnedFd,
    ready: Sender<Result<()>>,
    _done: Sender<()>,
}

impl Worker {
    pub(super) fn new(
        process: Arc<ChildProcess>,
        requests: Receiver<Request>,
        notify: OwnedFd,
        ready: Sender<Result<()>>,
        done: Sender<()>,
    ) -> Self {
        Worker {
            process,
            requests,
            notify,
            ready,
            _done: done,
        }
    }

    pub(super) fn run(self) {
        let p = &self.process;
        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(rc) => {
                tracing::debug!("spawning '{}' failed: {}", p.info.cmd, rc);
                p.shutdown.store(true, Ordering::SeqCst);
                p.stopped.store(true, Ordering::SeqCst);
                if self.ready.send(Err(rc)).is_err() {
                    tracing::debug!("starter gave up before the spawn failed");
                }
                return;
            }
        };
        if self.ready.send(Ok(())).is_err() {
            tracing::warn!("starter gave up before the process started");
        }

        let os_pid = child.id();
        let pid = match p.session.upgrade() {
            Some(session) => session.assign_pid(p, os_pid),
            None => {
                p.set_pid(os_pid);
                os_pid
            }
        };
        tracing::debug!("[PID {}] started '{}' (os pid {})", pid, p.info.cmd, os_pid);

        if let Err(e) = p.ctx.proc_status(pid, ProcStatus::Started, 0) {
            tracing::error!("[PID {}] reporting start failed: {}", pid, e);
        }

        let mut limit = TimeLimit::new(p.info.timeout_ms, Instant::now());
        let mut exit = self.supervise(&mut child, &mut limit);
        self.wind_down(&mut child, &mut limit, &mut exit);

        let (status, flags) =
            final_status(exit, limit.timed_out(), limit.killed(), p.info.flags);
        tracing::debug!("[PID {}] final status {:?} flags={:#x}", pid, status, flags);
        if let Err(e) = p.ctx.proc_status(pid, status, flags) {
            tracing::error!("[PID {}] reporting final status failed: {}", pid, e);
        }

        p.lock_io().close_all();
        p.stopped.store(true, Ordering::SeqCst);
    }

    fn spawn(&self) -> Result<Child> {
        let p = &self.process;
        let session = p.session.upgrade().ok_or(ErrorCode::Cancelled)?;
        let line = startup::command_line(&p.info, p.ctx.host_features, session.agent_exe())?;

        let mut cmd = Command::new(&line.exe);
        cmd.arg0(&line.argv0).args(&line.args);
        for change in startup::env_changes(&p.info.env)? {
            match change {
                EnvChange::Set(key, value) => cmd.env(key, value),
                EnvChange::Remove(key) => cmd.env_remove(key),
            };
        }

        let piped = |flag: u32| {
            if p.info.flags & flag != 0 {
                Stdio::piped()
            } else {
                Stdio::null()
            }
        };
        cmd.stdin(Stdio::piped())
            .stdout(piped(proc_flags::WAIT_STDOUT))
            .stderr(piped(proc_flags::WAIT_STDERR));

        if session.needs_impersonation() && !p.info.user.is_empty() {
            let user = sys::lookup_user(&p.info.user).ok_or(ErrorCode::AccessDenied)?;
            if user.uid != sys::effective_uid() {
                cmd.uid(user.uid).gid(user.gid);
            }
            if p.info.flags & proc_flags::PROFILE != 0 {
                cmd.env("HOME", &user.home)
                    .env("USER", &p.info.user)
                    .env("LOGNAME", &p.info.user);
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            tracing::debug!("spawn of {} failed: {}", line.exe.display(), e);
            ErrorCode::from(e)
        })?;

        let mut io = p.lock_io();
        io.stdin = child.stdin.take().map(|s| Pipe::new(OwnedFd::from(s)));
        io.stdout = child.stdout.take().map(|s| Pipe::new(OwnedFd::from(s)));
        io.stderr = child.stderr.take().map(|s| Pipe::new(OwnedFd::from(s)));
        let nonblocking = [&io.stdin, &io.stdout, &io.stderr]
            .into_iter()
            .flatten()
            .try_for_each(|pipe| sys::set_nonblocking(pipe.fd.as_raw_fd()));
        if let Err(e) = nonblocking {
            tracing::error!("setting up pipes of '{}' failed: {}", p.info.cmd, e);
            io.close_all();
            discard(&mut child);
            return Err(e.into());
        }
        Ok(child)
    }

    fn supervise(&self, child: &mut Child, limit: &mut TimeLimit) -> Option<ExitKind> {
        let p = &self.process;
        let base_interval = if p.lock_io().stdin.is_some() {
            POLL_INTERVAL_STDIN
        } else {
            POLL_INTERVAL_IDLE
        };
        let mut exit = None;
        let mut interval = Duration::ZERO;

        loop {
            self.poll_once(interval);

            if p.shutdown.load(Ordering::SeqCst) {
                break;
            }

            if exit.is_none() {
                exit = reap(child);
            }
            if exit.is_some() {
                let outputs_closed = {
                    let io = p.lock_io();
                    io.stdout.is_none() && io.stderr.is_none()
                };
                if limit.timed_out() || outputs_closed {
                    break;
                }
            }

            let left = match limit.check(Instant::now()) {
                LimitCheck::Unlimited => None,
                LimitCheck::Remaining(left) => Some(left),
                LimitCheck::Kill => {
                    tracing::debug!("[PID {}] time limit reached, killing", p.pid());
                    if let Err(e) = child.kill() {
                        tracing::debug!("[PID {}] kill failed: {}", p.pid(), e);
                    }
                    interval = Duration::ZERO;
                    continue;
                }
                LimitCheck::GiveUp => {
                    tracing::error!("[PID {}] does not die, giving up", p.pid());
                    break;
                }
            };

            interval = if exit.is_none() {
                base_interval
            } else {
                POLL_INTERVAL_EXITED
            };
            if let Some(left) = left {
                interval = interval.min(left);
            }
        }
        exit
    }

    fn wind_down(&self, child: &mut Child, limit: &mut TimeLimit, exit: &mut Option<ExitKind>) {
        let p = &self.process;
        p.shutdown.store(true, Ordering::SeqCst);

        if exit.is_none() {
            if !limit.killed() {
                if let Err(e) = child.kill() {
                    tracing::debug!("[PID {}] kill failed: {}", p.pid(), e);
                }
                limit.note_kill(Instant::now());
                std::thread::sleep(Duration::from_millis(500));
            }
            for attempt in 0..10 {
                *exit = reap(child);
                if exit.is_some() {
                    break;
                }
                if attempt >= 5 {
                    tracing::debug!("[PID {}] still alive, killing again", p.pid());
                    if let Err(e) = child.kill() {
                        tracing::warn!("[PID {}] kill failed: {}", p.pid(), e);
                    }
                }
                std::thread::sleep(Duration::from_millis(if attempt >= 5 { 2000 } else { 500 }));
            }
            if exit.is_none() {
                tracing::error!("[PID {}] could not be terminated", p.pid());
            }
        }

        *p.accepting.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.process_requests();
    }

    fn poll_once(&self, interval: Duration) {
        let p = &self.process;
        let mut fds = Vec::with_capacity(4);
        let mut watched = Vec::with_capacity(4);
        {
            let io = p.lock_io();
            if let Some(pipe) = io.stdin.as_ref().filter(|pipe| pipe.polled) {
                fds.push(sys::pollfd(pipe.fd.as_raw_fd(), 0));
                watched.push(Watched::Stdin);
            }
            if let Some(pipe) = io.stdout.as_ref().filter(|pipe| pipe.polled) {
                fds.push(sys::pollfd(pipe.fd.as_raw_fd(), 0));
                watched.push(Watched::Output(output_handle::STDOUT));
            }
            if let Some(pipe) = io.stderr.as_ref().filter(|pipe| pipe.polled) {
                fds.push(sys::pollfd(pipe.fd.as_raw_fd(), 0));
                watched.push(Watched::Output(output_handle::STDERR));
            }
        }
        fds.push(sys::pollfd(self.notify.as_raw_fd(), libc::POLLIN));
        watched.push(Watched::Notify);

        let timeout = interval.as_millis().min(i32::MAX as u128) as i32;
        match sys::poll(&mut fds, timeout) {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                tracing::error!("[PID {}] poll failed: {}", p.pid(), e);
                return;
            }
        }

        for (pfd, what) in fds.iter().zip(watched) {
            if pfd.revents == 0 {
                continue;
            }
            match what {
                Watched::Stdin => {
                    tracing::debug!("[PID {}] stdin went away", p.pid());
                    p.lock_io().stdin = None;
                }
                Watched::Output(handle) => self.output_hangup(handle),
                Watched::Notify => {
                    sys::drain(self.notify.as_raw_fd());
                    self.process_requests();
                }
            }
        }
    }

    /// The writer side of an output pipe is gone. Stop polling it, and close
    /// it unless the host still has data to collect.
    fn output_hangup(&self, handle: u32) {
        let p = &self.process;
        let mut io = p.lock_io();
        let slot = io.output_mut(handle);
        match slot.as_ref().map(|pipe| sys::bytes_readable(pipe.fd.as_raw_fd())) {
            Some(0) => *slot = None,
            Some(pending) => {
                tracing::trace!("[PID {}] handle {} hung up with {} bytes left", p.pid(), handle, pending);
                if let Some(pipe) = slot.as_mut() {
                    pipe.polled = false;
                }
            }
            None => {}
        }
    }

    fn process_requests(&self) {
        while let Ok(request) = self.requests.try_recv() {
            if let Err(e) = self.process.execute(request) {
                tracing::debug!("[PID {}] request failed: {}", self.process.pid(), e);
            }
        }
    }
}

/// Kills and reaps a child that will not be supervised.
fn discard(child: &mut Child) {
    if let Err(e) = child.kill() {
        tracing::warn!("killing os pid {} failed: {}", child.id(), e);
    }
    if let Err(e) = child.wait() {
        tracing::warn!("reaping os pid {} failed: {}", child.id(), e);
    }
}

fn reap(child: &mut Child) -> Option<ExitKind> {
    match child.try_wait() {
        Ok(Some(status)) => Some(match (status.code(), status.signal()) {
            (Some(code), _) => ExitKind::Normal(code),
            (None, Some(sig)) => ExitKind::Signal(sig),
            (None, None) => ExitKind::Abend(255),
        }),
        Ok(None) => None,
        Err(e) if e.raw_os_error() == Some(libc::ECHILD) => Some(ExitKind::Abend(255)),
        Err(e) => {
            tracing::debug!("waiting for child failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_without_timeout() {
        let start = Instant::now();
        for ms in [0, u32::MAX] {
            let mut limit = TimeLimit::new(ms, start);
            assert_eq!(limit.check(start + Duration::from_secs(3600)), LimitCheck::Unlimited);
            assert!(!limit.timed_out());
        }
    }

    #[test]
    fn test_kill_escalation_and_give_up() {
        let start = Instant::now();
        let mut limit = TimeLimit::new(10_000, start);
        let at = |ms: u64| start + Duration::from_millis(ms);

        assert_eq!(limit.check(at(4_000)), LimitCheck::Remaining(Duration::from_secs(6)));
        assert_eq!(limit.check(at(10_000)), LimitCheck::Kill);
        assert!(limit.timed_out() && limit.killed());

        // Within a second of the last kill nothing new happens.
        assert_eq!(limit.check(at(10_500)), LimitCheck::Remaining(KILL_RECHECK));
        assert_eq!(limit.check(at(11_500)), LimitCheck::Kill);
        assert_eq!(limit.check(at(10_000 + 20 * 60 * 1000 - 1)), LimitCheck::Kill);
        assert_eq!(limit.check(at(10_000 + 20 * 60 * 1000 + 2_000)), LimitCheck::GiveUp);
    }

    #[test]
    fn test_discard_kills_and_reaps() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        discard(&mut child);
        assert_eq!(reap(&mut child), Some(ExitKind::Signal(libc::SIGKILL)));
    }

    #[test]
    fn test_final_status_matrix() {
        use ExitKind::*;
        let flags = proc_flags::WAIT_STDOUT;
        assert_eq!(
            final_status(Some(Normal(3)), false, false, flags),
            (ProcStatus::TerminatedNormally, 3)
        );
        assert_eq!(
            final_status(Some(Signal(9)), false, false, flags),
            (ProcStatus::TerminatedSignal, 9)
        );
        assert_eq!(
            final_status(Some(Abend(255)), false, false, flags),
            (ProcStatus::TerminatedAbnormally, 255)
        );
        assert_eq!(
            final_status(Some(Signal(9)), true, true, flags),
            (ProcStatus::TimedOutKilled, 0)
        );
        assert_eq!(final_status(None, true, true, flags), (ProcStatus::TimedOutAbnormally, 0));
        assert_eq!(
            final_status(Some(Signal(9)), false, true, flags),
            (ProcStatus::Down, flags)
        );
        assert_eq!(final_status(None, false, true, flags), (ProcStatus::Down, flags));
    }
}
