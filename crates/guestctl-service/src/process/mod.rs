//! One supervised guest process and the worker thread that owns it.
//!
//! The session thread hands requests to the worker through a bounded queue
//! and wakes it with a byte on the notification pipe. Once the worker stops
//! accepting, requests run directly on the caller's thread.

mod arena;
mod startup;
mod worker;

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use guestctl_proto::msg::{input_flags, output_handle, MAX_OUTPUT_CHUNK};
use guestctl_proto::{ErrorCode, HostCtx, InputStatus, ProcStartupInfo, Result};

use crate::session::GuestSession;
use crate::sys;

pub(crate) use arena::Arena;
pub use arena::ProcessKey;

/// How long the starter waits for the worker to report the spawn outcome.
pub(crate) const START_TIMEOUT: Duration = Duration::from_secs(60);
/// How long the session waits for a stopping worker.
pub(crate) const STOP_TIMEOUT: Duration = Duration::from_secs(30);

const REQUEST_QUEUE_DEPTH: usize = 64;

pub(crate) enum Request {
    Input {
        ctx: HostCtx,
        eof: bool,
        data: Vec<u8>,
    },
    Output {
        ctx: HostCtx,
        handle: u32,
        flags: u32,
    },
    Terminate,
}

/// A pipe end the worker may still be polling.
struct Pipe {
    fd: OwnedFd,
    polled: bool,
}

impl Pipe {
    fn new(fd: OwnedFd) -> Self {
        Pipe { fd, polled: true }
    }
}

#[derive(Default)]
struct ProcessIo {
    stdin: Option<Pipe>,
    stdout: Option<Pipe>,
    stderr: Option<Pipe>,
}

impl ProcessIo {
    fn output_mut(&mut self, handle: u32) -> &mut Option<Pipe> {
        if handle == output_handle::STDERR {
            &mut self.stderr
        } else {
            &mut self.stdout
        }
    }

    fn close_all(&mut self) {
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
    }
}

pub(crate) struct ChildProcess {
    session: Weak<GuestSession>,
    /// Context of the start request, final status goes out on it.
    ctx: HostCtx,
    info: ProcStartupInfo,
    pid: AtomicU32,
    refs: AtomicU32,
    started: AtomicBool,
    shutdown: AtomicBool,
    stopped: AtomicBool,
    io: Mutex<ProcessIo>,
    accepting: Mutex<bool>,
    requests: Sender<Request>,
    notify: OwnedFd,
    done: Receiver<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ChildProcess {
    /// Spawns the worker and waits until it has tried to start the process.
    pub(crate) fn start(
        session: &Arc<GuestSession>,
        ctx: &HostCtx,
        info: ProcStartupInfo,
    ) -> Result<ProcessKey> {
        let (notify_rx, notify_tx) = sys::pipe()?;
        sys::set_nonblocking(notify_rx.as_raw_fd())?;
        sys::set_nonblocking(notify_tx.as_raw_fd())?;

        let (req_tx, req_rx) = bounded(REQUEST_QUEUE_DEPTH);
        let (done_tx, done_rx) = bounded(1);
        let (ready_tx, ready_rx) = bounded(1);

        let process = Arc::new(ChildProcess {
            session: Arc::downgrade(session),
            ctx: ctx.clone(),
            info,
            pid: AtomicU32::new(0),
            refs: AtomicU32::new(0),
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            io: Mutex::new(ProcessIo::default()),
            accepting: Mutex::new(true),
            requests: req_tx,
            notify: notify_tx,
            done: done_rx,
            thread: Mutex::new(None),
        });

        let key = session.insert_process(process.clone());
        let worker = worker::Worker::new(process.clone(), req_rx, notify_rx, ready_tx, done_tx);
        let spawned = std::thread::Builder::new()
            .name(format!("gctl-proc-s{}", session.id()))
            .spawn(move || worker.run());
        match spawned {
            Ok(handle) => *process.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle),
            Err(e) => {
                tracing::error!("failed to create process worker thread: {}", e);
                process.stopped.store(true, Ordering::SeqCst);
                session.remove_process(key)?;
                return Err(e.into());
            }
        }

        let outcome = match ready_rx.recv_timeout(START_TIMEOUT) {
            Ok(outcome) => outcome,
            Err(_) => Err(ErrorCode::Timeout),
        };
        if let Err(rc) = outcome {
            tracing::debug!("starting '{}' failed: {}", process.info.cmd, rc);
            process.shutdown.store(true, Ordering::SeqCst);
            if process.wait(STOP_TIMEOUT).is_ok() {
                if let Err(e) = session.remove_process(key) {
                    tracing::warn!("could not release failed process: {}", e);
                }
            }
            return Err(rc);
        }

        process.started.store(true, Ordering::SeqCst);
        Ok(key)
    }

    /// Guest PID reported to the host, 0 until the worker assigned it.
    pub(crate) fn pid(&self) -> u32 {
        self.pid.load(Ordering::SeqCst)
    }

    /// Whether the process made it past startup.
    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn refs(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }

    pub(crate) fn retain(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "process reference count underflow");
    }

    pub(crate) fn handle_input(&self, ctx: HostCtx, flags: u32, data: Vec<u8>) -> Result<()> {
        self.submit(Request::Input {
            ctx,
            eof: flags & input_flags::EOF != 0,
            data,
        })
    }

    pub(crate) fn handle_output(&self, ctx: HostCtx, handle: u32, flags: u32) -> Result<()> {
        self.submit(Request::Output { ctx, handle, flags })
    }

    pub(crate) fn handle_term(&self) -> Result<()> {
        self.submit(Request::Terminate)
    }

    /// Asks the worker to wind down; it reports the final status itself.
    pub(crate) fn stop(&self) {
        if let Err(e) = self.handle_term() {
            tracing::debug!("[PID {}] stop request failed: {}", self.pid(), e);
            self.shutdown.store(true, Ordering::SeqCst);
        }
    }

    /// Waits for the worker thread to exit and joins it.
    pub(crate) fn wait(&self, timeout: Duration) -> Result<()> {
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!("[PID {}] worker did not stop within {:?}", self.pid(), timeout);
                return Err(ErrorCode::Timeout);
            }
        }
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("[PID {}] worker thread panicked", self.pid());
                return Err(ErrorCode::Internal);
            }
        }
        Ok(())
    }

    pub(crate) fn set_pid(&self, pid: u32) {
        self.pid.store(pid, Ordering::SeqCst);
    }

    /// Queues a request for the worker, or runs it here once the worker no
    /// longer accepts work. An error means the request was not delivered
    /// and nothing was replied.
    fn submit(&self, request: Request) -> Result<()> {
        let request = {
            let accepting = self.accepting.lock().unwrap_or_else(PoisonError::into_inner);
            if *accepting && !self.shutdown.load(Ordering::SeqCst) && !self.is_stopped() {
                match self.requests.try_send(request) {
                    Ok(()) => {
                        self.wake();
                        return Ok(());
                    }
                    Err(TrySendError::Full(_)) => return Err(ErrorCode::OutOfResources),
                    Err(TrySendError::Disconnected(request)) => request,
                }
            } else {
                request
            }
        };
        if let Err(e) = self.execute(request) {
            tracing::debug!("[PID {}] request failed: {}", self.pid(), e);
        }
        Ok(())
    }

    fn wake(&self) {
        if let Err(e) = sys::write_raw(self.notify.as_raw_fd(), b"n") {
            // A full pipe already guarantees a wakeup.
            if e.kind() != std::io::ErrorKind::WouldBlock {
                tracing::warn!("[PID {}] notify failed: {}", self.pid(), e);
            }
        }
    }

    fn execute(&self, request: Request) -> Result<()> {
        match request {
            Request::Input { ctx, eof, data } => self.on_input(&ctx, eof, &data),
            Request::Output { ctx, handle, flags } => self.on_output(&ctx, handle, flags),
            Request::Terminate => {
                self.shutdown.store(true, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    fn lock_io(&self) -> MutexGuard<'_, ProcessIo> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_input(&self, ctx: &HostCtx, eof: bool, data: &[u8]) -> Result<()> {
        let pid = self.pid();
        let (result, written) = {
            let mut io = self.lock_io();
            let (result, written) = match &io.stdin {
                Some(pipe) if !data.is_empty() => match sys::write_raw(pipe.fd.as_raw_fd(), data) {
                    Ok(n) => (Ok(()), n),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => (Ok(()), 0),
                    Err(e) => (Err(ErrorCode::from(e)), 0),
                },
                // Nothing to write or stdin already gone: treated as end of input.
                _ => (Ok(()), 0),
            };
            if eof && written == data.len() {
                tracing::debug!("[PID {}] closing stdin", pid);
                io.stdin = None;
            }
            (result, written)
        };

        let (status, flags) = match result {
            Ok(()) => (InputStatus::Written, 0),
            Err(ErrorCode::BrokenPipe) => (InputStatus::Terminated, 0),
            Err(ErrorCode::BufferOverflow) => (InputStatus::Overflow, 0),
            Err(rc) => (InputStatus::Error, rc.to_raw() as u32),
        };
        tracing::trace!("[PID {}] wrote {}/{} bytes to stdin", pid, written, data.len());
        ctx.proc_input_status(pid, status, flags, written as u32)?;
        result
    }

    fn on_output(&self, ctx: &HostCtx, handle: u32, flags: u32) -> Result<()> {
        let pid = self.pid();
        let mut buf = vec![0u8; MAX_OUTPUT_CHUNK];
        let mut drained = false;
        let read = {
            let mut io = self.lock_io();
            let slot = io.output_mut(handle);
            match slot.as_ref().map(|pipe| pipe.fd.as_raw_fd()) {
                Some(fd) => match sys::read_raw(fd, &mut buf) {
                    Ok(0) => {
                        *slot = None;
                        Ok(0)
                    }
                    Ok(n) => {
                        // A hung up pipe is closed by whoever empties it.
                        drained = slot
                            .as_ref()
                            .is_some_and(|pipe| !pipe.polled && sys::bytes_readable(fd) == 0);
                        if drained {
                            tracing::trace!("[PID {}] handle {} drained", pid, handle);
                            *slot = None;
                        }
                        Ok(n)
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
                    Err(e) => {
                        *slot = None;
                        let rc = ErrorCode::from(e);
                        if rc == ErrorCode::BrokenPipe {
                            Ok(0)
                        } else {
                            Err(rc)
                        }
                    }
                },
                None => Ok(0),
            }
        };
        if drained && !self.is_stopped() {
            self.wake();
        }
        let len = match &read {
            Ok(n) => *n,
            Err(rc) => {
                tracing::error!("[PID {}] reading handle {} failed: {}", pid, handle, rc);
                0
            }
        };
        buf.truncate(len);

        if let Some(session) = self.session.upgrade() {
            session.dump_output(pid, handle, &buf);
        }

        match ctx.proc_output(pid, handle, flags, buf) {
            Ok(()) | Err(ErrorCode::NotFound) => {}
            Err(rc) => return Err(rc),
        }
        read.map(|_| ())
    }
}

/// Counted reference held while a handler works on a process.
pub(crate) struct ProcessRef {
    process: Arc<ChildProcess>,
}

impl ProcessRef {
    pub(crate) fn new(process: Arc<ChildProcess>) -> Self {
        process.retain();
        ProcessRef { process }
    }
}

impl std::ops::Deref for ProcessRef {
    type Target = ChildProcess;

    fn deref(&self) -> &ChildProcess {
        &self.process
    }
}

impl Drop for ProcessRef {
    fn drop(&mut self) {
        self.process.release();
    }
}
