//! A guest session: the processes and files one host session owns, and the
//! dispatcher for the messages addressed to it.

mod file;
mod path;
pub mod spawned;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use guestctl_proto::msg::output_handle;
use guestctl_proto::{
    ErrorCode, Fetched, HostCtx, HostMessage, HostMsgKind, InputStatus, ProcStatus, Result,
};

use crate::process::{Arena, ChildProcess, ProcessKey, ProcessRef, STOP_TIMEOUT};
use crate::scratch::ScratchBuffer;

use file::OpenFile;

/// Session flags.
pub mod flags {
    /// The session runs in its own process, already as the target user.
    pub const SPAWN: u32 = 0x1;
    /// Started without credentials.
    pub const ANONYMOUS: u32 = 0x2;
    /// Append process stdout to a file in the dump directory.
    pub const DUMP_STDOUT: u32 = 0x4;
    pub const DUMP_STDERR: u32 = 0x8;
}

/// Step added to a colliding process ID until it is unique in the session.
pub const PID_STEP: u32 = 391_939;

pub const DEFAULT_PROCS_MAX_KEPT: u32 = 256;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub id: u32,
    pub flags: u32,
    /// Limit on live plus finished-but-unreaped processes, 0 for none.
    pub procs_max_kept: u32,
    /// Binary run for the agent's own command aliases.
    pub agent_exe: PathBuf,
    pub dump_dir: PathBuf,
    /// Replaces the platform shutdown command when set.
    pub shutdown_program: Option<PathBuf>,
}

impl SessionOptions {
    pub fn new(id: u32, flags: u32) -> Self {
        SessionOptions {
            id,
            flags,
            procs_max_kept: DEFAULT_PROCS_MAX_KEPT,
            agent_exe: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("guestctl-agent")),
            dump_dir: std::env::temp_dir(),
            shutdown_program: None,
        }
    }
}

/// What the caller's message loop should do after a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The host closed this session.
    Shutdown,
}

pub struct GuestSession {
    options: SessionOptions,
    processes: Mutex<Arena<Arc<ChildProcess>>>,
    files: Mutex<BTreeMap<u32, OpenFile>>,
}

impl GuestSession {
    pub fn new(options: SessionOptions) -> Arc<GuestSession> {
        tracing::debug!(
            "[session {}] created with flags {:#x}",
            options.id,
            options.flags
        );
        Arc::new(GuestSession {
            options,
            processes: Mutex::new(Arena::new()),
            files: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn id(&self) -> u32 {
        self.options.id
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Spawned and anonymous sessions may touch the file system.
    pub fn is_impersonated(&self) -> bool {
        self.options.flags & (flags::SPAWN | flags::ANONYMOUS) != 0
    }

    /// Processes of a non-spawned session must switch to the requested user.
    pub(crate) fn needs_impersonation(&self) -> bool {
        self.options.flags & flags::SPAWN == 0
    }

    pub(crate) fn agent_exe(&self) -> &Path {
        &self.options.agent_exe
    }

    pub fn process_count(&self) -> usize {
        self.lock_processes().len()
    }

    pub fn file_count(&self) -> usize {
        self.lock_files().len()
    }

    /// Guest PIDs of all tracked processes.
    pub fn process_pids(&self) -> Vec<u32> {
        self.lock_processes()
            .iter()
            .map(|(_, p)| p.pid())
            .filter(|pid| *pid != 0)
            .collect()
    }

    fn lock_processes(&self) -> MutexGuard<'_, Arena<Arc<ChildProcess>>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_files(&self) -> MutexGuard<'_, BTreeMap<u32, OpenFile>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert_process(&self, process: Arc<ChildProcess>) -> ProcessKey {
        self.lock_processes().insert(process)
    }

    /// Drops a finished process. Only legal once it is stopped and nobody
    /// holds a reference.
    pub(crate) fn remove_process(&self, key: ProcessKey) -> Result<()> {
        let mut processes = self.lock_processes();
        let process = processes.get(key).ok_or(ErrorCode::NotFound)?;
        if process.refs() != 0 || !process.is_stopped() {
            tracing::error!(
                "[PID {}] cannot free: refs={} stopped={}",
                process.pid(),
                process.refs(),
                process.is_stopped()
            );
            return Err(ErrorCode::WrongOrder);
        }
        processes.remove(key);
        Ok(())
    }

    /// Gives `process` a guest PID derived from its OS PID that no other
    /// process of this session uses.
    pub(crate) fn assign_pid(&self, process: &ChildProcess, os_pid: u32) -> u32 {
        let processes = self.lock_processes();
        let pid = next_free_pid(os_pid, |candidate| {
            processes
                .iter()
                .any(|(_, p)| !std::ptr::eq(p.as_ref(), process) && p.pid() == candidate)
        });
        if pid != os_pid {
            tracing::debug!("[session {}] PID {} taken, using {}", self.id(), os_pid, pid);
        }
        process.set_pid(pid);
        pid
    }

    fn retain_process(&self, pid: u32) -> Option<ProcessRef> {
        if pid == 0 {
            return None;
        }
        self.lock_processes()
            .iter()
            .find(|(_, p)| p.pid() == pid)
            .map(|(_, p)| ProcessRef::new(p.clone()))
    }

    fn start_allowed(&self) -> bool {
        let max = self.options.procs_max_kept as usize;
        max == 0 || self.process_count() < max
    }

    /// Frees processes whose workers have finished.
    fn reap_stopped(&self) {
        let stopped: Vec<_> = self
            .lock_processes()
            .iter()
            .filter(|(_, p)| p.is_stopped())
            .map(|(key, p)| (key, p.clone()))
            .collect();
        for (key, process) in stopped {
            let freed = process
                .wait(STOP_TIMEOUT)
                .and_then(|()| self.remove_process(key));
            if let Err(e) = freed {
                tracing::warn!("[PID {}] not freed: {}", process.pid(), e);
            }
        }
    }

    pub(crate) fn dump_output(&self, pid: u32, handle: u32, data: &[u8]) {
        let (flag, name) = if handle == output_handle::STDERR {
            (flags::DUMP_STDERR, "stderr")
        } else {
            (flags::DUMP_STDOUT, "stdout")
        };
        if self.options.flags & flag == 0 || data.is_empty() {
            return;
        }
        let path = self
            .options
            .dump_dir
            .join(format!("guestctl-s{}-pid{}-{}.txt", self.id(), pid, name));
        let written = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(data));
        if let Err(e) = written {
            tracing::warn!("dumping output to {} failed: {}", path.display(), e);
        }
    }

    /// Handles the message `ctx` was peeked for.
    pub fn dispatch(
        self: &Arc<Self>,
        ctx: &mut HostCtx,
        scratch: &mut ScratchBuffer,
    ) -> Result<Flow> {
        let kind = match HostMsgKind::from_raw(ctx.msg) {
            Some(kind) if !kind.is_filesystem() || self.is_impersonated() => kind,
            _ => {
                skip_unsupported(ctx)?;
                return Ok(Flow::Continue);
            }
        };
        tracing::trace!("[session {}] handling {}", self.id(), kind);

        let result = match kind {
            HostMsgKind::SessionClose => {
                if let Err(e) = fetch(ctx, kind, scratch) {
                    tracing::debug!("session close without parameters: {}", e);
                }
                if let Err(e) = self.close() {
                    tracing::error!("[session {}] closing failed: {}", self.id(), e);
                }
                return Ok(Flow::Shutdown);
            }
            HostMsgKind::ExecCmd => self.handle_exec(ctx, scratch),
            HostMsgKind::ExecSetInput => self.handle_exec_input(ctx, scratch),
            HostMsgKind::ExecGetOutput => self.handle_exec_output(ctx, scratch),
            HostMsgKind::ExecTerminate => self.handle_exec_terminate(ctx, scratch),
            HostMsgKind::ExecWaitFor => self.handle_exec_wait_for(ctx, scratch),
            HostMsgKind::FileOpen => self.handle_file_open(ctx, scratch),
            HostMsgKind::FileClose => self.handle_file_close(ctx, scratch),
            HostMsgKind::FileRead => self.handle_file_read(ctx, scratch),
            HostMsgKind::FileReadAt => self.handle_file_read_at(ctx, scratch),
            HostMsgKind::FileWrite => self.handle_file_write(ctx, scratch),
            HostMsgKind::FileWriteAt => self.handle_file_write_at(ctx, scratch),
            HostMsgKind::FileSeek => self.handle_file_seek(ctx, scratch),
            HostMsgKind::FileTell => self.handle_file_tell(ctx, scratch),
            HostMsgKind::FileSetSize => self.handle_file_set_size(ctx, scratch),
            HostMsgKind::DirRemove => self.handle_dir_remove(ctx, scratch),
            HostMsgKind::PathRename => self.handle_path_rename(ctx, scratch),
            HostMsgKind::PathUserDocuments => self.handle_user_documents(ctx, scratch),
            HostMsgKind::PathUserHome => self.handle_user_home(ctx, scratch),
            HostMsgKind::Shutdown => self.handle_shutdown(ctx, scratch),
            // Only the main service handles these.
            HostMsgKind::CancelPendingWaits | HostMsgKind::SessionCreate => {
                skip_unsupported(ctx)?;
                Ok(())
            }
        };
        result.map(|()| Flow::Continue)
    }

    fn handle_exec(self: &Arc<Self>, ctx: &mut HostCtx, scratch: &mut ScratchBuffer) -> Result<()> {
        let HostMessage::ExecCmd(info) = fetch(ctx, HostMsgKind::ExecCmd, scratch)? else {
            return Err(ErrorCode::Mismatch);
        };
        tracing::debug!("[session {}] exec '{}' flags={:#x}", self.id(), info.cmd, info.flags);

        self.reap_stopped();
        let result = if self.start_allowed() {
            ChildProcess::start(self, ctx, info).map(|_| ())
        } else {
            tracing::warn!(
                "[session {}] process limit of {} reached",
                self.id(),
                self.options.procs_max_kept
            );
            Err(ErrorCode::MaxProcsReached)
        };

        if let Err(rc) = result {
            ctx.proc_status(0, ProcStatus::Error, rc.to_raw() as u32)?;
        }
        result
    }

    fn handle_exec_input(&self, ctx: &mut HostCtx, scratch: &mut ScratchBuffer) -> Result<()> {
        let HostMessage::ExecSetInput { pid, flags, data } =
            fetch(ctx, HostMsgKind::ExecSetInput, scratch)?
        else {
            return Err(ErrorCode::Mismatch);
        };
        let Some(process) = self.retain_process(pid) else {
            let rc = ErrorCode::ProcessNotFound;
            ctx.proc_input_status(pid, InputStatus::Error, rc.to_raw() as u32, 0)?;
            return Err(rc);
        };
        if let Err(rc) = process.handle_input(ctx.clone(), flags, data) {
            ctx.proc_input_status(pid, InputStatus::Error, rc.to_raw() as u32, 0)?;
            return Err(rc);
        }
        Ok(())
    }

    fn handle_exec_output(&self, ctx: &mut HostCtx, scratch: &mut ScratchBuffer) -> Result<()> {
        let HostMessage::ExecGetOutput { pid, handle, flags } =
            fetch(ctx, HostMsgKind::ExecGetOutput, scratch)?
        else {
            return Err(ErrorCode::Mismatch);
        };
        let result = match self.retain_process(pid) {
            Some(process) => process.handle_output(ctx.clone(), handle, flags),
            None => Err(ErrorCode::ProcessNotFound),
        };
        if let Err(rc) = result {
            ctx.reply_rc(rc.to_raw())?;
        }
        result
    }

    /// Termination is answered by the process's final status.
    fn handle_exec_terminate(&self, ctx: &mut HostCtx, scratch: &mut ScratchBuffer) -> Result<()> {
        let HostMessage::ExecTerminate { pid } = fetch(ctx, HostMsgKind::ExecTerminate, scratch)?
        else {
            return Err(ErrorCode::Mismatch);
        };
        let result = match self.retain_process(pid) {
            Some(process) => process.handle_term(),
            None => Err(ErrorCode::ProcessNotFound),
        };
        if let Err(rc) = result {
            ctx.reply_rc(rc.to_raw())?;
        }
        result
    }

    fn handle_exec_wait_for(&self, ctx: &mut HostCtx, scratch: &mut ScratchBuffer) -> Result<()> {
        let HostMessage::ExecWaitFor { pid, .. } = fetch(ctx, HostMsgKind::ExecWaitFor, scratch)?
        else {
            return Err(ErrorCode::Mismatch);
        };
        let rc = match self.retain_process(pid) {
            Some(_) => ErrorCode::NotImplemented,
            None => ErrorCode::NotFound,
        };
        ctx.reply_rc(rc.to_raw())?;
        Err(rc)
    }

    /// Stops every process, waits for the workers and closes all files.
    /// Calling it again on an empty session does nothing.
    pub fn close(&self) -> Result<()> {
        let processes: Vec<_> = self
            .lock_processes()
            .iter()
            .map(|(key, p)| (key, p.clone()))
            .collect();
        if !processes.is_empty() {
            tracing::debug!(
                "[session {}] stopping {} process(es)",
                self.id(),
                processes.len()
            );
        }
        for (_, process) in &processes {
            tracing::trace!(
                "[PID {}] stopping (started={} stopped={})",
                process.pid(),
                process.is_started(),
                process.is_stopped()
            );
            process.stop();
        }

        let mut first_err = None;
        for (key, process) in processes {
            let freed = process
                .wait(STOP_TIMEOUT)
                .and_then(|()| self.remove_process(key));
            if let Err(e) = freed {
                tracing::error!("[PID {}] could not be freed: {}", process.pid(), e);
                first_err.get_or_insert(e);
            }
        }

        let files = std::mem::take(&mut *self.lock_files());
        for (handle, file) in files {
            tracing::debug!("[session {}] closing file {} ({})", self.id(), handle, file.path.display());
        }

        match first_err {
            Some(e) => Err(e),
            None => {
                debug_assert_eq!(self.process_count(), 0);
                debug_assert_eq!(self.file_count(), 0);
                Ok(())
            }
        }
    }
}

impl Drop for GuestSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("[session {}] teardown incomplete: {}", self.options.id, e);
        }
    }
}

fn next_free_pid(mut pid: u32, in_use: impl Fn(u32) -> bool) -> u32 {
    while pid == 0 || in_use(pid) {
        pid = pid.wrapping_add(PID_STEP);
    }
    pid
}

/// Fetches the current message into `scratch`, growing it once if the body
/// does not fit. On failure the message is skipped so the queue moves on.
fn fetch(ctx: &mut HostCtx, kind: HostMsgKind, scratch: &mut ScratchBuffer) -> Result<HostMessage> {
    let result = loop {
        match ctx.fetch(kind, scratch.capacity()) {
            Ok(Fetched::Message { message, .. }) => break Ok(message),
            Ok(Fetched::Overflow { needed }) => {
                if let Err(rc) = scratch.ensure_capacity(needed) {
                    break Err(rc);
                }
            }
            Err(rc) => break Err(rc),
        }
    };
    if let Err(rc) = result {
        tracing::error!("fetching {} failed: {}", kind, rc);
        if let Err(e) = ctx.skip(rc.to_raw()) {
            tracing::debug!("skipping {} failed: {}", kind, e);
        }
    }
    result
}

fn skip_unsupported(ctx: &HostCtx) -> Result<()> {
    tracing::debug!("skipping unsupported message {} (context {:#x})", ctx.msg, ctx.context_id);
    ctx.skip(ErrorCode::NotSupported.to_raw())
}

/// Combines an operation's result with the outcome of replying to it.
fn finish<T>(result: Result<T>, replied: Result<()>) -> Result<()> {
    if let Err(e) = &replied {
        tracing::error!("reply failed: {}", e);
    }
    result.map(|_| ()).and(replied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_collision_steps() {
        let taken = [1000, 1000 + PID_STEP];
        assert_eq!(next_free_pid(1000, |p| taken.contains(&p)), 1000 + 2 * PID_STEP);
        assert_eq!(next_free_pid(42, |p| taken.contains(&p)), 42);
        assert_eq!(next_free_pid(0, |_| false), PID_STEP);
    }

    #[test]
    fn test_impersonation_flags() {
        let root = GuestSession::new(SessionOptions::new(0, 0));
        assert!(!root.is_impersonated());
        assert!(root.needs_impersonation());

        let spawned = GuestSession::new(SessionOptions::new(3, flags::SPAWN));
        assert!(spawned.is_impersonated());
        assert!(!spawned.needs_impersonation());

        let anon = GuestSession::new(SessionOptions::new(4, flags::ANONYMOUS));
        assert!(anon.is_impersonated());
    }

    #[test]
    fn test_held_process_is_not_freed() {
        use guestctl_proto::{
            GuestReply, HostChannel, HostEvent, LoopbackHost, ProcStartupInfo, PROTOCOL_VERSION,
        };
        use std::time::{Duration, Instant};

        let host = LoopbackHost::new(0);
        let channel: Arc<dyn HostChannel> = host.connect_client().unwrap();
        let ctx = HostCtx::new(channel, PROTOCOL_VERSION, 0);
        let session = GuestSession::new(SessionOptions::new(1, flags::SPAWN));
        let info = ProcStartupInfo {
            cmd: "/bin/sh".into(),
            args: "-c 'exit 0'".into(),
            ..Default::default()
        };
        let key = ChildProcess::start(&session, &ctx, info).unwrap();
        let started = host.wait_for(Duration::from_secs(20), |e| {
            matches!(
                e,
                HostEvent::Reply {
                    reply: GuestReply::ProcStatus {
                        status: ProcStatus::Started,
                        ..
                    },
                    ..
                }
            )
        });
        assert!(started.is_some());

        let held = session.retain_process(session.process_pids()[0]).unwrap();
        let deadline = Instant::now() + Duration::from_secs(20);
        while !held.is_stopped() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(held.is_stopped());
        assert_eq!(held.refs(), 1);
        assert_eq!(session.remove_process(key), Err(ErrorCode::WrongOrder));
        assert_eq!(session.process_count(), 1);

        drop(held);
        session.remove_process(key).unwrap();
        assert_eq!(session.process_count(), 0);
        assert_eq!(session.remove_process(key), Err(ErrorCode::NotFound));
    }

    #[test]
    fn test_close_empty_session_is_noop() {
        let session = GuestSession::new(SessionOptions::new(1, flags::SPAWN));
        session.close().unwrap();
        session.close().unwrap();
        assert_eq!(session.process_count(), 0);
    }

    #[test]
    fn test_finish_keeps_first_error() {
        assert_eq!(finish(Ok(1), Ok(())), Ok(()));
        assert_eq!(
            finish::<()>(Err(ErrorCode::NotFound), Err(ErrorCode::Disconnected)),
            Err(ErrorCode::NotFound)
        );
        assert_eq!(finish(Ok(()), Err(ErrorCode::Disconnected)), Err(ErrorCode::Disconnected));
    }
}
