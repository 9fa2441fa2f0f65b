use serde::{Deserialize, Serialize};

/// Message kinds the host queues for the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum HostMsgKind {
    CancelPendingWaits = 0,
    SessionCreate = 20,
    SessionClose = 21,
    ExecCmd = 100,
    ExecSetInput = 101,
    ExecGetOutput = 102,
    ExecTerminate = 110,
    ExecWaitFor = 120,
    FileOpen = 240,
    FileClose = 241,
    FileRead = 250,
    FileReadAt = 251,
    FileWrite = 260,
    FileWriteAt = 261,
    FileSeek = 270,
    FileTell = 271,
    FileSetSize = 272,
    DirRemove = 320,
    PathRename = 330,
    PathUserDocuments = 331,
    PathUserHome = 332,
    Shutdown = 333,
}

impl HostMsgKind {
    pub const ALL: [HostMsgKind; 22] = [
        HostMsgKind::CancelPendingWaits,
        HostMsgKind::SessionCreate,
        HostMsgKind::SessionClose,
        HostMsgKind::ExecCmd,
        HostMsgKind::ExecSetInput,
        HostMsgKind::ExecGetOutput,
        HostMsgKind::ExecTerminate,
        HostMsgKind::ExecWaitFor,
        HostMsgKind::FileOpen,
        HostMsgKind::FileClose,
        HostMsgKind::FileRead,
        HostMsgKind::FileReadAt,
        HostMsgKind::FileWrite,
        HostMsgKind::FileWriteAt,
        HostMsgKind::FileSeek,
        HostMsgKind::FileTell,
        HostMsgKind::FileSetSize,
        HostMsgKind::DirRemove,
        HostMsgKind::PathRename,
        HostMsgKind::PathUserDocuments,
        HostMsgKind::PathUserHome,
        HostMsgKind::Shutdown,
    ];

    pub fn from_raw(raw: u32) -> Option<HostMsgKind> {
        Self::ALL.iter().copied().find(|k| *k as u32 == raw)
    }

    /// Kinds that touch the guest file system and require an
    /// impersonated or spawned session.
    pub fn is_filesystem(self) -> bool {
        matches!(
            self,
            HostMsgKind::DirRemove
                | HostMsgKind::FileOpen
                | HostMsgKind::FileClose
                | HostMsgKind::FileRead
                | HostMsgKind::FileReadAt
                | HostMsgKind::FileWrite
                | HostMsgKind::FileWriteAt
                | HostMsgKind::FileSeek
                | HostMsgKind::FileTell
                | HostMsgKind::FileSetSize
                | HostMsgKind::PathRename
                | HostMsgKind::PathUserDocuments
                | HostMsgKind::PathUserHome
        )
    }
}

impl std::fmt::Display for HostMsgKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, *self as u32)
    }
}

/// Final and intermediate process states reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcStatus {
    Undefined,
    Started,
    /// Terminated normally, flags carry the exit code.
    TerminatedNormally,
    /// Terminated by a signal, flags carry the signal number.
    TerminatedSignal,
    TerminatedAbnormally,
    TimedOutKilled,
    TimedOutAbnormally,
    /// Killed because the service shut down.
    Down,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputStatus {
    Undefined,
    Written,
    Error,
    Terminated,
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionNotifyType {
    Undefined,
    Error,
    Started,
    TerminatedNormally,
    TerminatedSignal,
    TerminatedAbnormally,
    TimedOutKilled,
    TimedOutAbnormally,
    Down,
}

pub mod host_features {
    pub const NOTIFY_RDWR_OFFSET: u64 = 1 << 0;
    pub const PROCESS_ARGV0: u64 = 1 << 1;
    /// Peek/get/cancel calls, session prepare/accept and the new skip call.
    pub const OPTIMIZATIONS: u64 = 1 << 2;
}

pub mod guest_features {
    pub const PROCESS_ARGV0: u64 = 1 << 0;
    pub const SHUTDOWN: u64 = 1 << 1;
    pub const MUST_BE_ONE: u64 = 1 << 63;

    pub const ALL: u64 = PROCESS_ARGV0 | SHUTDOWN | MUST_BE_ONE;
}

pub mod proc_flags {
    pub const NONE: u32 = 0;
    pub const HIDDEN: u32 = 0x1;
    pub const WAIT_STDOUT: u32 = 0x4;
    pub const WAIT_STDERR: u32 = 0x8;
    pub const EXPAND_ARGUMENTS: u32 = 0x10;
    pub const UNQUOTED_ARGS: u32 = 0x20;
    pub const PROFILE: u32 = 0x40;

    pub const VALID_MASK: u32 =
        HIDDEN | WAIT_STDOUT | WAIT_STDERR | EXPAND_ARGUMENTS | UNQUOTED_ARGS | PROFILE;
}

pub mod output_handle {
    pub const STDOUT_DEPRECATED: u32 = 0;
    pub const STDOUT: u32 = 1;
    pub const STDERR: u32 = 2;
}

pub mod input_flags {
    pub const NONE: u32 = 0;
    pub const EOF: u32 = 0x1;
}

pub mod dir_remove_flags {
    pub const NONE: u32 = 0;
    pub const RECURSIVE: u32 = 0x1;
    pub const CONTENT_AND_DIR: u32 = 0x2;
    pub const CONTENT_ONLY: u32 = 0x4;
    pub const VALID_MASK: u32 = RECURSIVE | CONTENT_AND_DIR | CONTENT_ONLY;
}

pub mod rename_flags {
    pub const NONE: u32 = 0;
    pub const NO_REPLACE: u32 = 0x1;
    pub const REPLACE: u32 = 0x2;
    pub const NO_SYMLINKS: u32 = 0x4;
    pub const VALID_MASK: u32 = NO_REPLACE | REPLACE | NO_SYMLINKS;
}

pub mod shutdown_flags {
    pub const POWER_OFF: u32 = 0;
    pub const REBOOT: u32 = 0x4;
    pub const FORCE: u32 = 0x8;
}

pub mod seek_method {
    pub const BEGIN: u32 = 1;
    pub const CURRENT: u32 = 4;
    pub const END: u32 = 8;
}

/// Largest payload a single host call may carry.
pub const MAX_TRANSFER_SIZE: usize = 32 * 1024 * 1024;
/// Upper bound for one process output read.
pub const MAX_OUTPUT_CHUNK: usize = 64 * 1024;
pub const MAX_ENV_LEN: usize = 64 * 1024;
pub const MAX_ARGS_LEN: usize = 128 * 1024;
pub const SESSION_KEY_SIZE: usize = 32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_raw() {
        assert_eq!(HostMsgKind::from_raw(100), Some(HostMsgKind::ExecCmd));
        assert_eq!(HostMsgKind::from_raw(333), Some(HostMsgKind::Shutdown));
        assert_eq!(HostMsgKind::from_raw(9999), None);
    }

    #[test]
    fn test_filesystem_gating_set() {
        let gated: Vec<_> = HostMsgKind::ALL
            .iter()
            .filter(|k| k.is_filesystem())
            .collect();
        assert_eq!(gated.len(), 13);
        assert!(!HostMsgKind::ExecCmd.is_filesystem());
        assert!(!HostMsgKind::SessionClose.is_filesystem());
        assert!(!HostMsgKind::Shutdown.is_filesystem());
    }
}
