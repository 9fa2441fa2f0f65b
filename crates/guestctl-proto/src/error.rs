use std::io;

/// Status codes exchanged with the host. `Ok(())` travels as `0`, every
/// variant below has a fixed negative wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorCode {
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("out of memory")]
    NoMemory,
    #[error("wrong order")]
    WrongOrder,
    #[error("not implemented")]
    NotImplemented,
    #[error("not supported")]
    NotSupported,
    #[error("access denied")]
    AccessDenied,
    #[error("interrupted")]
    Interrupted,
    #[error("timed out")]
    Timeout,
    #[error("buffer overflow")]
    BufferOverflow,
    #[error("too much data")]
    TooMuchData,
    #[error("try again")]
    TryAgain,
    #[error("cancelled")]
    Cancelled,
    #[error("not found")]
    NotFound,
    #[error("out of resources")]
    OutOfResources,
    #[error("file not found")]
    FileNotFound,
    #[error("path not found")]
    PathNotFound,
    #[error("invalid name")]
    InvalidName,
    #[error("already exists")]
    AlreadyExists,
    #[error("directory not empty")]
    DirNotEmpty,
    #[error("message mismatch")]
    Mismatch,
    #[error("internal error")]
    Internal,
    #[error("process not found")]
    ProcessNotFound,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("maximum number of processes reached")]
    MaxProcsReached,
    #[error("virtual machine was restored")]
    VmRestored,
    #[error("host channel disconnected")]
    Disconnected,
    #[error("os error {0}")]
    Os(i32),
    #[error("status {0}")]
    Unknown(i32),
}

const OS_BASE: i32 = -10_000;

impl ErrorCode {
    pub fn to_raw(self) -> i32 {
        match self {
            ErrorCode::InvalidParameter => -2,
            ErrorCode::InvalidHandle => -4,
            ErrorCode::NoMemory => -8,
            ErrorCode::NotImplemented => -12,
            ErrorCode::WrongOrder => -22,
            ErrorCode::NotSupported => -37,
            ErrorCode::AccessDenied => -38,
            ErrorCode::Interrupted => -39,
            ErrorCode::Timeout => -40,
            ErrorCode::BufferOverflow => -41,
            ErrorCode::TooMuchData => -42,
            ErrorCode::TryAgain => -52,
            ErrorCode::Cancelled => -70,
            ErrorCode::NotFound => -78,
            ErrorCode::OutOfResources => -80,
            ErrorCode::FileNotFound => -102,
            ErrorCode::PathNotFound => -103,
            ErrorCode::InvalidName => -104,
            ErrorCode::AlreadyExists => -105,
            ErrorCode::DirNotEmpty => -130,
            ErrorCode::Mismatch => -220,
            ErrorCode::Internal => -225,
            ErrorCode::ProcessNotFound => -300,
            ErrorCode::BrokenPipe => -301,
            ErrorCode::MaxProcsReached => -305,
            ErrorCode::VmRestored => -4710,
            ErrorCode::Disconnected => -4711,
            ErrorCode::Os(errno) => OS_BASE - errno,
            ErrorCode::Unknown(raw) => raw,
        }
    }

    /// Decodes a wire status. `None` means success.
    pub fn from_raw(raw: i32) -> Option<ErrorCode> {
        let code = match raw {
            r if r >= 0 => return None,
            -2 => ErrorCode::InvalidParameter,
            -4 => ErrorCode::InvalidHandle,
            -8 => ErrorCode::NoMemory,
            -12 => ErrorCode::NotImplemented,
            -22 => ErrorCode::WrongOrder,
            -37 => ErrorCode::NotSupported,
            -38 => ErrorCode::AccessDenied,
            -39 => ErrorCode::Interrupted,
            -40 => ErrorCode::Timeout,
            -41 => ErrorCode::BufferOverflow,
            -42 => ErrorCode::TooMuchData,
            -52 => ErrorCode::TryAgain,
            -70 => ErrorCode::Cancelled,
            -78 => ErrorCode::NotFound,
            -80 => ErrorCode::OutOfResources,
            -102 => ErrorCode::FileNotFound,
            -103 => ErrorCode::PathNotFound,
            -104 => ErrorCode::InvalidName,
            -105 => ErrorCode::AlreadyExists,
            -130 => ErrorCode::DirNotEmpty,
            -220 => ErrorCode::Mismatch,
            -225 => ErrorCode::Internal,
            -300 => ErrorCode::ProcessNotFound,
            -301 => ErrorCode::BrokenPipe,
            -305 => ErrorCode::MaxProcsReached,
            -4710 => ErrorCode::VmRestored,
            -4711 => ErrorCode::Disconnected,
            r if r <= OS_BASE => ErrorCode::Os(OS_BASE - r),
            r => ErrorCode::Unknown(r),
        };
        Some(code)
    }

    pub fn from_errno(errno: i32) -> ErrorCode {
        match errno {
            libc::ENOENT => ErrorCode::FileNotFound,
            libc::ENOTDIR => ErrorCode::PathNotFound,
            libc::EACCES | libc::EPERM => ErrorCode::AccessDenied,
            libc::EEXIST => ErrorCode::AlreadyExists,
            libc::ENOTEMPTY => ErrorCode::DirNotEmpty,
            libc::EPIPE => ErrorCode::BrokenPipe,
            libc::EINTR => ErrorCode::Interrupted,
            libc::EAGAIN => ErrorCode::TryAgain,
            libc::EINVAL => ErrorCode::InvalidParameter,
            libc::EBADF => ErrorCode::InvalidHandle,
            libc::ENOMEM => ErrorCode::NoMemory,
            libc::ESRCH | libc::ECHILD => ErrorCode::ProcessNotFound,
            libc::ENAMETOOLONG => ErrorCode::InvalidName,
            libc::ETIMEDOUT => ErrorCode::Timeout,
            libc::ENOTSUP => ErrorCode::NotSupported,
            other => ErrorCode::Os(other),
        }
    }

    pub fn last_os_error() -> ErrorCode {
        io::Error::last_os_error().into()
    }
}

impl From<io::Error> for ErrorCode {
    fn from(err: io::Error) -> Self {
        if let Some(errno) = err.raw_os_error() {
            return ErrorCode::from_errno(errno);
        }
        match err.kind() {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessDenied,
            io::ErrorKind::AlreadyExists => ErrorCode::AlreadyExists,
            io::ErrorKind::BrokenPipe => ErrorCode::BrokenPipe,
            io::ErrorKind::Interrupted => ErrorCode::Interrupted,
            io::ErrorKind::WouldBlock => ErrorCode::TryAgain,
            io::ErrorKind::InvalidInput => ErrorCode::InvalidParameter,
            io::ErrorKind::TimedOut => ErrorCode::Timeout,
            io::ErrorKind::UnexpectedEof => ErrorCode::BrokenPipe,
            io::ErrorKind::Unsupported => ErrorCode::NotSupported,
            _ => ErrorCode::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, ErrorCode>;

/// Wire status for a result.
pub fn rc_of<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(code) => code.to_raw(),
    }
}
