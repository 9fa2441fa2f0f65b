//! Thin libc wrappers for pipes, polling and user lookup.

use std::ffi::{CStr, CString};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

/// Creates a close-on-exec pipe, returning `(read, write)`.
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe(2) just handed us two fresh descriptors
        let read = OwnedFd::from_raw_fd(fds[0]);
        let write = OwnedFd::from_raw_fd(fds[1]);
        set_cloexec(read.as_raw_fd())?;
        set_cloexec(write.as_raw_fd())?;
        Ok((read, write))
    }
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn pollfd(fd: RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

/// Waits for events on `fds`. Returns the number of ready descriptors,
/// 0 on timeout or when interrupted by a signal.
pub fn poll(fds: &mut [libc::pollfd], timeout_ms: i32) -> io::Result<usize> {
    let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(ret as usize)
}

/// Bytes waiting to be read from a pipe.
pub fn bytes_readable(fd: RawFd) -> usize {
    let mut n: libc::c_int = 0;
    unsafe {
        if libc::ioctl(fd, libc::FIONREAD, &mut n) != 0 {
            return 0;
        }
    }
    n.max(0) as usize
}

/// Reads from a raw descriptor. A non-blocking descriptor with nothing
/// buffered yields `ErrorKind::WouldBlock`.
pub fn read_raw(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

pub fn write_raw(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Empties a non-blocking notification pipe.
pub fn drain(fd: RawFd) {
    let mut buf = [0u8; 64];
    while let Ok(n) = read_raw(fd, &mut buf) {
        if n < buf.len() {
            break;
        }
    }
}

pub fn is_fifo(fd: RawFd) -> bool {
    unsafe {
        let mut st: libc::stat = std::mem::zeroed();
        libc::fstat(fd, &mut st) == 0 && st.st_mode & libc::S_IFMT == libc::S_IFIFO
    }
}

/// Account details of a local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIds {
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

pub fn lookup_user(name: &str) -> Option<UserIds> {
    let name = CString::new(name).ok()?;
    with_passwd(|pwd, buf, result| unsafe {
        libc::getpwnam_r(name.as_ptr(), pwd, buf.as_mut_ptr(), buf.len(), result)
    })
}

pub fn effective_uid() -> u32 {
    unsafe { libc::geteuid() }
}

fn with_passwd(
    lookup: impl Fn(*mut libc::passwd, &mut [libc::c_char], *mut *mut libc::passwd) -> libc::c_int,
) -> Option<UserIds> {
    let mut buf = vec![0 as libc::c_char; 4096];
    loop {
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = lookup(&mut pwd, &mut buf, &mut result);
        if rc == libc::ERANGE && buf.len() < 1 << 20 {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return None;
        }
        let home = if pwd.pw_dir.is_null() {
            PathBuf::new()
        } else {
            // SAFETY: pw_dir points into `buf`, which outlives this borrow
            let dir = unsafe { CStr::from_ptr(pwd.pw_dir) };
            PathBuf::from(dir.to_string_lossy().into_owned())
        };
        return Some(UserIds {
            uid: pwd.pw_uid,
            gid: pwd.pw_gid,
            home,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_roundtrip_and_readable_count() {
        let (r, w) = pipe().unwrap();
        set_nonblocking(r.as_raw_fd()).unwrap();
        assert_eq!(write_raw(w.as_raw_fd(), b"abc").unwrap(), 3);
        assert_eq!(bytes_readable(r.as_raw_fd()), 3);

        let mut buf = [0u8; 8];
        assert_eq!(read_raw(r.as_raw_fd(), &mut buf).unwrap(), 3);
        let err = read_raw(r.as_raw_fd(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(is_fifo(r.as_raw_fd()));
    }

    #[test]
    fn test_poll_reports_hangup() {
        let (r, w) = pipe().unwrap();
        drop(w);
        let mut fds = [pollfd(r.as_raw_fd(), 0)];
        assert_eq!(poll(&mut fds, 100).unwrap(), 1);
        assert_ne!(fds[0].revents & libc::POLLHUP, 0);
    }

    #[test]
    fn test_drain_empties_pipe() {
        let (r, w) = pipe().unwrap();
        set_nonblocking(r.as_raw_fd()).unwrap();
        write_raw(w.as_raw_fd(), &[1; 100]).unwrap();
        drain(r.as_raw_fd());
        assert_eq!(bytes_readable(r.as_raw_fd()), 0);
    }
}
