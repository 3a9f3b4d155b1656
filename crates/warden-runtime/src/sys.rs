//! Thin libc wrappers. Every `unsafe` block in the crate lives here.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use warden_core::ExitStatus;

/// Put `fd` into non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let rc = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let rc = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}

/// `poll(2)`. Returns the number of ready entries.
pub(crate) fn poll(fds: &mut [libc::pollfd], timeout_ms: i32) -> io::Result<usize> {
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}

/// Result of a non-blocking reap attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reap {
    /// The child is still running.
    Running,
    /// The child terminated and has been reaped.
    Exited(ExitStatus),
    /// Not our child, or already reaped by someone else.
    NoChild,
}

/// `waitpid(pid, WNOHANG)`, retried on `EINTR`.
pub(crate) fn try_reap(pid: i32) -> io::Result<Reap> {
    loop {
        let mut status: libc::c_int = 0;
        let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        if rc == 0 {
            return Ok(Reap::Running);
        }
        if rc == pid {
            return Ok(Reap::Exited(ExitStatus::from_wait_status(status)));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::ECHILD) => return Ok(Reap::NoChild),
            _ => return Err(err),
        }
    }
}

/// `kill(2)`. A negative `target` addresses a process group.
pub(crate) fn send_signal(target: i32, signal: i32) -> io::Result<()> {
    let rc = unsafe { libc::kill(target, signal) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A pollable descriptor that turns readable when `pid` exits.
///
/// `None` where the kernel lacks `pidfd_open(2)` (pre-5.3 Linux, other Unix);
/// callers fall back to periodic `waitpid`.
#[cfg(target_os = "linux")]
pub(crate) fn pidfd_open(pid: i32) -> Option<OwnedFd> {
    let rc = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
    if rc < 0 {
        return None;
    }
    let fd = rc as RawFd;
    Some(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn pidfd_open(_pid: i32) -> Option<OwnedFd> {
    None
}

/// `dup2(2)`: make `target` refer to the file behind `source`.
#[cfg(test)]
pub(crate) fn dup_onto(source: RawFd, target: RawFd) -> io::Result<()> {
    let rc = unsafe { libc::dup2(source, target) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn nonblocking_read_on_empty_pipe_would_block() {
        let (r, _w) = pipe();
        set_nonblocking(r.as_raw_fd()).unwrap();
        set_nonblocking(r.as_raw_fd()).unwrap();
        let mut buf = [0u8; 8];
        let err = read(r.as_raw_fd(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn write_then_read() {
        let (r, w) = pipe();
        assert_eq!(write(w.as_raw_fd(), b"abc").unwrap(), 3);
        let mut buf = [0u8; 8];
        assert_eq!(read(r.as_raw_fd(), &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        drop(w);
        assert_eq!(read(r.as_raw_fd(), &mut buf).unwrap(), 0);
    }

    #[test]
    fn poll_reports_readable_pipe() {
        let (r, w) = pipe();
        let mut fds = [libc::pollfd {
            fd: r.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        assert_eq!(poll(&mut fds, 0).unwrap(), 0);
        write(w.as_raw_fd(), b"x").unwrap();
        assert_eq!(poll(&mut fds, 0).unwrap(), 1);
        assert_ne!(fds[0].revents & libc::POLLIN, 0);
    }

    #[test]
    fn reaping_a_stranger_is_no_child() {
        // pid 1 is never our child.
        assert_eq!(try_reap(1).unwrap(), Reap::NoChild);
    }

    #[test]
    fn reap_spawned_child() {
        let child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        let status = loop {
            match try_reap(pid).unwrap() {
                Reap::Exited(status) => break status,
                Reap::Running => std::thread::sleep(std::time::Duration::from_millis(5)),
                Reap::NoChild => panic!("lost child"),
            }
        };
        assert_eq!(status, ExitStatus::Exited(0));
    }

    #[test]
    fn signal_zero_probes_liveness() {
        let me = std::process::id() as i32;
        send_signal(me, 0).unwrap();
    }
}
