// src/doorbell.rs

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// An eventfd-backed wakeup primitive.
///
/// Rings accumulate into the eventfd counter; a single drain consumes
/// all of them. The fd is non-blocking and close-on-exec, and can be
/// handed to another process (see `fdpass`), which is how the two ends
/// of a shared-memory ring coordinate.
pub struct Doorbell {
    fd: OwnedFd,
}

impl Doorbell {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: eventfd just returned this fd and nobody else owns it.
        Ok(Doorbell {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Adopt an eventfd received from another process.
    pub fn from_owned_fd(fd: OwnedFd) -> io::Result<Self> {
        let raw = fd.as_raw_fd();
        unsafe {
            let flags = libc::fcntl(raw, libc::F_GETFL);
            if flags < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(Doorbell { fd })
    }

    /// Ring the doorbell. A full counter (EAGAIN) means the other side
    /// is already overdue for a wakeup, so that case is a no-op.
    pub fn ring(&self) -> io::Result<()> {
        let val: u64 = 1;
        let rv = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                8,
            )
        };
        if rv < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Consume all pending rings without blocking. Returns the number
    /// of rings consumed (zero if none were pending).
    pub fn drain(&self) -> io::Result<u64> {
        let mut val: u64 = 0;
        let rv = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if rv < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(val)
    }

    /// Block until the doorbell rings, then drain it.
    ///
    /// Only used from dedicated helper threads and tests; the event
    /// loops watch the fd through poll/epoll instead.
    pub fn wait(&self) -> io::Result<u64> {
        loop {
            let drained = self.drain()?;
            if drained > 0 {
                return Ok(drained);
            }
            let mut pfd = libc::pollfd {
                fd: self.fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let rv = unsafe { libc::poll(&mut pfd, 1, -1) };
            if rv < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
        }
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Doorbell {
            fd: self.fd.try_clone()?,
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn into_owned_fd(self) -> OwnedFd {
        self.fd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_and_drain() {
        let db = Doorbell::new().unwrap();
        assert_eq!(db.drain().unwrap(), 0);

        db.ring().unwrap();
        db.ring().unwrap();
        assert_eq!(db.drain().unwrap(), 2);
        assert_eq!(db.drain().unwrap(), 0);
    }

    #[test]
    fn wait_returns_after_ring() {
        let db = Doorbell::new().unwrap();
        db.ring().unwrap();
        assert!(db.wait().unwrap() > 0);
    }

    #[test]
    fn clone_shares_counter() {
        let db = Doorbell::new().unwrap();
        let other = db.try_clone().unwrap();
        assert_ne!(db.as_raw_fd(), other.as_raw_fd());

        other.ring().unwrap();
        assert_eq!(db.drain().unwrap(), 1);
    }

    #[test]
    fn cross_thread_wait() {
        let db = Doorbell::new().unwrap();
        let other = db.try_clone().unwrap();
        let handle = std::thread::spawn(move || other.wait().unwrap());
        db.ring().unwrap();
        assert!(handle.join().unwrap() > 0);
    }
}
