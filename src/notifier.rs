//! Readiness handles for external I/O multiplexers.
//!
//! A [`Readiness`] owns a kernel object (an `eventfd` on Linux, a pipe
//! elsewhere) whose descriptor polls readable exactly while the owning
//! provider has a message that a zero-deadline receive would return.
//! Providers call [`Readiness::raise`] and [`Readiness::lower`] while holding
//! the lock that guards their pending-message state, so the descriptor never
//! disagrees with that state for longer than the critical section.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::{Error, Result};

#[cfg(target_os = "linux")]
mod platform {
    use std::mem;
    use std::os::unix::io::RawFd;

    use crate::{Error, Result};

    pub struct Signal {
        fd: RawFd,
    }

    impl Signal {
        pub fn new() -> Result<Self> {
            let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
            if fd < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            Ok(Self { fd })
        }

        pub fn fd(&self) -> RawFd {
            self.fd
        }

        pub fn post(&self) -> Result<()> {
            let value: u64 = 1;
            let res = unsafe {
                libc::write(
                    self.fd,
                    &value as *const u64 as *const _,
                    mem::size_of::<u64>(),
                )
            };
            if res < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EAGAIN) {
                    return Err(Error::Io(err));
                }
            }
            Ok(())
        }

        pub fn drain(&self) -> Result<()> {
            let mut buf: u64 = 0;
            let n = unsafe {
                libc::read(
                    self.fd,
                    &mut buf as *mut u64 as *mut _,
                    mem::size_of::<u64>(),
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::WouldBlock {
                    return Err(Error::Io(err));
                }
            }
            Ok(())
        }
    }

    impl Drop for Signal {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use std::os::unix::io::RawFd;

    use crate::{Error, Result};

    pub struct Signal {
        read_fd: RawFd,
        write_fd: RawFd,
    }

    impl Signal {
        pub fn new() -> Result<Self> {
            let mut fds = [0 as libc::c_int; 2];
            if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            for fd in fds {
                unsafe {
                    let flags = libc::fcntl(fd, libc::F_GETFL);
                    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                    libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
                }
            }
            Ok(Self {
                read_fd: fds[0],
                write_fd: fds[1],
            })
        }

        pub fn fd(&self) -> RawFd {
            self.read_fd
        }

        pub fn post(&self) -> Result<()> {
            let byte = [b'+'];
            let res = unsafe { libc::write(self.write_fd, byte.as_ptr() as *const _, 1) };
            if res < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::WouldBlock {
                    return Err(Error::Io(err));
                }
            }
            Ok(())
        }

        pub fn drain(&self) -> Result<()> {
            let mut buf = [0u8; 64];
            loop {
                let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut _, buf.len()) };
                if n > 0 {
                    continue;
                }
                if n < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.kind() != std::io::ErrorKind::WouldBlock {
                        return Err(Error::Io(err));
                    }
                }
                return Ok(());
            }
        }
    }

    impl Drop for Signal {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.read_fd);
                libc::close(self.write_fd);
            }
        }
    }
}

pub struct Readiness {
    signal: platform::Signal,
    raised: AtomicBool,
}

impl Readiness {
    pub fn new() -> Result<Self> {
        Ok(Self {
            signal: platform::Signal::new()?,
            raised: AtomicBool::new(false),
        })
    }

    /// Marks the handle readable. Idempotent.
    pub fn raise(&self) -> Result<()> {
        if !self.raised.swap(true, Ordering::AcqRel) {
            self.signal.post()?;
        }
        Ok(())
    }

    /// Marks the handle not readable. Idempotent.
    pub fn lower(&self) -> Result<()> {
        if self.raised.swap(false, Ordering::AcqRel) {
            self.signal.drain()?;
        }
        Ok(())
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Polls the descriptor, returning whether it became readable before
    /// `timeout` elapsed. Does not consume the readiness.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.signal.fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = match timeout {
            Some(t) => i32::try_from(t.as_millis()).unwrap_or(i32::MAX),
            None => -1,
        };
        let res = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if res < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(Error::Io(err));
        }
        Ok(res > 0 && pfd.revents & libc::POLLIN != 0)
    }
}

impl AsRawFd for Readiness {
    fn as_raw_fd(&self) -> RawFd {
        self.signal.fd()
    }
}
