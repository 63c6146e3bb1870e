//! Watching a process that is not our child
//!
//! Under `--new-pid-ns` the jailer forks Firecracker into a fresh PID
//! namespace and exits, leaving Firecracker reparented away from us. A
//! pidfd still names it without pid reuse races: it polls readable once the
//! process exits and signals sent through it cannot reach a recycled pid.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::Result;

pub struct Pidfd {
    pid: i32,
    fd: AsyncFd<OwnedFd>,
}

impl Pidfd {
    /// Requires a tokio runtime with IO enabled
    pub fn open(pid: i32) -> Result<Self> {
        // SAFETY: pidfd_open only reads its two integer arguments
        let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: the kernel just handed us this descriptor and nothing else owns it
        let fd = unsafe { OwnedFd::from_raw_fd(fd as RawFd) };

        Ok(Self {
            pid,
            fd: AsyncFd::with_interest(fd, Interest::READABLE)?,
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// SIGKILL the process; already gone counts as success
    pub fn kill(&self) -> Result<()> {
        // SAFETY: valid pidfd, no siginfo, no flags
        let rc = unsafe {
            libc::syscall(
                libc::SYS_pidfd_send_signal,
                self.fd.get_ref().as_raw_fd(),
                libc::SIGKILL,
                std::ptr::null::<libc::siginfo_t>(),
                0,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Resolves once the process has exited. Cancel-safe.
    pub async fn exited(&self) -> Result<()> {
        // Readiness is never cleared, so later calls return at once
        let _ready = self.fd.readable().await?;
        Ok(())
    }
}
