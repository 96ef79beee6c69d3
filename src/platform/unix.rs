//! SysV shared memory and unix signal classification.

use std::process::Command;

use nix::libc::{self, c_void};

use super::ShMem;
use crate::error::Result;

/// A SysV shared-memory segment, created with a private key so the kernel
/// picks an id for us (mirrors the reference implementation's `shmget`
/// call with `IPC_PRIVATE`).
pub struct UnixShMem {
    id: i32,
    addr: *mut c_void,
    size: usize,
}

// The segment outlives any single thread's stack frame and is meant to be
// shared across forked workers; the pointer itself is only ever
// dereferenced as a byte slice of fixed size.
unsafe impl Send for UnixShMem {}

impl UnixShMem {
    pub fn create(size: usize, _worker_id: usize) -> Result<Self> {
        // SAFETY: shmget/shmat are plain syscalls; failure is reported
        // through errno and turned into an Err below.
        let id = unsafe { libc::shmget(libc::IPC_PRIVATE, size, 0o666) };
        if id < 0 {
            return Err(super::missing_shmem_error(format!(
                "shmget() failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let addr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(super::missing_shmem_error(format!(
                "shmat() failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(Self { id, addr, size })
    }
}

impl Drop for UnixShMem {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.addr);
            // Mark the segment for destruction once the last attachment
            // (including forked workers) detaches.
            libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut());
        }
    }
}

impl ShMem for UnixShMem {
    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr.cast::<u8>(), self.size) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.addr.cast::<u8>(), self.size) }
    }

    fn export_to_env(&self, cmd: &mut Command, var: &str) {
        cmd.env(var, self.id.to_string());
    }
}

/// A SysV shared-memory region shared across the supervisor and its
/// forked workers — the virgin and crash bitmaps live here. Unlike
/// [`UnixShMem`], only the owner (the supervisor, before forking) marks
/// the segment for destruction; forked workers inherit the attachment
/// for free (SysV attachments survive `fork()`) and simply detach on
/// exit without destroying it out from under their siblings.
pub struct SharedRegion {
    id: i32,
    addr: *mut c_void,
    size: usize,
    owns_cleanup: bool,
}

unsafe impl Send for SharedRegion {}

impl SharedRegion {
    pub fn create(size: usize) -> Result<Self> {
        let id = unsafe { libc::shmget(libc::IPC_PRIVATE, size, 0o666) };
        if id < 0 {
            return Err(super::missing_shmem_error(format!(
                "shmget() failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        let addr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(super::missing_shmem_error(format!(
                "shmat() failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self { id, addr, size, owns_cleanup: true })
    }

    /// Produces the handle a freshly forked worker should hold: same
    /// mapping, but without cleanup responsibility.
    pub fn for_child(&self) -> Self {
        Self { id: self.id, addr: self.addr, size: self.size, owns_cleanup: false }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr.cast::<u8>(), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.addr.cast::<u8>(), self.size) }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.addr);
            if self.owns_cleanup {
                libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut());
            }
        }
    }
}

/// Critical-signal set for Linux (and, pragmatically, other non-BSD
/// unices): a target killed by one of these signals is a crash.
const CRITICAL_SIGNALS: &[i32] = &[
    libc::SIGSEGV,
    libc::SIGILL,
    libc::SIGBUS,
    libc::SIGFPE,
    libc::SIGABRT,
];

/// `exit_code` uses the negative-means-killed-by-signal convention
/// documented in [`super::classify_exit`].
pub fn is_critical_linux(exit_code: i32, ignore_sigabrt: bool, user_signals: &[i32]) -> bool {
    if exit_code >= 0 {
        // A positive, non-zero exit from a normally-terminating process is
        // not itself a crash signature; message-based detection already
        // ran before we got here.
        return false;
    }
    let signal = -exit_code;
    if signal == libc::SIGABRT && ignore_sigabrt {
        return false;
    }
    CRITICAL_SIGNALS.contains(&signal) || user_signals.contains(&signal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigsegv_is_critical() {
        assert!(is_critical_linux(-libc::SIGSEGV, false, &[]));
    }

    #[test]
    fn sigabrt_can_be_ignored() {
        assert!(is_critical_linux(-libc::SIGABRT, false, &[]));
        assert!(!is_critical_linux(-libc::SIGABRT, true, &[]));
    }

    #[test]
    fn plain_nonzero_exit_is_not_critical() {
        assert!(!is_critical_linux(1, false, &[]));
    }

    #[test]
    fn user_signal_extends_the_set() {
        assert!(is_critical_linux(-libc::SIGUSR1, false, &[libc::SIGUSR1]));
    }
}
