//! Platform-specific pieces: shared-memory setup and exit-status
//! classification. Everything else in the crate is written against the
//! small interface defined here.

use crate::bitmap::SHM_SIZE;
use crate::error::{Error, Result};

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;
// The BSD/Mach signal set is selected independently of the shared-memory
// backend: BSDs and macOS use the same SysV shared memory as Linux, they
// just classify exit codes differently.
#[cfg(unix)]
mod bsd;

/// A coverage-map-sized shared-memory segment plus how to hand its
/// identity to a child process.
pub trait ShMem {
    /// Raw bytes of the segment.
    fn as_slice(&self) -> &[u8];
    fn as_mut_slice(&mut self) -> &mut [u8];
    /// Export this segment's identity to `var` in `cmd`'s environment, so a
    /// freshly spawned target can attach to the same segment.
    fn export_to_env(&self, cmd: &mut std::process::Command, var: &str);
}

/// Allocates a new `SHM_SIZE` shared-memory segment for the current worker.
#[cfg(unix)]
pub fn create(worker_id: usize) -> Result<Box<dyn ShMem>> {
    unix::UnixShMem::create(SHM_SIZE, worker_id).map(|s| Box::new(s) as Box<dyn ShMem>)
}

#[cfg(windows)]
pub fn create(worker_id: usize) -> Result<Box<dyn ShMem>> {
    windows::WindowsShMem::create(SHM_SIZE, worker_id).map(|s| Box::new(s) as Box<dyn ShMem>)
}

/// A cross-worker bitmap region (the shared virgin and crash bitmaps).
#[cfg(unix)]
pub type SharedRegion = unix::SharedRegion;
#[cfg(windows)]
pub type SharedRegion = windows::SharedRegion;

/// Creates a shared region for the supervisor to own. `name` is only
/// meaningful on Windows, where workers are separate processes that
/// reattach by name rather than inheriting the mapping through `fork()`.
#[cfg(unix)]
pub fn create_shared_region(_name: &str, size: usize) -> Result<SharedRegion> {
    unix::SharedRegion::create(size)
}

#[cfg(windows)]
pub fn create_shared_region(name: &str, size: usize) -> Result<SharedRegion> {
    windows::SharedRegion::create(name, size)
}

/// Reattaches to a shared region a worker process did not create itself.
/// On unix, forked workers already hold a valid handle via
/// [`unix::SharedRegion::for_child`] and never call this.
#[cfg(windows)]
pub fn open_shared_region(name: &str, size: usize) -> Result<SharedRegion> {
    windows::SharedRegion::open_existing(name, size)
}

/// Outcome of classifying a finished execution's exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Clean exit, nothing of note.
    Ok,
    /// A critical failure: persist as a crash.
    Crash,
    /// Non-critical but broken invocation (permission denied, binary not
    /// found): fatal configuration error.
    ConfigError,
    /// The execution ran past its deadline.
    Timeout,
}

/// Exit code the [`crate::target_runner::TargetRunner`] reports for a
/// timed-out execution, mirroring the shell convention the design uses
/// throughout (`124`, as in `timeout`(1)).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Classifies a finished execution by exit code and captured stderr.
///
/// `exit_code` follows the convention used throughout this crate: a
/// non-negative value is a normal exit code, a negative value `-N` means
/// the process was terminated by signal `N` (the same convention
/// Python's `subprocess` module uses on unix, which the reference
/// implementation this design is based on relied on).
pub fn classify_exit(exit_code: i32, stderr: &str, ignore_sigabrt: bool) -> ExitOutcome {
    if exit_code == 0 {
        return ExitOutcome::Ok;
    }
    if exit_code == TIMEOUT_EXIT_CODE {
        return ExitOutcome::Timeout;
    }
    if exit_code == 126 || exit_code == 127 {
        return ExitOutcome::ConfigError;
    }
    if is_critical_by_message(stderr) {
        return ExitOutcome::Crash;
    }
    if is_critical_platform(exit_code, ignore_sigabrt) {
        ExitOutcome::Crash
    } else {
        ExitOutcome::Ok
    }
}

/// Message-based critical detection, shared across all platforms: sanitizer
/// reports and common crash strings are unambiguous regardless of how the
/// process actually terminated.
fn is_critical_by_message(stderr: &str) -> bool {
    const NEEDLES: &[&str] = &[
        "Sanitizer",
        "SIGSEGV",
        "Segmentation fault",
        "core dumped",
        "floating point exception",
    ];
    NEEDLES.iter().any(|needle| stderr.contains(needle))
}

#[cfg(target_os = "linux")]
fn is_critical_platform(exit_code: i32, ignore_sigabrt: bool) -> bool {
    unix::is_critical_linux(exit_code, ignore_sigabrt, &[])
}

#[cfg(all(unix, not(target_os = "linux"), not(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd", target_os = "netbsd"))))]
fn is_critical_platform(exit_code: i32, ignore_sigabrt: bool) -> bool {
    unix::is_critical_linux(exit_code, ignore_sigabrt, &[])
}

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd", target_os = "netbsd"))]
fn is_critical_platform(exit_code: i32, ignore_sigabrt: bool) -> bool {
    bsd::is_critical_bsd(exit_code, ignore_sigabrt)
}

#[cfg(windows)]
fn is_critical_platform(exit_code: i32, _ignore_sigabrt: bool) -> bool {
    windows::is_critical_windows(exit_code as u32)
}

pub(crate) fn missing_shmem_error(detail: impl Into<String>) -> Error {
    Error::ShMem(detail.into())
}
