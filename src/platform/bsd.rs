//! Exit-code classification for the BSD/Mach family, which is looser than
//! Linux's explicit signal allowlist: anything that isn't an
//! explicitly-benign signal counts as a crash.

use nix::libc;

const BENIGN_SIGNALS: &[i32] = &[
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGALRM,
    libc::SIGCHLD,
    libc::SIGKILL,
];

/// `exit_code` uses the negative-means-killed-by-signal convention
/// documented in [`super::classify_exit`].
pub fn is_critical_bsd(exit_code: i32, ignore_sigabrt: bool) -> bool {
    if exit_code >= 0 {
        return false;
    }
    let signal = -exit_code;
    if signal == libc::SIGABRT && ignore_sigabrt {
        return false;
    }
    !BENIGN_SIGNALS.contains(&signal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigchld_is_benign() {
        assert!(!is_critical_bsd(-libc::SIGCHLD, false));
    }

    #[test]
    fn sigsegv_is_critical() {
        assert!(is_critical_bsd(-libc::SIGSEGV, false));
    }
}
