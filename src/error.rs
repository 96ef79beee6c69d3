//! Crate-wide error type.

use std::path::PathBuf;

/// Errors the fuzzer core can raise.
///
/// Configuration errors are meant to be fatal at startup; the rest are
/// surfaced to a caller that decides whether to retry, warn, or give up
/// on a single worker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("shared memory setup failed: {0}")]
    ShMem(String),

    #[error("target binary {path} is missing the __AFL_SHM_ID marker (not instrumented)")]
    NotInstrumented { path: PathBuf },

    #[error("mutator {name} produced no output")]
    EmptyMutation { name: String },

    #[error("worker {worker} failed: {source}")]
    Worker {
        worker: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid integer: {0}")]
    ParseInt(#[from] std::num::ParseIntError),

    #[error("unix errno: {0}")]
    Errno(#[from] nix::errno::Errno),
}

pub type Result<T> = std::result::Result<T, Error>;
