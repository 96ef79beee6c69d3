//! The on-disk and in-memory test case queue.
//!
//! Entries are appended and never removed during a run (the reference
//! implementation never prunes a queue either); an entry's index into
//! `entries` is stable for the lifetime of the process and is what the
//! mutation dispatcher's havoc state and the splice mutator key off of.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::mutator::havoc::HavocState;

/// One queued test case.
#[derive(Debug, Clone)]
pub struct InputEntry {
    pub path: PathBuf,
    pub data: Vec<u8>,
    /// Trace hash of the last execution produced by mutating this entry;
    /// the fast-path early exit in the worker loop skips classification
    /// entirely when a new trace hashes the same.
    pub last_trace_hash: Option<u32>,
}

/// The queue plus per-entry havoc state, kept in parallel vectors so the
/// hot mutation loop can index both without an extra map lookup.
pub struct InputCorpus {
    dir: PathBuf,
    entries: Vec<InputEntry>,
    havoc_state: Vec<HavocState>,
}

impl InputCorpus {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            entries: Vec::new(),
            havoc_state: Vec::new(),
        }
    }

    /// Loads every regular file under `seed_dir` as an initial queue entry.
    pub fn load_seeds(&mut self, seed_dir: &Path) -> Result<()> {
        let mut paths: Vec<PathBuf> = fs::read_dir(seed_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        paths.sort();
        for path in paths {
            let data = fs::read(&path)?;
            self.push_raw(path, data);
        }
        Ok(())
    }

    fn push_raw(&mut self, path: PathBuf, data: Vec<u8>) {
        self.entries.push(InputEntry { path, data, last_trace_hash: None });
        self.havoc_state.push(HavocState::default());
    }

    /// Appends one initial seed directly, for callers (the supervisor)
    /// that have already decided which files belong to this worker's
    /// slice rather than handing it a directory to scan wholesale.
    pub fn push_seed(&mut self, path: PathBuf, data: Vec<u8>) {
        self.push_raw(path, data);
    }

    /// Appends a newly discovered, interesting input and writes it to the
    /// queue directory, returning the stable index it was assigned.
    /// `parent_name` is the filename of the seed this candidate was
    /// mutated from, carried into the new name per spec's
    /// `generate_new_name(e)`.
    pub fn add_interesting(
        &mut self,
        worker_id: usize,
        executions: u64,
        parent_name: Option<&str>,
        data: Vec<u8>,
    ) -> Result<usize> {
        let filename = new_coverage_filename(worker_id, executions, parent_name);
        let path = self.dir.join(filename);
        fs::write(&path, &data)?;
        self.push_raw(path, data);
        Ok(self.entries.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> &InputEntry {
        &self.entries[index]
    }

    pub fn havoc_state_mut(&mut self, index: usize) -> &mut HavocState {
        &mut self.havoc_state[index]
    }

    /// Records the trace hash produced by the most recent mutation of
    /// `index`, used by the worker loop's fast-path early exit.
    pub fn set_last_hash(&mut self, index: usize, hash: u32) {
        self.entries[index].last_trace_hash = Some(hash);
    }

    /// Picks a random entry distinct from `avoid`, for the splice mutator.
    /// Returns `None` for a corpus of zero or one entries.
    pub fn random_other(&self, avoid: usize, rng: &mut impl rand::Rng) -> Option<usize> {
        if self.entries.len() < 2 {
            return None;
        }
        loop {
            let idx = rng.gen_range(0..self.entries.len());
            if idx != avoid {
                return Some(idx);
            }
        }
    }

    /// Restores queue state from a directory left by a previous run:
    /// every file already present is re-read as a queue entry so a
    /// resumed session doesn't refuzz inputs it already queued.
    pub fn restore(dir: &Path) -> Result<Self> {
        let mut corpus = Self::new(dir);
        if dir.is_dir() {
            corpus.load_seeds(dir)?;
        }
        Ok(corpus)
    }
}

/// Builds a filename in the reference implementation's convention:
/// `manul-<unix_seconds>-<worker_id>-<executions>_<original_name>`, with
/// any existing `manul-...-_` prefix on `original_name` stripped first so
/// re-mutating an already-queued input doesn't pile prefixes indefinitely.
pub fn new_coverage_filename(worker_id: usize, executions: u64, original_name: Option<&str>) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let base = original_name
        .map(strip_manul_prefix)
        .filter(|s| !s.is_empty());
    match base {
        Some(name) => format!("manul-{now}-{worker_id}-{executions}_{name}"),
        None => format!("manul-{now}-{worker_id}-{executions}"),
    }
}

fn strip_manul_prefix(name: &str) -> &str {
    if let Some(rest) = name.strip_prefix("manul-") {
        if let Some(underscore) = rest.find('_') {
            return &rest[underscore + 1..];
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_existing_manul_prefix() {
        assert_eq!(strip_manul_prefix("manul-1700000000-0-42_seed.bin"), "seed.bin");
        assert_eq!(strip_manul_prefix("seed.bin"), "seed.bin");
    }

    #[test]
    fn filename_without_original_name_has_no_trailing_underscore() {
        let name = new_coverage_filename(2, 7, None);
        assert!(!name.ends_with('_'));
        assert!(name.starts_with("manul-"));
    }

    #[test]
    fn loads_seeds_from_directory() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"hello").unwrap();
        fs::write(dir.path().join("b"), b"world").unwrap();
        let mut corpus = InputCorpus::new(dir.path());
        corpus.load_seeds(dir.path())?;
        assert_eq!(corpus.len(), 2);
        Ok(())
    }
}
