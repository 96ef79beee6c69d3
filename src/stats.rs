//! Per-worker counters, persisted to `fuzzer_stats` and aggregated by the
//! supervisor.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;

/// Order here is the order statistics are written to and read from
/// `fuzzer_stats`; index 0 is `executions`, index 1 `exceptions`, and so
/// on, matching the `<idx>:<value>` pairs in the stats line.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    pub executions: u64,
    pub exceptions: u64,
    pub crashes: u64,
    pub unique_crashes: u64,
    pub new_paths: u64,
    pub files_in_queue: u64,
    pub exec_per_sec: u64,
    pub last_crash_time: u64,
    pub last_path_time: u64,
    pub blacklisted_paths: u64,
    pub file_running: u64,
}

/// Number of `u64` counters in [`Statistics`], and so the per-worker
/// stride of [`SharedStats`]'s backing region.
pub const FIELDS_PER_WORKER: usize = 11;

impl Statistics {
    pub(crate) fn fields(&self) -> [u64; FIELDS_PER_WORKER] {
        [
            self.executions,
            self.exceptions,
            self.crashes,
            self.unique_crashes,
            self.new_paths,
            self.files_in_queue,
            self.exec_per_sec,
            self.last_crash_time,
            self.last_path_time,
            self.blacklisted_paths,
            self.file_running,
        ]
    }

    pub(crate) fn from_fields(fields: &[u64]) -> Self {
        Self {
            executions: fields.first().copied().unwrap_or(0),
            exceptions: fields.get(1).copied().unwrap_or(0),
            crashes: fields.get(2).copied().unwrap_or(0),
            unique_crashes: fields.get(3).copied().unwrap_or(0),
            new_paths: fields.get(4).copied().unwrap_or(0),
            files_in_queue: fields.get(5).copied().unwrap_or(0),
            exec_per_sec: fields.get(6).copied().unwrap_or(0),
            last_crash_time: fields.get(7).copied().unwrap_or(0),
            last_path_time: fields.get(8).copied().unwrap_or(0),
            blacklisted_paths: fields.get(9).copied().unwrap_or(0),
            file_running: fields.get(10).copied().unwrap_or(0),
        }
    }

    /// Appends one line to `fuzzer_stats`: `<unix_seconds> 0:<v0> 1:<v1> …`.
    pub fn append_to(&self, path: &Path) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut line = format!("{now}");
        for (idx, value) in self.fields().iter().enumerate() {
            line.push_str(&format!(" {idx}:{value}"));
        }
        line.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Parses the last line of `fuzzer_stats`, used by session restore to
    /// pick up counters (and, via [`crate::mutator::havoc::HavocMutator::fast_forward`],
    /// the PRNG draw count) where a prior run left off. Fields are parsed
    /// by explicit index, not iteration order, so a reordered or partial
    /// line is still interpreted correctly.
    pub fn restore_from(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)?;
        let Some(last_line) = contents.lines().last() else {
            return Ok(None);
        };
        let mut fields = vec![0u64; 11];
        for token in last_line.split_whitespace().skip(1) {
            if let Some((idx_str, value_str)) = token.split_once(':') {
                if let (Ok(idx), Ok(value)) = (idx_str.parse::<usize>(), value_str.parse::<u64>()) {
                    if idx < fields.len() {
                        fields[idx] = value;
                    }
                }
            }
        }
        Ok(Some(Self::from_fields(&fields)))
    }
}

/// The statistics block described in the design: one [`Statistics`] slot
/// per worker, packed into shared memory so the supervisor can aggregate
/// them without going through each worker's `fuzzer_stats` file. Written
/// only by the owning worker; read by the supervisor without
/// synchronization, which is fine for scalars refreshed every few seconds.
pub struct SharedStats<'a> {
    bytes: &'a mut [u8],
}

impl<'a> SharedStats<'a> {
    pub fn size_for(workers: usize) -> usize {
        workers * FIELDS_PER_WORKER * 8
    }

    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    pub fn write(&mut self, worker: usize, stats: &Statistics) {
        for (i, value) in stats.fields().iter().enumerate() {
            let offset = (worker * FIELDS_PER_WORKER + i) * 8;
            self.bytes[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
        }
    }

    pub fn read(&self, worker: usize) -> Statistics {
        let mut fields = [0u64; FIELDS_PER_WORKER];
        for (i, slot) in fields.iter_mut().enumerate() {
            let offset = (worker * FIELDS_PER_WORKER + i) * 8;
            *slot = u64::from_ne_bytes(self.bytes[offset..offset + 8].try_into().unwrap());
        }
        Statistics::from_fields(&fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_fuzzer_stats_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fuzzer_stats");
        let stats = Statistics {
            executions: 120,
            crashes: 2,
            unique_crashes: 1,
            ..Default::default()
        };
        stats.append_to(&path).unwrap();

        let restored = Statistics::restore_from(&path).unwrap().unwrap();
        assert_eq!(restored.executions, 120);
        assert_eq!(restored.crashes, 2);
        assert_eq!(restored.unique_crashes, 1);
    }

    #[test]
    fn restore_from_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fuzzer_stats");
        assert!(Statistics::restore_from(&path).unwrap().is_none());
    }

    #[test]
    fn restore_parses_out_of_order_indices() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fuzzer_stats");
        std::fs::write(&path, "1700000000 2:5 0:10 1:3\n").unwrap();
        let restored = Statistics::restore_from(&path).unwrap().unwrap();
        assert_eq!(restored.executions, 10);
        assert_eq!(restored.exceptions, 3);
        assert_eq!(restored.crashes, 5);
    }

    #[test]
    fn shared_stats_isolates_worker_slots() {
        let mut bytes = vec![0u8; SharedStats::size_for(2)];
        let mut shared = SharedStats::new(&mut bytes);
        shared.write(0, &Statistics { executions: 7, ..Default::default() });
        shared.write(1, &Statistics { executions: 99, crashes: 3, ..Default::default() });
        assert_eq!(shared.read(0).executions, 7);
        assert_eq!(shared.read(1).executions, 99);
        assert_eq!(shared.read(1).crashes, 3);
        assert_eq!(shared.read(0).crashes, 0);
    }
}
