//! The per-worker fuzzing loop: mutate, execute, observe coverage,
//! classify, save. Each [`Worker`] is meant to run in its own process
//! (see [`crate::supervisor`]); nothing here spawns threads.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::thread_rng;

use crate::bitmap::{classify, merge_sync, AtomicMonotoneBitmap, Bitmap, Classification, OwnedBitmap, VolatileSet};
use crate::classifier::calibrate;
use crate::corpus::{new_coverage_filename, InputCorpus};
use crate::error::{Error, Result};
use crate::mutator::dispatcher::MutationDispatcher;
use crate::platform::{self, ExitOutcome, SharedRegion};
use crate::stats::{SharedStats, Statistics};
use crate::target_runner::TargetRunner;

/// Everything a [`Worker`] needs that does not come from the shared
/// bitmaps or the corpus: the knobs from the CLI that shape its loop.
pub struct WorkerConfig {
    pub id: usize,
    pub out_dir: PathBuf,
    pub sync_freq: u64,
    pub ignore_sigabrt: bool,
}

/// Owns one worker's private state: its target runner, virgin bitmap,
/// corpus, mutator dispatcher, and statistics. Runs the fuzzing loop
/// described in spec §4.4 until told to stop.
pub struct Worker {
    id: usize,
    out_dir: PathBuf,
    queue_dir: PathBuf,
    crashes_dir: PathBuf,
    crashes_unique_dir: PathBuf,
    stats_path: PathBuf,
    runner: TargetRunner,
    corpus: InputCorpus,
    dispatcher: MutationDispatcher,
    virgin_local: OwnedBitmap,
    crash_shared: SharedRegion,
    virgin_shared: SharedRegion,
    stats_shared: SharedRegion,
    stats: Statistics,
    sync_freq: u64,
    since_sync: u64,
    ignore_sigabrt: bool,
    last_flush_executions: u64,
    last_flush_time: SystemTime,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: WorkerConfig,
        runner: TargetRunner,
        corpus: InputCorpus,
        dispatcher: MutationDispatcher,
        virgin_shared: SharedRegion,
        crash_shared: SharedRegion,
        stats_shared: SharedRegion,
    ) -> Result<Self> {
        let queue_dir = config.out_dir.join("queue");
        let crashes_dir = config.out_dir.join("crashes");
        let crashes_unique_dir = crashes_dir.join("unique");
        fs::create_dir_all(&queue_dir)?;
        fs::create_dir_all(&crashes_unique_dir)?;
        let stats_path = config.out_dir.join("fuzzer_stats");

        let stats = Statistics::restore_from(&stats_path)?.unwrap_or_default();

        Ok(Self {
            id: config.id,
            out_dir: config.out_dir,
            queue_dir,
            crashes_dir,
            crashes_unique_dir,
            stats_path,
            runner,
            corpus,
            dispatcher,
            virgin_local: OwnedBitmap::new_virgin(),
            crash_shared,
            virgin_shared,
            stats_shared,
            stats,
            sync_freq: config.sync_freq.max(1),
            since_sync: 0,
            ignore_sigabrt: config.ignore_sigabrt,
            last_flush_executions: 0,
            last_flush_time: SystemTime::now(),
        })
    }

    /// Execute every initial seed once, confirming the target is actually
    /// instrumented and seeding the virgin bitmap. Any single seed whose
    /// trace is entirely zero means the binary never touched the shared
    /// coverage map, so that first all-zero trace aborts the dry run
    /// immediately rather than waiting to see whether a later seed fares
    /// better. Returns how many of the seeds produced no coverage news of
    /// their own, matching scenario S2's "N out of M initial files are
    /// useless" warning.
    pub fn dry_run(&mut self) -> Result<usize> {
        if self.corpus.is_empty() {
            return Err(Error::Config("initial corpus for this worker is empty".into()));
        }
        let total = self.corpus.len();
        let mut useless = 0usize;

        for idx in 0..total {
            self.runner.trace_bitmap_mut().fill(0);
            let data = self.corpus.get(idx).data.clone();
            let tmp_path = self.queue_dir.join(format!(".dryrun-{idx}"));
            fs::write(&tmp_path, &data)?;
            let _ = self.runner.run(&tmp_path, &data)?;
            let _ = fs::remove_file(&tmp_path);

            let trace = self.runner.trace_bitmap();
            if !trace.iter().any(|&b| b != 0) {
                return Err(Error::NotInstrumented { path: self.out_dir.clone() });
            }

            let mut view = self.virgin_local.view();
            let classification = classify(trace, view.as_mut_slice(), &VolatileSet::new(), true);
            if classification == Classification::NoNews {
                useless += 1;
                log::warn!("initial file {idx} added no coverage of its own");
            }
        }

        if useless > 0 {
            log::warn!("{useless} out of {total} initial files are useless");
        }
        Ok(useless)
    }

    /// Runs the fuzzing loop until `shutdown` is set. Returns normally on
    /// shutdown; propagates any resource-acquisition error (corpus I/O,
    /// fatal target misconfiguration).
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            let n = self.corpus.len();
            for idx in 0..n {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                self.fuzz_one(idx)?;
            }
            self.sync_and_persist()?;
        }
        self.sync_and_persist()?;
        Ok(())
    }

    /// Called once per outer pass over the corpus. Bitmap folding happens
    /// every `sync_freq` passes (spec §5's "sync cadence"); stats are
    /// persisted every pass regardless.
    fn sync_and_persist(&mut self) -> Result<()> {
        self.since_sync += 1;
        if self.since_sync >= self.sync_freq {
            merge_sync(self.virgin_local.view().as_mut_slice(), self.virgin_shared.as_mut_slice());
            self.since_sync = 0;
        }
        self.stats.files_in_queue = self.corpus.len() as u64;
        self.refresh_exec_per_sec();
        self.stats.append_to(&self.stats_path)?;
        SharedStats::new(self.stats_shared.as_mut_slice()).write(self.id, &self.stats);
        Ok(())
    }

    fn refresh_exec_per_sec(&mut self) {
        let elapsed = self
            .last_flush_time
            .elapsed()
            .unwrap_or(Duration::from_secs(1))
            .as_secs()
            .max(1);
        let delta = self.stats.executions.saturating_sub(self.last_flush_executions);
        self.stats.exec_per_sec = delta / elapsed;
        self.last_flush_executions = self.stats.executions;
        self.last_flush_time = SystemTime::now();
    }

    /// One iteration of the inner loop over the corpus: mutate entry
    /// `idx`, run it, classify, and either persist a crash or admit a new
    /// queue entry. Never aborts on target misbehavior, only on
    /// resource-acquisition failure.
    fn fuzz_one(&mut self, idx: usize) -> Result<()> {
        self.stats.file_running = 1;
        self.runner.trace_bitmap_mut().fill(0);

        let entry_data = self.corpus.get(idx).data.clone();
        let entry_name = self
            .corpus
            .get(idx)
            .path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("seed")
            .to_string();

        let sample_idx = self.corpus.random_other(idx, &mut thread_rng());
        let sample = sample_idx.map(|j| self.corpus.get(j).data.clone());

        let mutation = self.dispatcher.mutate(
            self.stats.executions,
            &entry_data,
            self.corpus.havoc_state_mut(idx),
            sample.as_deref(),
        );
        let (_mutator_name, mutated) = match mutation {
            Ok(v) => v,
            Err(Error::EmptyMutation { name }) => {
                log::warn!("mutator {name} produced no output, skipping this slot");
                self.stats.file_running = 0;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let scratch_path = self.queue_dir.join(format!("{entry_name}_mutated"));
        fs::write(&scratch_path, &mutated)?;

        let (exit_code, stderr) = self.runner.run(&scratch_path, &mutated)?;
        self.stats.executions += 1;
        if exit_code != 0 {
            self.stats.exceptions += 1;
        }

        let trace_hash = Bitmap::new(self.runner.trace_bitmap_mut()).hash();
        let unchanged = self.corpus.get(idx).last_trace_hash == Some(trace_hash);
        self.corpus.set_last_hash(idx, trace_hash);

        let outcome = platform::classify_exit(exit_code, &stderr, self.ignore_sigabrt);
        match outcome {
            ExitOutcome::Crash => {
                self.handle_crash(&entry_name, &mutated)?;
                self.stats.file_running = 0;
                return Ok(());
            }
            ExitOutcome::ConfigError => {
                self.stats.file_running = 0;
                return Err(Error::Config(format!(
                    "target reported a fatal configuration problem (exit {exit_code}): {stderr}"
                )));
            }
            ExitOutcome::Timeout => {
                self.stats.file_running = 0;
                return Ok(());
            }
            ExitOutcome::Ok => {}
        }

        self.stats.file_running = 0;
        if unchanged {
            return Ok(());
        }

        let trace = self.runner.trace_bitmap().to_vec();
        let ret = {
            let mut view = self.virgin_local.view();
            classify(&trace, view.as_mut_slice(), &VolatileSet::new(), false)
        };
        if ret != Classification::NewEdge {
            return Ok(());
        }

        self.calibrate_and_admit(&entry_name, &scratch_path, &mutated)
    }

    fn handle_crash(&mut self, entry_name: &str, mutated: &[u8]) -> Result<()> {
        self.stats.crashes += 1;
        self.stats.last_crash_time = now_secs();

        let crash_name = new_coverage_filename(self.id, self.stats.executions, Some(entry_name));
        let crash_path = self.crashes_dir.join(&crash_name);
        fs::write(&crash_path, mutated)?;

        let trace = self.runner.trace_bitmap().to_vec();
        let mut shared = AtomicMonotoneBitmap::new(self.crash_shared.as_mut_slice());
        if shared.observe_and_clear(&trace, &VolatileSet::new()) == Classification::NewEdge {
            let unique_path = self.crashes_unique_dir.join(&crash_name);
            fs::write(&unique_path, mutated)?;
            self.stats.unique_crashes += 1;
        }
        Ok(())
    }

    fn calibrate_and_admit(
        &mut self,
        entry_name: &str,
        scratch_path: &std::path::Path,
        mutated: &[u8],
    ) -> Result<()> {
        let mut view = self.virgin_local.view();
        let runner = &mut self.runner;
        let (classification, volatile) = calibrate(view.as_mut_slice(), |trace_buf| {
            runner.trace_bitmap_mut().fill(0);
            let _ = runner.run(scratch_path, mutated);
            trace_buf.copy_from_slice(runner.trace_bitmap());
        });
        drop(view);

        if !volatile.is_empty() {
            self.stats.blacklisted_paths = volatile.len() as u64;
        }
        if classification != Classification::NewEdge {
            return Ok(());
        }

        self.corpus
            .add_interesting(self.id, self.stats.executions, Some(entry_name), mutated.to_vec())?;
        self.stats.new_paths += 1;
        self.stats.last_path_time = now_secs();
        Ok(())
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutator::havoc::HavocMutator;
    use std::collections::HashMap;

    fn fake_runner(worker_id: usize, script: &std::path::Path) -> TargetRunner {
        use crate::target_runner::{DeliveryMode, TargetRunnerConfig, INPUT_SENTINEL};
        use nix::sys::signal::Signal;
        let config = TargetRunnerConfig {
            binary: script.as_os_str().to_owned(),
            args_template: vec![INPUT_SENTINEL.into()],
            mode: DeliveryMode::File,
            timeout: Duration::from_secs(5),
            kill_signal: Signal::SIGKILL,
            memlimit_mb: 0,
            debug_child: false,
            envs: Vec::new(),
        };
        TargetRunner::new(config, worker_id).unwrap()
    }

    /// A tiny shell script standing in for an instrumented binary: reads
    /// `__AFL_SHM_ID`, and writes a fixed byte pattern into the attached
    /// SysV segment via a small embedded perl/python-free approach is
    /// overkill for a unit test, so instead we exercise the classify/dry
    /// run plumbing against a script that simply always exits 0 without
    /// touching the shared memory (an "uninstrumented binary").
    #[test]
    #[cfg_attr(not(unix), ignore)]
    fn dry_run_rejects_uninstrumented_target() {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("target.sh");
        std::fs::write(&script_path, "#!/bin/sh\nexit 0\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script_path, perms).unwrap();
        }

        let seed_dir = dir.path().join("seeds");
        std::fs::create_dir(&seed_dir).unwrap();
        std::fs::write(seed_dir.join("a"), b"x").unwrap();

        let mut corpus = InputCorpus::new(dir.path().join("out/queue"));
        corpus.load_seeds(&seed_dir).unwrap();

        let out_dir = dir.path().join("out");
        let runner = fake_runner(0, &script_path);
        let dispatcher = MutationDispatcher::new("afl:10", HavocMutator::new(1, Vec::new()), HashMap::new()).unwrap();

        let virgin_bytes = vec![0xFFu8; crate::bitmap::SHM_SIZE];
        let crash_bytes = vec![0xFFu8; crate::bitmap::SHM_SIZE];
        let _ = (virgin_bytes, crash_bytes);

        // SharedRegion needs a real mapping; use the platform constructor
        // directly since this is a same-process unit test (no fork).
        let virgin_shared = platform::create_shared_region("test-virgin", crate::bitmap::SHM_SIZE).unwrap();
        let crash_shared = platform::create_shared_region("test-crash", crate::bitmap::SHM_SIZE).unwrap();
        let stats_shared = platform::create_shared_region("test-stats", crate::stats::SharedStats::size_for(1)).unwrap();

        let config = WorkerConfig { id: 0, out_dir, sync_freq: 100, ignore_sigabrt: false };
        let mut worker = Worker::new(config, runner, corpus, dispatcher, virgin_shared, crash_shared, stats_shared).unwrap();

        let err = worker.dry_run().unwrap_err();
        assert!(matches!(err, Error::NotInstrumented { .. }));
    }
}
