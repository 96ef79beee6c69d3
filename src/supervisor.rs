//! Spawns workers, owns the two shared bitmaps and the shared statistics
//! block, periodically aggregates and prints statistics, and watches for
//! dead workers.
//!
//! On unix this forks once per worker, mirroring the reference
//! implementation's use of `multiprocessing.Process` (which also forks);
//! the shared-memory regions stay mapped across the fork for free. On
//! platforms without `fork()`, each worker is instead a re-exec of this
//! same binary with a hidden `--worker-slot` argument, and processes
//! rendezvous through named shared memory (see [`crate::platform`]).

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;

use crate::bitmap::SHM_SIZE;
use crate::cli::Cli;
use crate::corpus::InputCorpus;
use crate::dictionary;
use crate::error::{Error, Result};
use crate::mutator::dispatcher::{parse_weights, MutationDispatcher};
use crate::mutator::external::ExternalMutator;
use crate::mutator::havoc::HavocMutator;
use crate::mutator::user::{parse_mutator_cmd, UserMutator};
use crate::mutator::Mutator;
use crate::platform::{self, SharedRegion};
use crate::stats::{SharedStats, Statistics};
use crate::target_runner::{check_instrumented, DeliveryMode, TargetRunner, TargetRunnerConfig};
use crate::worker::{Worker, WorkerConfig};

/// Renames the existing output directory out of the way (`DIR_<n>`) so a
/// fresh run doesn't mix its queue and crashes with a prior one, unless
/// this is a restore.
fn prepare_out_dir(out_dir: &Path, restore: bool) -> Result<()> {
    if out_dir.exists() {
        let nonempty = fs::read_dir(out_dir)?.next().is_some();
        if nonempty && !restore {
            let mut n = 1u32;
            let renamed = loop {
                let candidate = PathBuf::from(format!("{}_{n}", out_dir.display()));
                if !candidate.exists() {
                    break candidate;
                }
                n += 1;
            };
            fs::rename(out_dir, &renamed)?;
            fs::create_dir_all(out_dir)?;
        }
    } else {
        fs::create_dir_all(out_dir)?;
    }
    Ok(())
}

/// Reads every file in `in_dir` once and deals them round-robin into
/// `workers` slices, giving each worker its own assigned portion of the
/// initial corpus per spec §3 ("starts with the worker's assigned slice
/// of initial entries").
fn load_and_split_seeds(in_dir: &Path, workers: usize) -> Result<Vec<Vec<(PathBuf, Vec<u8>)>>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(in_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();
    if paths.is_empty() {
        return Err(Error::Config(format!("initial corpus directory {} is empty", in_dir.display())));
    }

    let mut slices = vec![Vec::new(); workers];
    for (i, path) in paths.into_iter().enumerate() {
        let data = fs::read(&path)?;
        slices[i % workers].push((path, data));
    }
    Ok(slices)
}

fn build_delivery_mode(cli: &Cli) -> Result<DeliveryMode> {
    if let Some((addr, protocol)) = cli.network_target()? {
        return Ok(DeliveryMode::Network { addr, protocol });
    }
    if cli.cmd_fuzzing {
        Ok(DeliveryMode::CommandLine)
    } else {
        Ok(DeliveryMode::File)
    }
}

fn build_mutators(cli: &Cli, worker_out_dir: &Path) -> Result<(HashMap<String, Box<dyn Mutator + Send>>, Vec<Vec<u8>>)> {
    let dictionary = match &cli.dict {
        Some(path) => dictionary::load(path)?,
        None => Vec::new(),
    };

    let mut others: HashMap<String, Box<dyn Mutator + Send>> = HashMap::new();
    for spec in &cli.mutator_cmd {
        let (name, path) = parse_mutator_cmd(spec)?;
        others.insert(name.clone(), Box::new(UserMutator::new(name, path)));
    }
    // Any weighted name besides "afl" that wasn't registered via
    // --mutator-cmd is assumed to be a byte-level external mutator on
    // PATH (spec §4.3's second built-in category).
    for (name, _) in parse_weights(&cli.mutator_weights)? {
        if name != "afl" && !others.contains_key(&name) {
            others.insert(
                name.clone(),
                Box::new(ExternalMutator::new(
                    name.clone(),
                    PathBuf::from(&name),
                    worker_out_dir.to_path_buf(),
                    cli.deterministic_seed,
                )),
            );
        }
    }
    Ok((others, dictionary))
}

/// Shared state every worker process needs a handle to, regardless of
/// how that process came to exist (fork or re-exec).
struct SharedHandles {
    virgin: SharedRegion,
    crash: SharedRegion,
    control: SharedRegion,
    stats: SharedRegion,
}

pub struct Supervisor {
    cli: Cli,
    shared: SharedHandles,
    seed_slices: Vec<Vec<(PathBuf, Vec<u8>)>>,
}

impl Supervisor {
    pub fn new(cli: Cli) -> Result<Self> {
        cli.validate()?;
        cli.network_target()?;
        if !cli.dumb_mode && !cli.dbi {
            check_instrumented(Path::new(&cli.executable))?;
        }
        prepare_out_dir(&cli.out_dir, cli.restore)?;

        parse_weights(&cli.mutator_weights)?;
        for spec in &cli.mutator_cmd {
            parse_mutator_cmd(spec)?;
        }

        let seed_slices = if cli.restore {
            Vec::new()
        } else {
            load_and_split_seeds(&cli.in_dir, cli.workers)?
        };

        let name = out_dir_region_name(&cli.out_dir);
        let mut virgin = platform::create_shared_region(&format!("{name}-virgin"), SHM_SIZE)?;
        virgin.as_mut_slice().fill(0xFF);
        let mut crash = platform::create_shared_region(&format!("{name}-crash"), SHM_SIZE)?;
        crash.as_mut_slice().fill(0xFF);
        let mut control = platform::create_shared_region(&format!("{name}-control"), 8)?;
        control.as_mut_slice().fill(0);

        let stats = platform::create_shared_region(&format!("{name}-stats"), SharedStats::size_for(cli.workers.max(1)))?;

        Ok(Self {
            cli,
            shared: SharedHandles { virgin, crash, control, stats },
            seed_slices,
        })
    }

    fn build_worker(&self, worker_id: usize, virgin: SharedRegion, crash: SharedRegion, stats: SharedRegion) -> Result<Worker> {
        let worker_out_dir = self.cli.out_dir.join(worker_id.to_string());
        fs::create_dir_all(&worker_out_dir)?;

        let mut corpus = if self.cli.restore {
            InputCorpus::restore(&worker_out_dir.join("queue"))?
        } else {
            InputCorpus::new(worker_out_dir.join("queue"))
        };
        if corpus.is_empty() {
            for (path, data) in self.seed_slices.get(worker_id).cloned().unwrap_or_default() {
                corpus.push_seed(path, data);
            }
        }
        if corpus.is_empty() {
            return Err(Error::Config(format!("worker {worker_id} was assigned no seeds")));
        }

        let mode = build_delivery_mode(&self.cli)?;
        let runner_config = TargetRunnerConfig {
            binary: OsString::from(&self.cli.executable),
            args_template: self.cli.arguments.iter().map(OsString::from).collect(),
            mode,
            timeout: self.cli.effective_timeout(),
            kill_signal: Signal::SIGKILL,
            memlimit_mb: 0,
            debug_child: false,
            envs: Vec::new(),
        };
        let runner = TargetRunner::new(runner_config, worker_id)?;

        let (others, dictionary) = build_mutators(&self.cli, &worker_out_dir)?;
        let seed = if self.cli.deterministic_seed { worker_id as u64 } else { rand::random() };
        let mut havoc = HavocMutator::new(seed, dictionary);
        if self.cli.restore {
            if let Some(prior) = Statistics::restore_from(&worker_out_dir.join("fuzzer_stats"))? {
                havoc.fast_forward(prior.executions);
            }
        }
        let dispatcher = MutationDispatcher::new(&self.cli.mutator_weights, havoc, others)?;

        let worker_config = WorkerConfig {
            id: worker_id,
            out_dir: worker_out_dir,
            sync_freq: self.cli.sync_freq,
            ignore_sigabrt: self.cli.ignore_sigabrt,
        };
        Worker::new(worker_config, runner, corpus, dispatcher, virgin, crash, stats)
    }

    fn report(&mut self) {
        let workers = self.cli.workers;
        let shared = SharedStats::new(self.shared.stats.as_mut_slice());
        let mut total = Statistics::default();
        let mut per_worker = Vec::with_capacity(workers);
        for id in 0..workers {
            let s = shared.read(id);
            total.executions += s.executions;
            total.exceptions += s.exceptions;
            total.crashes += s.crashes;
            total.unique_crashes += s.unique_crashes;
            total.new_paths += s.new_paths;
            total.files_in_queue += s.files_in_queue;
            total.exec_per_sec += s.exec_per_sec;
            total.last_crash_time = total.last_crash_time.max(s.last_crash_time);
            total.last_path_time = total.last_path_time.max(s.last_path_time);
            total.blacklisted_paths += s.blacklisted_paths;
            per_worker.push(s);
        }

        if self.cli.per_thread {
            for (id, s) in per_worker.iter().enumerate() {
                log::info!(
                    "worker {id}: execs={} exec/s={} crashes={} unique={} paths={} queue={}",
                    s.executions, s.exec_per_sec, s.crashes, s.unique_crashes, s.new_paths, s.files_in_queue
                );
            }
        } else {
            log::info!(
                "execs={} exec/s={} crashes={} unique={} paths={} queue={}",
                total.executions, total.exec_per_sec, total.crashes, total.unique_crashes, total.new_paths, total.files_in_queue
            );
        }
    }
}

fn out_dir_region_name(out_dir: &Path) -> String {
    let hash = crc32fast::hash(out_dir.to_string_lossy().as_bytes());
    format!("manul-{hash:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_out_dir_renames_nonempty_existing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("stale"), b"leftover").unwrap();

        prepare_out_dir(&out, false).unwrap();

        let renamed = PathBuf::from(format!("{}_1", out.display()));
        assert!(renamed.join("stale").exists());
        assert!(out.exists());
        assert!(fs::read_dir(&out).unwrap().next().is_none());
    }

    #[test]
    fn prepare_out_dir_leaves_existing_dir_alone_on_restore() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("fuzzer_stats"), b"1700000000 0:5\n").unwrap();

        prepare_out_dir(&out, true).unwrap();

        assert!(out.join("fuzzer_stats").exists());
    }

    #[test]
    fn prepare_out_dir_creates_missing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("fresh");
        prepare_out_dir(&out, false).unwrap();
        assert!(out.is_dir());
    }

    #[test]
    fn load_and_split_seeds_round_robins_across_workers() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["a", "b", "c", "d", "e"] {
            fs::write(tmp.path().join(name), name.as_bytes()).unwrap();
        }
        let slices = load_and_split_seeds(tmp.path(), 2).unwrap();
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len() + slices[1].len(), 5);
    }

    #[test]
    fn load_and_split_seeds_rejects_empty_dir() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(load_and_split_seeds(tmp.path(), 2).is_err());
    }

    #[test]
    fn out_dir_region_name_is_stable_for_same_path() {
        let a = out_dir_region_name(Path::new("/tmp/out"));
        let b = out_dir_region_name(Path::new("/tmp/out"));
        assert_eq!(a, b);
        assert_ne!(a, out_dir_region_name(Path::new("/tmp/other")));
    }
}

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::{fork, ForkResult, Pid};
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    impl Supervisor {
        /// Forks one child per worker. The child runs [`Worker::run`] to
        /// completion (or until the shared control byte asks it to stop)
        /// and then exits; the parent only ever sees [`Pid`]s.
        fn fork_worker(&self, worker_id: usize) -> Result<Pid> {
            let virgin = self.shared.virgin.for_child();
            let crash = self.shared.crash.for_child();
            let stats = self.shared.stats.for_child();
            let control_ptr = self.shared.control.as_slice().as_ptr();

            // SAFETY: single-threaded up to this point; the child never
            // returns past this function body.
            match unsafe { fork() }.map_err(Error::Errno)? {
                ForkResult::Parent { child } => Ok(child),
                ForkResult::Child => {
                    unsafe {
                        let _ = nix::sys::signal::signal(Signal::SIGINT, nix::sys::signal::SigHandler::SigIgn);
                    }
                    let shutdown = shutdown_flag(control_ptr);
                    let exit_code = match self.build_worker(worker_id, virgin, crash, stats) {
                        Ok(mut worker) => match worker.dry_run().and_then(|_| worker.run(shutdown)) {
                            Ok(()) => 0,
                            Err(e) => {
                                log::error!("worker {worker_id} failed: {e}");
                                1
                            }
                        },
                        Err(e) => {
                            log::error!("worker {worker_id} failed to start: {e}");
                            1
                        }
                    };
                    std::process::exit(exit_code);
                }
            }
        }

        pub fn run(mut self) -> Result<()> {
            let interrupted = Arc::new(StdAtomicBool::new(false));
            signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupted))
                .map_err(|e| Error::Config(format!("failed to install SIGINT handler: {e}")))?;

            let mut children: Vec<Option<Pid>> = Vec::with_capacity(self.cli.workers);
            for worker_id in 0..self.cli.workers {
                children.push(Some(self.fork_worker(worker_id)?));
            }

            let stats_interval = Duration::from_secs(self.cli.stats_interval_secs.max(1));
            let mut last_report = Instant::now();

            loop {
                if interrupted.load(Ordering::Relaxed) {
                    log::info!("shutting down");
                    self.shared.control.as_mut_slice()[0] = 1;
                    for pid in children.iter().flatten() {
                        let _ = nix::sys::signal::kill(*pid, Signal::SIGTERM);
                    }
                    break;
                }

                for (worker_id, slot) in children.iter_mut().enumerate() {
                    let Some(pid) = *slot else { continue };
                    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                        Ok(WaitStatus::StillAlive) => {}
                        Ok(_status) => {
                            log::warn!("worker {worker_id} exited unexpectedly");
                            *slot = None;
                            if self.cli.dumb_mode {
                                match self.fork_worker(worker_id) {
                                    Ok(new_pid) => {
                                        log::info!("restarted worker {worker_id}");
                                        *slot = Some(new_pid);
                                    }
                                    Err(e) => log::error!("failed to restart worker {worker_id}: {e}"),
                                }
                            }
                        }
                        Err(e) => log::warn!("waitpid for worker {worker_id} failed: {e}"),
                    }
                }

                if children.iter().all(Option::is_none) {
                    log::error!("every worker has exited; stopping");
                    break;
                }

                if last_report.elapsed() >= stats_interval {
                    self.report();
                    last_report = Instant::now();
                }

                std::thread::sleep(Duration::from_millis(200));
            }

            for pid in children.into_iter().flatten() {
                let _ = waitpid(pid, None);
            }
            Ok(())
        }
    }

    /// A `&'static AtomicBool` view over the shared control byte so
    /// [`Worker::run`] can check it with the same interface regardless of
    /// whether the flag lives in process-local or shared memory. Reading
    /// a racily-written byte as a bool is well-defined (any non-zero byte
    /// reads as `true`); we only ever write `0` or `1`.
    fn shutdown_flag(ptr: *const u8) -> &'static StdAtomicBool {
        // SAFETY: `ptr` points into a `MAP_SHARED`-equivalent SysV segment
        // that outlives this worker process (the supervisor holds the
        // owning handle); `AtomicBool` has the same size and alignment as
        // `u8`, the type the control region was sized and zeroed as.
        unsafe { &*(ptr as *const StdAtomicBool) }
    }
}

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use std::process::Child;

    impl Supervisor {
        fn reexec_worker(&self, worker_id: usize) -> Result<Child> {
            let exe = std::env::current_exe()?;
            let mut cmd = std::process::Command::new(exe);
            cmd.arg(&self.cli.executable);
            cmd.args(&self.cli.arguments);
            cmd.arg("-i").arg(&self.cli.in_dir);
            cmd.arg("-o").arg(&self.cli.out_dir);
            cmd.arg("-n").arg("1");
            cmd.arg("--timeout").arg(self.cli.timeout_secs.to_string());
            cmd.arg("--mutator_weights").arg(&self.cli.mutator_weights);
            cmd.arg("--sync-freq").arg(self.cli.sync_freq.to_string());
            if self.cli.cmd_fuzzing {
                cmd.arg("--cmd_fuzzing");
            }
            if self.cli.dbi {
                cmd.arg("--dbi");
            }
            if self.cli.ignore_sigabrt {
                cmd.arg("--ignore-sigabrt");
            }
            if self.cli.deterministic_seed {
                cmd.arg("--determinstic_seed");
            }
            if self.cli.restore {
                cmd.arg("-r");
            }
            if let Some(dict) = &self.cli.dict {
                cmd.arg("--dict").arg(dict);
            }
            if let Some(addr) = &self.cli.net {
                cmd.arg("--net").arg(addr).arg("--net-proto").arg(&self.cli.net_proto);
            }
            for entry in &self.cli.mutator_cmd {
                cmd.arg("--mutator-cmd").arg(entry);
            }
            cmd.arg("--worker-slot").arg(worker_id.to_string());
            cmd.spawn().map_err(Error::Io)
        }

        pub fn run(mut self) -> Result<()> {
            let mut children: Vec<Option<Child>> = Vec::with_capacity(self.cli.workers);
            for worker_id in 0..self.cli.workers {
                children.push(Some(self.reexec_worker(worker_id)?));
            }

            let stats_interval = Duration::from_secs(self.cli.stats_interval_secs.max(1));
            let mut last_report = Instant::now();

            loop {
                for (worker_id, slot) in children.iter_mut().enumerate() {
                    if let Some(child) = slot {
                        if let Ok(Some(_status)) = child.try_wait() {
                            log::warn!("worker {worker_id} exited unexpectedly");
                            *slot = None;
                            if self.cli.dumb_mode {
                                if let Ok(new_child) = self.reexec_worker(worker_id) {
                                    *slot = Some(new_child);
                                }
                            }
                        }
                    }
                }
                if children.iter().all(Option::is_none) {
                    break;
                }
                if last_report.elapsed() >= stats_interval {
                    self.report();
                    last_report = Instant::now();
                }
                std::thread::sleep(Duration::from_millis(200));
            }
            Ok(())
        }
    }

    /// Entry point for a re-exec'd worker process (`--worker-slot N`):
    /// opens the named shared regions the original supervisor created and
    /// runs the worker loop directly. Deliberately does not go through
    /// [`Supervisor::new`] — that constructor's startup side effects
    /// (renaming a stale output directory, checking instrumentation) are
    /// the supervisor's responsibility alone, and repeating them here
    /// would race with the supervisor process that already did them.
    pub fn run_worker_slot(cli: Cli, slot: usize) -> Result<()> {
        cli.validate()?;
        let name = out_dir_region_name(&cli.out_dir);
        let stats_size = SharedStats::size_for(cli.workers.max(1));

        // Opened twice: once for the worker itself, once to populate the
        // `Supervisor` shape `build_worker` expects. Named mappings can be
        // opened any number of times, each handing back its own view onto
        // the same underlying section.
        let worker_virgin = platform::open_shared_region(&format!("{name}-virgin"), SHM_SIZE)?;
        let worker_crash = platform::open_shared_region(&format!("{name}-crash"), SHM_SIZE)?;
        let worker_stats = platform::open_shared_region(&format!("{name}-stats"), stats_size)?;
        let shared = SharedHandles {
            virgin: platform::open_shared_region(&format!("{name}-virgin"), SHM_SIZE)?,
            crash: platform::open_shared_region(&format!("{name}-crash"), SHM_SIZE)?,
            control: platform::open_shared_region(&format!("{name}-control"), 8)?,
            stats: platform::open_shared_region(&format!("{name}-stats"), stats_size)?,
        };

        // Seed assignment is a pure function of `in_dir` and `workers`, so
        // a freshly re-exec'd process reconstructs the same slice the
        // supervisor computed without needing to share it explicitly.
        let seed_slices = if cli.restore { Vec::new() } else { load_and_split_seeds(&cli.in_dir, cli.workers)? };

        let supervisor = Supervisor { cli, shared, seed_slices };
        let mut worker = supervisor.build_worker(slot, worker_virgin, worker_crash, worker_stats)?;
        worker.dry_run()?;
        let shutdown = shutdown_flag(&supervisor.shared.control);
        worker.run(shutdown)
    }

    fn shutdown_flag(control: &SharedRegion) -> &std::sync::atomic::AtomicBool {
        // SAFETY: same layout argument as the unix control flag; the
        // named mapping keeps this memory alive for the process lifetime.
        unsafe { &*(control.as_slice().as_ptr() as *const std::sync::atomic::AtomicBool) }
    }
}

#[cfg(windows)]
pub use windows_impl::run_worker_slot;
