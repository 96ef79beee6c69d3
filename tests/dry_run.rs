//! Filesystem-backed integration test for scenario S1: a target lacking
//! `__AFL_SHM_ID` is rejected at dry-run time with a clear error, matching
//! the "not instrumented" contract in spec.md §6/§8.

use std::collections::HashMap;
use std::time::Duration;

use manul::bitmap::SHM_SIZE;
use manul::corpus::InputCorpus;
use manul::error::Error;
use manul::mutator::dispatcher::MutationDispatcher;
use manul::mutator::havoc::HavocMutator;
use manul::platform;
use manul::stats::SharedStats;
use manul::target_runner::{DeliveryMode, TargetRunner, TargetRunnerConfig, INPUT_SENTINEL};
use manul::worker::{Worker, WorkerConfig};
use nix::sys::signal::Signal;

#[cfg(unix)]
fn make_script(path: &std::path::Path, body: &str) {
    std::fs::write(path, body).unwrap();
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).unwrap();
}

#[test]
#[cfg(unix)]
fn uninstrumented_target_fails_dry_run() {
    let tmp = tempfile::tempdir().unwrap();
    let script = tmp.path().join("target.sh");
    make_script(&script, "#!/bin/sh\nexit 0\n");

    let seed_dir = tmp.path().join("seeds");
    std::fs::create_dir(&seed_dir).unwrap();
    std::fs::write(seed_dir.join("one"), b"seed-one").unwrap();
    std::fs::write(seed_dir.join("two"), b"seed-two").unwrap();

    let out_dir = tmp.path().join("out");
    let mut corpus = InputCorpus::new(out_dir.join("queue"));
    corpus.load_seeds(&seed_dir).unwrap();

    let runner_config = TargetRunnerConfig {
        binary: script.as_os_str().to_owned(),
        args_template: vec![INPUT_SENTINEL.into()],
        mode: DeliveryMode::File,
        timeout: Duration::from_secs(5),
        kill_signal: Signal::SIGKILL,
        memlimit_mb: 0,
        debug_child: false,
        envs: Vec::new(),
    };
    let runner = TargetRunner::new(runner_config, 0).unwrap();
    let dispatcher = MutationDispatcher::new("afl:10", HavocMutator::new(1, Vec::new()), HashMap::new()).unwrap();

    let virgin = platform::create_shared_region("it-dry-run-virgin", SHM_SIZE).unwrap();
    let crash = platform::create_shared_region("it-dry-run-crash", SHM_SIZE).unwrap();
    let stats = platform::create_shared_region("it-dry-run-stats", SharedStats::size_for(1)).unwrap();

    let config = WorkerConfig { id: 0, out_dir, sync_freq: 100, ignore_sigabrt: false };
    let mut worker = Worker::new(config, runner, corpus, dispatcher, virgin, crash, stats).unwrap();

    let err = worker.dry_run().unwrap_err();
    assert!(matches!(err, Error::NotInstrumented { .. }));
}
