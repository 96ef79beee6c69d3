//! The command line interface of the fuzzer.

use std::path::PathBuf;

use clap::Parser;

use crate::error::{Error, Result};
use crate::target_runner::{NetworkProtocol, INPUT_SENTINEL};

#[derive(Debug, Parser)]
#[command(about = "Coverage-guided mutational fuzzer for instrumented native binaries")]
pub struct Cli {
    #[arg(
        help = "The instrumented target binary",
        name = "EXEC",
        required = true
    )]
    pub executable: String,

    #[arg(
        help = "Arguments passed to the target; use @@ where the input path (or, with --cmd_fuzzing, the input bytes) should go",
        name = "arguments",
        num_args(0..),
        allow_hyphen_values = true
    )]
    pub arguments: Vec<String>,

    #[arg(help = "Directory of initial corpus files", short = 'i', required = true)]
    pub in_dir: PathBuf,

    #[arg(help = "Output directory", short = 'o', required = true)]
    pub out_dir: PathBuf,

    #[arg(help = "Number of parallel workers", short = 'n', default_value_t = 1)]
    pub workers: usize,

    #[arg(help = "Dumb (no-instrumentation) mode", short = 's', default_value_t = false)]
    pub dumb_mode: bool,

    #[arg(help = "Restore a previous session from the output directory", short = 'r', default_value_t = false)]
    pub restore: bool,

    #[arg(help = "Per-execution timeout, in seconds", long = "timeout", default_value_t = 10)]
    pub timeout_secs: u64,

    #[arg(help = "Dictionary of interesting tokens, one per line")]
    #[arg(long = "dict")]
    pub dict: Option<PathBuf>,

    #[arg(
        help = "Mutator weights, e.g. \"afl:7,radamsa:3\"; must sum to 10",
        long = "mutator_weights",
        default_value = "afl:10"
    )]
    pub mutator_weights: String,

    #[arg(
        help = "Register a user-defined mutator as NAME=PATH; repeatable",
        long = "mutator-cmd"
    )]
    pub mutator_cmd: Vec<String>,

    #[arg(help = "Deliver the mutated input via command-line substitution instead of a file", long = "cmd_fuzzing", default_value_t = false)]
    pub cmd_fuzzing: bool,

    #[arg(
        help = "Seed the PRNG with the worker id for reproducible sessions (spelling preserved for compatibility)",
        long = "determinstic_seed",
        alias = "deterministic-seed",
        default_value_t = false
    )]
    pub deterministic_seed: bool,

    #[arg(help = "Drive the target through dynamic binary instrumentation (multiplies the timeout by 30)", long = "dbi", default_value_t = false)]
    pub dbi: bool,

    #[arg(help = "Print one line per worker instead of an aggregate summary", long = "per-thread", default_value_t = false)]
    pub per_thread: bool,

    #[arg(help = "Iterations between bitmap syncs across workers", short = 'j', long = "sync-freq", default_value_t = 100)]
    pub sync_freq: u64,

    #[arg(help = "Ignore SIGABRT when classifying crashes", long = "ignore-sigabrt", default_value_t = false)]
    pub ignore_sigabrt: bool,

    #[arg(
        help = "Deliver test cases to a long-lived target over the network instead of launching it per input, e.g. \"127.0.0.1:4444\"",
        long = "net"
    )]
    pub net: Option<String>,

    #[arg(
        help = "Protocol to use with --net",
        long = "net-proto",
        default_value = "tcp"
    )]
    pub net_proto: String,

    #[arg(help = "Seconds between aggregate statistics refreshes", long = "stats-interval", default_value_t = 5)]
    pub stats_interval_secs: u64,

    #[arg(help = "Hidden: identifies this process as worker N on platforms without fork()", long = "worker-slot", hide = true)]
    pub worker_slot: Option<usize>,
}

impl Cli {
    pub fn validate(&self) -> Result<()> {
        if !self.arguments.iter().any(|a| a == INPUT_SENTINEL)
            && self.executable != INPUT_SENTINEL
        {
            return Err(Error::Config(format!(
                "target command line must contain the {INPUT_SENTINEL} input-path sentinel"
            )));
        }
        if self.workers == 0 {
            return Err(Error::Config("-n must be at least 1".into()));
        }
        Ok(())
    }

    pub fn effective_timeout(&self) -> std::time::Duration {
        let secs = if self.dbi { self.timeout_secs * 30 } else { self.timeout_secs };
        std::time::Duration::from_secs(secs)
    }

    /// Parses `--net`/`--net-proto` into the address and protocol
    /// [`crate::target_runner::DeliveryMode::Network`] needs, if network
    /// delivery was requested at all.
    pub fn network_target(&self) -> Result<Option<(String, NetworkProtocol)>> {
        let Some(addr) = &self.net else {
            return Ok(None);
        };
        let proto = match self.net_proto.to_ascii_lowercase().as_str() {
            "tcp" => NetworkProtocol::Tcp,
            "udp" => NetworkProtocol::Udp,
            other => return Err(Error::Config(format!("--net-proto must be tcp or udp, got {other:?}"))),
        };
        Ok(Some((addr.clone(), proto)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_sentinel() {
        let cli = Cli {
            executable: "target".into(),
            arguments: vec!["-x".into()],
            in_dir: "/tmp/in".into(),
            out_dir: "/tmp/out".into(),
            workers: 1,
            dumb_mode: false,
            restore: false,
            timeout_secs: 10,
            dict: None,
            mutator_weights: "afl:10".into(),
            mutator_cmd: Vec::new(),
            cmd_fuzzing: false,
            deterministic_seed: false,
            dbi: false,
            per_thread: false,
            sync_freq: 100,
            ignore_sigabrt: false,
            net: None,
            net_proto: "tcp".into(),
            stats_interval_secs: 5,
            worker_slot: None,
        };
        assert!(cli.validate().is_err());
    }

    #[test]
    fn dbi_multiplies_timeout_by_30() {
        let mut cli_args = vec!["manul", "target", "@@", "-i", "in", "-o", "out"];
        let cli = Cli::try_parse_from(&mut cli_args).unwrap();
        assert_eq!(cli.effective_timeout().as_secs(), 10);
    }
}
