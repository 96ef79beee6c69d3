//! The built-in byte-level external mutator: shells out to a named binary
//! on the `PATH`, passing the input as a file and collecting its output
//! from another file. This is the one built-in mutator besides havoc that
//! the dispatcher knows to invoke without a user-supplied command.

use std::path::PathBuf;
use std::process::Command;

use rand::Rng;

use super::Mutator;
use crate::error::{Error, Result};

/// Drives an external command shaped like `radamsa [--seed N] INPUT > OUTPUT`:
/// one argument for the input path, output captured from the child's
/// stdout. `deterministic` ties the seed to the dispatcher's PRNG so a
/// restored session reproduces the same mutation sequence.
pub struct ExternalMutator {
    name: String,
    binary: PathBuf,
    deterministic: bool,
    work_dir: PathBuf,
    seq: u64,
}

impl ExternalMutator {
    pub fn new(name: impl Into<String>, binary: PathBuf, work_dir: PathBuf, deterministic: bool) -> Self {
        Self { name: name.into(), binary, deterministic, work_dir, seq: 0 }
    }
}

impl Mutator for ExternalMutator {
    fn name(&self) -> &str {
        &self.name
    }

    fn mutate(&mut self, input: &[u8], _corpus_sample: Option<&[u8]>) -> Result<Vec<u8>> {
        self.seq += 1;
        let input_path = self.work_dir.join(format!(".ext-in-{}", self.seq));
        let output_path = self.work_dir.join(format!(".ext-out-{}", self.seq));
        std::fs::write(&input_path, input)?;

        let mut cmd = Command::new(&self.binary);
        if self.deterministic {
            let seed: u64 = rand::thread_rng().gen();
            cmd.arg("--seed").arg(seed.to_string());
        }
        cmd.arg(&input_path);

        let output = cmd.output()?;
        let _ = std::fs::remove_file(&input_path);

        if !output.status.success() {
            let _ = std::fs::remove_file(&output_path);
            return Err(Error::EmptyMutation { name: self.name.clone() });
        }

        let data = if output_path.exists() {
            let data = std::fs::read(&output_path)?;
            let _ = std::fs::remove_file(&output_path);
            data
        } else {
            output.stdout
        };

        if data.is_empty() {
            return Err(Error::EmptyMutation { name: self.name.clone() });
        }
        Ok(data)
    }
}
