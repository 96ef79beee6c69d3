//! User-supplied mutators, registered by name via `--mutator-cmd
//! NAME=PATH`. Each is an out-of-process filter: mutation input arrives
//! on the child's stdin and the mutated bytes are read back from stdout.
//! This stands in for the dynamic-module-loading scheme of the reference
//! implementation, which a systems rewrite should not emulate.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use super::Mutator;
use crate::error::{Error, Result};

pub struct UserMutator {
    name: String,
    command: PathBuf,
}

impl UserMutator {
    pub fn new(name: impl Into<String>, command: PathBuf) -> Self {
        Self { name: name.into(), command }
    }
}

impl Mutator for UserMutator {
    fn name(&self) -> &str {
        &self.name
    }

    fn mutate(&mut self, input: &[u8], _corpus_sample: Option<&[u8]>) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        child
            .stdin
            .take()
            .expect("piped stdin")
            .write_all(input)?;

        let output = child.wait_with_output()?;
        if !output.status.success() || output.stdout.is_empty() {
            return Err(Error::EmptyMutation { name: self.name.clone() });
        }
        Ok(output.stdout)
    }
}

/// Parses a single `NAME=PATH` entry from `--mutator-cmd`, repeated once
/// per registered user mutator.
pub fn parse_mutator_cmd(spec: &str) -> Result<(String, PathBuf)> {
    let (name, path) = spec
        .split_once('=')
        .ok_or_else(|| Error::Config(format!("invalid --mutator-cmd entry {spec:?}, expected NAME=PATH")))?;
    if name.is_empty() || path.is_empty() {
        return Err(Error::Config(format!("invalid --mutator-cmd entry {spec:?}, expected NAME=PATH")));
    }
    Ok((name.to_string(), PathBuf::from(path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_and_path() {
        let (name, path) = parse_mutator_cmd("upper=/usr/bin/tr").unwrap();
        assert_eq!(name, "upper");
        assert_eq!(path, PathBuf::from("/usr/bin/tr"));
    }

    #[test]
    fn rejects_missing_equals() {
        assert!(parse_mutator_cmd("upper").is_err());
    }
}
