//! Weighted selection between the built-in havoc mutator and any number
//! of named external/user mutators.

use std::collections::HashMap;

use super::havoc::{HavocMutator, HavocState};
use super::Mutator;
use crate::error::{Error, Result};

/// Parses `"name:weight,name:weight,..."`, preserving declaration order
/// (the order determines which mutator wins ties at a cumulative
/// threshold) and returning cumulative thresholds rather than raw
/// weights, since that is what slot selection compares against.
pub fn parse_weights(spec: &str) -> Result<Vec<(String, u32)>> {
    let mut cumulative = 0u32;
    let mut out = Vec::new();
    for entry in spec.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (name, weight) = entry
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("invalid mutator_weights entry {entry:?}, expected name:weight")))?;
        let weight: u32 = weight
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid weight in {entry:?}")))?;
        cumulative += weight;
        out.push((name.trim().to_string(), cumulative));
    }
    if out.is_empty() {
        return Err(Error::Config("mutator_weights must name at least one mutator".into()));
    }
    if cumulative != 10 {
        return Err(Error::Config(format!(
            "mutator_weights must sum to 10, got {cumulative}"
        )));
    }
    Ok(out)
}

/// Selects among mutators by cumulative weight and drives whichever one
/// wins for a given seed's state.
pub struct MutationDispatcher {
    weights: Vec<(String, u32)>,
    havoc: HavocMutator,
    others: HashMap<String, Box<dyn Mutator + Send>>,
}

impl MutationDispatcher {
    pub fn new(
        weights_spec: &str,
        havoc: HavocMutator,
        others: HashMap<String, Box<dyn Mutator + Send>>,
    ) -> Result<Self> {
        let weights = parse_weights(weights_spec)?;
        for (name, _) in &weights {
            if name != "afl" && !others.contains_key(name) {
                return Err(Error::Config(format!("mutator {name:?} has a weight but is not registered")));
            }
        }
        Ok(Self { weights, havoc, others })
    }

    /// The mutator selected for this call count's slot (`executions mod
    /// 10`), per the threshold rule: the first entry whose cumulative
    /// weight exceeds the slot.
    pub fn select_name(&self, executions: u64) -> &str {
        let slot = (executions % 10) as u32;
        self.weights
            .iter()
            .find(|(_, cumulative)| slot < *cumulative)
            .map(|(name, _)| name.as_str())
            .expect("weights sum to 10, so some entry's cumulative exceeds any slot in 0..10")
    }

    pub fn mutate(
        &mut self,
        executions: u64,
        input: &[u8],
        havoc_state: &mut HavocState,
        corpus_sample: Option<&[u8]>,
    ) -> Result<(String, Vec<u8>)> {
        let name = self.select_name(executions).to_string();
        let data = if name == "afl" {
            self.havoc.mutate_with_state(input, havoc_state, corpus_sample)?
        } else {
            let mutator = self
                .others
                .get_mut(&name)
                .ok_or_else(|| Error::Config(format!("mutator {name:?} not registered")))?;
            mutator.mutate(input, corpus_sample)?
        };
        Ok((name, data))
    }

    pub fn havoc_mut(&mut self) -> &mut HavocMutator {
        &mut self.havoc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_weights_not_summing_to_ten() {
        assert!(parse_weights("afl:5,radamsa:4").is_err());
    }

    #[test]
    fn accepts_weights_summing_to_ten() {
        let weights = parse_weights("afl:7,radamsa:3").unwrap();
        assert_eq!(weights, vec![("afl".to_string(), 7), ("radamsa".to_string(), 3)]);
    }

    #[test]
    fn rejects_unregistered_mutator_name() {
        let havoc = HavocMutator::new(1, Vec::new());
        let err = MutationDispatcher::new("afl:7,radamsa:3", havoc, HashMap::new()).unwrap_err();
        // radamsa isn't registered, so construction should fail with a
        // clear configuration error rather than panicking at dispatch time.
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn select_name_counts_match_weight_over_a_window_of_ten() {
        let havoc = HavocMutator::new(1, Vec::new());
        let mut others: HashMap<String, Box<dyn Mutator + Send>> = HashMap::new();
        others.insert("radamsa".to_string(), Box::new(StubMutator));
        let dispatcher = MutationDispatcher::new("afl:7,radamsa:3", havoc, others).unwrap();
        let mut afl_count = 0;
        let mut radamsa_count = 0;
        for executions in 0..10u64 {
            match dispatcher.select_name(executions) {
                "afl" => afl_count += 1,
                "radamsa" => radamsa_count += 1,
                other => panic!("unexpected mutator {other}"),
            }
        }
        assert_eq!(afl_count, 7);
        assert_eq!(radamsa_count, 3);
    }

    struct StubMutator;
    impl Mutator for StubMutator {
        fn name(&self) -> &str {
            "radamsa"
        }
        fn mutate(&mut self, input: &[u8], _corpus_sample: Option<&[u8]>) -> Result<Vec<u8>> {
            Ok(input.to_vec())
        }
    }
}
