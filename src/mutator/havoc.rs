//! The built-in, stateful byte-level mutator (named `afl` in configuration,
//! for continuity with the mutator this design's havoc stage was modeled
//! after).

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use super::Mutator;
use crate::error::{Error, Result};

/// Well-known "interesting" integers instrumentation-aware fuzzers seed
/// arithmetic mutations with: boundary values for 8/16/32-bit signed and
/// unsigned integers.
const INTERESTING_8: &[i64] = &[-128, -1, 0, 1, 16, 32, 64, 100, 127];
const INTERESTING_16: &[i64] = &[-32768, -129, 128, 255, 256, 512, 1000, 1024, 4096, 32767];
const INTERESTING_32: &[i64] = &[-2147483648, -100663046, -32769, 32768, 65535, 65536, 100663045, 2147483647];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    BitFlip,
    Arithmetic,
    Interesting,
    ByteInvert,
    BlockInsert,
    BlockOverwrite,
    BlockDelete,
    Dictionary,
    Splice,
}

const STAGES: &[Stage] = &[
    Stage::BitFlip,
    Stage::Arithmetic,
    Stage::Interesting,
    Stage::ByteInvert,
    Stage::BlockInsert,
    Stage::BlockOverwrite,
    Stage::BlockDelete,
    Stage::Dictionary,
    Stage::Splice,
];

/// Per-corpus-entry scheduling state: which stage runs next and how many
/// times it has run. Kept in the corpus's parallel vector, indexed by
/// entry position (see the arena-indexed design in [`crate::corpus`]).
#[derive(Debug, Clone)]
pub struct HavocState {
    stage_idx: usize,
    stage_progress: u32,
}

impl Default for HavocState {
    fn default() -> Self {
        Self { stage_idx: 0, stage_progress: 0 }
    }
}

impl HavocState {
    fn current_stage(&self) -> Stage {
        STAGES[self.stage_idx % STAGES.len()]
    }

    fn advance(&mut self) {
        self.stage_progress += 1;
        if self.stage_progress >= 16 {
            self.stage_progress = 0;
            self.stage_idx = (self.stage_idx + 1) % STAGES.len();
        }
    }
}

pub struct HavocMutator {
    rng: Xoshiro256PlusPlus,
    dictionary: Vec<Vec<u8>>,
}

impl HavocMutator {
    pub fn new(seed: u64, dictionary: Vec<Vec<u8>>) -> Self {
        Self { rng: Xoshiro256PlusPlus::seed_from_u64(seed), dictionary }
    }

    /// Replays `count` draws against the PRNG, so a restored session's
    /// mutation sequence continues where the prior run left off instead
    /// of repeating already-explored mutations.
    pub fn fast_forward(&mut self, count: u64) {
        for _ in 0..count {
            let _: u64 = self.rng.gen();
        }
    }

    pub fn mutate_with_state(
        &mut self,
        input: &[u8],
        state: &mut HavocState,
        corpus_sample: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        if input.is_empty() {
            return Err(Error::EmptyMutation { name: "havoc".into() });
        }
        let mut data = input.to_vec();
        let stage = state.current_stage();
        match stage {
            Stage::BitFlip => self.bit_flip(&mut data),
            Stage::Arithmetic => self.arithmetic(&mut data),
            Stage::Interesting => self.interesting(&mut data),
            Stage::ByteInvert => self.byte_invert(&mut data),
            Stage::BlockInsert => self.block_insert(&mut data),
            Stage::BlockOverwrite => self.block_overwrite(&mut data),
            Stage::BlockDelete => self.block_delete(&mut data),
            Stage::Dictionary => self.dictionary_insert(&mut data),
            Stage::Splice => self.splice(&mut data, corpus_sample),
        }
        state.advance();
        if data.is_empty() {
            return Err(Error::EmptyMutation { name: "havoc".into() });
        }
        Ok(data)
    }

    fn bit_flip(&mut self, data: &mut [u8]) {
        let byte_idx = self.rng.gen_range(0..data.len());
        let bit = self.rng.gen_range(0..8);
        data[byte_idx] ^= 1 << bit;
    }

    fn arithmetic(&mut self, data: &mut [u8]) {
        let idx = self.rng.gen_range(0..data.len());
        let delta: i8 = self.rng.gen_range(-35..=35);
        data[idx] = data[idx].wrapping_add(delta as u8);
    }

    fn interesting(&mut self, data: &mut [u8]) {
        let len = data.len();
        let width = if len >= 4 && self.rng.gen_bool(0.34) {
            4
        } else if len >= 2 && self.rng.gen_bool(0.5) {
            2
        } else {
            1
        };
        let idx = self.rng.gen_range(0..=len - width);
        let value = match width {
            1 => INTERESTING_8[self.rng.gen_range(0..INTERESTING_8.len())],
            2 => INTERESTING_16[self.rng.gen_range(0..INTERESTING_16.len())],
            _ => INTERESTING_32[self.rng.gen_range(0..INTERESTING_32.len())],
        };
        let bytes = value.to_le_bytes();
        data[idx..idx + width].copy_from_slice(&bytes[..width]);
    }

    fn byte_invert(&mut self, data: &mut [u8]) {
        let idx = self.rng.gen_range(0..data.len());
        data[idx] = !data[idx];
    }

    fn block_insert(&mut self, data: &mut Vec<u8>) {
        let idx = self.rng.gen_range(0..=data.len());
        let block_len = self.rng.gen_range(1..=16.min(data.len().max(1)));
        let block: Vec<u8> = (0..block_len).map(|_| self.rng.gen()).collect();
        data.splice(idx..idx, block);
    }

    fn block_overwrite(&mut self, data: &mut [u8]) {
        if data.len() < 2 {
            return;
        }
        let block_len = self.rng.gen_range(1..=data.len().min(16));
        let idx = self.rng.gen_range(0..=data.len() - block_len);
        for b in &mut data[idx..idx + block_len] {
            *b = self.rng.gen();
        }
    }

    fn block_delete(&mut self, data: &mut Vec<u8>) {
        if data.len() < 2 {
            return;
        }
        let block_len = self.rng.gen_range(1..data.len());
        let idx = self.rng.gen_range(0..=data.len() - block_len);
        data.drain(idx..idx + block_len);
    }

    fn dictionary_insert(&mut self, data: &mut Vec<u8>) {
        if self.dictionary.is_empty() {
            self.block_insert(data);
            return;
        }
        let token = &self.dictionary[self.rng.gen_range(0..self.dictionary.len())];
        let idx = self.rng.gen_range(0..=data.len());
        data.splice(idx..idx, token.iter().copied());
    }

    fn splice(&mut self, data: &mut Vec<u8>, corpus_sample: Option<&[u8]>) {
        let Some(other) = corpus_sample else {
            self.block_overwrite(data);
            return;
        };
        if other.is_empty() || data.len() < 2 {
            return;
        }
        let split_self = self.rng.gen_range(1..data.len());
        let split_other = self.rng.gen_range(0..other.len());
        data.truncate(split_self);
        data.extend_from_slice(&other[split_other..]);
    }
}

impl Mutator for HavocMutator {
    fn name(&self) -> &str {
        "afl"
    }

    fn mutate(&mut self, input: &[u8], corpus_sample: Option<&[u8]>) -> Result<Vec<u8>> {
        let mut state = HavocState::default();
        self.mutate_with_state(input, &mut state, corpus_sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_returns_empty_on_nonempty_input() {
        let mut mutator = HavocMutator::new(42, Vec::new());
        let mut state = HavocState::default();
        for _ in 0..200 {
            let out = mutator.mutate_with_state(b"hello world", &mut state, None).unwrap();
            assert!(!out.is_empty());
        }
    }

    #[test]
    fn rejects_empty_input() {
        let mut mutator = HavocMutator::new(1, Vec::new());
        let mut state = HavocState::default();
        assert!(mutator.mutate_with_state(b"", &mut state, None).is_err());
    }

    #[test]
    fn stage_cycles_through_all_categories() {
        let mut state = HavocState::default();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..(STAGES.len() * 16) {
            seen.insert(state.current_stage());
            state.advance();
        }
        assert_eq!(seen.len(), STAGES.len());
    }

    #[test]
    fn splice_uses_corpus_sample_when_present() {
        let mut mutator = HavocMutator::new(7, Vec::new());
        let mut data = b"aaaaaaaaaa".to_vec();
        mutator.splice(&mut data, Some(b"bbbbbbbbbb"));
        assert!(data.iter().any(|&b| b == b'b'));
    }

    #[test]
    fn fast_forward_changes_subsequent_draws() {
        let mut a = HavocMutator::new(99, Vec::new());
        let mut b = HavocMutator::new(99, Vec::new());
        b.fast_forward(5);
        let mut sa = HavocState::default();
        let mut sb = HavocState::default();
        let out_a = a.mutate_with_state(b"deterministic", &mut sa, None).unwrap();
        let out_b = b.mutate_with_state(b"deterministic", &mut sb, None).unwrap();
        assert_ne!(out_a, out_b);
    }
}
