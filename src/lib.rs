//! manul, a parallel coverage-guided mutational fuzzer for instrumented
//! native binaries.

pub mod bitmap;
pub mod classifier;
pub mod cli;
pub mod corpus;
pub mod dictionary;
pub mod error;
pub mod mutator;
pub mod platform;
pub mod stats;
pub mod supervisor;
pub mod target_runner;
pub mod worker;
