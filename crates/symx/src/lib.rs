// SPDX-License-Identifier: AGPL-3.0

//! Driver library: build-artifact loading, the setUp/test harness, the
//! counterexample pipeline, and verdict reporting.

pub mod artifact;
pub mod report;
pub mod runner;

pub use artifact::{Artifact, ContractArtifact};
pub use report::TestResult;
pub use runner::{run_contract, run_test, setup};
