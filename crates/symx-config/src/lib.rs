// SPDX-License-Identifier: AGPL-3.0

//! Configuration: command-line options and the engine knobs derived from
//! them.

use anyhow::{bail, Result};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;

use symx_constants::{
    DEFAULT_EXP_BY_CONST, DEFAULT_LOOP_BOUND, DEFAULT_TIMEOUT_ASSERTION_MS,
    DEFAULT_TIMEOUT_BRANCHING_MS,
};

/// How an arithmetic operator is encoded for the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    /// The solver's native bitvector operator.
    Native,
    /// An uninterpreted function `f_evm_<op>`.
    Uf,
}

/// Per-operator SMT encoding choices. Defaults: add/sub/mul native,
/// div uninterpreted.
#[derive(Debug, Clone, Copy)]
pub struct SmtOptions {
    pub add: OpMode,
    pub sub: OpMode,
    pub mul: OpMode,
    pub div: OpMode,
    pub div_by_const: bool,
    pub mod_by_const: bool,
    pub exp_by_const: u32,
}

impl Default for SmtOptions {
    fn default() -> Self {
        Self {
            add: OpMode::Native,
            sub: OpMode::Native,
            mul: OpMode::Native,
            div: OpMode::Uf,
            div_by_const: false,
            mod_by_const: false,
            exp_by_const: DEFAULT_EXP_BY_CONST,
        }
    }
}

/// Path exploration budgets and solver timeouts.
#[derive(Debug, Clone, Copy)]
pub struct ExploreOptions {
    pub max_loop: usize,
    pub max_width: Option<usize>,
    pub max_depth: Option<usize>,
    pub timeout_branching_ms: u32,
    pub timeout_assertion_ms: u32,
}

impl Default for ExploreOptions {
    fn default() -> Self {
        Self {
            max_loop: DEFAULT_LOOP_BOUND,
            max_width: None,
            max_depth: None,
            timeout_branching_ms: DEFAULT_TIMEOUT_BRANCHING_MS,
            timeout_assertion_ms: DEFAULT_TIMEOUT_ASSERTION_MS,
        }
    }
}

/// Command-line configuration.
#[derive(Debug, Clone, Parser)]
#[clap(
    name = "symx",
    version,
    about = "Symbolic execution of EVM property tests"
)]
pub struct Config {
    /// Build artifact JSON file (bytecode, ABI, source maps, selectors)
    pub artifact: PathBuf,

    /// Run tests in the given contract only
    #[clap(long)]
    pub contract: Option<String>,

    /// Run tests matching the given prefix only
    #[clap(long, default_value = "test")]
    pub function: String,

    /// Set loop unrolling bounds
    #[clap(long = "loop", default_value_t = DEFAULT_LOOP_BOUND)]
    pub loop_bound: usize,

    /// Set the max number of paths
    #[clap(long)]
    pub width: Option<usize>,

    /// Set the max path length
    #[clap(long)]
    pub depth: Option<usize>,

    /// Set the length of dynamic-sized arrays including bytes and string
    /// (default: loop unrolling bound), e.g. name1=32,name2=1024
    #[clap(long)]
    pub array_lengths: Option<String>,

    /// Do not interpret `+`
    #[clap(long)]
    pub no_smt_add: bool,

    /// Do not interpret `-`
    #[clap(long)]
    pub no_smt_sub: bool,

    /// Do not interpret `*`
    #[clap(long)]
    pub no_smt_mul: bool,

    /// Interpret `/`
    #[clap(long)]
    pub smt_div: bool,

    /// Interpret division by constant
    #[clap(long)]
    pub smt_div_by_const: bool,

    /// Interpret constant modulo
    #[clap(long)]
    pub smt_mod_by_const: bool,

    /// Interpret constant power up to N
    #[clap(long, default_value_t = DEFAULT_EXP_BY_CONST)]
    pub smt_exp_by_const: u32,

    /// Timeout (in milliseconds) for solving branching conditions
    #[clap(long, default_value_t = DEFAULT_TIMEOUT_BRANCHING_MS)]
    pub solver_timeout_branching: u32,

    /// Timeout (in milliseconds) for solving assertion violation conditions
    #[clap(long, default_value_t = DEFAULT_TIMEOUT_ASSERTION_MS)]
    pub solver_timeout_assertion: u32,

    /// Run an extra solver in subprocess for unknown
    #[clap(long)]
    pub solver_subprocess: bool,

    /// Increase verbosity levels: -v, -vv, -vvv, -vvvv
    #[clap(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Run in debug mode
    #[clap(long)]
    pub debug: bool,

    /// Log individual execution steps in JSON
    #[clap(long)]
    pub log: Option<PathBuf>,

    /// Print reverting paths in verbose mode
    #[clap(long)]
    pub print_revert: bool,
}

impl Config {
    pub fn smt_options(&self) -> SmtOptions {
        let mode = |uninterpreted: bool| {
            if uninterpreted {
                OpMode::Uf
            } else {
                OpMode::Native
            }
        };
        SmtOptions {
            add: mode(self.no_smt_add),
            sub: mode(self.no_smt_sub),
            mul: mode(self.no_smt_mul),
            div: mode(!self.smt_div),
            div_by_const: self.smt_div_by_const,
            mod_by_const: self.smt_mod_by_const,
            exp_by_const: self.smt_exp_by_const,
        }
    }

    pub fn explore_options(&self) -> ExploreOptions {
        ExploreOptions {
            max_loop: self.loop_bound,
            max_width: self.width,
            max_depth: self.depth,
            timeout_branching_ms: self.solver_timeout_branching,
            timeout_assertion_ms: self.solver_timeout_assertion,
        }
    }

    /// Parse `--array-lengths name1=len1,name2=len2` into a map.
    pub fn parse_array_lengths(&self) -> Result<HashMap<String, usize>> {
        let mut arrlen = HashMap::new();
        if let Some(spec) = &self.array_lengths {
            for assign in spec.split(',') {
                let assign = assign.trim();
                if assign.is_empty() {
                    continue;
                }
                let Some((name, size)) = assign.split_once('=') else {
                    bail!("invalid --array-lengths entry: {}", assign);
                };
                let size: usize = size
                    .trim()
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid array length: {}", size))?;
                arrlen.insert(name.trim().to_string(), size);
            }
        }
        Ok(arrlen)
    }
}
