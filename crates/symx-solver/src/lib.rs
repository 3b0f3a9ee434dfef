// SPDX-License-Identifier: AGPL-3.0

//! External SMT solver integration: SMT2 query files, a subprocess
//! runner with a hard timeout, and parsing of solver output into models.
//!
//! The in-process solver talks to Z3 through its API; this crate exists
//! for the `--solver-subprocess` fallback, where an `unknown` assertion
//! query is retried by a standalone solver on a dumped SMT2 file.

use num_bigint::BigUint;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

/// Verdict of an external solver run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Sat,
    Unsat,
    Unknown,
    Error(String),
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Sat => write!(f, "sat"),
            Verdict::Unsat => write!(f, "unsat"),
            Verdict::Unknown => write!(f, "unknown"),
            Verdict::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// A constant assignment from a solver model.
#[derive(Debug, Clone)]
pub struct ModelVar {
    pub name: String,
    pub bits: u32,
    pub value: BigUint,
}

/// Model constants keyed by name; BTreeMap keeps reporting order stable.
pub type ModelVars = BTreeMap<String, ModelVar>;

/// Result of an external solver run.
#[derive(Debug)]
pub struct SolverOutput {
    pub verdict: Verdict,
    pub model: Option<ModelVars>,
    /// Whether the model assigned an interpretation to an `f_evm_*`
    /// uninterpreted function (such a model is unusable).
    pub model_valid: bool,
}

/// Parse an SMT2 bitvector literal: `#b1010`, `#xff`, or `(_ bv42 256)`.
pub fn parse_const_value(value: &str) -> Option<BigUint> {
    let value = value.trim();
    if let Some(bits) = value.strip_prefix("#b") {
        return BigUint::parse_bytes(bits.as_bytes(), 2);
    }
    if let Some(digits) = value.strip_prefix("#x") {
        return BigUint::parse_bytes(digits.as_bytes(), 16);
    }
    for token in value.split_whitespace() {
        if let Some(digits) = token.strip_prefix("bv") {
            return BigUint::parse_bytes(digits.as_bytes(), 10);
        }
    }
    None
}

static DEFINE_FUN_CONST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        \(\s*define-fun\s+
        \|?([^\s|()]+)\|?\s+              # constant name
        \(\)\s+
        \(_\s+BitVec\s+(\d+)\s*\)\s+      # sort width
        (                                 # value
            \#b[01]+
            |\#x[0-9a-fA-F]+
            |\(_\s+bv\d+\s+\d+\s*\)
        )",
    )
    .expect("model regex")
});

/// Extract all zero-arity bitvector assignments from solver output.
pub fn parse_model_str(output: &str) -> ModelVars {
    let mut model = ModelVars::new();
    for captures in DEFINE_FUN_CONST.captures_iter(output) {
        let name = captures[1].to_string();
        let bits: u32 = captures[2].parse().unwrap_or(0);
        let Some(value) = parse_const_value(&captures[3]) else {
            continue;
        };
        model.insert(name.clone(), ModelVar { name, bits, value });
    }
    model
}

/// A model is invalid if the solver had to invent an interpretation for
/// one of the uninterpreted arithmetic functions.
pub fn is_output_model_valid(output: &str) -> bool {
    !output.contains("f_evm_")
}

/// Write an SMT2 query file from the solver's serialized assertions.
pub fn dump_query(smtlib: &str, path: &Path) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    writeln!(file, "(set-logic QF_AUFBV)")?;
    writeln!(file, "{}", smtlib)?;
    writeln!(file, "(check-sat)")?;
    writeln!(file, "(get-model)")?;
    Ok(())
}

/// Run an external solver on a query file, with a hard wall-clock
/// timeout. A timeout reports `Unknown`.
pub fn solve_external(
    solver_command: &[String],
    query_file: &Path,
    timeout: Option<Duration>,
) -> SolverOutput {
    if solver_command.is_empty() {
        return SolverOutput {
            verdict: Verdict::Error("empty solver command".to_string()),
            model: None,
            model_valid: false,
        };
    }

    let mut cmd = Command::new(&solver_command[0]);
    cmd.args(&solver_command[1..])
        .arg(query_file)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return SolverOutput {
                verdict: Verdict::Error(format!("failed to spawn solver: {}", e)),
                model: None,
                model_valid: false,
            }
        }
    };

    if let Some(limit) = timeout {
        match wait_timeout::ChildExt::wait_timeout(&mut child, limit) {
            Ok(Some(_status)) => {}
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                return SolverOutput {
                    verdict: Verdict::Unknown,
                    model: None,
                    model_valid: false,
                };
            }
            Err(e) => {
                return SolverOutput {
                    verdict: Verdict::Error(format!("wait error: {}", e)),
                    model: None,
                    model_valid: false,
                }
            }
        }
    }

    let output = match child.wait_with_output() {
        Ok(output) => output,
        Err(e) => {
            return SolverOutput {
                verdict: Verdict::Error(format!("failed to read solver output: {}", e)),
                model: None,
                model_valid: false,
            }
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    from_solver_output(&stdout, &stderr)
}

fn from_solver_output(stdout: &str, stderr: &str) -> SolverOutput {
    match stdout.lines().next().map(str::trim) {
        Some("sat") => SolverOutput {
            verdict: Verdict::Sat,
            model: Some(parse_model_str(stdout)),
            model_valid: is_output_model_valid(stdout),
        },
        Some("unsat") => SolverOutput {
            verdict: Verdict::Unsat,
            model: None,
            model_valid: true,
        },
        Some("unknown") => SolverOutput {
            verdict: Verdict::Unknown,
            model: None,
            model_valid: false,
        },
        _ => SolverOutput {
            verdict: Verdict::Error(stderr.trim().to_string()),
            model: None,
            model_valid: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_const_value() {
        assert_eq!(parse_const_value("#b1010"), Some(BigUint::from(10u8)));
        assert_eq!(parse_const_value("#xff"), Some(BigUint::from(255u8)));
        assert_eq!(
            parse_const_value("(_ bv123 256)"),
            Some(BigUint::from(123u8))
        );
        assert_eq!(parse_const_value("true"), None);
    }

    #[test]
    fn test_parse_const_value_wide() {
        let huge = "#x".to_string() + &"ff".repeat(32);
        let parsed = parse_const_value(&huge).unwrap();
        assert_eq!(parsed.bits(), 256);
    }

    #[test]
    fn test_parse_model() {
        let stdout = r#"sat
(model
  (define-fun p_x_uint256 () (_ BitVec 256) #x000000000000000000000000000000000000000000000000000000000000002a)
  (define-fun |p_y_uint256| () (_ BitVec 256) (_ bv7 256))
)"#;
        let model = parse_model_str(stdout);
        assert_eq!(model.len(), 2);
        assert_eq!(model["p_x_uint256"].value, BigUint::from(42u8));
        assert_eq!(model["p_x_uint256"].bits, 256);
        assert_eq!(model["p_y_uint256"].value, BigUint::from(7u8));
    }

    #[test]
    fn test_model_validity() {
        assert!(is_output_model_valid("sat\n(model (define-fun x () ...))"));
        assert!(!is_output_model_valid(
            "sat\n(model (define-fun f_evm_mul ((x!0 (_ BitVec 256))) ...))"
        ));
    }

    #[test]
    fn test_verdict_parsing() {
        assert_eq!(from_solver_output("unsat\n", "").verdict, Verdict::Unsat);
        assert_eq!(
            from_solver_output("unknown\n", "").verdict,
            Verdict::Unknown
        );
        assert!(matches!(
            from_solver_output("", "boom").verdict,
            Verdict::Error(_)
        ));

        let sat = from_solver_output("sat\n(model )\n", "");
        assert_eq!(sat.verdict, Verdict::Sat);
        assert!(sat.model.is_some());
    }

    #[test]
    fn test_dump_query() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("query.smt2");
        dump_query("(assert true)", &path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("(set-logic QF_AUFBV)"));
        assert!(content.contains("(assert true)"));
        assert!(content.ends_with("(get-model)\n"));
    }

    #[test]
    fn test_solve_external_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("query.smt2");
        dump_query("(assert true)", &path).unwrap();
        let out = solve_external(
            &["definitely-not-a-solver-binary".to_string()],
            &path,
            Some(Duration::from_secs(1)),
        );
        assert!(matches!(out.verdict, Verdict::Error(_)));
    }
}
