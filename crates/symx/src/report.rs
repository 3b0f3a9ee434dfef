// SPDX-License-Identifier: AGPL-3.0

//! Verdict reporting.

use symx_logs::{color_good, color_warn};

/// The outcome of one symbolic test.
#[derive(Debug)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    /// Terminal states that halted normally without a failure flag.
    pub normal: usize,
    /// All terminal states.
    pub total: usize,
    pub time_secs: f64,
    /// Bound sizes of dynamic parameters, e.g. `|data|=64`.
    pub bounds: Vec<String>,
    /// One entry per candidate violation that survived the solver; None
    /// means the solver answered unknown.
    pub counterexamples: Vec<Option<String>>,
    /// Stuck states and unsupported inputs.
    pub unsupported: Vec<String>,
}

pub fn print_test(result: &TestResult) {
    let verdict = if result.passed {
        color_good("[PASS]")
    } else {
        color_warn("[FAIL]")
    };
    println!(
        "{} {} (paths: {}/{}, time: {:.2}s, bounds: [{}])",
        verdict,
        result.name,
        result.normal,
        result.total,
        result.time_secs,
        result.bounds.join(", ")
    );
    for counterexample in &result.counterexamples {
        match counterexample {
            Some(model) => println!("{}", color_warn(&format!("Counterexample: {}", model))),
            None => println!("{}", color_warn("Counterexample: unknown")),
        }
    }
    for message in &result.unsupported {
        println!("{}", color_warn(&format!("Not supported: {}", message)));
    }
}

pub fn print_contract_header(name: &str, test_count: usize) {
    println!("\nRunning {} tests for {}", test_count, name);
}

pub fn print_contract_summary(passed: usize, failed: usize) {
    println!("Symbolic test result: {} passed; {} failed", passed, failed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_shape() {
        let result = TestResult {
            name: "test_ok()".to_string(),
            passed: true,
            normal: 1,
            total: 2,
            time_secs: 0.01,
            bounds: vec!["|b|=64".to_string()],
            counterexamples: Vec::new(),
            unsupported: Vec::new(),
        };
        // printing must not panic
        print_test(&result);
        assert!(result.passed);
    }
}
