// SPDX-License-Identifier: AGPL-3.0

use anyhow::Result;
use clap::Parser;

use symx::artifact::Artifact;
use symx::report::{print_contract_header, print_contract_summary};
use symx::runner::run_contract;
use symx_config::Config;
use symx_logs::color_warn;

fn main() {
    match run() {
        Ok(exitcode) => std::process::exit(exitcode),
        Err(err) => {
            eprintln!("{}", color_warn(&format!("{:#}", err)));
            std::process::exit(2);
        }
    }
}

fn run() -> Result<i32> {
    let cfg = Config::parse();
    let arrlen = cfg.parse_array_lengths()?;
    let artifact = Artifact::load(&cfg.artifact)?;

    let mut total_found = 0usize;
    let mut total_failed = 0usize;

    for (name, contract) in &artifact.contracts {
        if let Some(filter) = &cfg.contract {
            if filter != name {
                continue;
            }
        }
        let funsigs = contract.test_signatures(&cfg.function);
        if funsigs.is_empty() {
            continue;
        }

        print_contract_header(name, funsigs.len());
        total_found += funsigs.len();

        match run_contract(name, contract, &funsigs, &cfg, &arrlen) {
            Ok(results) => {
                let passed = results.iter().filter(|r| r.passed).count();
                let failed = results.len() - passed;
                print_contract_summary(passed, failed);
                total_failed += failed;
            }
            Err(err) => {
                // fatal setUp error: the whole contract is aborted
                eprintln!("{}", color_warn(&err.to_string()));
                total_failed += funsigs.len();
            }
        }
    }

    if total_found == 0 {
        anyhow::bail!(
            "No matching tests found (contract: {}, function: {})",
            cfg.contract.as_deref().unwrap_or("*"),
            cfg.function
        );
    }

    Ok(if total_failed == 0 { 0 } else { 1 })
}
