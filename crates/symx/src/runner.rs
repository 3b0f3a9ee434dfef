// SPDX-License-Identifier: AGPL-3.0

//! The setUp/test harness and the counterexample pipeline.
//!
//! `setup` runs the concrete setUp() frame and must observe exactly one
//! normally-terminating path. `run_test` overlays a symbolic calldata
//! frame for the tested function onto that state, explores all paths,
//! classifies each terminal, and tries to extract a model for every
//! candidate violation: incremental check, fresh-solver retry with the
//! assertion timeout, axiomatized repair for models that interpreted the
//! uninterpreted arithmetic, and optionally an external solver
//! subprocess.

use num_bigint::BigUint;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use z3::ast::{Ast, Bool, BV};
use z3::{Context, Model, SatResult};

use symx_calldata::{layout_calldata, parse_selector};
use symx_config::Config;
use symx_constants::{CALLDATA_SIZE, PANIC_ASSERT};
use symx_errors::{SymxError, SymxResult};
use symx_program::{mnemonic, Program, OP_RETURN, OP_REVERT, OP_SELFDESTRUCT, OP_STOP};
use symx_sevm::{repair_axioms, ArithUfs, Calldata, Exec, Memory, Path, Sevm, Step};
use symx_solver::Verdict;
use symx_word::Word;

use crate::artifact::ContractArtifact;
use crate::report::TestResult;

/// Outcome of the model search for one candidate violation.
pub enum ModelOutcome {
    /// The violation constraint is unsatisfiable.
    Refuted,
    /// A valid model, already rendered for display.
    Model(String),
    /// sat-with-invalid-model or unknown.
    Unknown,
}

/// Variables eligible for counterexample display.
pub struct ModelScope<'ctx> {
    /// `p_*` input variables from the calldata layout.
    pub inputs: Vec<(String, Word<'ctx>)>,
    /// `msg_*` / `this_*` variables, shown in verbose mode.
    pub extras: Vec<(String, Word<'ctx>)>,
    pub verbose: bool,
    pub debug: bool,
}

/// Run setUp() concretely. The resulting state seeds every test run.
pub fn setup<'ctx>(
    sevm: &Sevm<'ctx>,
    contract: &ContractArtifact,
    cfg: &Config,
) -> SymxResult<Exec<'ctx>> {
    let ctx = sevm.ctx;

    let mut program = Program::decode(&contract.hexcode)?;
    program.attach_srcmap(&contract.srcmap);
    let program = Rc::new(program);

    let mut path = Path::new(ctx, cfg.solver_timeout_branching);

    // test addresses live in the low 160 bits
    let caller = Word::fresh(ctx, "msg_sender", 256);
    path.assert(high_bits_zero(ctx, &caller), false);
    let this = Word::fresh(ctx, "this_address", 256);
    path.assert(high_bits_zero(ctx, &this), false);

    let setup_selector = contract
        .method_identifiers
        .get("setUp()")
        .map(|hex| parse_selector(hex))
        .transpose()?;

    let calldata = Calldata::concrete(setup_selector);
    let ex = Exec::create(ctx, program, this, caller, calldata, Word::con(0), path, false);

    if setup_selector.is_none() {
        return Ok(ex);
    }

    let (mut terminals, _steps) = sevm.run(ex);
    if terminals.len() != 1 {
        if cfg.debug {
            for terminal in &terminals {
                symx_logs::debug(&format!(
                    "setUp path: pc={} error={:?}",
                    terminal.pc, terminal.error
                ));
            }
        }
        return Err(SymxError::Setup("multiple paths exist in setUp()".to_string()));
    }

    let ex = terminals.remove(0);
    let opcode = ex.halted_opcode(ctx);
    if !(opcode == OP_STOP || opcode == OP_RETURN) || ex.failed || ex.error.is_some() {
        return Err(SymxError::Setup("setUp() failed".to_string()));
    }
    Ok(ex)
}

fn high_bits_zero<'ctx>(ctx: &'ctx Context, word: &Word<'ctx>) -> Bool<'ctx> {
    word.to_bv(ctx)
        .extract(255, 160)
        ._eq(&BV::from_u64(ctx, 0, 96))
}

/// Symbolically execute one test function and classify the result.
pub fn run_test<'ctx>(
    sevm: &Sevm<'ctx>,
    setup_ex: &Exec<'ctx>,
    contract: &ContractArtifact,
    funsig: &str,
    selector_hex: &str,
    arrlen: &HashMap<String, usize>,
    cfg: &Config,
) -> SymxResult<TestResult> {
    let ctx = sevm.ctx;
    let funname = funsig.split('(').next().unwrap_or(funsig);
    let selector = parse_selector(selector_hex)?;

    let mut calldata = Calldata::symbolic(ctx, CALLDATA_SIZE);
    calldata.write_selector(selector);
    let layout = layout_calldata(ctx, &contract.abi, funname, arrlen, cfg.loop_bound)?;
    for write in &layout.writes {
        calldata.write_word(write.offset, write.len, &write.word, ctx);
    }

    let callvalue = Word::fresh(ctx, "msg_value", 256);
    let this_balance = Word::fresh(ctx, "this_balance", 256);
    let seeded_balance = sevm.add(&this_balance, &callvalue);

    let fp = setup_ex.this_fp(ctx);
    let mut balance = indexmap::IndexMap::new();
    balance.insert(fp, seeded_balance);

    let ex = Exec {
        pgm: setup_ex.pgm.clone(),
        storage: setup_ex.storage.clone(),
        balance,
        calldata,
        callvalue: callvalue.clone(),
        caller: setup_ex.caller.clone(),
        this: setup_ex.this.clone(),
        pc: 0,
        stack: Vec::new(),
        memory: Memory::new(),
        returndata: None,
        jumpis: indexmap::IndexMap::new(),
        output: None,
        failed: setup_ex.failed,
        error: setup_ex.error.clone(),
        log: setup_ex.log.clone(),
        path: setup_ex.path.reload(cfg.solver_timeout_branching),
        cnts: setup_ex.cnts.clone(),
        sha3s: setup_ex.sha3s.clone(),
        storage_reads: setup_ex.storage_reads.clone(),
        calls: setup_ex.calls.clone(),
        symbolic: true,
        steps_taken: 0,
    };

    let start = Instant::now();
    let (terminals, steps) = sevm.run(ex);
    let elapsed = start.elapsed().as_secs_f64();

    if let Some(log_path) = &cfg.log {
        write_step_log(log_path, &steps)?;
    }

    let scope = ModelScope {
        inputs: layout.inputs.clone(),
        extras: vec![
            ("msg_sender".to_string(), setup_ex.caller.clone()),
            ("msg_value".to_string(), callvalue),
            ("this_address".to_string(), setup_ex.this.clone()),
            ("this_balance".to_string(), this_balance),
        ],
        verbose: cfg.verbose >= 1,
        debug: cfg.debug,
    };

    let mut normal = 0usize;
    let mut counterexamples: Vec<Option<String>> = Vec::new();
    let mut unsupported: Vec<String> = Vec::new();

    for terminal in &terminals {
        if let Some(error) = &terminal.error {
            unsupported.push(format!(
                "{} {}",
                mnemonic(terminal.halted_opcode(ctx)),
                error
            ));
            continue;
        }
        match terminal.halted_opcode(ctx) {
            OP_STOP | OP_RETURN | OP_SELFDESTRUCT => {
                if terminal.failed {
                    record_candidate(sevm, terminal, &scope, cfg, &mut counterexamples);
                } else {
                    normal += 1;
                }
            }
            OP_REVERT => {
                // the assert(false) encoding: Panic(uint256) with code 1
                if terminal.output_bytes().as_deref() == Some(&PANIC_ASSERT[..]) {
                    record_candidate(sevm, terminal, &scope, cfg, &mut counterexamples);
                }
                // other reverts are preconditions, not violations
            }
            opcode => {
                unsupported.push(mnemonic(opcode));
            }
        }
    }

    if cfg.verbose >= 2 {
        for (idx, terminal) in terminals.iter().enumerate() {
            let reverted = terminal.halted_opcode(ctx) == OP_REVERT;
            if (reverted || terminal.failed) && !cfg.print_revert {
                continue;
            }
            symx_logs::debug(&format!(
                "# {} / {}\npc: {} ({})\npath:\n{}",
                idx + 1,
                terminals.len(),
                terminal.pc,
                mnemonic(terminal.halted_opcode(ctx)),
                terminal.path.branch_trail()
            ));
        }
    }

    let passed = normal > 0 && counterexamples.is_empty() && unsupported.is_empty();
    Ok(TestResult {
        name: funsig.to_string(),
        passed,
        normal,
        total: terminals.len(),
        time_secs: elapsed,
        bounds: layout.dyn_bounds,
        counterexamples,
        unsupported,
    })
}

fn record_candidate<'ctx>(
    sevm: &Sevm<'ctx>,
    ex: &Exec<'ctx>,
    scope: &ModelScope<'ctx>,
    cfg: &Config,
    counterexamples: &mut Vec<Option<String>>,
) {
    match gen_model(sevm, ex, scope, cfg) {
        ModelOutcome::Refuted => {}
        ModelOutcome::Model(rendered) => counterexamples.push(Some(rendered)),
        ModelOutcome::Unknown => counterexamples.push(None),
    }
}

/// The model search for one candidate violation: check, retry with the
/// assertion timeout, axiomatized repair, optional external solver.
pub fn gen_model<'ctx>(
    sevm: &Sevm<'ctx>,
    ex: &Exec<'ctx>,
    scope: &ModelScope<'ctx>,
    cfg: &Config,
) -> ModelOutcome {
    let ctx = sevm.ctx;

    let mut res = ex.path.check();
    let mut model = match res {
        SatResult::Sat => ex.path.get_model(),
        _ => None,
    };

    if res == SatResult::Unknown {
        let retry = ex.path.reload(cfg.solver_timeout_assertion);
        res = retry.check();
        if res == SatResult::Sat {
            model = retry.get_model();
        }
    }

    if res == SatResult::Sat
        && !model
            .as_ref()
            .map_or(false, |m| is_valid_model(m, &sevm.ufs))
    {
        // the model interpreted the uninterpreted arithmetic; retry with
        // the monotone bounds axioms
        let mut repair = ex.path.reload(cfg.solver_timeout_assertion);
        for axiom in repair_axioms(ctx, &sevm.ufs) {
            repair.assert(axiom, false);
        }
        res = repair.check();
        model = match res {
            SatResult::Sat => repair.get_model(),
            _ => None,
        };
    }

    if res == SatResult::Unknown && cfg.solver_subprocess {
        static QUERY_ID: AtomicUsize = AtomicUsize::new(0);
        let query_file = std::env::temp_dir().join(format!(
            "symx-{}-{}.smt2",
            std::process::id(),
            QUERY_ID.fetch_add(1, Ordering::Relaxed)
        ));
        if symx_solver::dump_query(&ex.path.smt2(), &query_file).is_ok() {
            if cfg.verbose >= 4 {
                symx_logs::debug(&format!("z3 {}", query_file.display()));
            }
            let timeout = Duration::from_millis(cfg.solver_timeout_assertion as u64);
            let output =
                symx_solver::solve_external(&["z3".to_string()], &query_file, Some(timeout));
            match output.verdict {
                Verdict::Unsat => res = SatResult::Unsat,
                Verdict::Sat => {
                    if output.model_valid {
                        if let Some(vars) = output.model {
                            return ModelOutcome::Model(render_external_model(&vars, scope));
                        }
                    }
                    return ModelOutcome::Unknown;
                }
                _ => {}
            }
        }
    }

    match res {
        SatResult::Unsat => ModelOutcome::Refuted,
        SatResult::Sat => match model {
            Some(model) if is_valid_model(&model, &sevm.ufs) => {
                ModelOutcome::Model(render_model(ctx, &model, ex, scope))
            }
            _ => ModelOutcome::Unknown,
        },
        SatResult::Unknown => ModelOutcome::Unknown,
    }
}

/// A model is valid only when the solver did not have to invent an
/// interpretation for any `f_evm_*` function.
pub fn is_valid_model<'ctx>(model: &Model<'ctx>, ufs: &ArithUfs<'ctx>) -> bool {
    ufs.all()
        .into_iter()
        .all(|decl| model.get_func_interp(decl).is_none())
}

/// Render the model restricted to `p_*` inputs (plus `storage*`,
/// `msg_*`, `this_*` in verbose mode), sorted by name.
fn render_model<'ctx>(
    ctx: &'ctx Context,
    model: &Model<'ctx>,
    ex: &Exec<'ctx>,
    scope: &ModelScope<'ctx>,
) -> String {
    if scope.debug {
        return format!("{}", model);
    }

    let mut consider: Vec<(String, Word<'ctx>)> = scope.inputs.clone();
    if scope.verbose {
        consider.extend(scope.extras.iter().cloned());
        consider.extend(
            ex.storage_reads
                .iter()
                .map(|(name, word)| (name.clone(), word.clone())),
        );
    }

    let mut entries = Vec::new();
    for (name, word) in consider {
        let term = word.to_bv(ctx);
        let Some(value) = model.eval(&term, false) else {
            continue;
        };
        if let Some(number) = numeral_value(&value.to_string()) {
            entries.push(format!("{} = {}", name, number));
        }
    }
    entries.sort();
    format!("[{}]", entries.join(", "))
}

fn render_external_model(vars: &symx_solver::ModelVars, scope: &ModelScope<'_>) -> String {
    let mut entries = Vec::new();
    for var in vars.values() {
        let shown = var.name.starts_with("p_")
            || (scope.verbose
                && (var.name.starts_with("storage")
                    || var.name.starts_with("msg_")
                    || var.name.starts_with("this_")));
        if shown {
            entries.push(format!("{} = {}", var.name, var.value));
        }
    }
    entries.sort();
    format!("[{}]", entries.join(", "))
}

/// Parse a printed Z3 numeral (`#x...`, `#b...`, or decimal digits).
fn numeral_value(printed: &str) -> Option<BigUint> {
    let printed = printed.trim();
    if let Some(digits) = printed.strip_prefix("#x") {
        return BigUint::parse_bytes(digits.as_bytes(), 16);
    }
    if let Some(bits) = printed.strip_prefix("#b") {
        return BigUint::parse_bytes(bits.as_bytes(), 2);
    }
    if printed.bytes().all(|b| b.is_ascii_digit()) {
        return BigUint::parse_bytes(printed.as_bytes(), 10);
    }
    None
}

fn write_step_log(path: &std::path::Path, steps: &[Step]) -> SymxResult<()> {
    let file = std::fs::File::create(path)
        .map_err(|e| SymxError::Internal(format!("cannot write step log: {}", e)))?;
    serde_json::to_writer(file, steps)
        .map_err(|e| SymxError::Internal(format!("cannot write step log: {}", e)))
}

/// Run every matching test of one contract, printing verdicts as they
/// come. A setUp failure aborts the whole contract.
pub fn run_contract(
    name: &str,
    contract: &ContractArtifact,
    funsigs: &[String],
    cfg: &Config,
    arrlen: &HashMap<String, usize>,
) -> SymxResult<Vec<TestResult>> {
    let z3cfg = z3::Config::new();
    let ctx = Context::new(&z3cfg);
    let sevm = Sevm::new(&ctx, cfg.smt_options(), cfg.explore_options());

    let setup_ex = setup(&sevm, contract, cfg)?;
    if cfg.verbose >= 2 {
        symx_logs::debug(&format!("{} setUp complete", name));
    }

    let mut results = Vec::new();
    for funsig in funsigs {
        let selector_hex = contract
            .method_identifiers
            .get(funsig)
            .cloned()
            .ok_or_else(|| SymxError::Artifact(format!("no selector for {}", funsig)))?;
        let result = match run_test(&sevm, &setup_ex, contract, funsig, &selector_hex, arrlen, cfg)
        {
            Ok(result) => result,
            Err(err) => TestResult {
                name: funsig.clone(),
                passed: false,
                normal: 0,
                total: 0,
                time_secs: 0.0,
                bounds: Vec::new(),
                counterexamples: Vec::new(),
                unsupported: vec![err.to_string()],
            },
        };
        crate::report::print_test(&result);
        results.push(result);
    }
    Ok(results)
}
