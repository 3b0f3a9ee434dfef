// SPDX-License-Identifier: AGPL-3.0

//! Explorer behavior on hand-assembled bytecode: concrete execution,
//! forking at symbolic branches, infeasible-side pruning, loop
//! bounding, budget limits, and stuck states.

use std::rc::Rc;
use z3::{Config as Z3Config, Context};

use symx_config::{ExploreOptions, SmtOptions};
use symx_program::{Program, OP_REVERT, OP_STOP};
use symx_sevm::{Calldata, Exec, Path, Sevm, Worklist};
use symx_word::Word;

fn engine(ctx: &Context) -> Sevm<'_> {
    Sevm::new(ctx, SmtOptions::default(), ExploreOptions::default())
}

fn engine_with(ctx: &Context, explore: ExploreOptions) -> Sevm<'_> {
    Sevm::new(ctx, SmtOptions::default(), explore)
}

fn exec_for<'ctx>(ctx: &'ctx Context, hexcode: &str, calldata: Calldata<'ctx>) -> Exec<'ctx> {
    let program = Rc::new(Program::decode(hexcode).expect("test bytecode"));
    Exec::create(
        ctx,
        program,
        Word::con(0xaa01),
        Word::con(0xbb02),
        calldata,
        Word::con(0),
        Path::new(ctx, 1000),
        true,
    )
}

#[test]
fn concrete_arithmetic_and_sstore() {
    let z3cfg = Z3Config::new();
    let ctx = Context::new(&z3cfg);
    let sevm = engine(&ctx);

    // PUSH1 3, PUSH1 2, ADD, PUSH1 0, SSTORE, STOP
    let ex = exec_for(&ctx, "600360020160005500", Calldata::concrete(None));
    let (terminals, steps) = sevm.run(ex);

    assert_eq!(terminals.len(), 1);
    let terminal = &terminals[0];
    assert_eq!(terminal.halted_opcode(&ctx), OP_STOP);
    assert!(terminal.error.is_none());
    assert!(terminal.stack.is_empty());
    assert_eq!(steps.len(), 6);
    assert_eq!(steps[2].op, "ADD");

    // one storage write happened for the executing account
    let fp = terminal.this_fp(&ctx);
    assert_eq!(terminal.storage.get(&fp).map(|a| a.gen()), Some(1));
}

#[test]
fn symbolic_branch_forks_both_sides() {
    let z3cfg = Z3Config::new();
    let ctx = Context::new(&z3cfg);
    let sevm = engine(&ctx);

    // PUSH1 0, CALLDATALOAD, PUSH1 7, JUMPI, STOP, JUMPDEST, STOP
    let ex = exec_for(&ctx, "600035600757005b00", Calldata::symbolic(&ctx, 100));
    let base_conditions = ex.path.conditions().len();
    let (terminals, _steps) = sevm.run(ex);

    assert_eq!(terminals.len(), 2);
    for terminal in &terminals {
        assert_eq!(terminal.halted_opcode(&ctx), OP_STOP);
        // each side carries exactly one extra branching condition
        assert_eq!(terminal.path.conditions().len(), base_conditions + 1);
    }
}

#[test]
fn concrete_false_condition_takes_one_side() {
    let z3cfg = Z3Config::new();
    let ctx = Context::new(&z3cfg);
    let sevm = engine(&ctx);

    // PUSH1 0, PUSH1 6, JUMPI, STOP, JUMPDEST, STOP
    let ex = exec_for(&ctx, "6000600657005b00", Calldata::concrete(None));
    let (terminals, _steps) = sevm.run(ex);

    assert_eq!(terminals.len(), 1);
    assert_eq!(terminals[0].pc, 5);
}

#[test]
fn unsat_side_is_pruned() {
    let z3cfg = Z3Config::new();
    let ctx = Context::new(&z3cfg);
    let sevm = engine(&ctx);

    let mut ex = exec_for(&ctx, "600035600757005b00", Calldata::symbolic(&ctx, 100));
    // pin the branch word to zero: the jump-taken side becomes unsat
    let word = ex.calldata.load_word(&Word::con(0), &ctx);
    let zero = Word::con(0);
    ex.path.assert(word.eq(&zero, &ctx).to_z3(&ctx), false);

    let (terminals, _steps) = sevm.run(ex);
    assert_eq!(terminals.len(), 1);
    // the surviving path fell through to the STOP at pc 6
    assert_eq!(terminals[0].pc, 6);
}

#[test]
fn loop_bound_limits_retaken_sides() {
    let z3cfg = Z3Config::new();
    let ctx = Context::new(&z3cfg);
    let sevm = engine(&ctx);

    // JUMPDEST, TIMESTAMP, PUSH1 0, JUMPI, STOP - a loop guarded by a
    // fresh symbolic word each iteration
    let ex = exec_for(&ctx, "5b4260005700", Calldata::concrete(None));
    let (terminals, _steps) = sevm.run(ex);

    // with max_loop = 2 the back edge is taken at most twice, so the
    // fall-through STOP is reached exactly three times
    assert_eq!(terminals.len(), 3);
    for terminal in &terminals {
        assert_eq!(terminal.halted_opcode(&ctx), OP_STOP);
        for (_, counts) in &terminal.jumpis {
            assert!(counts.taken <= 2);
            assert!(counts.fallen <= 2);
        }
    }
}

#[test]
fn max_depth_yields_stuck_state() {
    let z3cfg = Z3Config::new();
    let ctx = Context::new(&z3cfg);
    let explore = ExploreOptions {
        max_depth: Some(3),
        ..ExploreOptions::default()
    };
    let sevm = engine_with(&ctx, explore);

    let ex = exec_for(&ctx, "6000600060006000600000", Calldata::concrete(None));
    let (terminals, _steps) = sevm.run(ex);

    assert_eq!(terminals.len(), 1);
    let error = terminals[0].error.as_deref().unwrap_or("");
    assert!(error.contains("max depth"), "got: {}", error);
}

#[test]
fn max_width_yields_stuck_state() {
    let z3cfg = Z3Config::new();
    let ctx = Context::new(&z3cfg);
    let explore = ExploreOptions {
        max_width: Some(1),
        ..ExploreOptions::default()
    };
    let sevm = engine_with(&ctx, explore);

    // the symbolic loop from above would produce three terminals
    let ex = exec_for(&ctx, "5b4260005700", Calldata::concrete(None));
    let (terminals, _steps) = sevm.run(ex);

    assert_eq!(terminals.len(), 2);
    assert!(terminals[0].error.is_none());
    let error = terminals[1].error.as_deref().unwrap_or("");
    assert!(error.contains("max width"), "got: {}", error);
}

#[test]
fn unknown_opcode_goes_stuck() {
    let z3cfg = Z3Config::new();
    let ctx = Context::new(&z3cfg);
    let sevm = engine(&ctx);

    // 0x0c is unassigned
    let ex = exec_for(&ctx, "0c", Calldata::concrete(None));
    let (terminals, _steps) = sevm.run(ex);

    assert_eq!(terminals.len(), 1);
    let error = terminals[0].error.as_deref().unwrap_or("");
    assert!(error.contains("not supported"), "got: {}", error);
}

#[test]
fn stack_underflow_goes_stuck() {
    let z3cfg = Z3Config::new();
    let ctx = Context::new(&z3cfg);
    let sevm = engine(&ctx);

    let ex = exec_for(&ctx, "80", Calldata::concrete(None));
    let (terminals, _steps) = sevm.run(ex);

    assert_eq!(terminals.len(), 1);
    let error = terminals[0].error.as_deref().unwrap_or("");
    assert!(error.contains("stack underflow"), "got: {}", error);
}

#[test]
fn revert_output_is_captured() {
    let z3cfg = Z3Config::new();
    let ctx = Context::new(&z3cfg);
    let sevm = engine(&ctx);

    // MSTORE8(0, 0x42), REVERT(0, 1)
    let ex = exec_for(&ctx, "604260005360016000fd", Calldata::concrete(None));
    let (terminals, _steps) = sevm.run(ex);

    assert_eq!(terminals.len(), 1);
    assert_eq!(terminals[0].halted_opcode(&ctx), OP_REVERT);
    assert_eq!(terminals[0].output_bytes(), Some(vec![0x42]));
}

#[test]
fn exploration_is_deterministic() {
    let run_once = || {
        let z3cfg = Z3Config::new();
        let ctx = Context::new(&z3cfg);
        let sevm = engine(&ctx);
        let ex = exec_for(&ctx, "5b4260005700", Calldata::concrete(None));
        let (terminals, steps) = sevm.run(ex);
        let ops: Vec<String> = steps.iter().map(|s| s.op.clone()).collect();
        let hashes: Vec<Vec<String>> = steps.iter().map(|s| s.stack.clone()).collect();
        (terminals.len(), ops, hashes)
    };

    let first = run_once();
    let second = run_once();
    assert_eq!(first.0, second.0);
    assert_eq!(first.1, second.1);
    assert_eq!(first.2, second.2);
}

#[test]
fn worklist_is_lifo() {
    let mut worklist = Worklist::new();
    worklist.push("a");
    worklist.push("b");
    assert_eq!(worklist.pop(), Some("b"));
    assert_eq!(worklist.pop(), Some("a"));
    assert_eq!(worklist.pop(), None);
}

#[test]
fn jumpi_condition_is_checked_against_path() {
    let z3cfg = Z3Config::new();
    let ctx = Context::new(&z3cfg);
    let sevm = engine(&ctx);

    // two successive branches on the same calldata word: the second
    // branch is decided by the first branch's constraint
    //
    //  0: PUSH1 0, CALLDATALOAD      x
    //  3: DUP1
    //  4: PUSH1 9, JUMPI             if x goto 9
    //  7: POP, STOP                  (x == 0)
    //  9: JUMPDEST
    // 10: PUSH1 15, JUMPI            if x goto 15 (always taken here)
    // 13: STOP (dead), STOP
    // 15: JUMPDEST, STOP
    let hexcode = "6000358060095750005b600f5700005b00";
    let ex = exec_for(&ctx, hexcode, Calldata::symbolic(&ctx, 100));
    let (terminals, _steps) = sevm.run(ex);

    // three is impossible: after taking the first branch, the second
    // branch's zero side is unsat
    assert_eq!(terminals.len(), 2);
    let mut pcs: Vec<usize> = terminals.iter().map(|t| t.pc).collect();
    pcs.sort();
    assert_eq!(pcs, vec![8, 16]);
}
