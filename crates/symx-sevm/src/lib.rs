// SPDX-License-Identifier: AGPL-3.0

//! The symbolic EVM: execution states, the opcode interpreter, and the
//! depth-first path explorer.
//!
//! `Sevm::run` drives a worklist of partially executed states. A state
//! forks at a symbolic JUMPI after per-side feasibility checks, is
//! retired when it reaches STOP/RETURN/REVERT/INVALID, and goes stuck
//! (with the reason recorded) when it hits an unsupported opcode or a
//! budget limit. Exploration order is deterministic; fresh-variable
//! names depend on it.

use indexmap::IndexMap;
use serde::Serialize;
use std::rc::Rc;
use z3::ast::Ast;
use z3::{Context, FuncDecl, Sort};

use symx_config::{ExploreOptions, OpMode, SmtOptions};
use symx_constants::EMPTY_KECCAK;
use symx_errors::SymxResult;
use symx_program::{Program, OP_JUMPI, OP_STOP};
use symx_word::{apply_uf, SymByte, Word};

mod memory;
mod opcodes;
mod path;
mod storage;
mod worklist;

pub use memory::{Calldata, Memory};
pub use path::Path;
pub use storage::StorageAccount;
pub use worklist::Worklist;

/// The uninterpreted arithmetic functions, declared once per context.
pub struct ArithUfs<'ctx> {
    pub add: FuncDecl<'ctx>,
    pub sub: FuncDecl<'ctx>,
    pub mul: FuncDecl<'ctx>,
    pub div: FuncDecl<'ctx>,
    pub rem: FuncDecl<'ctx>,
    pub sdiv: FuncDecl<'ctx>,
    pub smod: FuncDecl<'ctx>,
    pub exp: FuncDecl<'ctx>,
}

impl<'ctx> ArithUfs<'ctx> {
    pub fn declare(ctx: &'ctx Context) -> Self {
        let bv = Sort::bitvector(ctx, 256);
        let binop = |name: &str| FuncDecl::new(ctx, name, &[&bv, &bv], &bv);
        Self {
            add: binop("f_evm_add"),
            sub: binop("f_evm_sub"),
            mul: binop("f_evm_mul"),
            div: binop("f_evm_div"),
            rem: binop("f_evm_mod"),
            sdiv: binop("f_evm_sdiv"),
            smod: binop("f_evm_smod"),
            exp: binop("f_evm_exp"),
        }
    }

    /// All declared functions, for model validity checks.
    pub fn all(&self) -> [&FuncDecl<'ctx>; 8] {
        [
            &self.add, &self.sub, &self.mul, &self.div, &self.rem, &self.sdiv, &self.smod,
            &self.exp,
        ]
    }
}

/// The two monotone bounds asserted in the counterexample-repair solver:
/// `forall x,y. f_evm_div(x,y) <=u x` and `forall x,y. f_evm_mod(x,y) <=u y`.
/// The main branching solver never sees quantifiers.
pub fn repair_axioms<'ctx>(ctx: &'ctx Context, ufs: &ArithUfs<'ctx>) -> Vec<z3::ast::Bool<'ctx>> {
    use z3::ast::{forall_const, BV};
    let x = BV::new_const(ctx, "x", 256);
    let y = BV::new_const(ctx, "y", 256);
    let div = apply_uf(&ufs.div, &[x.clone(), y.clone()]);
    let rem = apply_uf(&ufs.rem, &[x.clone(), y.clone()]);
    let bounds: [&dyn Ast<'ctx>; 2] = [&x, &y];
    vec![
        forall_const(ctx, &bounds, &[], &div.bvule(&x)),
        forall_const(ctx, &bounds, &[], &rem.bvule(&y)),
    ]
}

/// How many times each side of a JUMPI has been taken on this path.
#[derive(Clone, Copy, Debug, Default)]
pub struct BranchTaken {
    pub taken: usize,
    pub fallen: usize,
}

/// A SHA3 computation already modelled on this path.
#[derive(Clone, Debug)]
pub struct Sha3Entry<'ctx> {
    pub input: Word<'ctx>,
    pub fp: u64,
    pub output: Word<'ctx>,
}

/// An external call made with a symbolic result.
#[derive(Clone, Debug)]
pub struct CallRecord<'ctx> {
    pub op: String,
    pub target: Word<'ctx>,
    pub success: Word<'ctx>,
}

/// One emitted event.
#[derive(Clone, Debug)]
pub struct LogRecord<'ctx> {
    pub topics: Vec<Word<'ctx>>,
    pub data: Vec<SymByte<'ctx>>,
}

/// One entry of the step trail (`--log`).
#[derive(Clone, Debug, Serialize)]
pub struct Step {
    pub pc: usize,
    pub op: String,
    pub stack: Vec<String>,
}

/// A single symbolic execution state.
#[derive(Clone)]
pub struct Exec<'ctx> {
    /// Program per account, keyed by the address term's fingerprint.
    /// Each program carries both views: the opcode-at-pc map and the raw
    /// code bytes for CODECOPY.
    pub pgm: IndexMap<u64, Rc<Program>>,
    pub storage: IndexMap<u64, StorageAccount<'ctx>>,
    pub balance: IndexMap<u64, Word<'ctx>>,

    pub calldata: Calldata<'ctx>,
    pub callvalue: Word<'ctx>,
    pub caller: Word<'ctx>,
    pub this: Word<'ctx>,

    pub pc: usize,
    pub stack: Vec<Word<'ctx>>,
    pub memory: Memory<'ctx>,
    pub returndata: Option<Vec<SymByte<'ctx>>>,

    pub jumpis: IndexMap<usize, BranchTaken>,
    pub output: Option<Vec<SymByte<'ctx>>>,
    pub failed: bool,
    pub error: Option<String>,
    pub log: Vec<LogRecord<'ctx>>,

    pub path: Path<'ctx>,
    pub cnts: IndexMap<String, usize>,
    pub sha3s: Vec<Sha3Entry<'ctx>>,
    pub storage_reads: IndexMap<String, Word<'ctx>>,
    pub calls: Vec<CallRecord<'ctx>>,

    /// false during the concrete setUp run, true during the test run.
    pub symbolic: bool,
    pub steps_taken: usize,
}

impl<'ctx> Exec<'ctx> {
    /// A fresh state at pc 0 for one account.
    pub fn create(
        ctx: &'ctx Context,
        program: Rc<Program>,
        this: Word<'ctx>,
        caller: Word<'ctx>,
        calldata: Calldata<'ctx>,
        callvalue: Word<'ctx>,
        path: Path<'ctx>,
        symbolic: bool,
    ) -> Self {
        let fp = this.fingerprint(ctx);
        let mut pgm = IndexMap::new();
        pgm.insert(fp, program);
        let mut balance = IndexMap::new();
        balance.insert(fp, Word::con(0));
        Self {
            pgm,
            storage: IndexMap::new(),
            balance,
            calldata,
            callvalue,
            caller,
            this,
            pc: 0,
            stack: Vec::new(),
            memory: Memory::new(),
            returndata: None,
            jumpis: IndexMap::new(),
            output: None,
            failed: false,
            error: None,
            log: Vec::new(),
            path,
            cnts: IndexMap::new(),
            sha3s: Vec::new(),
            storage_reads: IndexMap::new(),
            calls: Vec::new(),
            symbolic,
            steps_taken: 0,
        }
    }

    pub fn this_fp(&self, ctx: &'ctx Context) -> u64 {
        self.this.fingerprint(ctx)
    }

    pub fn program(&self, ctx: &'ctx Context) -> Option<Rc<Program>> {
        self.pgm.get(&self.this_fp(ctx)).cloned()
    }

    /// The opcode at the current pc; positions past the end behave as
    /// STOP. Used for terminal-state classification.
    pub fn halted_opcode(&self, ctx: &'ctx Context) -> u8 {
        self.program(ctx).map(|p| p.op_at(self.pc)).unwrap_or(OP_STOP)
    }

    /// Concrete output bytes, if the whole output is concrete.
    pub fn output_bytes(&self) -> Option<Vec<u8>> {
        self.output
            .as_ref()
            .map(|bytes| bytes.iter().map(|b| b.as_con()).collect::<Option<Vec<u8>>>())
            .unwrap_or(None)
    }

    pub fn push(&mut self, word: Word<'ctx>) -> SymxResult<()> {
        if self.stack.len() >= symx_constants::MAX_STACK {
            return Err(symx_errors::SymxError::StackOverflow);
        }
        self.stack.push(word);
        Ok(())
    }

    pub fn pop(&mut self) -> SymxResult<Word<'ctx>> {
        self.stack.pop().ok_or(symx_errors::SymxError::StackUnderflow)
    }

    pub fn peek(&self, n: usize) -> SymxResult<Word<'ctx>> {
        if self.stack.len() < n {
            return Err(symx_errors::SymxError::StackUnderflow);
        }
        Ok(self.stack[self.stack.len() - n].clone())
    }

    /// Monotone per-kind naming for fresh symbolic constants.
    pub fn fresh_word(&mut self, ctx: &'ctx Context, kind: &str) -> Word<'ctx> {
        let counter = self.cnts.entry(kind.to_string()).or_insert(0);
        let name = format!("{}_{}", kind, counter);
        *counter += 1;
        Word::fresh(ctx, &name, 256)
    }

    fn record_step(&self, ctx: &'ctx Context, op: String) -> Step {
        Step {
            pc: self.pc,
            op,
            stack: self
                .stack
                .iter()
                .map(|w| format!("{:016x}", w.fingerprint(ctx)))
                .collect(),
        }
    }
}

/// The symbolic EVM engine. One instance per test contract; execution
/// states own their solvers, the engine owns the per-context
/// uninterpreted function declarations.
pub struct Sevm<'ctx> {
    pub ctx: &'ctx Context,
    pub smt: SmtOptions,
    pub explore: ExploreOptions,
    pub ufs: ArithUfs<'ctx>,
}

impl<'ctx> Sevm<'ctx> {
    pub fn new(ctx: &'ctx Context, smt: SmtOptions, explore: ExploreOptions) -> Self {
        Self {
            ctx,
            smt,
            explore,
            ufs: ArithUfs::declare(ctx),
        }
    }

    pub(crate) fn add_uf(&self) -> Option<&FuncDecl<'ctx>> {
        (self.smt.add == OpMode::Uf).then_some(&self.ufs.add)
    }

    pub(crate) fn sub_uf(&self) -> Option<&FuncDecl<'ctx>> {
        (self.smt.sub == OpMode::Uf).then_some(&self.ufs.sub)
    }

    pub(crate) fn mul_uf(&self) -> Option<&FuncDecl<'ctx>> {
        (self.smt.mul == OpMode::Uf).then_some(&self.ufs.mul)
    }

    /// DIV dispatch: `div_by_const` forces the native operator for a
    /// concrete non-zero divisor regardless of the `div` mode.
    pub(crate) fn div_uf(&self, divisor: &Word<'ctx>) -> Option<&FuncDecl<'ctx>> {
        if self.smt.div == OpMode::Native {
            return None;
        }
        if self.smt.div_by_const && divisor.as_biguint().map_or(false, |v| v.bits() > 0) {
            return None;
        }
        Some(&self.ufs.div)
    }

    pub(crate) fn sdiv_uf(&self) -> Option<&FuncDecl<'ctx>> {
        (self.smt.div == OpMode::Uf).then_some(&self.ufs.sdiv)
    }

    /// MOD dispatch: uninterpreted unless `mod_by_const` hits a concrete
    /// non-zero divisor.
    pub(crate) fn rem_uf(&self, divisor: &Word<'ctx>) -> Option<&FuncDecl<'ctx>> {
        if self.smt.mod_by_const && divisor.as_biguint().map_or(false, |v| v.bits() > 0) {
            return None;
        }
        Some(&self.ufs.rem)
    }

    /// Addition through the configured dispatch (used by the driver for
    /// the balance-plus-callvalue seed).
    pub fn add(&self, a: &Word<'ctx>, b: &Word<'ctx>) -> Word<'ctx> {
        a.add_with(b, self.ctx, self.add_uf())
    }

    /// Model a SHA3 over a byte sequence: an injective uninterpreted
    /// function per input width, with pairwise collision-freedom axioms
    /// added on demand.
    pub fn sha3_word(&self, ex: &mut Exec<'ctx>, bytes: &[SymByte<'ctx>]) -> Word<'ctx> {
        let ctx = self.ctx;
        if bytes.is_empty() {
            return Word::from_bytes(&EMPTY_KECCAK, 256);
        }

        let mut input: Option<Word<'ctx>> = None;
        for byte in bytes {
            let chunk = match byte {
                SymByte::Con(b) => Word::from_bytes(&[*b], 8),
                SymByte::Sym(term) => Word::from_bv(term.clone()),
            };
            input = Some(match input {
                None => chunk,
                Some(acc) => acc.concat(&chunk, ctx),
            });
        }
        let input = input.expect("non-empty input");
        let bits = input.bits();
        let fp = input.fingerprint(ctx);

        if let Some(entry) = ex
            .sha3s
            .iter()
            .find(|e| e.fp == fp && e.input.bits() == bits)
        {
            return entry.output.clone();
        }

        let domain = Sort::bitvector(ctx, bits);
        let range = Sort::bitvector(ctx, 256);
        let decl = FuncDecl::new(ctx, format!("f_sha3_{}", bits), &[&domain], &range);
        let output = Word::from_bv(apply_uf(&decl, &[input.to_bv(ctx)]));

        let mut axioms = Vec::new();
        for prior in &ex.sha3s {
            let out_eq = output.to_bv(ctx)._eq(&prior.output.to_bv(ctx));
            if prior.input.bits() == bits {
                // injectivity: equal outputs force equal inputs
                let in_eq = input.to_bv(ctx)._eq(&prior.input.to_bv(ctx));
                axioms.push(out_eq.implies(&in_eq));
            } else {
                axioms.push(out_eq.not());
            }
        }
        for axiom in axioms {
            ex.path.assert(axiom, false);
        }

        ex.sha3s.push(Sha3Entry {
            input,
            fp,
            output: output.clone(),
        });
        output
    }

    /// Explore all paths from an initial state. Returns the terminal
    /// states and the ordered step trail.
    pub fn run(&self, initial: Exec<'ctx>) -> (Vec<Exec<'ctx>>, Vec<Step>) {
        let ctx = self.ctx;
        let mut terminals: Vec<Exec<'ctx>> = Vec::new();
        let mut steps: Vec<Step> = Vec::new();
        let mut worklist: Worklist<Exec<'ctx>> = Worklist::new();
        let mut next: Option<Exec<'ctx>> = Some(initial);

        while let Some(mut ex) = next.take().or_else(|| worklist.pop()) {
            if let Some(width) = self.explore.max_width {
                if terminals.len() >= width {
                    ex.error = Some(format!("max width {} exceeded", width));
                    terminals.push(ex);
                    break;
                }
            }

            let Some(program) = ex.program(ctx) else {
                ex.error = Some("no program for the current account".to_string());
                terminals.push(ex);
                continue;
            };

            // positions past the end of the code halt like STOP
            if ex.pc >= program.code_len() {
                steps.push(ex.record_step(ctx, "STOP".to_string()));
                terminals.push(ex);
                continue;
            }

            let Some(insn) = program.insn_at(ex.pc).cloned() else {
                ex.error = Some(format!("invalid pc {}", ex.pc));
                terminals.push(ex);
                continue;
            };

            steps.push(ex.record_step(ctx, insn.mnemonic()));

            ex.steps_taken += 1;
            if let Some(depth) = self.explore.max_depth {
                if ex.steps_taken > depth {
                    ex.error = Some(format!("max depth {} exceeded", depth));
                    terminals.push(ex);
                    continue;
                }
            }

            if insn.opcode == OP_JUMPI {
                next = self.jumpi(ex, &insn, &mut worklist, &mut terminals);
                continue;
            }

            match self.step(&mut ex, &insn) {
                Ok(true) => terminals.push(ex),
                Ok(false) => next = Some(ex),
                Err(err) => {
                    ex.error = Some(err.to_string());
                    terminals.push(ex);
                }
            }
        }

        (terminals, steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use z3::Config;

    #[test]
    fn test_fresh_word_naming_is_monotone() {
        let z3cfg = Config::new();
        let ctx = Context::new(&z3cfg);
        let program = Rc::new(Program::decode("00").unwrap());
        let mut ex = Exec::create(
            &ctx,
            program,
            Word::con(0xaaaa),
            Word::con(0xbbbb),
            Calldata::concrete(None),
            Word::con(0),
            Path::new(&ctx, 1000),
            false,
        );

        let a = ex.fresh_word(&ctx, "balance");
        let b = ex.fresh_word(&ctx, "balance");
        let c = ex.fresh_word(&ctx, "gas");
        assert!(format!("{:?}", a).contains("balance_0"));
        assert!(format!("{:?}", b).contains("balance_1"));
        assert!(format!("{:?}", c).contains("gas_0"));
        assert_eq!(ex.cnts.get("balance"), Some(&2));
    }

    #[test]
    fn test_stack_bounds() {
        let z3cfg = Config::new();
        let ctx = Context::new(&z3cfg);
        let program = Rc::new(Program::decode("00").unwrap());
        let mut ex = Exec::create(
            &ctx,
            program,
            Word::con(1),
            Word::con(2),
            Calldata::concrete(None),
            Word::con(0),
            Path::new(&ctx, 1000),
            false,
        );

        assert!(ex.pop().is_err());
        for _ in 0..symx_constants::MAX_STACK {
            ex.push(Word::con(0)).unwrap();
        }
        assert!(ex.push(Word::con(0)).is_err());
        assert_eq!(ex.stack.len(), symx_constants::MAX_STACK);
    }

    #[test]
    fn test_sha3_structural_sharing_and_injectivity() {
        let z3cfg = Config::new();
        let ctx = Context::new(&z3cfg);
        let sevm = Sevm::new(&ctx, SmtOptions::default(), ExploreOptions::default());
        let program = Rc::new(Program::decode("00").unwrap());
        let mut ex = Exec::create(
            &ctx,
            program,
            Word::con(1),
            Word::con(2),
            Calldata::concrete(None),
            Word::con(0),
            Path::new(&ctx, 1000),
            true,
        );

        let a = sevm.sha3_word(&mut ex, &[SymByte::Con(1), SymByte::Con(2)]);
        let b = sevm.sha3_word(&mut ex, &[SymByte::Con(1), SymByte::Con(2)]);
        // structurally equal inputs share the output term
        assert_eq!(ex.sha3s.len(), 1);
        assert_eq!(
            a.fingerprint(&ctx),
            b.fingerprint(&ctx)
        );

        let c = sevm.sha3_word(&mut ex, &[SymByte::Con(3)]);
        assert_eq!(ex.sha3s.len(), 2);
        assert_ne!(a.fingerprint(&ctx), c.fingerprint(&ctx));
        // a pairwise axiom was recorded
        assert!(!ex.path.conditions().is_empty());
    }

    #[test]
    fn test_sha3_empty_input_is_concrete() {
        let z3cfg = Config::new();
        let ctx = Context::new(&z3cfg);
        let sevm = Sevm::new(&ctx, SmtOptions::default(), ExploreOptions::default());
        let program = Rc::new(Program::decode("00").unwrap());
        let mut ex = Exec::create(
            &ctx,
            program,
            Word::con(1),
            Word::con(2),
            Calldata::concrete(None),
            Word::con(0),
            Path::new(&ctx, 1000),
            true,
        );

        let empty = sevm.sha3_word(&mut ex, &[]);
        assert_eq!(empty.to_bytes().unwrap(), EMPTY_KECCAK.to_vec());
    }
}
