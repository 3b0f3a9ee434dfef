// SPDX-License-Identifier: AGPL-3.0

//! The storage model.
//!
//! Each account's storage is an array-theory term from 256-bit keys to
//! 256-bit values, updated functionally by SSTORE. An SLOAD introduces a
//! named read constant `storage_<gen>_<fingerprint>` tied to the array
//! select, so that re-reads of the same key at the same generation are
//! the same term and models display readably.

use z3::ast::Array;
use z3::{Context, Sort};

use symx_word::Word;

/// Storage of a single account.
#[derive(Clone, Debug)]
pub struct StorageAccount<'ctx> {
    arr: Array<'ctx>,
    gen: usize,
}

impl<'ctx> StorageAccount<'ctx> {
    /// Fresh storage for the account identified by the fingerprint of
    /// its address term.
    pub fn new(ctx: &'ctx Context, account_fp: u64) -> Self {
        let domain = Sort::bitvector(ctx, 256);
        let range = Sort::bitvector(ctx, 256);
        let name = format!("storage_arr_{:016x}", account_fp);
        Self {
            arr: Array::new_const(ctx, name.as_str(), &domain, &range),
            gen: 0,
        }
    }

    /// The write generation, used for read-constant naming.
    pub fn gen(&self) -> usize {
        self.gen
    }

    /// SSTORE: functional array update.
    pub fn store(&mut self, key: &Word<'ctx>, value: &Word<'ctx>, ctx: &'ctx Context) {
        self.arr = self.arr.store(&key.to_bv(ctx), &value.to_bv(ctx));
        self.gen += 1;
    }

    /// The raw select term for a key at the current generation.
    pub fn select(&self, key: &Word<'ctx>, ctx: &'ctx Context) -> Word<'ctx> {
        let value = self
            .arr
            .select(&key.to_bv(ctx))
            .as_bv()
            .expect("storage array ranges over bitvectors");
        Word::from_bv(value)
    }

    /// Deterministic name for the read constant of a key.
    pub fn read_name(&self, key: &Word<'ctx>, ctx: &'ctx Context) -> String {
        format!("storage_{}_{:016x}", self.gen, key.fingerprint(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use z3::ast::Ast;
    use z3::{Config, SatResult, Solver};

    #[test]
    fn test_store_then_select() {
        let ctx = Context::new(&Config::new());
        let mut storage = StorageAccount::new(&ctx, 0);

        let key = Word::con(7);
        storage.store(&key, &Word::con(42), &ctx);

        let solver = Solver::new(&ctx);
        let selected = storage.select(&key, &ctx).to_bv(&ctx);
        let expected = Word::con(42).to_bv(&ctx);
        solver.assert(&selected._eq(&expected).not());
        assert_eq!(solver.check(), SatResult::Unsat);
    }

    #[test]
    fn test_symbolic_key_aliasing() {
        let ctx = Context::new(&Config::new());
        let mut storage = StorageAccount::new(&ctx, 0);

        let k = Word::fresh(&ctx, "k", 256);
        storage.store(&k, &Word::con(1), &ctx);

        // under k == 5, reading slot 5 must observe the write
        let solver = Solver::new(&ctx);
        solver.assert(&k.to_bv(&ctx)._eq(&Word::con(5).to_bv(&ctx)));
        let read = storage.select(&Word::con(5), &ctx).to_bv(&ctx);
        solver.assert(&read._eq(&Word::con(1).to_bv(&ctx)).not());
        assert_eq!(solver.check(), SatResult::Unsat);
    }

    #[test]
    fn test_read_names_are_generation_scoped() {
        let ctx = Context::new(&Config::new());
        let mut storage = StorageAccount::new(&ctx, 0);

        let key = Word::con(3);
        let before = storage.read_name(&key, &ctx);
        storage.store(&key, &Word::con(9), &ctx);
        let after = storage.read_name(&key, &ctx);

        assert_ne!(before, after);
        assert!(before.starts_with("storage_0_"));
        assert!(after.starts_with("storage_1_"));

        // same key, same generation: same name
        assert_eq!(after, storage.read_name(&Word::con(3), &ctx));
    }
}
