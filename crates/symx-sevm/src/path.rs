// SPDX-License-Identifier: AGPL-3.0

//! Path conditions and the per-path solver context.
//!
//! Each execution state owns its solver. The ordered condition list is
//! mirrored alongside the solver so that a path can be forked (a fresh
//! solver is created and the conditions are replayed) or reloaded into a
//! context with a different timeout, with no back-references between
//! states.

use z3::ast::Bool;
use z3::{Context, Params, SatResult, Solver};

/// The path condition of one execution state.
pub struct Path<'ctx> {
    ctx: &'ctx Context,
    solver: Solver<'ctx>,
    timeout_ms: u32,
    /// (condition, came-from-branching) in assertion order.
    conditions: Vec<(Bool<'ctx>, bool)>,
}

fn new_solver<'ctx>(ctx: &'ctx Context, timeout_ms: u32) -> Solver<'ctx> {
    let solver = Solver::new(ctx);
    let mut params = Params::new(ctx);
    params.set_u32("timeout", timeout_ms);
    solver.set_params(&params);
    solver
}

impl<'ctx> Path<'ctx> {
    pub fn new(ctx: &'ctx Context, timeout_ms: u32) -> Self {
        Self {
            ctx,
            solver: new_solver(ctx, timeout_ms),
            timeout_ms,
            conditions: Vec::new(),
        }
    }

    /// Add a condition. Conditions are never removed on a path.
    pub fn assert(&mut self, cond: Bool<'ctx>, branching: bool) {
        self.solver.assert(&cond);
        self.conditions.push((cond, branching));
    }

    /// Satisfiability of the path itself.
    pub fn check(&self) -> SatResult {
        self.solver.check()
    }

    /// Satisfiability of the path extended with one extra condition,
    /// without keeping it.
    pub fn check_cond(&self, cond: &Bool<'ctx>) -> SatResult {
        self.solver.push();
        self.solver.assert(cond);
        let result = self.solver.check();
        self.solver.pop(1);
        result
    }

    pub fn get_model(&self) -> Option<z3::Model<'ctx>> {
        self.solver.get_model()
    }

    pub fn conditions(&self) -> &[(Bool<'ctx>, bool)] {
        &self.conditions
    }

    pub fn ctx(&self) -> &'ctx Context {
        self.ctx
    }

    /// Rebuild into a fresh solver with a different timeout, replaying
    /// every condition (used by the counterexample pipeline).
    pub fn reload(&self, timeout_ms: u32) -> Path<'ctx> {
        let mut fresh = Path::new(self.ctx, timeout_ms);
        for (cond, branching) in &self.conditions {
            fresh.assert(cond.clone(), *branching);
        }
        fresh
    }

    /// Serialize the solver state as SMT2 (assertions plus declarations).
    pub fn smt2(&self) -> String {
        self.solver.to_string()
    }

    /// The human-readable trail of branching conditions.
    pub fn branch_trail(&self) -> String {
        let mut out = String::new();
        for (cond, branching) in &self.conditions {
            if *branching {
                out.push_str(&format!("- {}\n", cond));
            }
        }
        if out.is_empty() {
            out.push_str("- (empty path condition)\n");
        }
        out
    }
}

impl<'ctx> Clone for Path<'ctx> {
    fn clone(&self) -> Self {
        self.reload(self.timeout_ms)
    }
}

impl<'ctx> std::fmt::Debug for Path<'ctx> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Path({} conditions)", self.conditions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use z3::ast::{Ast, BV};
    use z3::Config;

    #[test]
    fn test_empty_path_is_sat() {
        let ctx = Context::new(&Config::new());
        let path = Path::new(&ctx, 1000);
        assert_eq!(path.check(), SatResult::Sat);
        assert!(path.branch_trail().contains("empty path condition"));
    }

    #[test]
    fn test_check_cond_does_not_persist() {
        let ctx = Context::new(&Config::new());
        let path = Path::new(&ctx, 1000);

        let x = BV::new_const(&ctx, "x", 256);
        let five = BV::from_u64(&ctx, 5, 256);
        let ten = BV::from_u64(&ctx, 10, 256);

        assert_eq!(path.check_cond(&x._eq(&five)), SatResult::Sat);
        // the probe above must not constrain x
        assert_eq!(path.check_cond(&x._eq(&ten)), SatResult::Sat);
    }

    #[test]
    fn test_contradiction_is_unsat() {
        let ctx = Context::new(&Config::new());
        let mut path = Path::new(&ctx, 1000);

        let x = BV::new_const(&ctx, "x", 256);
        path.assert(x._eq(&BV::from_u64(&ctx, 5, 256)), true);
        assert_eq!(path.check(), SatResult::Sat);
        assert_eq!(
            path.check_cond(&x._eq(&BV::from_u64(&ctx, 6, 256))),
            SatResult::Unsat
        );
    }

    #[test]
    fn test_fork_replays_conditions() {
        let ctx = Context::new(&Config::new());
        let mut path = Path::new(&ctx, 1000);

        let x = BV::new_const(&ctx, "x", 256);
        path.assert(x._eq(&BV::from_u64(&ctx, 5, 256)), true);

        let forked = path.clone();
        assert_eq!(forked.conditions().len(), 1);
        assert_eq!(
            forked.check_cond(&x._eq(&BV::from_u64(&ctx, 6, 256))),
            SatResult::Unsat
        );

        // the fork is independent: new conditions do not leak back
        let mut forked = forked;
        forked.assert(x._eq(&BV::from_u64(&ctx, 7, 256)), false);
        assert_eq!(forked.check(), SatResult::Unsat);
        assert_eq!(path.check(), SatResult::Sat);
    }

    #[test]
    fn test_branch_trail_lists_branching_only() {
        let ctx = Context::new(&Config::new());
        let mut path = Path::new(&ctx, 1000);

        let a = Bool::new_const(&ctx, "a");
        let b = Bool::new_const(&ctx, "b");
        path.assert(a, true);
        path.assert(b, false);

        let trail = path.branch_trail();
        assert!(trail.contains("a"));
        assert!(!trail.contains("b"));
    }
}
