//! The SAT solver boundary.
//!
//! The encoder speaks an IPASIR-style interface: clauses are streamed
//! literal by literal with 0 as terminator, assumptions are re-issued
//! before every solve, and models are read back per variable. The
//! termination callback is a plain value installed on the solver and
//! polled at solve boundaries; it must be side-effect-free and
//! idempotent.

use crate::sig::FxSet;
use varisat::{ExtendFormula, Lit, Solver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveResult {
    Sat,
    Unsat,
    Unknown,
}

pub type TerminateFn = Box<dyn Fn() -> bool>;

pub trait SatSolver {
    /// Stream a literal of the current clause; 0 terminates the clause.
    fn add(&mut self, lit: i32);
    /// Register an assumption for the next solve call only.
    fn assume(&mut self, lit: i32);
    fn solve(&mut self) -> SolveResult;
    /// Signed value of `var` in the last model: `var` if true, `-var`
    /// if false. Only meaningful after a Sat result.
    fn val(&self, var: i32) -> i32;
    fn set_terminate(&mut self, callback: Option<TerminateFn>);
}

/// Incremental CDCL backend on top of varisat.
pub struct VarisatBackend {
    solver: Solver<'static>,
    clause: Vec<Lit>,
    assumptions: Vec<Lit>,
    model: FxSet<i32>,
    terminate: Option<TerminateFn>,
}

impl VarisatBackend {
    pub fn new() -> Self {
        Self {
            solver: Solver::new(),
            clause: Vec::new(),
            assumptions: Vec::new(),
            model: FxSet::default(),
            terminate: None,
        }
    }
}

impl Default for VarisatBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SatSolver for VarisatBackend {
    fn add(&mut self, lit: i32) {
        if lit == 0 {
            self.solver.add_clause(&self.clause);
            self.clause.clear();
        } else {
            self.clause.push(Lit::from_dimacs(lit as isize));
        }
    }

    fn assume(&mut self, lit: i32) {
        self.assumptions.push(Lit::from_dimacs(lit as isize));
    }

    fn solve(&mut self) -> SolveResult {
        if let Some(cb) = &self.terminate {
            if cb() {
                return SolveResult::Unknown;
            }
        }
        let assumptions = std::mem::take(&mut self.assumptions);
        self.solver.assume(&assumptions);
        match self.solver.solve() {
            Ok(true) => {
                self.model.clear();
                if let Some(model) = self.solver.model() {
                    for lit in model {
                        if lit.is_positive() {
                            self.model.insert(lit.to_dimacs() as i32);
                        }
                    }
                }
                SolveResult::Sat
            }
            Ok(false) => SolveResult::Unsat,
            Err(_) => SolveResult::Unknown,
        }
    }

    fn val(&self, var: i32) -> i32 {
        debug_assert!(var > 0);
        if self.model.contains(&var) {
            var
        } else {
            -var
        }
    }

    fn set_terminate(&mut self, callback: Option<TerminateFn>) {
        self.terminate = callback;
    }
}
