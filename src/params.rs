/// Which free arguments the instantiator grounds eagerly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstantiationMode {
    /// Ground every free argument.
    Full,
    /// Ground only arguments occurring in preconditions.
    Preconditions,
    /// Ground nothing eagerly; leave everything to q-constants.
    Nothing,
}

/// Configuration of the planning run. No CLI here; construct the struct
/// and hand it to the planner.
#[derive(Debug, Clone)]
pub struct Params {
    /// Earliest iteration at which solving is attempted (`d`).
    pub first_solve_iteration: usize,
    /// Maximum iteration count (`D`); 0 means unbounded.
    pub max_iterations: usize,
    /// On UNSAT with assumptions, re-solve without assumptions to tell
    /// depth exhaustion from unsolvability (`cs`).
    pub check_solvability: bool,
    /// Eager instantiation policy (`q` / `qq`).
    pub instantiation_mode: InstantiationMode,
    /// Per-operator cap for full enumeration; 0 disables the attempt.
    pub q_const_instantiation_limit: usize,
    /// Multiplier comparing an argument's precondition rating against
    /// its domain size; arguments scoring above their domain size are
    /// promoted to eager instantiation. 0 disables.
    pub q_const_rating_factor: f32,
    /// Sort DFS arguments descending by precondition rating instead of
    /// leaving them in declaration order.
    pub sort_args_by_rating: bool,
    /// Encode fact supports for non-primitive operations too (`nps`).
    pub nonprimitive_support: bool,
    /// Derive primitiveness from operation identity instead of a
    /// dedicated variable per position.
    pub implicit_primitiveness: bool,
    /// Mirror every emitted clause to a DIMACS-like dump.
    pub print_formula: bool,
    /// Minimize plan length by binary search after the first solution.
    pub optimize: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            first_solve_iteration: 0,
            max_iterations: 0,
            check_solvability: false,
            instantiation_mode: InstantiationMode::Full,
            q_const_instantiation_limit: 0,
            q_const_rating_factor: 0.0,
            sort_args_by_rating: false,
            nonprimitive_support: false,
            implicit_primitiveness: false,
            print_formula: false,
            optimize: false,
        }
    }
}
