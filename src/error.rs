use thiserror::Error;

/// Failure modes surfaced to the caller. Internal invariant violations
/// are programming errors and panic instead of appearing here.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The input HTN is malformed: arity mismatch, unknown sort,
    /// undeclared predicate. Fatal; no partial result.
    #[error("malformed domain: {0}")]
    Domain(String),

    /// The formula is unsatisfiable even without assumptions; no depth
    /// bound will help.
    #[error("problem is unsolvable")]
    Unsolvable,

    /// The configured maximum iteration count was reached without a
    /// solution.
    #[error("no success within {0} iterations")]
    DepthExhausted(usize),

    /// The termination callback fired during solving.
    #[error("solving was interrupted")]
    Interrupted,
}
