//! lamina — layered HTN planning via incremental SAT.
//!
//! A lifted HTN problem (actions, reductions, sorts, initial state,
//! goals, top-level tasks) is grown into a hierarchy of layers, each
//! refining the last by one decomposition level. Every layer is encoded
//! into propositional clauses over an incremental SAT solver; a model
//! of the deepest layer, assumed fully primitive, is read back as a
//! classical plan plus the decomposition tree that produced it.
//!
//! ```no_run
//! use lamina::{HtnInstance, Params, Planner, VarisatBackend};
//!
//! let mut htn = HtnInstance::new();
//! // ... declare sorts, actions, reductions, init, goals, top tasks ...
//! # htn.set_top_tasks(vec![]);
//! let mut planner = Planner::new(htn, Params::default(), VarisatBackend::new());
//! match planner.find_plan() {
//!     Ok(plan) => print!("{}", planner.format_plan(&plan)),
//!     Err(e) => eprintln!("{}", e),
//! }
//! ```

pub mod encoding;
pub mod error;
pub mod htn;
pub mod instantiate;
pub mod layer;
pub mod op;
pub mod params;
pub mod plan;
pub mod planner;
pub mod sig;
pub mod solver;
pub mod subst;
pub mod symbol;
pub mod traversal;

pub use error::PlanError;
pub use htn::HtnInstance;
pub use op::{Action, HtnOp, Reduction};
pub use params::{InstantiationMode, Params};
pub use plan::{Plan, PlanItem};
pub use planner::Planner;
pub use sig::{Sig, Usig};
pub use solver::{SatSolver, SolveResult, VarisatBackend};
pub use subst::Substitution;
