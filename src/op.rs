//! Lifted operator templates: primitive actions and reductions.
//!
//! Templates live in the HTN instance's pools and are immutable;
//! substitution always produces a fresh value.

use crate::sig::{Args, Sig, SigSet, Usig};
use crate::subst::Substitution;
use crate::symbol::Sym;

/// Common base of actions and reductions: a named, parameterized
/// operator with preconditions and effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtnOp {
    pub name: Sym,
    pub args: Args,
    pub preconditions: SigSet,
    pub extra_preconditions: SigSet,
    pub effects: SigSet,
}

impl HtnOp {
    pub fn new(name: Sym, args: impl IntoIterator<Item = Sym>) -> Self {
        Self {
            name,
            args: args.into_iter().collect(),
            preconditions: SigSet::default(),
            extra_preconditions: SigSet::default(),
            effects: SigSet::default(),
        }
    }

    pub fn signature(&self) -> Usig {
        Usig {
            name: self.name,
            args: self.args.clone(),
        }
    }

    pub fn add_precondition(&mut self, sig: Sig) {
        self.preconditions.insert(sig);
    }

    pub fn add_extra_precondition(&mut self, sig: Sig) {
        self.extra_preconditions.insert(sig);
    }

    pub fn add_effect(&mut self, sig: Sig) {
        self.effects.insert(sig);
    }

    pub fn substitute(&self, sub: &Substitution) -> HtnOp {
        HtnOp {
            name: self.name,
            args: sub.apply_args(&self.args),
            preconditions: self.preconditions.iter().map(|s| sub.apply_sig(s)).collect(),
            extra_preconditions: self
                .extra_preconditions
                .iter()
                .map(|s| sub.apply_sig(s))
                .collect(),
            effects: self.effects.iter().map(|s| sub.apply_sig(s)).collect(),
        }
    }
}

/// A primitive operator. No subtasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub op: HtnOp,
}

impl Action {
    pub fn new(op: HtnOp) -> Self {
        Self { op }
    }

    pub fn signature(&self) -> Usig {
        self.op.signature()
    }

    pub fn substitute(&self, sub: &Substitution) -> Action {
        Action {
            op: self.op.substitute(sub),
        }
    }

    /// Drop delete-effects that a substitution turned into the exact
    /// opposite of an add-effect (add wins over delete).
    pub fn remove_inconsistent_effects(&mut self) {
        let contradicted: Vec<Sig> = self
            .op
            .effects
            .iter()
            .filter(|e| e.negated && self.op.effects.contains(&e.opposite()))
            .cloned()
            .collect();
        for e in contradicted {
            self.op.effects.remove(&e);
        }
    }
}

/// A method decomposing a compound task into an ordered subtask list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reduction {
    pub op: HtnOp,
    pub task: Usig,
    pub subtasks: Vec<Usig>,
}

impl Reduction {
    pub fn new(op: HtnOp, task: Usig, subtasks: Vec<Usig>) -> Self {
        Self { op, task, subtasks }
    }

    pub fn signature(&self) -> Usig {
        self.op.signature()
    }

    pub fn substitute(&self, sub: &Substitution) -> Reduction {
        Reduction {
            op: self.op.substitute(sub),
            task: sub.apply_usig(&self.task),
            subtasks: self.subtasks.iter().map(|t| sub.apply_usig(t)).collect(),
        }
    }
}
