use crate::symbol::{Sym, SymbolTable};
use rustc_hash::FxHasher;
use smallvec::SmallVec;
use std::hash::BuildHasherDefault;

pub type FxBuild = BuildHasherDefault<FxHasher>;
pub type FxMap<K, V> = hashbrown::HashMap<K, V, FxBuild>;
pub type FxSet<T> = hashbrown::HashSet<T, FxBuild>;

/// Argument list of a signature. Most operators and predicates have a
/// handful of parameters, so arguments are stored inline.
pub type Args = SmallVec<[Sym; 4]>;

/// An unsigned signature: an interned name applied to an ordered
/// argument list. Identifies facts, operator instances and tasks.
/// Equality and hashing are structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Usig {
    pub name: Sym,
    pub args: Args,
}

impl Usig {
    pub fn new(name: Sym, args: impl IntoIterator<Item = Sym>) -> Self {
        Self {
            name,
            args: args.into_iter().collect(),
        }
    }

    pub fn nullary(name: Sym) -> Self {
        Self {
            name,
            args: Args::new(),
        }
    }

    /// Attach a polarity, yielding a signed fact.
    pub fn to_sig(&self, negated: bool) -> Sig {
        Sig {
            usig: self.clone(),
            negated,
        }
    }
}

/// A signed signature: a fact together with its polarity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sig {
    pub usig: Usig,
    pub negated: bool,
}

impl Sig {
    pub fn new(usig: Usig, negated: bool) -> Self {
        Self { usig, negated }
    }

    /// The same fact with inverted polarity.
    pub fn opposite(&self) -> Sig {
        Sig {
            usig: self.usig.clone(),
            negated: !self.negated,
        }
    }
}

pub type USigSet = FxSet<Usig>;
pub type SigSet = FxSet<Sig>;

/// Render a signature as `(name arg ...)`, or bare `name` when nullary.
pub fn format_usig(sig: &Usig, symbols: &SymbolTable) -> String {
    if sig.args.is_empty() {
        return symbols.resolve(sig.name).to_string();
    }
    let mut out = String::from("(");
    out.push_str(symbols.resolve(sig.name));
    for arg in sig.args.iter() {
        out.push(' ');
        out.push_str(symbols.resolve(*arg));
    }
    out.push(')');
    out
}

/// Render a signature as `name arg ...` without brackets, the form the
/// plan verification format expects.
pub fn format_usig_bare(sig: &Usig, symbols: &SymbolTable) -> String {
    let mut out = String::new();
    out.push_str(symbols.resolve(sig.name));
    for arg in sig.args.iter() {
        out.push(' ');
        out.push_str(symbols.resolve(*arg));
    }
    out
}
