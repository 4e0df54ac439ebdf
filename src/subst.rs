//! Partial substitutions over interned symbols.
//!
//! A substitution maps variables (and q-constants, during decoding) to
//! replacement symbols. Applying a substitution to a signature or an
//! operator always produces a new value; templates stay immutable.

use crate::sig::{Args, FxMap, Sig, Usig};
use crate::symbol::{Sym, SymbolTable};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Substitution {
    map: FxMap<Sym, Sym>,
}

impl Substitution {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a substitution mapping `src[i] -> dst[i]` pairwise.
    /// Positions where the two sides already agree are skipped.
    /// Panics if a source symbol would need two distinct images; use
    /// [`Substitution::get_all`] when that can happen.
    pub fn from_pairs(src: &[Sym], dst: &[Sym]) -> Self {
        assert_eq!(src.len(), dst.len(), "argument lists must have equal arity");
        let mut sub = Self::new();
        for (&s, &d) in src.iter().zip(dst.iter()) {
            if s == d {
                continue;
            }
            let prev = sub.map.insert(s, d);
            assert!(
                prev.is_none() || prev == Some(d),
                "conflicting binding for repeated argument"
            );
        }
        sub
    }

    pub fn bind(&mut self, from: Sym, to: Sym) {
        self.map.insert(from, to);
    }

    pub fn get(&self, sym: Sym) -> Option<Sym> {
        self.map.get(&sym).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Sym, Sym)> + '_ {
        self.map.iter().map(|(&k, &v)| (k, v))
    }

    /// Apply to a single symbol: one replacement step, no chains.
    pub fn apply_sym(&self, sym: Sym) -> Sym {
        self.get(sym).unwrap_or(sym)
    }

    pub fn apply_args(&self, args: &[Sym]) -> Args {
        args.iter().map(|&a| self.apply_sym(a)).collect()
    }

    pub fn apply_usig(&self, sig: &Usig) -> Usig {
        Usig {
            name: sig.name,
            args: self.apply_args(&sig.args),
        }
    }

    pub fn apply_sig(&self, sig: &Sig) -> Sig {
        Sig {
            usig: self.apply_usig(&sig.usig),
            negated: sig.negated,
        }
    }

    /// Compose with `other`: existing images are routed through `other`,
    /// and bindings only present in `other` are adopted. The result
    /// applies like "self, then other".
    pub fn compose(&mut self, other: &Substitution) {
        for v in self.map.values_mut() {
            *v = other.apply_sym(*v);
        }
        for (k, v) in other.iter() {
            self.map.entry(k).or_insert(v);
        }
    }

    /// All substitutions unifying `src` with `dst` position-wise, binding
    /// only variables of `src`. A repeated source variable that would
    /// need two distinct images kills that unifier; a ground mismatch
    /// kills the whole match. The result is therefore empty or a
    /// singleton unless repeated variables are consistently bindable.
    pub fn get_all(src: &[Sym], dst: &[Sym], symbols: &SymbolTable) -> Vec<Substitution> {
        if src.len() != dst.len() {
            return Vec::new();
        }
        let mut subs = vec![Substitution::new()];
        for (&s, &d) in src.iter().zip(dst.iter()) {
            if s == d {
                continue;
            }
            if !symbols.is_variable(s) {
                // Ground against ground: no unifier can fix a mismatch.
                return Vec::new();
            }
            subs.retain_mut(|sub| match sub.get(s) {
                None => {
                    sub.bind(s, d);
                    true
                }
                Some(prev) => prev == d,
            });
            if subs.is_empty() {
                return subs;
            }
        }
        subs
    }
}
