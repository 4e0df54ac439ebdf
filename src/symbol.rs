use hashbrown::HashSet;
use lasso::{Rodeo, Spur};
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;

/// A unique identifier for an interned name: a predicate, task, sort,
/// constant, variable or q-constant.
pub type Sym = Spur;

type FxBuild = BuildHasherDefault<FxHasher>;

/// Interning table for every name in a planning problem.
///
/// Guarantees:
/// - Same string always produces the same Sym
/// - Different strings always produce different Syms
/// - The variable and q-constant classes are disjoint: variable names
///   begin with `?`, q-constant names with `!`, and classification
///   happens at interning time.
pub struct SymbolTable {
    rodeo: Rodeo,
    variables: HashSet<Sym, FxBuild>,
    q_constants: HashSet<Sym, FxBuild>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            rodeo: Rodeo::new(),
            variables: HashSet::default(),
            q_constants: HashSet::default(),
        }
    }

    /// Intern a name, returning its unique Sym.
    /// Names starting with `?` are registered as variables.
    pub fn intern(&mut self, name: &str) -> Sym {
        let sym = self.rodeo.get_or_intern(name);
        if name.starts_with('?') {
            self.variables.insert(sym);
        }
        sym
    }

    /// Intern a q-constant name (must start with `!`) and register it.
    pub fn intern_q_constant(&mut self, name: &str) -> Sym {
        debug_assert!(name.starts_with('!'), "q-constant names start with '!'");
        let sym = self.rodeo.get_or_intern(name);
        self.q_constants.insert(sym);
        sym
    }

    /// Resolve a Sym back to its string representation.
    pub fn resolve(&self, sym: Sym) -> &str {
        self.rodeo.resolve(&sym)
    }

    /// Get the Sym for a name if it exists, without interning.
    pub fn get(&self, name: &str) -> Option<Sym> {
        self.rodeo.get(name)
    }

    pub fn is_variable(&self, sym: Sym) -> bool {
        self.variables.contains(&sym)
    }

    pub fn is_q_constant(&self, sym: Sym) -> bool {
        self.q_constants.contains(&sym)
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}
