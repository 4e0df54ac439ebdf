//! Layers, positions and the layer state.
//!
//! A layer is a horizontal slice of the decomposition hierarchy; a
//! position is one time-step of the plan at that refinement level. A
//! position is mutated only while it is being created, then sealed for
//! the encoder. The layer state tracks, per fact and polarity, the
//! interval of positions over which the fact may hold.

use crate::htn::TypeConstraint;
use crate::sig::{FxMap, Sig, SigSet, USigSet, Usig};
use crate::subst::Substitution;
use crate::symbol::Sym;

/// Kinds of propositional variables. Fact and operation variables live
/// in per-position tables; substitution and q-equality variables are
/// global to the encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarType {
    Fact,
    Op,
    Substitution,
    QEquality,
}

/// One (layer, position) coordinate and everything that may happen there.
#[derive(Debug)]
pub struct Position {
    pub layer: usize,
    pub pos: usize,

    pub actions: USigSet,
    pub reductions: USigSet,

    /// Ground fact signatures that may appear at this position.
    pub facts: USigSet,
    /// Facts containing q-constants, indexed by predicate.
    pub qfacts: FxMap<Sym, USigSet>,

    /// Facts whose polarity is fixed here.
    pub true_facts: USigSet,
    pub false_facts: USigSet,

    /// Parent operator (previous layer) -> child operators here.
    pub expansions: FxMap<Usig, USigSet>,
    /// Parents with no valid child at this offset; the encoder forbids
    /// them outright.
    pub forbidden_parents: USigSet,

    /// Operators without a parent expansion (layer-0 roots, the goal
    /// action); the encoder requires one of them to occur.
    pub axiomatic_ops: USigSet,

    /// Per signed fact, the operators at the previous position whose
    /// effects can produce it here.
    pub fact_supports: FxMap<Sig, USigSet>,
    /// Signed facts with some unspecified (non-primitive) support.
    pub touched_supports: SigSet,

    /// Memoized effect set per operator at this position.
    pub fact_changes: FxMap<Usig, Vec<Sig>>,

    /// Per operator, q-constant assignments incompatible with some
    /// q-fact decoding.
    pub forbidden_substitutions: FxMap<Usig, Vec<Substitution>>,

    /// Type constraints introduced by operators at this position.
    pub q_constraints: FxMap<Usig, Vec<TypeConstraint>>,

    /// How many child positions the operators here may occupy.
    pub max_expansion_size: usize,

    variables: FxMap<(VarType, Usig), i32>,
    pub primitive_var: Option<i32>,
}

impl Position {
    pub fn new(layer: usize, pos: usize) -> Self {
        Self {
            layer,
            pos,
            actions: USigSet::default(),
            reductions: USigSet::default(),
            facts: USigSet::default(),
            qfacts: FxMap::default(),
            true_facts: USigSet::default(),
            false_facts: USigSet::default(),
            expansions: FxMap::default(),
            forbidden_parents: USigSet::default(),
            axiomatic_ops: USigSet::default(),
            fact_supports: FxMap::default(),
            touched_supports: SigSet::default(),
            fact_changes: FxMap::default(),
            forbidden_substitutions: FxMap::default(),
            q_constraints: FxMap::default(),
            max_expansion_size: 1,
            variables: FxMap::default(),
            primitive_var: None,
        }
    }

    pub fn add_action(&mut self, sig: Usig) {
        self.actions.insert(sig);
    }

    pub fn add_reduction(&mut self, sig: Usig) {
        self.reductions.insert(sig);
    }

    pub fn has_op(&self, sig: &Usig) -> bool {
        self.actions.contains(sig) || self.reductions.contains(sig)
    }

    pub fn add_fact(&mut self, sig: Usig) {
        self.facts.insert(sig);
    }

    pub fn add_qfact(&mut self, sig: Usig) {
        self.qfacts.entry(sig.name).or_default().insert(sig);
    }

    pub fn has_fact(&self, sig: &Usig) -> bool {
        self.facts.contains(sig)
    }

    pub fn has_qfact(&self, sig: &Usig) -> bool {
        self.qfacts
            .get(&sig.name)
            .map_or(false, |set| set.contains(sig))
    }

    pub fn num_qfacts(&self) -> usize {
        self.qfacts.values().map(|s| s.len()).sum()
    }

    /// Fix a fact's polarity at this position.
    pub fn add_definitive_fact(&mut self, sig: &Sig) {
        if sig.negated {
            self.false_facts.insert(sig.usig.clone());
        } else {
            self.true_facts.insert(sig.usig.clone());
        }
    }

    pub fn add_expansion(&mut self, parent: Usig, child: Usig) {
        self.expansions.entry(parent).or_default().insert(child);
    }

    pub fn forbid_parent(&mut self, parent: Usig) {
        self.forbidden_parents.insert(parent);
    }

    pub fn add_axiomatic_op(&mut self, sig: Usig) {
        self.axiomatic_ops.insert(sig);
    }

    pub fn add_fact_support(&mut self, fact: &Sig, op: Usig) {
        self.fact_supports
            .entry(fact.clone())
            .or_default()
            .insert(op);
    }

    /// Remember that some unspecified operator supports this fact.
    pub fn touch_fact_support(&mut self, fact: &Sig) {
        self.touched_supports.insert(fact.clone());
    }

    pub fn set_fact_changes(&mut self, op: Usig, changes: Vec<Sig>) {
        self.fact_changes.insert(op, changes);
    }

    pub fn get_fact_changes(&self, op: &Usig) -> &[Sig] {
        self.fact_changes.get(op).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn add_forbidden_substitution(&mut self, op: &Usig, sub: Substitution) {
        self.forbidden_substitutions
            .entry(op.clone())
            .or_default()
            .push(sub);
    }

    pub fn add_q_constant_type_constraint(&mut self, op: &Usig, constraint: TypeConstraint) {
        self.q_constraints
            .entry(op.clone())
            .or_default()
            .push(constraint);
    }

    pub fn add_expansion_size(&mut self, size: usize) {
        self.max_expansion_size = self.max_expansion_size.max(size);
    }

    // ----- variable table -----

    pub fn set_variable(&mut self, vt: VarType, sig: &Usig, var: i32) {
        let prev = self.variables.insert((vt, sig.clone()), var);
        debug_assert!(prev.is_none(), "variable allocated twice for one signature");
    }

    pub fn get_variable(&self, vt: VarType, sig: &Usig) -> i32 {
        self.variable_or_zero(vt, sig)
            .unwrap_or_else(|| panic!("no variable allocated at ({},{})", self.layer, self.pos))
    }

    pub fn variable_or_zero(&self, vt: VarType, sig: &Usig) -> Option<i32> {
        self.variables.get(&(vt, sig.clone())).copied()
    }

    pub fn has_variable(&self, vt: VarType, sig: &Usig) -> bool {
        self.variables.contains_key(&(vt, sig.clone()))
    }

    pub fn variables(&self) -> impl Iterator<Item = (&(VarType, Usig), &i32)> {
        self.variables.iter()
    }
}

/// Interval table: per fact and polarity, the half-open position range
/// over which the fact may hold. Intervals may extend but never
/// contract retroactively.
#[derive(Debug, Default, Clone)]
pub struct LayerState {
    pos_ranges: FxMap<Usig, (usize, usize)>,
    neg_ranges: FxMap<Usig, (usize, usize)>,
}

impl LayerState {
    pub fn new() -> Self {
        Self::default()
    }

    fn ranges(&self, negated: bool) -> &FxMap<Usig, (usize, usize)> {
        if negated {
            &self.neg_ranges
        } else {
            &self.pos_ranges
        }
    }

    fn ranges_mut(&mut self, negated: bool) -> &mut FxMap<Usig, (usize, usize)> {
        if negated {
            &mut self.neg_ranges
        } else {
            &mut self.pos_ranges
        }
    }

    /// Mark the fact as possibly holding from `pos` onwards. Re-adding
    /// a previously withdrawn fact reopens its interval: the closed end
    /// is cleared, never left at the stale withdrawal point.
    pub fn add(&mut self, pos: usize, sig: &Sig) {
        let entry = self
            .ranges_mut(sig.negated)
            .entry(sig.usig.clone())
            .or_insert((pos, usize::MAX));
        entry.0 = entry.0.min(pos);
        entry.1 = usize::MAX;
    }

    /// Mark the fact as impossible from `pos` onwards.
    pub fn withdraw(&mut self, pos: usize, fact: &Usig, negated: bool) {
        if let Some(entry) = self.ranges_mut(negated).get_mut(fact) {
            entry.1 = pos;
        }
    }

    pub fn contains(&self, pos: usize, sig: &Sig) -> bool {
        match self.ranges(sig.negated).get(&sig.usig) {
            Some(&(first, last)) => first <= pos && pos < last,
            None => false,
        }
    }

    pub fn occurrences(&self, negated: bool) -> impl Iterator<Item = (&Usig, (usize, usize))> {
        self.ranges(negated).iter().map(|(k, &v)| (k, v))
    }
}

/// An ordered run of positions plus the layer state and the offset
/// table mapping each position to its successor in the next layer.
#[derive(Debug)]
pub struct Layer {
    pub index: usize,
    pub positions: Vec<Position>,
    pub state: LayerState,
    successors: Vec<usize>,
}

impl Layer {
    pub fn new(index: usize, size: usize) -> Self {
        Self {
            index,
            positions: (0..size).map(|p| Position::new(index, p)).collect(),
            state: LayerState::new(),
            successors: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.positions.len()
    }

    pub fn at(&self, pos: usize) -> &Position {
        &self.positions[pos]
    }

    pub fn at_mut(&mut self, pos: usize) -> &mut Position {
        &mut self.positions[pos]
    }

    /// Compute the successor-offset table from the expansion sizes.
    /// Call once after every position of the layer is complete.
    pub fn consolidate(&mut self) {
        self.successors = Vec::with_capacity(self.size() + 1);
        self.successors.push(0);
        for p in 0..self.size() {
            let next = self.successors[p] + self.positions[p].max_expansion_size;
            self.successors.push(next);
        }
    }

    pub fn successor_pos(&self, pos: usize) -> usize {
        self.successors[pos]
    }

    pub fn next_layer_size(&self) -> usize {
        *self.successors.last().expect("layer not consolidated")
    }
}
