//! The SAT encoder.
//!
//! Maps sealed positions into propositional variables and clauses,
//! drives the incremental solver, and reads plans back out of models.
//! Clause emission is grouped into named stages whose counts are
//! tracked and reported.

use crate::htn::HtnInstance;
use crate::layer::{Layer, Position, VarType};
use crate::params::Params;
use crate::plan::{Plan, PlanItem};
use crate::sig::{FxMap, FxSet, Sig, Usig};
use crate::solver::{SatSolver, SolveResult, TerminateFn};
use crate::symbol::Sym;
use lasso::Key;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Stage {
    ActionConstraints = 0,
    ActionEffects,
    AtLeastOneElement,
    AtMostOneElement,
    AxiomaticOps,
    DirectFrameAxioms,
    Expansions,
    FactPropagation,
    FactVarEncoding,
    ForbiddenOperations,
    IndirectFrameAxioms,
    InitSubstitutions,
    Predecessors,
    QConstEquality,
    QFactSemantics,
    QTypeConstraints,
    ReductionConstraints,
    SubstitutionConstraints,
    TrueFacts,
    Assumptions,
    PlanLengthCounting,
}

pub const NUM_STAGES: usize = 21;

pub const STAGE_NAMES: [&str; NUM_STAGES] = [
    "actionconstraints",
    "actioneffects",
    "atleastoneelement",
    "atmostoneelement",
    "axiomaticops",
    "directframeaxioms",
    "expansions",
    "factpropagation",
    "factvarencoding",
    "forbiddenoperations",
    "indirectframeaxioms",
    "initsubstitutions",
    "predecessors",
    "qconstequality",
    "qfactsemantics",
    "qtypeconstraints",
    "reductionconstraints",
    "substitutionconstraints",
    "truefacts",
    "assumptions",
    "planlengthcounting",
];

pub struct Encoding<S: SatSolver> {
    solver: S,
    params: Params,

    next_var: i32,
    /// Global (q-constant, constant) -> variable table.
    substitution_vars: FxMap<(Sym, Sym), i32>,
    /// Q-constants whose substitution domain clauses were emitted.
    encoded_q_domains: FxSet<Sym>,
    /// Global q-equality variable table, keyed with the smaller symbol
    /// first.
    q_equality_vars: FxMap<(Sym, Sym), i32>,

    stage_counts: [usize; NUM_STAGES],
    stage_stack: Vec<Stage>,
    num_clauses: usize,
    num_lits: usize,

    /// DIMACS-like mirror of every clause, when `print_formula` is set.
    formula_dump: Option<String>,

    /// Plan-length counter registers, built once per optimization run.
    counter_registers: Vec<Vec<i32>>,
}

impl<S: SatSolver> Encoding<S> {
    pub fn new(params: &Params, solver: S) -> Self {
        Self {
            solver,
            params: params.clone(),
            next_var: 0,
            substitution_vars: FxMap::default(),
            encoded_q_domains: FxSet::default(),
            q_equality_vars: FxMap::default(),
            stage_counts: [0; NUM_STAGES],
            stage_stack: Vec::new(),
            num_clauses: 0,
            num_lits: 0,
            formula_dump: if params.print_formula {
                Some(String::new())
            } else {
                None
            },
            counter_registers: Vec::new(),
        }
    }

    pub fn set_terminate(&mut self, callback: Option<TerminateFn>) {
        self.solver.set_terminate(callback);
    }

    pub fn formula_dump(&self) -> Option<&str> {
        self.formula_dump.as_deref()
    }

    pub fn num_clauses(&self) -> usize {
        self.num_clauses
    }

    pub fn stage_count(&self, stage: Stage) -> usize {
        self.stage_counts[stage as usize]
    }

    // ----- clause plumbing -----

    fn new_var(&mut self) -> i32 {
        self.next_var += 1;
        self.next_var
    }

    fn begin(&mut self, stage: Stage) {
        self.stage_stack.push(stage);
    }

    fn end(&mut self, stage: Stage) {
        let top = self.stage_stack.pop();
        debug_assert_eq!(top, Some(stage), "mismatched encoding stage");
    }

    fn add_clause(&mut self, lits: &[i32]) {
        let stage = *self
            .stage_stack
            .last()
            .expect("clause emitted outside any stage");
        for &lit in lits {
            debug_assert!(lit != 0);
            self.solver.add(lit);
        }
        self.solver.add(0);
        self.num_clauses += 1;
        self.num_lits += lits.len();
        self.stage_counts[stage as usize] += 1;
        if let Some(dump) = &mut self.formula_dump {
            for &lit in lits {
                dump.push_str(&lit.to_string());
                dump.push(' ');
            }
            dump.push_str("0\n");
        }
    }

    /// Allocate or fetch the variable of `sig` at `pos`. Ids are
    /// monotone across the whole run and never reallocated.
    fn var(&mut self, pos: &mut Position, vt: VarType, sig: &Usig) -> i32 {
        if let Some(v) = pos.variable_or_zero(vt, sig) {
            return v;
        }
        let v = self.new_var();
        pos.set_variable(vt, sig, v);
        v
    }

    /// Emit the at-most-one / at-least-one domain clauses of a
    /// q-constant on first contact.
    fn ensure_q_domain(&mut self, htn: &HtnInstance, q: Sym) {
        if !self.encoded_q_domains.insert(q) {
            return;
        }
        let domain = htn.q_domain(q).to_vec();
        if domain.is_empty() {
            return;
        }
        let mut vars: Vec<i32> = Vec::with_capacity(domain.len());
        for &c in &domain {
            let v = self.new_var();
            self.substitution_vars.insert((q, c), v);
            vars.push(v);
        }
        self.begin(Stage::InitSubstitutions);
        for i in 0..vars.len() {
            for j in (i + 1)..vars.len() {
                self.add_clause(&[-vars[i], -vars[j]]);
            }
        }
        self.add_clause(&vars);
        self.end(Stage::InitSubstitutions);
    }

    fn var_substitution(&mut self, htn: &HtnInstance, q: Sym, c: Sym) -> i32 {
        self.ensure_q_domain(htn, q);
        *self
            .substitution_vars
            .get(&(q, c))
            .unwrap_or_else(|| panic!("constant outside the domain of its q-constant"))
    }

    fn var_q_equality(&mut self, htn: &HtnInstance, q1: Sym, q2: Sym) -> i32 {
        let key = if q1.into_usize() <= q2.into_usize() {
            (q1, q2)
        } else {
            (q2, q1)
        };
        if let Some(&v) = self.q_equality_vars.get(&key) {
            return v;
        }
        let eq_var = self.new_var();
        self.q_equality_vars.insert(key, eq_var);

        // eq <-> some common constant is chosen by both.
        let dom1 = htn.q_domain(q1).to_vec();
        let dom2 = htn.q_domain(q2).to_vec();
        let common: Vec<Sym> = dom1.iter().filter(|c| dom2.contains(c)).copied().collect();
        self.begin(Stage::QConstEquality);
        let mut witnesses = Vec::with_capacity(common.len());
        for &c in &common {
            let s1 = self.var_substitution(htn, q1, c);
            let s2 = self.var_substitution(htn, q2, c);
            self.add_clause(&[-s1, -s2, eq_var]);
            let w = self.new_var();
            self.add_clause(&[-w, s1]);
            self.add_clause(&[-w, s2]);
            witnesses.push(w);
        }
        let mut alo = vec![-eq_var];
        alo.extend(&witnesses);
        self.add_clause(&alo);
        self.end(Stage::QConstEquality);
        eq_var
    }

    /// Positional substitution pairs turning the q-fact into the
    /// decoded ground fact. None if an occurrence conflict makes the
    /// decoding impossible.
    fn decoding_pairs(htn: &HtnInstance, qfact: &Usig, decoded: &Usig) -> Option<Vec<(Sym, Sym)>> {
        let mut pairs: Vec<(Sym, Sym)> = Vec::new();
        for (&qa, &da) in qfact.args.iter().zip(decoded.args.iter()) {
            if htn.is_q_constant(qa) {
                if let Some(&(_, prev)) = pairs.iter().find(|(q, _)| *q == qa) {
                    if prev != da {
                        return None;
                    }
                } else {
                    pairs.push((qa, da));
                }
            } else if qa != da {
                return None;
            }
        }
        Some(pairs)
    }

    // ----- position encoding -----

    /// Encode one sealed position: variables plus all clause families
    /// that depend only on this position, its left neighbor and the
    /// position above it.
    pub fn encode(
        &mut self,
        htn: &mut HtnInstance,
        layers: &mut [Layer],
        layer_idx: usize,
        pos: usize,
        old_pos: Option<usize>,
    ) {
        let (below, rest) = layers.split_at_mut(layer_idx);
        let layer = &mut rest[0];
        let above_layer = below.last();
        let (head, tail) = layer.positions.split_at_mut(pos);
        let left = head.last();
        let cur = &mut tail[0];
        let (above, offset) = match (above_layer, old_pos) {
            (Some(al), Some(op)) => (Some(al.at(op)), pos - al.successor_pos(op)),
            _ => (None, 0),
        };

        debug!(
            layer = layer_idx,
            pos,
            actions = cur.actions.len(),
            reductions = cur.reductions.len(),
            facts = cur.facts.len(),
            qfacts = cur.num_qfacts(),
            "encoding position"
        );

        self.encode_operation_variables(cur);
        self.encode_fact_variables(cur, above, offset);
        self.encode_operation_constraints(htn, cur);
        if let Some(left) = left {
            self.encode_action_effects(htn, cur, left);
            self.encode_frame_axioms(htn, cur, left);
        }
        self.encode_qfact_semantics(htn, cur);
        if let Some(above) = above {
            self.encode_subtask_relationships(cur, above);
        }
    }

    fn encode_operation_variables(&mut self, cur: &mut Position) {
        let actions: Vec<Usig> = cur.actions.iter().cloned().collect();
        let reductions: Vec<Usig> = cur.reductions.iter().cloned().collect();
        for sig in &actions {
            self.var(cur, VarType::Op, sig);
        }
        for sig in &reductions {
            self.var(cur, VarType::Op, sig);
        }

        if self.params.implicit_primitiveness {
            return;
        }
        let prim = self.new_var();
        cur.primitive_var = Some(prim);
        self.begin(Stage::ActionConstraints);
        for sig in &actions {
            let v = cur.get_variable(VarType::Op, sig);
            self.add_clause(&[-v, prim]);
        }
        self.end(Stage::ActionConstraints);
        self.begin(Stage::ReductionConstraints);
        for sig in &reductions {
            let v = cur.get_variable(VarType::Op, sig);
            self.add_clause(&[-v, -prim]);
        }
        self.end(Stage::ReductionConstraints);
    }

    fn encode_fact_variables(&mut self, cur: &mut Position, above: Option<&Position>, offset: usize) {
        self.begin(Stage::FactVarEncoding);
        let facts: Vec<Usig> = cur.facts.iter().cloned().collect();
        for f in &facts {
            self.var(cur, VarType::Fact, f);
        }
        let qfacts: Vec<Usig> = cur.qfacts.values().flatten().cloned().collect();
        for f in &qfacts {
            self.var(cur, VarType::Fact, f);
        }
        self.end(Stage::FactVarEncoding);

        self.begin(Stage::TrueFacts);
        let trues: Vec<Usig> = cur.true_facts.iter().cloned().collect();
        for f in trues {
            let v = cur.get_variable(VarType::Fact, &f);
            self.add_clause(&[v]);
        }
        let falses: Vec<Usig> = cur.false_facts.iter().cloned().collect();
        for f in falses {
            let v = cur.get_variable(VarType::Fact, &f);
            self.add_clause(&[-v]);
        }
        self.end(Stage::TrueFacts);

        // At offset 0 the child position denotes the same time point as
        // its parent: link the shared facts with equivalences.
        if offset == 0 {
            if let Some(above) = above {
                self.begin(Stage::FactPropagation);
                for f in facts.iter().chain(qfacts.iter()) {
                    if let Some(av) = above.variable_or_zero(VarType::Fact, f) {
                        let v = cur.get_variable(VarType::Fact, f);
                        self.add_clause(&[-v, av]);
                        self.add_clause(&[v, -av]);
                    }
                }
                self.end(Stage::FactPropagation);
            }
        }
    }

    fn encode_operation_constraints(&mut self, htn: &mut HtnInstance, cur: &mut Position) {
        let actions: Vec<Usig> = cur.actions.iter().cloned().collect();
        let reductions: Vec<Usig> = cur.reductions.iter().cloned().collect();
        let all_ops: Vec<i32> = actions
            .iter()
            .chain(reductions.iter())
            .map(|sig| cur.get_variable(VarType::Op, sig))
            .collect();

        self.begin(Stage::AtMostOneElement);
        for i in 0..all_ops.len() {
            for j in (i + 1)..all_ops.len() {
                self.add_clause(&[-all_ops[i], -all_ops[j]]);
            }
        }
        self.end(Stage::AtMostOneElement);

        if !all_ops.is_empty() {
            self.begin(Stage::AtLeastOneElement);
            self.add_clause(&all_ops);
            self.end(Stage::AtLeastOneElement);
        }

        if !cur.axiomatic_ops.is_empty() && cur.axiomatic_ops.len() < all_ops.len() {
            let vars: Vec<i32> = cur
                .axiomatic_ops
                .iter()
                .map(|sig| cur.get_variable(VarType::Op, sig))
                .collect();
            self.begin(Stage::AxiomaticOps);
            self.add_clause(&vars);
            self.end(Stage::AxiomaticOps);
        }

        // Preconditions, substitution domains, type constraints.
        for (sigs, stage) in [
            (&actions, Stage::ActionConstraints),
            (&reductions, Stage::ReductionConstraints),
        ] {
            for sig in sigs.iter() {
                let op_var = cur.get_variable(VarType::Op, sig);
                for &arg in sig.args.iter() {
                    if htn.is_q_constant(arg) {
                        self.ensure_q_domain(htn, arg);
                    }
                }
                let op = match htn.get_op(sig) {
                    Some(op) => op.clone(),
                    None => continue,
                };
                for pre in op.preconditions.iter().chain(op.extra_preconditions.iter()) {
                    if pre.usig.name == htn.equality_name {
                        self.encode_equality_precondition(htn, op_var, pre);
                        continue;
                    }
                    let fv = cur.get_variable(VarType::Fact, &pre.usig);
                    let lit = if pre.negated { -fv } else { fv };
                    self.begin(stage);
                    self.add_clause(&[-op_var, lit]);
                    self.end(stage);
                }
            }
        }

        // Q-constant type constraints introduced by operators here.
        let constraints: Vec<(Usig, crate::htn::TypeConstraint)> = cur
            .q_constraints
            .iter()
            .flat_map(|(op, cs)| cs.iter().map(move |c| (op.clone(), c.clone())))
            .collect();
        self.begin(Stage::QTypeConstraints);
        for (op_sig, constraint) in constraints {
            if !cur.has_op(&op_sig) {
                continue;
            }
            let op_var = cur.get_variable(VarType::Op, &op_sig);
            let domain = htn.q_domain(constraint.q).to_vec();
            for c in domain {
                if !constraint.allowed.contains(&c) {
                    let sv = self.var_substitution(htn, constraint.q, c);
                    self.add_clause(&[-op_var, -sv]);
                }
            }
        }
        self.end(Stage::QTypeConstraints);

        // Substitution choices refuted by q-fact decoding.
        let forbidden: Vec<(Usig, Vec<crate::subst::Substitution>)> = cur
            .forbidden_substitutions
            .iter()
            .map(|(op, subs)| (op.clone(), subs.clone()))
            .collect();
        self.begin(Stage::SubstitutionConstraints);
        for (op_sig, subs) in forbidden {
            if !cur.has_op(&op_sig) {
                continue;
            }
            let op_var = cur.get_variable(VarType::Op, &op_sig);
            for sub in subs {
                let mut clause = vec![-op_var];
                for (q, c) in sub.iter() {
                    clause.push(-self.var_substitution(htn, q, c));
                }
                self.add_clause(&clause);
            }
        }
        self.end(Stage::SubstitutionConstraints);
    }

    fn encode_equality_precondition(&mut self, htn: &HtnInstance, op_var: i32, pre: &Sig) {
        debug_assert_eq!(pre.usig.args.len(), 2);
        let (a, b) = (pre.usig.args[0], pre.usig.args[1]);
        let a_q = htn.is_q_constant(a);
        let b_q = htn.is_q_constant(b);
        match (a_q, b_q) {
            (false, false) => {
                // Static: forbid the operator when violated.
                if (a == b) == pre.negated {
                    self.begin(Stage::ForbiddenOperations);
                    self.add_clause(&[-op_var]);
                    self.end(Stage::ForbiddenOperations);
                }
            }
            (true, true) => {
                let eq = self.var_q_equality(htn, a, b);
                let lit = if pre.negated { -eq } else { eq };
                self.begin(Stage::QConstEquality);
                self.add_clause(&[-op_var, lit]);
                self.end(Stage::QConstEquality);
            }
            (true, false) | (false, true) => {
                let (q, c) = if a_q { (a, b) } else { (b, a) };
                if !htn.q_domain(q).contains(&c) {
                    if !pre.negated {
                        self.begin(Stage::ForbiddenOperations);
                        self.add_clause(&[-op_var]);
                        self.end(Stage::ForbiddenOperations);
                    }
                    return;
                }
                let sv = self.var_substitution(htn, q, c);
                let lit = if pre.negated { -sv } else { sv };
                self.begin(Stage::QConstEquality);
                self.add_clause(&[-op_var, lit]);
                self.end(Stage::QConstEquality);
            }
        }
    }

    /// Effects of the actions at `left` take hold at `cur`.
    fn encode_action_effects(&mut self, htn: &mut HtnInstance, cur: &mut Position, left: &Position) {
        self.begin(Stage::ActionEffects);
        let left_actions: Vec<Usig> = left.actions.iter().cloned().collect();
        for a_sig in left_actions {
            let op_var = left.get_variable(VarType::Op, &a_sig);
            let changes: Vec<Sig> = left.get_fact_changes(&a_sig).to_vec();
            for eff in changes {
                let ev = cur.get_variable(VarType::Fact, &eff.usig);
                let lit = if eff.negated { -ev } else { ev };
                self.add_clause(&[-op_var, lit]);

                if !htn.has_q_constants(&eff.usig) {
                    continue;
                }
                // Decoded effects, conditional on the substitution that
                // produces them.
                let decodings: Vec<Usig> = htn
                    .q_fact_decodings(&eff.usig)
                    .map(|s| s.iter().cloned().collect())
                    .unwrap_or_default();
                for dec in decodings {
                    let pairs = match Self::decoding_pairs(htn, &eff.usig, &dec) {
                        Some(p) => p,
                        None => continue,
                    };
                    let dv = match cur.variable_or_zero(VarType::Fact, &dec) {
                        Some(v) => v,
                        None => continue,
                    };
                    let mut clause = vec![-op_var];
                    for (q, c) in pairs {
                        clause.push(-self.var_substitution(htn, q, c));
                    }
                    clause.push(if eff.negated { -dv } else { dv });
                    self.add_clause(&clause);
                }
            }
        }
        self.end(Stage::ActionEffects);
    }

    /// A ground fact may only change between `left` and `cur` if some
    /// operator at `left` supports the change.
    fn encode_frame_axioms(&mut self, htn: &mut HtnInstance, cur: &mut Position, left: &Position) {
        let facts: Vec<Usig> = cur.facts.iter().cloned().collect();
        for f in facts {
            let prev = match left.variable_or_zero(VarType::Fact, &f) {
                Some(v) => v,
                None => continue,
            };
            let here = cur.get_variable(VarType::Fact, &f);

            for becomes_true in [true, false] {
                let effect_sig = f.to_sig(!becomes_true);
                let base = if becomes_true {
                    [prev, -here]
                } else {
                    [-prev, here]
                };

                let mut lits: Vec<i32> = base.to_vec();

                // Non-primitive excuse for facts with unspecified
                // support, whether touched under the ground fact or a
                // q-fact decoding to it.
                let touched = cur.touched_supports.contains(&effect_sig)
                    || cur.touched_supports.iter().any(|t| {
                        t.negated == effect_sig.negated
                            && t.usig.name == f.name
                            && htn.has_q_constants(&t.usig)
                            && Self::decoding_pairs(htn, &t.usig, &f).map_or(false, |ps| {
                                ps.iter().all(|(q, c)| htn.q_domain(*q).contains(c))
                            })
                    });
                if touched {
                    if self.params.implicit_primitiveness {
                        for r in left.reductions.iter() {
                            lits.push(left.get_variable(VarType::Op, r));
                        }
                    } else if let Some(prim) = left.primitive_var {
                        lits.push(-prim);
                    }
                }

                // Direct supports: operators whose ground effect is f.
                if let Some(ops) = cur.fact_supports.get(&effect_sig) {
                    for op in ops.iter() {
                        lits.push(left.get_variable(VarType::Op, op));
                    }
                }

                // Indirect supports: q-operators some decoding of whose
                // effect is f; each contributes a witness implying the
                // operator and its substitution.
                let indirect: Vec<(Usig, Vec<(Sym, Sym)>)> = cur
                    .fact_supports
                    .iter()
                    .filter(|(eff, _)| {
                        eff.negated == effect_sig.negated
                            && eff.usig.name == f.name
                            && htn.has_q_constants(&eff.usig)
                    })
                    .flat_map(|(eff, ops)| {
                        let pairs = Self::decoding_pairs(htn, &eff.usig, &f);
                        ops.iter()
                            .filter_map(move |op| pairs.clone().map(|p| (op.clone(), p)))
                            .collect::<Vec<_>>()
                    })
                    .collect();
                self.begin(Stage::IndirectFrameAxioms);
                for (op, pairs) in indirect {
                    let valid = pairs.iter().all(|(q, c)| htn.q_domain(*q).contains(c));
                    if !valid {
                        continue;
                    }
                    let op_var = left.get_variable(VarType::Op, &op);
                    let witness = self.new_var();
                    self.add_clause(&[-witness, op_var]);
                    for (q, c) in pairs {
                        let sv = self.var_substitution(htn, q, c);
                        self.add_clause(&[-witness, sv]);
                    }
                    lits.push(witness);
                }
                self.end(Stage::IndirectFrameAxioms);

                self.begin(Stage::DirectFrameAxioms);
                self.add_clause(&lits);
                self.end(Stage::DirectFrameAxioms);
            }
        }
    }

    /// A q-fact is true iff some decoding is true under the chosen
    /// substitution.
    fn encode_qfact_semantics(&mut self, htn: &mut HtnInstance, cur: &mut Position) {
        self.begin(Stage::QFactSemantics);
        let qfacts: Vec<Usig> = cur.qfacts.values().flatten().cloned().collect();
        for qf in qfacts {
            let qv = cur.get_variable(VarType::Fact, &qf);
            let decodings: Vec<Usig> = htn
                .q_fact_decodings(&qf)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default();
            for dec in decodings {
                let dv = match cur.variable_or_zero(VarType::Fact, &dec) {
                    Some(v) => v,
                    None => continue,
                };
                let pairs = match Self::decoding_pairs(htn, &qf, &dec) {
                    Some(p) => p,
                    None => continue,
                };
                if !pairs.iter().all(|(q, c)| htn.q_domain(*q).contains(c)) {
                    continue;
                }
                let mut subst_lits = Vec::with_capacity(pairs.len());
                for (q, c) in pairs {
                    subst_lits.push(-self.var_substitution(htn, q, c));
                }
                let mut to_dec = vec![-qv];
                to_dec.extend(&subst_lits);
                to_dec.push(dv);
                self.add_clause(&to_dec);
                let mut from_dec = vec![qv];
                from_dec.extend(&subst_lits);
                from_dec.push(-dv);
                self.add_clause(&from_dec);
            }
        }
        self.end(Stage::QFactSemantics);
    }

    /// Parents imply a child; children imply a parent; parents with no
    /// valid child are forbidden.
    fn encode_subtask_relationships(&mut self, cur: &mut Position, above: &Position) {
        self.begin(Stage::Expansions);
        let mut child_parents: FxMap<Usig, Vec<i32>> = FxMap::default();
        let expansions: Vec<(Usig, Vec<Usig>)> = cur
            .expansions
            .iter()
            .map(|(p, cs)| (p.clone(), cs.iter().cloned().collect()))
            .collect();
        for (parent, children) in &expansions {
            let pv = above.get_variable(VarType::Op, parent);
            let mut clause = vec![-pv];
            for child in children {
                clause.push(cur.get_variable(VarType::Op, child));
                child_parents.entry(child.clone()).or_default().push(pv);
            }
            self.add_clause(&clause);
        }
        self.end(Stage::Expansions);

        self.begin(Stage::ForbiddenOperations);
        let forbidden: Vec<Usig> = cur.forbidden_parents.iter().cloned().collect();
        for parent in forbidden {
            let pv = above.get_variable(VarType::Op, &parent);
            self.add_clause(&[-pv]);
        }
        self.end(Stage::ForbiddenOperations);

        self.begin(Stage::Predecessors);
        for (child, parents) in child_parents {
            let cv = cur.get_variable(VarType::Op, &child);
            let mut clause = vec![-cv];
            clause.extend(parents);
            self.add_clause(&clause);
        }
        self.end(Stage::Predecessors);
    }

    // ----- assumptions and solving -----

    /// Assume every position of the layer primitive and the goal action
    /// true. Re-issued before every solve; `permanent` turns them into
    /// unit clauses instead.
    pub fn add_assumptions(&mut self, htn: &HtnInstance, layers: &[Layer], layer_idx: usize, permanent: bool) {
        let layer = &layers[layer_idx];
        let mut lits: Vec<i32> = Vec::new();
        for p in 0..layer.size() {
            let pos = layer.at(p);
            if self.params.implicit_primitiveness {
                for r in pos.reductions.iter() {
                    lits.push(-pos.get_variable(VarType::Op, r));
                }
            } else if let Some(prim) = pos.primitive_var {
                lits.push(prim);
            }
        }
        if layer.size() > 0 {
            let goal_sig = Usig::nullary(htn.goal_action_name);
            if let Some(gv) = layer
                .at(layer.size() - 1)
                .variable_or_zero(VarType::Op, &goal_sig)
            {
                lits.push(gv);
            }
        }
        if permanent {
            self.begin(Stage::Assumptions);
            for lit in lits {
                self.add_clause(&[lit]);
            }
            self.end(Stage::Assumptions);
        } else {
            for lit in lits {
                self.solver.assume(lit);
            }
        }
    }

    pub fn solve(&mut self) -> SolveResult {
        info!(
            vars = self.next_var,
            clauses = self.num_clauses,
            literals = self.num_lits,
            "invoking SAT solver"
        );
        let result = self.solver.solve();
        info!(?result, "solver returned");
        result
    }

    pub fn print_stages(&self) {
        for (i, name) in STAGE_NAMES.iter().enumerate() {
            if self.stage_counts[i] > 0 {
                info!(stage = name, clauses = self.stage_counts[i], "stage statistics");
            }
        }
    }

    // ----- plan extraction -----

    fn true_op(&self, candidates: &crate::sig::USigSet, pos: &Position) -> Option<Usig> {
        let mut found: Option<Usig> = None;
        for sig in candidates.iter() {
            let v = pos.get_variable(VarType::Op, sig);
            if self.solver.val(v) > 0 {
                debug_assert!(found.is_none(), "at-most-one violated in the model");
                found = Some(sig.clone());
            }
        }
        found
    }

    /// Resolve each q-constant argument through the substitution
    /// variables of the model.
    fn decode_q_sig(&self, htn: &HtnInstance, sig: &Usig) -> Usig {
        let mut out = sig.clone();
        for arg in out.args.iter_mut() {
            if !htn.is_q_constant(*arg) {
                continue;
            }
            for &c in htn.q_domain(*arg) {
                if let Some(&sv) = self.substitution_vars.get(&(*arg, c)) {
                    if self.solver.val(sv) > 0 {
                        *arg = c;
                        break;
                    }
                }
            }
        }
        out
    }

    /// Read the model back as a classical plan plus the decomposition
    /// tree that produced it.
    pub fn extract_plan(&self, htn: &HtnInstance, layers: &[Layer]) -> Plan {
        let final_idx = layers.len() - 1;
        let final_layer = &layers[final_idx];

        let mut classical = Vec::new();
        for p in 0..final_layer.size() {
            let pos = final_layer.at(p);
            let a_sig = match self.true_op(&pos.actions, pos) {
                Some(a) => a,
                None => continue,
            };
            if a_sig.name == htn.blank_name || a_sig.name == htn.goal_action_name {
                continue;
            }
            classical.push(PlanItem {
                id: p as i64,
                task: self.decode_q_sig(htn, &a_sig),
                reduction: None,
                subtask_ids: Vec::new(),
            });
        }

        let mut decomposition = Vec::new();
        let mut next_id = final_layer.size() as i64;
        let mut reduction_ids: FxMap<(usize, usize), i64> = FxMap::default();

        for k in 0..final_idx {
            let layer = &layers[k];
            for p in 0..layer.size() {
                let pos = layer.at(p);
                let r_sig = match self.true_op(&pos.reductions, pos) {
                    Some(r) => r,
                    None => continue,
                };
                let id = *reduction_ids.entry((k, p)).or_insert_with(|| {
                    let i = next_id;
                    next_id += 1;
                    i
                });
                let red = htn
                    .reductions_by_sig
                    .get(&r_sig)
                    .expect("satisfied reduction is registered");
                let base = layer.successor_pos(p);
                let span = pos.max_expansion_size.min(red.subtasks.len());
                let mut subtask_ids = Vec::with_capacity(span);
                for o in 0..span {
                    if let Some(cid) = self.item_id(
                        htn,
                        layers,
                        final_idx,
                        k + 1,
                        base + o,
                        &mut reduction_ids,
                        &mut next_id,
                    ) {
                        subtask_ids.push(cid);
                    }
                }
                decomposition.push(PlanItem {
                    id,
                    task: self.decode_q_sig(htn, &red.task),
                    reduction: Some(self.decode_q_sig(htn, &r_sig)),
                    subtask_ids,
                });
            }
        }

        Plan {
            classical,
            decomposition,
        }
    }

    /// Plan-item id of the operator satisfied at (layer, pos): actions
    /// chase their offset-0 propagation chain down to the final layer
    /// and take its position index; reductions get fresh ids.
    #[allow(clippy::too_many_arguments)]
    fn item_id(
        &self,
        htn: &HtnInstance,
        layers: &[Layer],
        final_idx: usize,
        k: usize,
        p: usize,
        reduction_ids: &mut FxMap<(usize, usize), i64>,
        next_id: &mut i64,
    ) -> Option<i64> {
        let pos = layers[k].at(p);
        if let Some(a_sig) = self.true_op(&pos.actions, pos) {
            if a_sig.name == htn.blank_name || a_sig.name == htn.goal_action_name {
                return None;
            }
            let mut kk = k;
            let mut pp = p;
            while kk < final_idx {
                pp = layers[kk].successor_pos(pp);
                kk += 1;
            }
            return Some(pp as i64);
        }
        if self.true_op(&pos.reductions, pos).is_some() {
            let id = *reduction_ids.entry((k, p)).or_insert_with(|| {
                let i = *next_id;
                *next_id += 1;
                i
            });
            return Some(id);
        }
        None
    }

    // ----- plan-length optimization -----

    /// Shrink the plan by binary search on a sequential at-most-k
    /// counter over "this position holds a real action" witnesses.
    /// `permanent` asserts each improvement as a hard bound.
    pub fn optimize_plan(
        &mut self,
        htn: &HtnInstance,
        layers: &[Layer],
        plan: &mut Plan,
        permanent: bool,
    ) {
        let upper = plan.length();
        if upper == 0 {
            return;
        }
        let final_idx = layers.len() - 1;
        let layer = &layers[final_idx];
        let n = layer.size();

        self.begin(Stage::PlanLengthCounting);
        let mut nonempty: Vec<i32> = Vec::with_capacity(n);
        for p in 0..n {
            let pos = layer.at(p);
            let np = self.new_var();
            for a in pos.actions.iter() {
                if a.name == htn.blank_name || a.name == htn.goal_action_name {
                    continue;
                }
                let v = pos.get_variable(VarType::Op, a);
                self.add_clause(&[-v, np]);
            }
            nonempty.push(np);
        }

        // registers[p][j]: at least j+1 real actions among 0..=p.
        let kmax = upper;
        let mut registers: Vec<Vec<i32>> = Vec::with_capacity(n);
        for _ in 0..n {
            let mut row = Vec::with_capacity(kmax);
            for _ in 0..kmax {
                row.push(self.new_var());
            }
            registers.push(row);
        }
        for p in 0..n {
            for j in 0..kmax {
                if p > 0 {
                    self.add_clause(&[-registers[p - 1][j], registers[p][j]]);
                }
                if j == 0 {
                    self.add_clause(&[-nonempty[p], registers[p][0]]);
                } else if p > 0 {
                    self.add_clause(&[-registers[p - 1][j - 1], -nonempty[p], registers[p][j]]);
                }
            }
        }
        self.counter_registers = registers;
        self.end(Stage::PlanLengthCounting);

        let last = n - 1;
        let mut best = upper;
        let mut lo = 0usize;
        let mut hi = upper - 1;
        while lo <= hi {
            let mid = (lo + hi) / 2;
            self.add_assumptions(htn, layers, final_idx, false);
            let bound_lit = -self.counter_registers[last][mid];
            self.solver.assume(bound_lit);
            match self.solve() {
                SolveResult::Sat => {
                    let improved = self.extract_plan(htn, layers);
                    best = improved.length();
                    *plan = improved;
                    debug!(best, "plan length improved");
                    if permanent {
                        let hard_lit = -self.counter_registers[last][best];
                        self.begin(Stage::PlanLengthCounting);
                        self.add_clause(&[hard_lit]);
                        self.end(Stage::PlanLengthCounting);
                    }
                    if best == 0 {
                        break;
                    }
                    hi = best - 1;
                }
                SolveResult::Unsat => {
                    lo = mid + 1;
                }
                SolveResult::Unknown => break,
            }
        }
        info!(length = best, "plan length after optimization");
    }
}
