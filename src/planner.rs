//! The layer planner: builds the decomposition hierarchy one depth at a
//! time and drives the encoder to a solution.
//!
//! Positions are created strictly left-to-right within a layer and
//! layer-by-layer; each position is mutated only during its own
//! creation, then sealed and handed to the encoder. The reachable-state
//! oracle the instantiator sees is a closure over the current layer
//! state, evaluated at the position being built.

use crate::encoding::Encoding;
use crate::error::PlanError;
use crate::htn::HtnInstance;
use crate::instantiate::Instantiator;
use crate::layer::Layer;
use crate::params::Params;
use crate::plan::Plan;
use crate::sig::{FxSet, Sig, Usig};
use crate::solver::{SatSolver, SolveResult, TerminateFn};
use crate::subst::Substitution;
use crate::symbol::Sym;
use tracing::{debug, info};

pub struct Planner<S: SatSolver> {
    htn: HtnInstance,
    params: Params,
    instantiator: Instantiator,
    enc: Encoding<S>,
    layers: Vec<Layer>,
    layer_idx: usize,
    pos: usize,
    old_pos: usize,
}

impl<S: SatSolver> Planner<S> {
    pub fn new(htn: HtnInstance, params: Params, solver: S) -> Self {
        let instantiator = Instantiator::new(&params);
        let enc = Encoding::new(&params, solver);
        Self {
            htn,
            params,
            instantiator,
            enc,
            layers: Vec::new(),
            layer_idx: 0,
            pos: 0,
            old_pos: 0,
        }
    }

    pub fn htn(&self) -> &HtnInstance {
        &self.htn
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn set_terminate(&mut self, callback: Option<TerminateFn>) {
        self.enc.set_terminate(callback);
    }

    pub fn format_plan(&self, plan: &Plan) -> String {
        plan.format(&self.htn)
    }

    /// The expand/solve loop: grow one layer per iteration, solving from
    /// iteration `d` on, until SAT, depth exhaustion, unsolvability (with
    /// `cs`) or interruption.
    pub fn find_plan(&mut self) -> Result<Plan, PlanError> {
        let mut iteration = 0usize;
        info!(iteration, "creating initial layer");
        self.create_first_layer()?;

        let first_solve = self.params.first_solve_iteration;
        let max_iterations = self.params.max_iterations;

        let mut solved = false;
        if iteration >= first_solve {
            self.enc
                .add_assumptions(&self.htn, &self.layers, self.layer_idx, false);
            solved = Self::check_result(self.enc.solve())?;
        }

        while !solved && (max_iterations == 0 || iteration < max_iterations) {
            if iteration >= first_solve {
                if self.params.check_solvability {
                    debug!(layer = self.layer_idx, "unsolvable with assumptions, retrying without");
                    match self.enc.solve() {
                        SolveResult::Unsat => return Err(PlanError::Unsolvable),
                        SolveResult::Unknown => return Err(PlanError::Interrupted),
                        SolveResult::Sat => {
                            debug!("solvable without assumptions, expanding another layer")
                        }
                    }
                } else {
                    debug!(layer = self.layer_idx, "unsolvable at this depth, expanding");
                }
            }

            iteration += 1;
            info!(iteration, "expanding next layer");
            self.create_next_layer()?;

            if iteration >= first_solve {
                self.enc
                    .add_assumptions(&self.htn, &self.layers, self.layer_idx, false);
                solved = Self::check_result(self.enc.solve())?;
            }
        }

        if !solved {
            info!("no success");
            return Err(PlanError::DepthExhausted(iteration));
        }

        info!(layer = self.layer_idx, "found a solution");
        let mut plan = self.enc.extract_plan(&self.htn, &self.layers);
        if self.params.optimize {
            self.enc
                .optimize_plan(&self.htn, &self.layers, &mut plan, false);
        }
        self.enc.print_stages();
        Ok(plan)
    }

    fn check_result(result: SolveResult) -> Result<bool, PlanError> {
        match result {
            SolveResult::Sat => Ok(true),
            SolveResult::Unsat => Ok(false),
            SolveResult::Unknown => Err(PlanError::Interrupted),
        }
    }

    // ----- layer construction -----

    /// Layer 0: position 0 holds the initial state and the instantiated
    /// root reduction choices; position 1 holds the virtual goal action.
    fn create_first_layer(&mut self) -> Result<(), PlanError> {
        self.layers.push(Layer::new(0, 2));
        self.layer_idx = 0;
        self.pos = 0;

        let init: Vec<Sig> = self.htn.init_state().iter().cloned().collect();
        {
            let layer = &mut self.layers[0];
            let pos0 = layer.at_mut(0);
            for fact in &init {
                pos0.add_fact(fact.usig.clone());
                pos0.add_definitive_fact(fact);
            }
            for fact in &init {
                layer.state.add(0, fact);
            }
        }

        let init_red = self.htn.init_reduction().clone();
        let choices = {
            let state = &self.layers[0].state;
            let oracle = |sig: &Sig| state.contains(0, sig);
            self.instantiator
                .get_applicable_instantiations(&mut self.htn, &init_red.op, &oracle)
        };
        for sig in choices {
            let red = init_red.substitute(&Substitution::from_pairs(&init_red.op.args, &sig.args));
            let red = self.htn.replace_q_constants_reduction(&red, 0, 0);
            let rsig = red.signature();
            if !Instantiator::has_consistently_typed_args(&self.htn, &rsig) {
                continue;
            }
            let valid = {
                let state = &self.layers[0].state;
                let oracle = |s: &Sig| state.contains(0, s);
                Instantiator::has_valid_preconditions(&mut self.htn, &red.op.preconditions, &oracle)
                    && Instantiator::has_valid_preconditions(
                        &mut self.htn,
                        &red.op.extra_preconditions,
                        &oracle,
                    )
            };
            if !valid {
                continue;
            }
            let preconds: Vec<Sig> = red
                .op
                .preconditions
                .iter()
                .chain(red.op.extra_preconditions.iter())
                .cloned()
                .collect();
            let num_subtasks = red.subtasks.len();
            self.htn.reductions_by_sig.insert(rsig.clone(), red);
            {
                let pos0 = self.layers[0].at_mut(0);
                pos0.add_reduction(rsig.clone());
                pos0.add_axiomatic_op(rsig.clone());
                pos0.add_expansion_size(num_subtasks);
            }
            for pre in preconds {
                self.add_precondition(&rsig, &pre);
            }
            self.add_q_constant_type_constraints(&rsig);
        }
        self.add_new_false_facts();
        self.encode_current();

        // Position 1: propagate, then install the goal action.
        self.pos = 1;
        self.create_next_position()?;

        let goal_action = self.htn.make_goal_action();
        let gsig = goal_action.signature();
        {
            let pos1 = self.layers[0].at_mut(1);
            pos1.add_action(gsig.clone());
            pos1.add_axiomatic_op(gsig.clone());
        }
        let goals: Vec<Sig> = self.htn.goals().iter().cloned().collect();
        for goal in goals {
            self.add_precondition(&gsig, &goal);
        }
        self.encode_current();

        self.layers[0].consolidate();
        Ok(())
    }

    fn create_next_layer(&mut self) -> Result<(), PlanError> {
        let old_idx = self.layers.len() - 1;
        let next_size = self.layers[old_idx].next_layer_size();
        debug!(size = next_size, "new layer");
        self.layers.push(Layer::new(old_idx + 1, next_size));
        self.layer_idx = old_idx + 1;
        self.pos = 0;

        let old_size = self.layers[old_idx].size();
        for old_pos in 0..old_size {
            self.old_pos = old_pos;
            let base = self.layers[old_idx].successor_pos(old_pos);
            let max_offset = self.layers[old_idx].at(old_pos).max_expansion_size;
            for offset in 0..max_offset {
                debug_assert_eq!(self.pos, base + offset);
                debug!(layer = self.layer_idx, pos = self.pos, "creating position");
                self.create_next_position()?;
                self.encode_current();
                self.pos += 1;
            }
        }
        self.layers[self.layer_idx].consolidate();
        Ok(())
    }

    fn encode_current(&mut self) {
        let old = if self.layer_idx > 0 {
            Some(self.old_pos)
        } else {
            None
        };
        self.enc
            .encode(&mut self.htn, &mut self.layers, self.layer_idx, self.pos, old);
    }

    // ----- position construction -----

    fn create_next_position(&mut self) -> Result<(), PlanError> {
        if self.pos == 0 {
            self.propagate_initial_state();
        } else {
            self.create_next_position_from_left();
        }
        if self.layer_idx > 0 {
            self.create_next_position_from_above()?;
        }
        self.add_new_false_facts();
        Ok(())
    }

    /// Position 0 of a fresh layer: copy position 0 of the layer above
    /// and re-anchor the layer state (initial-state ranges and q-facts;
    /// everything else is re-derived as effects are re-applied).
    fn propagate_initial_state(&mut self) {
        if self.layer_idx == 0 {
            return;
        }
        let li = self.layer_idx;
        let (facts, qfacts, trues, falses) = {
            let above = self.layers[li - 1].at(0);
            (
                above.facts.iter().cloned().collect::<Vec<Usig>>(),
                above.qfacts.values().flatten().cloned().collect::<Vec<Usig>>(),
                above.true_facts.iter().cloned().collect::<Vec<Usig>>(),
                above.false_facts.iter().cloned().collect::<Vec<Usig>>(),
            )
        };
        {
            let pos0 = self.layers[li].at_mut(0);
            for f in facts {
                pos0.add_fact(f);
            }
            for f in qfacts {
                pos0.add_qfact(f);
            }
            for f in trues {
                pos0.add_definitive_fact(&f.to_sig(false));
            }
            for f in falses {
                pos0.add_definitive_fact(&f.to_sig(true));
            }
        }

        let entries: Vec<(Usig, (usize, usize), bool)> = {
            let prev = &self.layers[li - 1];
            let mut v = Vec::new();
            for neg in [false, true] {
                for (fact, range) in prev.state.occurrences(neg) {
                    v.push((fact.clone(), range, neg));
                }
            }
            v
        };
        for (fact, (first, last), neg) in entries {
            if first == 0 || self.htn.has_q_constants(&fact) {
                let new_first = self.layers[li - 1].successor_pos(first);
                self.layers[li].state.add(new_first, &fact.to_sig(neg));
                if last != usize::MAX && last <= self.layers[li - 1].size() {
                    let new_last = self.layers[li - 1].successor_pos(last);
                    self.layers[li].state.withdraw(new_last, &fact, neg);
                }
            }
        }
    }

    /// Forward facts from the left neighbor and apply the effects of
    /// every operator there; forget q-facts whose q-constants no longer
    /// occur in any surviving operator.
    fn create_next_position_from_left(&mut self) {
        let li = self.layer_idx;
        let p = self.pos;

        let (left_ops, left_facts, left_qfacts) = {
            let left = self.layers[li].at(p - 1);
            let mut ops: Vec<Usig> = left.actions.iter().cloned().collect();
            ops.extend(left.reductions.iter().cloned());
            (
                ops,
                left.facts.iter().cloned().collect::<Vec<Usig>>(),
                left.qfacts.values().flatten().cloned().collect::<Vec<Usig>>(),
            )
        };

        let mut relevant_q: FxSet<Sym> = FxSet::default();
        for op in &left_ops {
            for &arg in op.args.iter() {
                if self.htn.is_q_constant(arg) {
                    relevant_q.insert(arg);
                }
            }
            let changes: Vec<Sig> = self.layers[li].at(p - 1).get_fact_changes(op).to_vec();
            for eff in changes {
                self.add_effect(op, &eff);
            }
        }

        for f in left_facts {
            self.layers[li].at_mut(p).add_fact(f);
        }
        for qf in left_qfacts {
            let keep = qf
                .args
                .iter()
                .all(|a| !self.htn.is_q_constant(*a) || relevant_q.contains(a));
            if keep {
                self.layers[li].at_mut(p).add_qfact(qf);
            } else {
                self.layers[li].state.withdraw(p, &qf, false);
                self.layers[li].state.withdraw(p, &qf, true);
            }
        }
    }

    /// Generate this position's operators from the position above it.
    fn create_next_position_from_above(&mut self) -> Result<(), PlanError> {
        let li = self.layer_idx;
        let p = self.pos;
        let offset = p - self.layers[li - 1].successor_pos(self.old_pos);

        if offset == 0 {
            let (facts, qfacts) = {
                let above = self.layers[li - 1].at(self.old_pos);
                (
                    above.facts.iter().cloned().collect::<Vec<Usig>>(),
                    above.qfacts.values().flatten().cloned().collect::<Vec<Usig>>(),
                )
            };
            let posn = self.layers[li].at_mut(p);
            for f in facts {
                posn.add_fact(f);
            }
            for f in qfacts {
                posn.add_qfact(f);
            }
        }

        self.propagate_actions(offset)?;
        self.propagate_reductions(offset)?;
        Ok(())
    }

    /// Actions above propagate unchanged at offset 0 and expand to the
    /// blank placeholder beyond it; actions whose preconditions became
    /// unreachable are forbidden.
    fn propagate_actions(&mut self, offset: usize) -> Result<(), PlanError> {
        let li = self.layer_idx;
        let p = self.pos;
        let above_actions: Vec<Usig> = self.layers[li - 1]
            .at(self.old_pos)
            .actions
            .iter()
            .cloned()
            .collect();

        for a_sig in above_actions {
            let action = self
                .htn
                .actions_by_sig
                .get(&a_sig)
                .cloned()
                .unwrap_or_else(|| panic!("action not registered by signature"));
            let valid = {
                let state = &self.layers[li].state;
                let oracle = |s: &Sig| state.contains(p, s);
                Instantiator::has_valid_preconditions(
                    &mut self.htn,
                    &action.op.preconditions,
                    &oracle,
                ) && Instantiator::has_valid_preconditions(
                    &mut self.htn,
                    &action.op.extra_preconditions,
                    &oracle,
                )
            };
            if !valid {
                self.layers[li].at_mut(p).forbid_parent(a_sig);
                continue;
            }

            if offset == 0 {
                debug_assert!(self.htn.is_fully_ground(&a_sig));
                {
                    let posn = self.layers[li].at_mut(p);
                    posn.add_action(a_sig.clone());
                    posn.add_expansion(a_sig.clone(), a_sig.clone());
                }
                let preconds: Vec<Sig> = action
                    .op
                    .preconditions
                    .iter()
                    .chain(action.op.extra_preconditions.iter())
                    .cloned()
                    .collect();
                for pre in preconds {
                    self.add_precondition(&a_sig, &pre);
                }
            } else {
                let blank = self.htn.blank_sig();
                let posn = self.layers[li].at_mut(p);
                posn.add_action(blank.clone());
                posn.add_expansion(a_sig, blank);
            }
        }
        Ok(())
    }

    /// Reductions above expand into every implementation of their
    /// subtask at this offset, or into the blank placeholder once their
    /// subtasks are exhausted. A reduction with no valid implementation
    /// is forbidden.
    fn propagate_reductions(&mut self, offset: usize) -> Result<(), PlanError> {
        let li = self.layer_idx;
        let p = self.pos;
        let above_reductions: Vec<Usig> = self.layers[li - 1]
            .at(self.old_pos)
            .reductions
            .iter()
            .cloned()
            .collect();

        for r_sig in above_reductions {
            let red = self
                .htn
                .reductions_by_sig
                .get(&r_sig)
                .cloned()
                .unwrap_or_else(|| panic!("reduction not registered by signature"));

            let mut num_added = 0usize;
            if offset < red.subtasks.len() {
                let subtask = red.subtasks[offset].clone();

                for sub_r in self.get_all_reductions_of_task(&subtask)? {
                    num_added += 1;
                    let sub_red = self
                        .htn
                        .reductions_by_sig
                        .get(&sub_r)
                        .cloned()
                        .expect("child reduction just registered");
                    debug_assert!(self.htn.is_fully_ground(&sub_r));
                    {
                        let posn = self.layers[li].at_mut(p);
                        posn.add_reduction(sub_r.clone());
                        posn.add_expansion(r_sig.clone(), sub_r.clone());
                        posn.add_expansion_size(sub_red.subtasks.len());
                    }
                    let preconds: Vec<Sig> = sub_red
                        .op
                        .preconditions
                        .iter()
                        .chain(sub_red.op.extra_preconditions.iter())
                        .cloned()
                        .collect();
                    for pre in preconds {
                        self.add_precondition(&sub_r, &pre);
                    }
                    self.add_q_constant_type_constraints(&sub_r);
                }

                for sub_a in self.get_all_actions_of_task(&subtask)? {
                    num_added += 1;
                    let sub_act = self
                        .htn
                        .actions_by_sig
                        .get(&sub_a)
                        .cloned()
                        .expect("child action just registered");
                    debug_assert!(self.htn.is_fully_ground(&sub_a));
                    {
                        let posn = self.layers[li].at_mut(p);
                        posn.add_action(sub_a.clone());
                        posn.add_expansion(r_sig.clone(), sub_a.clone());
                    }
                    let preconds: Vec<Sig> = sub_act
                        .op
                        .preconditions
                        .iter()
                        .chain(sub_act.op.extra_preconditions.iter())
                        .cloned()
                        .collect();
                    for pre in preconds {
                        self.add_precondition(&sub_a, &pre);
                    }
                    self.add_q_constant_type_constraints(&sub_a);
                }
            } else {
                num_added += 1;
                let blank = self.htn.blank_sig();
                let posn = self.layers[li].at_mut(p);
                posn.add_action(blank.clone());
                posn.add_expansion(r_sig.clone(), blank);
            }

            if num_added == 0 {
                self.layers[li].at_mut(p).forbid_parent(r_sig);
            }
        }
        Ok(())
    }

    // ----- task resolution -----

    /// Every grounded reduction implementing `task`: unify the task
    /// signature (all unifiers), instantiate against the state, replace
    /// residual variables by q-constants, filter, register.
    fn get_all_reductions_of_task(&mut self, task: &Usig) -> Result<Vec<Usig>, PlanError> {
        let mut result = Vec::new();
        if !self.htn.has_reductions_for_task(task.name) {
            return Ok(result);
        }
        let red_names: Vec<Sym> = self.htn.reductions_of_task(task.name).to_vec();
        debug!(reductions = red_names.len(), "resolving compound task");

        for name in red_names {
            let template = self
                .htn
                .reduction_template(name)
                .cloned()
                .ok_or_else(|| PlanError::Domain("reduction template missing".into()))?;
            let unifiers = Substitution::get_all(&template.task.args, &task.args, &self.htn.symbols);
            for unifier in unifiers {
                let r_sub = template.substitute(&unifier);
                if !Instantiator::has_consistently_typed_args(&self.htn, &r_sub.signature()) {
                    continue;
                }

                let insts = {
                    let state = &self.layers[self.layer_idx].state;
                    let p = self.pos;
                    let oracle = |s: &Sig| state.contains(p, s);
                    self.instantiator
                        .get_applicable_instantiations(&mut self.htn, &r_sub.op, &oracle)
                };
                for inst_sig in insts {
                    let red = r_sub
                        .substitute(&Substitution::from_pairs(&r_sub.op.args, &inst_sig.args));
                    let red =
                        self.htn
                            .replace_q_constants_reduction(&red, self.layer_idx, self.pos);
                    if red.task != *task {
                        continue;
                    }
                    let rsig = red.signature();
                    if !self.htn.is_fully_ground(&rsig) {
                        continue;
                    }
                    if !Instantiator::has_consistently_typed_args(&self.htn, &rsig) {
                        continue;
                    }
                    let valid = {
                        let state = &self.layers[self.layer_idx].state;
                        let p = self.pos;
                        let oracle = |s: &Sig| state.contains(p, s);
                        Instantiator::has_valid_preconditions(
                            &mut self.htn,
                            &red.op.preconditions,
                            &oracle,
                        ) && Instantiator::has_valid_preconditions(
                            &mut self.htn,
                            &red.op.extra_preconditions,
                            &oracle,
                        )
                    };
                    if !valid {
                        continue;
                    }
                    self.htn.reductions_by_sig.insert(rsig.clone(), red);
                    if !result.contains(&rsig) {
                        result.push(rsig);
                    }
                }
            }
        }
        Ok(result)
    }

    /// The grounded action implementing `task`, if `task` names one.
    fn get_all_actions_of_task(&mut self, task: &Usig) -> Result<Vec<Usig>, PlanError> {
        let mut result = Vec::new();
        if !self.htn.is_action(task) {
            return Ok(result);
        }
        let template = self
            .htn
            .action_template(task.name)
            .cloned()
            .ok_or_else(|| PlanError::Domain("action template missing".into()))?;
        let base = template.substitute(&Substitution::from_pairs(&template.op.args, &task.args));

        let insts = {
            let state = &self.layers[self.layer_idx].state;
            let p = self.pos;
            let oracle = |s: &Sig| state.contains(p, s);
            self.instantiator
                .get_applicable_instantiations(&mut self.htn, &base.op, &oracle)
        };
        for inst_sig in insts {
            let act = base.substitute(&Substitution::from_pairs(&base.op.args, &inst_sig.args));
            let mut act = self
                .htn
                .replace_q_constants_action(&act, self.layer_idx, self.pos);
            act.remove_inconsistent_effects();
            if act.signature() != *task {
                continue;
            }
            let asig = act.signature();
            if !self.htn.is_fully_ground(&asig) {
                continue;
            }
            if !Instantiator::has_consistently_typed_args(&self.htn, &asig) {
                continue;
            }
            let valid = {
                let state = &self.layers[self.layer_idx].state;
                let p = self.pos;
                let oracle = |s: &Sig| state.contains(p, s);
                Instantiator::has_valid_preconditions(&mut self.htn, &act.op.preconditions, &oracle)
                    && Instantiator::has_valid_preconditions(
                        &mut self.htn,
                        &act.op.extra_preconditions,
                        &oracle,
                    )
            };
            if !valid {
                continue;
            }
            self.htn.actions_by_sig.insert(asig.clone(), act);
            if !result.contains(&asig) {
                result.push(asig);
            }
        }
        Ok(result)
    }

    // ----- fact registration -----

    /// Register one precondition of `op` at the current position: the
    /// fact (or q-fact) becomes part of the position, unseen facts are
    /// installed definitively false, and q-fact decodings are tested
    /// against the state — statically impossible decodings become
    /// forbidden substitutions of `op`.
    fn add_precondition(&mut self, op: &Usig, fact: &Sig) {
        if fact.usig.name == self.htn.equality_name {
            // Equality is static or decided by substitution variables.
            return;
        }
        let li = self.layer_idx;
        let p = self.pos;
        let fact_abs = fact.usig.clone();
        let is_qfact = self.htn.has_q_constants(&fact_abs);

        if !is_qfact {
            if !self.layers[li].at(p).has_fact(&fact_abs) {
                self.introduce_new_false_fact(&fact_abs);
            }
            self.layers[li].at_mut(p).add_fact(fact_abs.clone());
            return;
        }

        self.layers[li].at_mut(p).add_qfact(fact_abs.clone());
        let decodings = self.htn.get_decoded_objects(&fact_abs);
        for dec in decodings {
            let dec_sig = dec.to_sig(fact.negated);
            let possible = {
                let state = &self.layers[li].state;
                let oracle = |s: &Sig| state.contains(p, s);
                Instantiator::test(&mut self.htn, &dec_sig, &oracle)
            };
            if !possible {
                let mut sub = Substitution::new();
                for (&qa, &da) in fact_abs.args.iter().zip(dec.args.iter()) {
                    if self.htn.is_q_constant(qa) {
                        sub.bind(qa, da);
                    }
                }
                self.layers[li].at_mut(p).add_forbidden_substitution(op, sub);
                continue;
            }
            if !self.layers[li].at(p).has_fact(&dec) {
                self.introduce_new_false_fact(&dec);
            }
            self.htn.add_q_fact_decoding(&fact_abs, &dec);
            self.layers[li].at_mut(p).add_fact(dec);
        }
    }

    /// Register one effect of an operator at the previous position: the
    /// fact may change here, its support is recorded, and the layer
    /// state widens accordingly.
    fn add_effect(&mut self, op: &Usig, eff: &Sig) {
        let li = self.layer_idx;
        let p = self.pos;
        debug_assert!(p > 0);
        let abs = eff.usig.clone();
        let is_qfact = self.htn.has_q_constants(&abs);
        let is_action = self.htn.actions_by_sig.contains_key(op);

        {
            let posn = self.layers[li].at_mut(p);
            if is_qfact {
                posn.add_qfact(abs.clone());
            } else {
                posn.add_fact(abs.clone());
            }
            if self.params.nonprimitive_support || is_action {
                posn.add_fact_support(eff, op.clone());
            } else {
                posn.touch_fact_support(eff);
            }
        }
        self.layers[li].state.add(p, eff);

        if !is_qfact {
            return;
        }
        for dec in self.htn.get_decoded_objects(&abs) {
            self.htn.add_q_fact_decoding(&abs, &dec);
            self.layers[li].state.add(p, &dec.to_sig(eff.negated));
        }
    }

    /// Memoize every operator's fact changes at this position and
    /// install each effect fact (and q-effect decoding) not seen before
    /// as definitively false; pre-seed facts the position above the
    /// next position will expect.
    fn add_new_false_facts(&mut self) {
        let li = self.layer_idx;
        let p = self.pos;
        let ops: Vec<Usig> = {
            let posn = self.layers[li].at(p);
            posn.actions.iter().chain(posn.reductions.iter()).cloned().collect()
        };
        for op in ops {
            let changes = self.htn.fact_changes(&op);
            self.layers[li]
                .at_mut(p)
                .set_fact_changes(op.clone(), changes.clone());
            for eff in &changes {
                if !self.htn.has_q_constants(&eff.usig) {
                    if !self.layers[li].at(p).has_fact(&eff.usig) {
                        self.introduce_new_false_fact(&eff.usig);
                    }
                } else {
                    for dec in self.htn.get_decoded_objects(&eff.usig) {
                        if !self.layers[li].at(p).has_fact(&dec) {
                            self.introduce_new_false_fact(&dec);
                        }
                    }
                }
            }
        }

        if li == 0 {
            return;
        }
        let seed: Option<(Vec<Usig>, Vec<Usig>)> = {
            let prev = &self.layers[li - 1];
            if self.old_pos + 1 < prev.size() && prev.successor_pos(self.old_pos + 1) == p + 1 {
                let above_next = prev.at(self.old_pos + 1);
                Some((
                    above_next.facts.iter().cloned().collect(),
                    above_next.qfacts.values().flatten().cloned().collect(),
                ))
            } else {
                None
            }
        };
        if let Some((facts, qfacts)) = seed {
            for f in facts {
                if !self.layers[li].at(p).has_fact(&f) {
                    self.introduce_new_false_fact(&f);
                }
            }
            for qf in qfacts {
                if !self.layers[li].at(p).has_qfact(&qf) {
                    self.layers[li].at_mut(p).add_qfact(qf);
                }
            }
        }
    }

    fn introduce_new_false_fact(&mut self, fact: &Usig) {
        debug_assert!(!self.htn.has_q_constants(fact));
        let li = self.layer_idx;
        let p = self.pos;
        let sig = fact.to_sig(true);
        {
            let posn = self.layers[li].at_mut(p);
            posn.add_definitive_fact(&sig);
            posn.add_fact(fact.clone());
        }
        self.layers[li].state.add(p, &sig);
    }

    fn add_q_constant_type_constraints(&mut self, sig: &Usig) {
        let constraints = Instantiator::q_constant_type_constraints(&self.htn, sig);
        for c in constraints {
            self.layers[self.layer_idx]
                .at_mut(self.pos)
                .add_q_constant_type_constraint(sig, c);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{Action, HtnOp};
    use crate::solver::VarisatBackend;

    /// A planner over a one-predicate domain (`p` over obj = {a, b}),
    /// one action `act(?x)` with effect p(?x), and an empty layer 0 of
    /// two positions ready for the position-construction helpers.
    fn fixture() -> (Planner<VarisatBackend>, Sym, Sym, Sym, Sym) {
        let mut htn = HtnInstance::new();
        let obj = htn.declare_sort("obj", &["a", "b"]);
        let p = htn.intern("p");
        htn.declare_signature(p, vec![obj]);
        let act = htn.intern("act");
        htn.declare_signature(act, vec![obj]);
        let x = htn.intern("?x");
        let mut op = HtnOp::new(act, [x]);
        op.add_effect(Usig::new(p, [x]).to_sig(false));
        htn.add_action(Action::new(op)).unwrap();
        let a = htn.intern("a");
        let b = htn.intern("b");
        let ground = htn.to_action(act, &[a]).unwrap();
        htn.actions_by_sig.insert(ground.signature(), ground);

        let mut planner = Planner::new(htn, Params::default(), VarisatBackend::new());
        planner.layers.push(Layer::new(0, 2));
        (planner, p, act, a, b)
    }

    #[test]
    fn introduce_new_false_fact_registers_everywhere() {
        let (mut planner, p, _act, a, _b) = fixture();
        let fact = Usig::new(p, [a]);
        planner.introduce_new_false_fact(&fact);

        let pos0 = planner.layers[0].at(0);
        assert!(pos0.has_fact(&fact), "the fact joins the position");
        assert!(
            pos0.false_facts.contains(&fact),
            "introduced facts are definitively false"
        );
        assert!(planner.layers[0].state.contains(0, &fact.to_sig(true)));
        assert!(
            !planner.layers[0].state.contains(0, &fact.to_sig(false)),
            "no positive occurrence is implied"
        );
    }

    #[test]
    fn add_effect_distinguishes_direct_and_touched_support() {
        let (mut planner, p, act, a, _b) = fixture();
        planner.pos = 1;
        let act_sig = Usig::new(act, [a]);
        let eff = Usig::new(p, [a]).to_sig(false);
        planner.add_effect(&act_sig, &eff);

        {
            let pos1 = planner.layers[0].at(1);
            assert!(pos1.has_fact(&eff.usig));
            assert!(
                pos1.fact_supports
                    .get(&eff)
                    .map_or(false, |s| s.contains(&act_sig)),
                "action effects register direct support"
            );
        }
        assert!(planner.layers[0].state.contains(1, &eff));
        assert!(
            planner.layers[0].state.contains(7, &eff),
            "the occurrence interval is open-ended"
        );

        // A non-action operator only touches the support.
        let method_sig = Usig::nullary(planner.htn.intern("m_virtual"));
        let neg = Usig::new(p, [a]).to_sig(true);
        planner.add_effect(&method_sig, &neg);
        let pos1 = planner.layers[0].at(1);
        assert!(pos1.touched_supports.contains(&neg));
        assert!(
            pos1.fact_supports.get(&neg).is_none(),
            "non-primitive support stays unspecified without nps"
        );
    }

    #[test]
    fn q_effect_widens_state_with_all_decodings() {
        let (mut planner, p, act, a, b) = fixture();
        planner.pos = 1;
        let x = planner.htn.intern("?x");
        let lifted = HtnOp::new(act, [x]);
        let q = planner
            .htn
            .q_constant_substitution(&lifted, 0, 0)
            .get(x)
            .unwrap();

        let act_sig = Usig::new(act, [a]);
        let qeff = Usig::new(p, [q]).to_sig(false);
        planner.add_effect(&act_sig, &qeff);

        assert!(planner.layers[0].at(1).has_qfact(&qeff.usig));
        for c in [a, b] {
            assert!(
                planner.layers[0]
                    .state
                    .contains(1, &Usig::new(p, [c]).to_sig(false)),
                "every decoding becomes possible"
            );
        }
        let decodings = planner.htn.q_fact_decodings(&qeff.usig).unwrap();
        assert_eq!(decodings.len(), 2, "both decodings are registered");
    }

    #[test]
    fn initial_state_propagation_reanchors_layer_state() {
        let (mut planner, p, _act, a, b) = fixture();
        let f = Usig::new(p, [a]);
        {
            let layer = &mut planner.layers[0];
            layer.at_mut(0).add_fact(f.clone());
            layer.at_mut(0).add_definitive_fact(&f.to_sig(false));
            layer.state.add(0, &f.to_sig(false));
            // possible only from mid-layer on: re-derived, not migrated
            layer.state.add(1, &Usig::new(p, [b]).to_sig(false));
            layer.consolidate();
        }
        planner.layers.push(Layer::new(1, 2));
        planner.layer_idx = 1;
        planner.pos = 0;
        planner.propagate_initial_state();

        let l1 = &planner.layers[1];
        assert!(l1.at(0).has_fact(&f), "facts of the position above are copied");
        assert!(l1.at(0).true_facts.contains(&f), "so are definitive polarities");
        assert!(l1.state.contains(0, &f.to_sig(false)));
        assert!(
            !l1.state.contains(1, &Usig::new(p, [b]).to_sig(false)),
            "ground occurrences starting mid-layer are not migrated"
        );
    }

    #[test]
    fn migrated_closed_interval_reopens_on_reassertion() {
        let (mut planner, p, _act, a, _b) = fixture();
        let f = Usig::new(p, [a]).to_sig(false);
        {
            let layer = &mut planner.layers[0];
            layer.at_mut(0).add_fact(f.usig.clone());
            layer.state.add(0, &f);
            layer.state.withdraw(1, &f.usig, false);
            layer.consolidate();
        }
        planner.layers.push(Layer::new(1, 2));
        planner.layer_idx = 1;
        planner.pos = 0;
        planner.propagate_initial_state();

        assert!(planner.layers[1].state.contains(0, &f));
        assert!(
            !planner.layers[1].state.contains(1, &f),
            "the closed end migrates with the interval"
        );
        planner.layers[1].state.add(1, &f);
        assert!(
            planner.layers[1].state.contains(2, &f),
            "a later re-assertion reopens the migrated interval"
        );
    }
}
