//! The HTN instance store.
//!
//! Owns the lifted operator templates, sort tables, name interning,
//! q-constant registry and the memoized derived data (q-fact decodings,
//! fact-change closures). Built once from a parsed domain, then
//! append-only: layers add q-constants and memo entries but never
//! invalidate earlier ones. Templates live in pools keyed by name;
//! positions reference them by signature, so pool growth never
//! invalidates anything.

use crate::error::PlanError;
use crate::op::{Action, HtnOp, Reduction};
use crate::sig::{Args, FxMap, Sig, SigSet, USigSet, Usig};
use crate::subst::Substitution;
use crate::symbol::{Sym, SymbolTable};

/// Restriction of a q-constant to the constants admissible in some
/// operator context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeConstraint {
    pub q: Sym,
    pub allowed: Vec<Sym>,
}

pub struct HtnInstance {
    pub symbols: SymbolTable,

    /// Parameter sorts per name: predicates, actions, reductions, tasks.
    sorts_of: FxMap<Sym, Vec<Sym>>,
    constants_of_sort: FxMap<Sym, Vec<Sym>>,

    /// Lifted templates, keyed by name.
    actions: FxMap<Sym, Action>,
    reductions: FxMap<Sym, Reduction>,
    task_to_reductions: FxMap<Sym, Vec<Sym>>,

    /// Grounded (or q-ground) operators registered during planning.
    pub actions_by_sig: FxMap<Usig, Action>,
    pub reductions_by_sig: FxMap<Usig, Reduction>,

    /// Q-constant registry: admissible constants and originating sort.
    q_domains: FxMap<Sym, Vec<Sym>>,
    q_sorts: FxMap<Sym, Sym>,

    /// Decodings registered as semantically relevant (precondition and
    /// effect processing), per q-fact.
    q_fact_decodings: FxMap<Usig, USigSet>,
    /// Memoized Cartesian decodings per signature.
    decoded_cache: FxMap<Usig, Vec<Usig>>,

    /// Lifted fact-change closure per operator name, over `??_i`
    /// placeholder arguments.
    fact_changes_lifted: FxMap<Sym, Vec<Sig>>,

    init_state: SigSet,
    goals: SigSet,
    init_reduction: Option<Reduction>,

    pub init_reduction_name: Sym,
    pub init_task_name: Sym,
    pub goal_action_name: Sym,
    pub blank_name: Sym,
    pub equality_name: Sym,
}

impl HtnInstance {
    pub fn new() -> Self {
        let mut symbols = SymbolTable::new();
        let init_reduction_name = symbols.intern("_init_reduction");
        let init_task_name = symbols.intern("_init_task");
        let goal_action_name = symbols.intern("_GOAL_ACTION_");
        let blank_name = symbols.intern("__BLANK_ACTION__");
        let equality_name = symbols.intern("=");

        let mut htn = Self {
            symbols,
            sorts_of: FxMap::default(),
            constants_of_sort: FxMap::default(),
            actions: FxMap::default(),
            reductions: FxMap::default(),
            task_to_reductions: FxMap::default(),
            actions_by_sig: FxMap::default(),
            reductions_by_sig: FxMap::default(),
            q_domains: FxMap::default(),
            q_sorts: FxMap::default(),
            q_fact_decodings: FxMap::default(),
            decoded_cache: FxMap::default(),
            fact_changes_lifted: FxMap::default(),
            init_state: SigSet::default(),
            goals: SigSet::default(),
            init_reduction: None,
            init_reduction_name,
            init_task_name,
            goal_action_name,
            blank_name,
            equality_name,
        };

        // The blank action is a genuine (virtual) action of every
        // instance: a no-op placeholder for exhausted expansions.
        htn.sorts_of.insert(blank_name, Vec::new());
        let blank = Action::new(HtnOp::new(blank_name, []));
        htn.actions.insert(blank_name, blank.clone());
        htn.actions_by_sig.insert(blank.signature(), blank);
        htn.sorts_of.insert(goal_action_name, Vec::new());
        htn.sorts_of.insert(init_reduction_name, Vec::new());
        htn
    }

    // ----- construction of the lifted problem -----

    pub fn intern(&mut self, name: &str) -> Sym {
        self.symbols.intern(name)
    }

    pub fn declare_sort(&mut self, name: &str, constants: &[&str]) -> Sym {
        let sort = self.symbols.intern(name);
        let consts: Vec<Sym> = constants.iter().map(|c| self.symbols.intern(c)).collect();
        let entry = self.constants_of_sort.entry(sort).or_default();
        for c in consts {
            if !entry.contains(&c) {
                entry.push(c);
            }
        }
        sort
    }

    /// Declare the parameter sorts of a predicate, action, reduction or
    /// compound task.
    pub fn declare_signature(&mut self, name: Sym, sorts: Vec<Sym>) {
        self.sorts_of.insert(name, sorts);
    }

    pub fn add_action(&mut self, action: Action) -> Result<(), PlanError> {
        let name = action.op.name;
        let sorts = self.sorts_of.get(&name).ok_or_else(|| {
            PlanError::Domain(format!(
                "action {} has no declared parameter sorts",
                self.symbols.resolve(name)
            ))
        })?;
        if sorts.len() != action.op.args.len() {
            return Err(PlanError::Domain(format!(
                "action {} declares {} sorts but has {} parameters",
                self.symbols.resolve(name),
                sorts.len(),
                action.op.args.len()
            )));
        }
        self.actions.insert(name, action);
        Ok(())
    }

    pub fn add_reduction(&mut self, reduction: Reduction) -> Result<(), PlanError> {
        let name = reduction.op.name;
        let sorts = self.sorts_of.get(&name).ok_or_else(|| {
            PlanError::Domain(format!(
                "reduction {} has no declared parameter sorts",
                self.symbols.resolve(name)
            ))
        })?;
        if sorts.len() != reduction.op.args.len() {
            return Err(PlanError::Domain(format!(
                "reduction {} declares {} sorts but has {} parameters",
                self.symbols.resolve(name),
                sorts.len(),
                reduction.op.args.len()
            )));
        }
        self.task_to_reductions
            .entry(reduction.task.name)
            .or_default()
            .push(name);
        self.reductions.insert(name, reduction);
        Ok(())
    }

    pub fn set_init_state(&mut self, init: SigSet) {
        self.init_state = init;
    }

    pub fn set_goals(&mut self, goals: SigSet) {
        self.goals = goals;
    }

    /// Install the problem's top-level tasks; synthesizes the initial
    /// reduction whose subtasks they are.
    pub fn set_top_tasks(&mut self, tasks: Vec<Usig>) {
        let red = Reduction::new(
            HtnOp::new(self.init_reduction_name, []),
            Usig::nullary(self.init_task_name),
            tasks,
        );
        self.task_to_reductions
            .insert(self.init_task_name, vec![self.init_reduction_name]);
        self.reductions.insert(self.init_reduction_name, red.clone());
        self.init_reduction = Some(red);
    }

    pub fn init_state(&self) -> &SigSet {
        &self.init_state
    }

    pub fn goals(&self) -> &SigSet {
        &self.goals
    }

    pub fn init_reduction(&self) -> &Reduction {
        self.init_reduction
            .as_ref()
            .expect("top-level tasks were never set")
    }

    /// The virtual action whose preconditions are the goal facts.
    pub fn make_goal_action(&mut self) -> Action {
        let mut op = HtnOp::new(self.goal_action_name, []);
        for g in self.goals.clone() {
            op.add_precondition(g);
        }
        let action = Action::new(op);
        self.actions.insert(self.goal_action_name, action.clone());
        self.actions_by_sig
            .insert(action.signature(), action.clone());
        action
    }

    pub fn blank_sig(&self) -> Usig {
        Usig::nullary(self.blank_name)
    }

    // ----- classification -----

    pub fn is_variable(&self, sym: Sym) -> bool {
        self.symbols.is_variable(sym)
    }

    pub fn is_q_constant(&self, sym: Sym) -> bool {
        self.symbols.is_q_constant(sym)
    }

    pub fn is_action(&self, sig: &Usig) -> bool {
        self.actions.contains_key(&sig.name)
    }

    pub fn is_reduction(&self, sig: &Usig) -> bool {
        self.reductions.contains_key(&sig.name)
    }

    pub fn has_reductions_for_task(&self, task: Sym) -> bool {
        self.task_to_reductions.contains_key(&task)
    }

    pub fn reduction_template(&self, name: Sym) -> Option<&Reduction> {
        self.reductions.get(&name)
    }

    pub fn action_template(&self, name: Sym) -> Option<&Action> {
        self.actions.get(&name)
    }

    pub fn reductions_of_task(&self, task: Sym) -> &[Sym] {
        self.task_to_reductions
            .get(&task)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn has_q_constants(&self, sig: &Usig) -> bool {
        sig.args.iter().any(|&a| self.is_q_constant(a))
    }

    pub fn is_fully_ground(&self, sig: &Usig) -> bool {
        !sig.args.iter().any(|&a| self.is_variable(a))
    }

    // ----- sorts -----

    pub fn get_sorts(&self, name: Sym) -> &[Sym] {
        self.sorts_of
            .get(&name)
            .unwrap_or_else(|| {
                panic!(
                    "no parameter sorts declared for {}",
                    self.symbols.resolve(name)
                )
            })
            .as_slice()
    }

    pub fn try_get_sorts(&self, name: Sym) -> Option<&[Sym]> {
        self.sorts_of.get(&name).map(|v| v.as_slice())
    }

    pub fn get_constants_of_sort(&self, sort: Sym) -> &[Sym] {
        self.constants_of_sort
            .get(&sort)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    // ----- template instantiation -----

    pub fn to_action(&self, name: Sym, args: &[Sym]) -> Result<Action, PlanError> {
        let template = self.actions.get(&name).ok_or_else(|| {
            PlanError::Domain(format!("unknown action {}", self.symbols.resolve(name)))
        })?;
        if template.op.args.len() != args.len() {
            return Err(PlanError::Domain(format!(
                "action {} applied to {} arguments, expects {}",
                self.symbols.resolve(name),
                args.len(),
                template.op.args.len()
            )));
        }
        let sub = Substitution::from_pairs(&template.op.args, args);
        Ok(template.substitute(&sub))
    }

    pub fn to_reduction(&self, name: Sym, args: &[Sym]) -> Result<Reduction, PlanError> {
        let template = self.reductions.get(&name).ok_or_else(|| {
            PlanError::Domain(format!("unknown reduction {}", self.symbols.resolve(name)))
        })?;
        if template.op.args.len() != args.len() {
            return Err(PlanError::Domain(format!(
                "reduction {} applied to {} arguments, expects {}",
                self.symbols.resolve(name),
                args.len(),
                template.op.args.len()
            )));
        }
        let sub = Substitution::from_pairs(&template.op.args, args);
        Ok(template.substitute(&sub))
    }

    /// The operator registered under this grounded signature.
    pub fn get_op(&self, sig: &Usig) -> Option<&HtnOp> {
        if let Some(a) = self.actions_by_sig.get(sig) {
            return Some(&a.op);
        }
        self.reductions_by_sig.get(sig).map(|r| &r.op)
    }

    // ----- q-constants -----

    /// Substitution mapping each still-variable argument of `op` to a
    /// q-constant. Q-constants are keyed by (layer, pos, operator name,
    /// argument index): re-querying the same context reuses the same
    /// q-constant. Newly created q-constants get the full constant set
    /// of the argument's sort as their domain.
    pub fn q_constant_substitution(&mut self, op: &HtnOp, layer: usize, pos: usize) -> Substitution {
        let sorts: Vec<Sym> = self.get_sorts(op.name).to_vec();
        let mut sub = Substitution::new();
        for (i, &arg) in op.args.iter().enumerate() {
            if !self.symbols.is_variable(arg) || sub.get(arg).is_some() {
                continue;
            }
            let name = format!(
                "!q_{}_{}_{}:{}",
                layer,
                pos,
                self.symbols.resolve(op.name),
                i
            );
            let q = self.symbols.intern_q_constant(&name);
            let sort = sorts[i];
            self.q_sorts.entry(q).or_insert(sort);
            if !self.q_domains.contains_key(&q) {
                let dom = self.get_constants_of_sort(sort).to_vec();
                self.q_domains.insert(q, dom);
            }
            sub.bind(arg, q);
        }
        sub
    }

    pub fn replace_q_constants_action(&mut self, a: &Action, layer: usize, pos: usize) -> Action {
        let sub = self.q_constant_substitution(&a.op, layer, pos);
        a.substitute(&sub)
    }

    pub fn replace_q_constants_reduction(
        &mut self,
        r: &Reduction,
        layer: usize,
        pos: usize,
    ) -> Reduction {
        let sub = self.q_constant_substitution(&r.op, layer, pos);
        r.substitute(&sub)
    }

    pub fn q_domain(&self, q: Sym) -> &[Sym] {
        self.q_domains.get(&q).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn q_sort(&self, q: Sym) -> Option<Sym> {
        self.q_sorts.get(&q).copied()
    }

    /// A per-sort wildcard q-constant standing for "any constant of this
    /// sort"; used for residual free variables in fact-change closures.
    pub fn wildcard_q(&mut self, sort: Sym) -> Sym {
        let name = format!("!any_{}", self.symbols.resolve(sort));
        let q = self.symbols.intern_q_constant(&name);
        self.q_sorts.entry(q).or_insert(sort);
        if !self.q_domains.contains_key(&q) {
            let dom = self.get_constants_of_sort(sort).to_vec();
            self.q_domains.insert(q, dom);
        }
        q
    }

    /// True iff every remaining variable and q-constant argument has at
    /// least one admissible constant.
    pub fn has_some_instantiation(&self, sig: &Usig) -> bool {
        let sorts = match self.try_get_sorts(sig.name) {
            Some(s) => s,
            None => return true,
        };
        for (i, &arg) in sig.args.iter().enumerate() {
            if self.symbols.is_variable(arg) {
                if self.get_constants_of_sort(sorts[i]).is_empty() {
                    return false;
                }
            } else if self.symbols.is_q_constant(arg) && self.q_domain(arg).is_empty() {
                return false;
            }
        }
        true
    }

    // ----- q-fact decoding -----

    /// Every ground signature reachable from `sig` by assigning each of
    /// its q-constants a value from its domain. Distinct occurrences of
    /// the same q-constant are assigned consistently. Memoized.
    pub fn get_decoded_objects(&mut self, sig: &Usig) -> Vec<Usig> {
        if let Some(v) = self.decoded_cache.get(sig) {
            return v.clone();
        }
        let mut qs: Vec<Sym> = Vec::new();
        for &arg in sig.args.iter() {
            if self.symbols.is_q_constant(arg) && !qs.contains(&arg) {
                qs.push(arg);
            }
        }
        let out = if qs.is_empty() {
            vec![sig.clone()]
        } else {
            let doms: Vec<Vec<Sym>> = qs.iter().map(|q| self.q_domain(*q).to_vec()).collect();
            let mut assignments: Vec<Substitution> = vec![Substitution::new()];
            for (q, dom) in qs.iter().zip(doms.iter()) {
                let mut next = Vec::with_capacity(assignments.len() * dom.len());
                for a in &assignments {
                    for &c in dom {
                        let mut aa = a.clone();
                        aa.bind(*q, c);
                        next.push(aa);
                    }
                }
                assignments = next;
            }
            assignments.iter().map(|a| a.apply_usig(sig)).collect()
        };
        self.decoded_cache.insert(sig.clone(), out.clone());
        out
    }

    pub fn add_q_fact_decoding(&mut self, qfact: &Usig, decoded: &Usig) {
        self.q_fact_decodings
            .entry(qfact.clone())
            .or_default()
            .insert(decoded.clone());
    }

    pub fn q_fact_decodings(&self, qfact: &Usig) -> Option<&USigSet> {
        self.q_fact_decodings.get(qfact)
    }

    // ----- normalization -----

    /// Replace every argument position by the positional placeholder
    /// `??_i`. Returns the normalized signature and the placeholder
    /// symbols, in position order.
    pub fn normalized_lifted(&mut self, sig: &Usig) -> (Usig, Args) {
        let placeholders: Args = (0..sig.args.len())
            .map(|i| self.symbols.intern(&format!("??_{}", i)))
            .collect();
        (
            Usig {
                name: sig.name,
                args: placeholders.clone(),
            },
            placeholders,
        )
    }

    /// True for the positional placeholders produced by
    /// [`HtnInstance::normalized_lifted`].
    pub fn is_placeholder(&self, sym: Sym) -> bool {
        self.symbols.resolve(sym).starts_with("??_")
    }

    // ----- fact-change closure -----

    /// The set of fact signatures this operator occurrence may change:
    /// for an action its substituted effects, for a reduction the
    /// effects of every action reachable through its decomposition
    /// network. Residual free variables become per-sort wildcard
    /// q-constants. The lifted closure is cached per operator name.
    pub fn fact_changes(&mut self, sig: &Usig) -> Vec<Sig> {
        if !self.fact_changes_lifted.contains_key(&sig.name) {
            self.compute_lifted_changes(sig.name);
        }
        let placeholders: Args = (0..sig.args.len())
            .map(|i| self.symbols.intern(&format!("??_{}", i)))
            .collect();
        let sub = Substitution::from_pairs(&placeholders, &sig.args);
        let lifted = self.fact_changes_lifted.get(&sig.name).unwrap().clone();
        let mut out = SigSet::default();
        for eff in &lifted {
            out.insert(self.wildcard_residuals(sub.apply_sig(eff)));
        }
        out.into_iter().collect()
    }

    /// Replace any variable argument of an effect by the wildcard
    /// q-constant of the predicate parameter's sort. Positional
    /// placeholders stand for the operator's own parameters and are
    /// kept.
    fn wildcard_residuals(&mut self, mut eff: Sig) -> Sig {
        let residual: Vec<usize> = eff
            .usig
            .args
            .iter()
            .enumerate()
            .filter(|(_, a)| self.symbols.is_variable(**a) && !self.is_placeholder(**a))
            .map(|(i, _)| i)
            .collect();
        for i in residual {
            let sort = self.get_sorts(eff.usig.name)[i];
            eff.usig.args[i] = self.wildcard_q(sort);
        }
        eff
    }

    /// Fixpoint computation of the lifted fact-change closure for every
    /// operator name reachable from `root`. Each name's closure is a set
    /// of effect signatures over `??_i` placeholders (the operator's own
    /// parameters), constants, and per-sort wildcard q-constants (values
    /// outside the operator's parameters). Recursive decompositions
    /// converge because the argument universe is finite.
    fn compute_lifted_changes(&mut self, root: Sym) {
        // Reachable operator names, via a name-level walk.
        let mut names = vec![root];
        let mut i = 0;
        while i < names.len() {
            let name = names[i];
            i += 1;
            let subtask_names: Vec<Sym> = match self.reductions.get(&name) {
                Some(r) => r.subtasks.iter().map(|t| t.name).collect(),
                None => continue,
            };
            for t in subtask_names {
                if self.actions.contains_key(&t) && !names.contains(&t) {
                    names.push(t);
                }
                for &rn in self.reductions_of_task(t) {
                    if !names.contains(&rn) {
                        names.push(rn);
                    }
                }
            }
        }

        // Seed every action with its normalized effects.
        let mut table: FxMap<Sym, SigSet> = FxMap::default();
        for &name in &names {
            let mut set = SigSet::default();
            if let Some(a) = self.actions.get(&name).cloned() {
                let (_, ph) = self.normalized_lifted(&a.signature());
                let sub = Substitution::from_pairs(&a.op.args, &ph);
                for eff in &a.op.effects {
                    let e = self.wildcard_residuals(sub.apply_sig(eff));
                    set.insert(e);
                }
            }
            table.insert(name, set);
        }

        // Iterate reductions until no closure grows.
        loop {
            let mut changed = false;
            for &name in &names {
                let red = match self.reductions.get(&name).cloned() {
                    Some(r) => r,
                    None => continue,
                };
                let (_, ph) = self.normalized_lifted(&red.signature());
                let norm_sub = Substitution::from_pairs(&red.op.args, &ph);
                let norm_red = red.substitute(&norm_sub);

                let mut additions: Vec<Sig> = Vec::new();
                for subtask in &norm_red.subtasks {
                    for child in self.implementations_of(subtask) {
                        let child_arity = child.args.len();
                        let child_ph: Args = (0..child_arity)
                            .map(|i| self.symbols.intern(&format!("??_{}", i)))
                            .collect();
                        let bind = Substitution::from_pairs(&child_ph, &child.args);
                        let child_changes: Vec<Sig> = table
                            .get(&child.name)
                            .map(|s| s.iter().cloned().collect())
                            .unwrap_or_default();
                        for eff in child_changes {
                            additions.push(self.wildcard_residuals(bind.apply_sig(&eff)));
                        }
                    }
                }
                let set = table.get_mut(&name).unwrap();
                for e in additions {
                    changed |= set.insert(e);
                }
            }
            if !changed {
                break;
            }
        }

        for (name, set) in table {
            self.fact_changes_lifted
                .insert(name, set.into_iter().collect());
        }
    }

    /// Operator signatures implementing a subtask: the action itself, or
    /// every reduction of the task with its arguments bound through the
    /// task signature.
    fn implementations_of(&self, subtask: &Usig) -> Vec<Usig> {
        let mut out = Vec::new();
        if self.actions.contains_key(&subtask.name) {
            out.push(subtask.clone());
            return out;
        }
        for &rn in self.reductions_of_task(subtask.name) {
            let template = match self.reductions.get(&rn) {
                Some(r) => r,
                None => continue,
            };
            for sub in Substitution::get_all(&template.task.args, &subtask.args, &self.symbols) {
                out.push(sub.apply_usig(&template.signature()));
            }
        }
        out
    }
}

impl Default for HtnInstance {
    fn default() -> Self {
        Self::new()
    }
}
