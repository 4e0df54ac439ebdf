//! The instantiator: grounds lifted operators against a reachable-state
//! oracle.
//!
//! `get_applicable_instantiations` runs a fast-fail probe, then an
//! optional bounded full enumeration, then falls back to the
//! mode-dependent eager instantiation; surviving free variables are
//! replaced by q-constants later, in the HTN instance.

use crate::htn::{HtnInstance, TypeConstraint};
use crate::op::HtnOp;
use crate::params::{InstantiationMode, Params};
use crate::sig::{FxMap, Sig, SigSet, USigSet, Usig};
use crate::subst::Substitution;
use crate::symbol::Sym;
use crate::traversal;
use tracing::trace;

pub struct Instantiator {
    mode: InstantiationMode,
    limit: usize,
    rating_factor: f32,
    sort_by_rating: bool,
    /// Precondition rating per argument position, cached per operator
    /// name.
    ratings: FxMap<Sym, Vec<f32>>,
}

impl Instantiator {
    pub fn new(params: &Params) -> Self {
        Self {
            mode: params.instantiation_mode,
            limit: params.q_const_instantiation_limit,
            rating_factor: params.q_const_rating_factor,
            sort_by_rating: params.sort_args_by_rating,
            ratings: FxMap::default(),
        }
    }

    /// Every instantiation of `op` whose preconditions the state oracle
    /// cannot refute. Returned signatures are fully ground after full
    /// enumeration, or retain free variables under the lifted fallback.
    pub fn get_applicable_instantiations<F>(
        &mut self,
        htn: &mut HtnInstance,
        op: &HtnOp,
        state: &F,
    ) -> Vec<Usig>
    where
        F: Fn(&Sig) -> bool,
    {
        let all_free = free_args(htn, op);

        // One complete grounding must exist, else the operator is
        // unreachable here.
        let probe = self.enumerate(htn, op, &all_free, 1, true, state);
        if probe.is_empty() {
            trace!(op = ?op.name, "operator has no valid instantiation");
            return probe;
        }

        // Below the configured cap, ship the full ground set.
        if self.limit > 0 {
            let full = self.enumerate(htn, op, &all_free, self.limit, false, state);
            if !full.is_empty() {
                return full;
            }
        }

        let eager = self.eager_args(htn, op, &all_free);
        self.enumerate(htn, op, &eager, 0, false, state)
    }

    /// DFS over partial assignments of `args`, in order. Prefixes whose
    /// substituted preconditions are refuted are pruned; pruning is
    /// monotone. With `limit > 0`: `return_unfinished` returns the first
    /// `limit` results, otherwise exceeding `limit` returns failure.
    fn enumerate<F>(
        &self,
        htn: &mut HtnInstance,
        op: &HtnOp,
        args: &[Sym],
        limit: usize,
        return_unfinished: bool,
        state: &F,
    ) -> Vec<Usig>
    where
        F: Fn(&Sig) -> bool,
    {
        if args.is_empty() {
            if Self::has_valid_preconditions(htn, &op.preconditions, state)
                && Self::has_valid_preconditions(htn, &op.extra_preconditions, state)
                && htn.has_some_instantiation(&op.signature())
            {
                return vec![op.signature()];
            }
            return Vec::new();
        }

        let positions: Vec<usize> = args
            .iter()
            .map(|a| {
                op.args
                    .iter()
                    .position(|x| x == a)
                    .expect("instantiation argument not an operator parameter")
            })
            .collect();
        let sorts: Vec<Sym> = htn.get_sorts(op.name).to_vec();

        let mut out = USigSet::default();
        let mut stack: Vec<Vec<Sym>> = vec![Vec::new()];
        while let Some(assignment) = stack.pop() {
            let idx = assignment.len();
            let candidates = htn.get_constants_of_sort(sorts[positions[idx]]).to_vec();
            for c in candidates {
                let mut sub = Substitution::new();
                for (j, &val) in assignment.iter().enumerate() {
                    sub.bind(args[j], val);
                }
                sub.bind(args[idx], c);
                let new_op = op.substitute(&sub);

                if !Self::has_valid_preconditions(htn, &new_op.preconditions, state)
                    || !Self::has_valid_preconditions(htn, &new_op.extra_preconditions, state)
                {
                    continue;
                }

                if idx + 1 == args.len() {
                    if !htn.has_some_instantiation(&new_op.signature()) {
                        continue;
                    }
                    out.insert(new_op.signature());
                    if limit > 0 {
                        if return_unfinished && out.len() == limit {
                            return out.into_iter().collect();
                        }
                        if !return_unfinished && out.len() > limit {
                            return Vec::new();
                        }
                    }
                } else {
                    let mut extended = assignment.clone();
                    extended.push(c);
                    stack.push(extended);
                }
            }
        }
        out.into_iter().collect()
    }

    /// Arguments to ground eagerly, per the instantiation mode, plus any
    /// argument whose rating scaled by the rating factor beats its
    /// domain size.
    fn eager_args(&mut self, htn: &mut HtnInstance, op: &HtnOp, all_free: &[Sym]) -> Vec<Sym> {
        let mut chosen: Vec<Sym> = match self.mode {
            InstantiationMode::Full => all_free.to_vec(),
            InstantiationMode::Preconditions => all_free
                .iter()
                .filter(|a| {
                    op.preconditions
                        .iter()
                        .any(|pre| pre.usig.args.contains(*a))
                })
                .copied()
                .collect(),
            InstantiationMode::Nothing => Vec::new(),
        };

        if self.rating_factor > 0.0 && self.mode != InstantiationMode::Full {
            let ratings = self.precondition_ratings(htn, op.name, op.args.len());
            let sorts: Vec<Sym> = htn.get_sorts(op.name).to_vec();
            for (i, &arg) in op.args.iter().enumerate() {
                if !htn.is_variable(arg) || chosen.contains(&arg) {
                    continue;
                }
                let domain_size = htn.get_constants_of_sort(sorts[i]).len();
                if self.rating_factor * ratings[i] > domain_size as f32 {
                    chosen.push(arg);
                }
            }
        }

        if self.sort_by_rating && chosen.len() > 1 {
            let ratings = self.precondition_ratings(htn, op.name, op.args.len());
            let rating_of = |arg: Sym| -> f32 {
                op.args
                    .iter()
                    .position(|&x| x == arg)
                    .map(|i| ratings[i])
                    .unwrap_or(0.0)
            };
            chosen.sort_by(|&a, &b| {
                rating_of(b)
                    .partial_cmp(&rating_of(a))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        chosen
    }

    /// Per-argument frequency-of-use in preconditions across the
    /// decomposition network, discounted geometrically by depth.
    pub fn precondition_ratings(
        &mut self,
        htn: &mut HtnInstance,
        name: Sym,
        arity: usize,
    ) -> Vec<f32> {
        if let Some(r) = self.ratings.get(&name) {
            return r.clone();
        }
        let placeholders: Vec<Sym> = (0..arity)
            .map(|i| htn.symbols.intern(&format!("??_{}", i)))
            .collect();
        let norm = Usig::new(name, placeholders.iter().copied());

        let mut sums: Vec<Vec<f32>> = vec![Vec::new(); arity];
        let mut counts: Vec<Vec<u32>> = vec![Vec::new(); arity];
        traversal::traverse(htn, &norm, |htn, node, depth| {
            let op: HtnOp = if htn.is_action(node) {
                match htn.to_action(node.name, &node.args) {
                    Ok(a) => a.op,
                    Err(_) => return,
                }
            } else if htn.is_reduction(node) {
                match htn.to_reduction(node.name, &node.args) {
                    Ok(r) => r.op,
                    Err(_) => return,
                }
            } else {
                return;
            };
            for (i, &ph) in placeholders.iter().enumerate() {
                let mut occs = 0u32;
                let mut total = 0u32;
                for pre in &op.preconditions {
                    for &a in pre.usig.args.iter() {
                        total += 1;
                        if a == ph {
                            occs += 1;
                        }
                    }
                }
                while sums[i].len() <= depth {
                    sums[i].push(0.0);
                    counts[i].push(0);
                }
                if total > 0 {
                    sums[i][depth] += occs as f32 / total as f32;
                }
                counts[i][depth] += 1;
            }
        });

        let rating: Vec<f32> = (0..arity)
            .map(|i| {
                sums[i]
                    .iter()
                    .zip(counts[i].iter())
                    .enumerate()
                    .filter(|(_, (_, &n))| n > 0)
                    .map(|(d, (&s, &n))| (0.5f32).powi(d as i32) * s / n as f32)
                    .sum()
            })
            .collect();
        self.ratings.insert(name, rating.clone());
        rating
    }

    // ----- precondition tests against the state oracle -----

    /// A precondition passes iff it is not statically refuted: lifted
    /// facts and equality over unknowns always pass; q-facts pass iff
    /// some decoding passes; ground facts defer to the oracle under the
    /// closed-world reading.
    pub fn test<F>(htn: &mut HtnInstance, sig: &Sig, state: &F) -> bool
    where
        F: Fn(&Sig) -> bool,
    {
        if sig.usig.name == htn.equality_name {
            return Self::test_equality(htn, sig);
        }
        if !htn.is_fully_ground(&sig.usig) {
            return true;
        }
        if !htn.has_q_constants(&sig.usig) {
            return Self::test_ground(sig, state);
        }
        let decoded = htn.get_decoded_objects(&sig.usig);
        decoded
            .iter()
            .any(|d| Self::test_ground(&d.to_sig(sig.negated), state))
    }

    fn test_equality(htn: &HtnInstance, sig: &Sig) -> bool {
        debug_assert_eq!(sig.usig.args.len(), 2);
        let (a, b) = (sig.usig.args[0], sig.usig.args[1]);
        if htn.is_variable(a) || htn.is_variable(b) || htn.is_q_constant(a) || htn.is_q_constant(b)
        {
            return true;
        }
        (a == b) != sig.negated
    }

    fn test_ground<F>(sig: &Sig, state: &F) -> bool
    where
        F: Fn(&Sig) -> bool,
    {
        // A fact that occurs with this polarity may hold; a fact that
        // never occurs at all is false under the closed world, which
        // satisfies exactly the negative query.
        state(sig) || (sig.negated && !state(&sig.opposite()))
    }

    pub fn has_valid_preconditions<F>(htn: &mut HtnInstance, preconds: &SigSet, state: &F) -> bool
    where
        F: Fn(&Sig) -> bool,
    {
        preconds.iter().all(|pre| {
            let ok = Self::test(htn, pre, state);
            if !ok {
                trace!(pre = ?pre, "precondition refuted");
            }
            ok
        })
    }

    /// Constant arguments must belong to the parameter's sort; q-constant
    /// arguments must have some admissible constant in it.
    pub fn has_consistently_typed_args(htn: &HtnInstance, sig: &Usig) -> bool {
        let sorts = match htn.try_get_sorts(sig.name) {
            Some(s) => s,
            None => return true,
        };
        for (i, &arg) in sig.args.iter().enumerate() {
            if htn.is_variable(arg) {
                continue;
            }
            let sort_consts = htn.get_constants_of_sort(sorts[i]);
            if htn.is_q_constant(arg) {
                if !htn.q_domain(arg).iter().any(|c| sort_consts.contains(c)) {
                    return false;
                }
            } else if !sort_consts.contains(&arg) {
                return false;
            }
        }
        true
    }

    /// Type constraints restricting each q-constant argument to the
    /// constants of the parameter's sort, where that is a real
    /// restriction.
    pub fn q_constant_type_constraints(htn: &HtnInstance, sig: &Usig) -> Vec<TypeConstraint> {
        let sorts = match htn.try_get_sorts(sig.name) {
            Some(s) => s,
            None => return Vec::new(),
        };
        let mut out = Vec::new();
        for (i, &arg) in sig.args.iter().enumerate() {
            if !htn.is_q_constant(arg) {
                continue;
            }
            let sort_consts = htn.get_constants_of_sort(sorts[i]);
            let domain = htn.q_domain(arg);
            let allowed: Vec<Sym> = domain
                .iter()
                .filter(|c| sort_consts.contains(c))
                .copied()
                .collect();
            if allowed.len() < domain.len() {
                out.push(TypeConstraint { q: arg, allowed });
            }
        }
        out
    }
}

/// Distinct free-variable arguments of `op`, in parameter order.
fn free_args(htn: &HtnInstance, op: &HtnOp) -> Vec<Sym> {
    let mut free = Vec::new();
    for &arg in op.args.iter() {
        if htn.is_variable(arg) && !free.contains(&arg) {
            free.push(arg);
        }
    }
    free
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::LayerState;
    use crate::op::Action;
    use crate::sig::Usig;

    /// Domain: move(?x, ?y) over rooms {r1, r2}, precondition at(?x),
    /// with only at(r1) reachable.
    fn fixture() -> (HtnInstance, LayerState, HtnOp) {
        let mut htn = HtnInstance::new();
        let room = htn.declare_sort("room", &["r1", "r2"]);
        let at = htn.intern("at");
        htn.declare_signature(at, vec![room]);
        let mv = htn.intern("move");
        htn.declare_signature(mv, vec![room, room]);
        let x = htn.intern("?x");
        let y = htn.intern("?y");
        let mut op = HtnOp::new(mv, [x, y]);
        op.add_precondition(Usig::new(at, [x]).to_sig(false));
        htn.add_action(Action::new(op.clone())).unwrap();

        let mut state = LayerState::new();
        let r1 = htn.intern("r1");
        state.add(0, &Usig::new(at, [r1]).to_sig(false));
        (htn, state, op)
    }

    #[test]
    fn full_mode_grounds_everything_reachable() {
        let (mut htn, state, op) = fixture();
        let mut inst = Instantiator::new(&Params::default());
        let oracle = |sig: &Sig| state.contains(0, sig);
        let mut sigs = inst.get_applicable_instantiations(&mut htn, &op, &oracle);
        sigs.sort_by_key(|s| format!("{:?}", s.args));
        assert_eq!(
            sigs.len(),
            2,
            "only at(r1) holds, so ?x=r1 with both choices of ?y survive"
        );
        let r1 = htn.intern("r1");
        for s in &sigs {
            assert_eq!(s.args[0], r1, "precondition pins the source room");
            assert!(htn.is_fully_ground(s));
        }
    }

    #[test]
    fn unreachable_precondition_yields_nothing() {
        let (mut htn, _state, op) = fixture();
        let mut inst = Instantiator::new(&Params::default());
        let empty = LayerState::new();
        let oracle = |sig: &Sig| empty.contains(0, sig);
        let sigs = inst.get_applicable_instantiations(&mut htn, &op, &oracle);
        assert!(sigs.is_empty(), "no room satisfies at(?x)");
    }

    #[test]
    fn nothing_mode_returns_lifted_operator() {
        let (mut htn, state, op) = fixture();
        let params = Params {
            instantiation_mode: InstantiationMode::Nothing,
            ..Params::default()
        };
        let mut inst = Instantiator::new(&params);
        let oracle = |sig: &Sig| state.contains(0, sig);
        let sigs = inst.get_applicable_instantiations(&mut htn, &op, &oracle);
        assert_eq!(sigs.len(), 1);
        assert!(
            !htn.is_fully_ground(&sigs[0]),
            "qq mode leaves the arguments to q-constants"
        );
    }

    #[test]
    fn instantiation_limit_ships_full_set_when_small_enough() {
        let (mut htn, state, op) = fixture();
        let params = Params {
            instantiation_mode: InstantiationMode::Nothing,
            q_const_instantiation_limit: 8,
            ..Params::default()
        };
        let mut inst = Instantiator::new(&params);
        let oracle = |sig: &Sig| state.contains(0, sig);
        let sigs = inst.get_applicable_instantiations(&mut htn, &op, &oracle);
        assert_eq!(sigs.len(), 2, "within the cap the ground set wins over q-constants");
        for s in &sigs {
            assert!(htn.is_fully_ground(s));
        }
    }

    #[test]
    fn instantiation_limit_exceeded_falls_back_to_lifted() {
        let (mut htn, state, op) = fixture();
        let params = Params {
            instantiation_mode: InstantiationMode::Nothing,
            q_const_instantiation_limit: 1,
            ..Params::default()
        };
        let mut inst = Instantiator::new(&params);
        let oracle = |sig: &Sig| state.contains(0, sig);
        let sigs = inst.get_applicable_instantiations(&mut htn, &op, &oracle);
        assert_eq!(sigs.len(), 1);
        assert!(!htn.is_fully_ground(&sigs[0]));
    }

    #[test]
    fn negative_precondition_on_unknown_fact_passes() {
        let (mut htn, state, _op) = fixture();
        let flying = htn.intern("flying");
        let r1 = htn.intern("r1");
        let sig = Usig::new(flying, [r1]).to_sig(true);
        let oracle = |s: &Sig| state.contains(0, s);
        assert!(
            Instantiator::test(&mut htn, &sig, &oracle),
            "never-seen facts are false, so their negation holds"
        );
        assert!(
            !Instantiator::test(&mut htn, &sig.opposite(), &oracle),
            "and the positive form is refuted"
        );
    }

    #[test]
    fn equality_preconditions_are_static_over_constants() {
        let (mut htn, _state, _op) = fixture();
        let r1 = htn.intern("r1");
        let r2 = htn.intern("r2");
        let eq = htn.equality_name;
        let oracle = |_: &Sig| false;
        assert!(Instantiator::test(
            &mut htn,
            &Usig::new(eq, [r1, r1]).to_sig(false),
            &oracle
        ));
        assert!(!Instantiator::test(
            &mut htn,
            &Usig::new(eq, [r1, r2]).to_sig(false),
            &oracle
        ));
        assert!(Instantiator::test(
            &mut htn,
            &Usig::new(eq, [r1, r2]).to_sig(true),
            &oracle
        ));
    }

    #[test]
    fn ratings_prefer_precondition_heavy_arguments() {
        let (mut htn, _state, op) = fixture();
        let mut inst = Instantiator::new(&Params::default());
        let ratings = inst.precondition_ratings(&mut htn, op.name, 2);
        assert!(
            ratings[0] > ratings[1],
            "?x appears in at(?x), ?y in no precondition: {:?}",
            ratings
        );
    }
}
