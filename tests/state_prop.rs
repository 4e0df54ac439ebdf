//! Property tests for the substitution laws and the layer-state
//! interval semantics.

use lamina::layer::LayerState;
use lamina::sig::Usig;
use lamina::subst::Substitution;
use lamina::symbol::{Sym, SymbolTable};
use proptest::prelude::*;

const VAR_COUNT: usize = 4;
const CONST_COUNT: usize = 4;

fn setup() -> (SymbolTable, Vec<Sym>, Vec<Sym>) {
    let mut syms = SymbolTable::new();
    let vars: Vec<Sym> = (0..VAR_COUNT)
        .map(|i| syms.intern(&format!("?v{}", i)))
        .collect();
    let consts: Vec<Sym> = (0..CONST_COUNT)
        .map(|i| syms.intern(&format!("c{}", i)))
        .collect();
    (syms, vars, consts)
}

/// A raw binding list: variable index -> constant index.
fn bindings_strategy() -> impl Strategy<Value = Vec<(usize, usize)>> {
    prop::collection::vec((0..VAR_COUNT, 0..CONST_COUNT), 0..VAR_COUNT)
}

fn build_subst(raw: &[(usize, usize)], vars: &[Sym], consts: &[Sym]) -> Substitution {
    let mut sub = Substitution::new();
    for &(v, c) in raw {
        sub.bind(vars[v], consts[c]);
    }
    sub
}

proptest! {
    /// Applying a substitution leaves symbols outside its domain alone
    /// and maps bound symbols in one step.
    #[test]
    fn apply_is_pointwise(raw in bindings_strategy()) {
        let (mut syms, vars, consts) = setup();
        let sub = build_subst(&raw, &vars, &consts);
        let p = syms.intern("p");
        let sig = Usig::new(p, vars.iter().copied());
        let out = sub.apply_usig(&sig);
        for (i, &v) in vars.iter().enumerate() {
            let expected = sub.get(v).unwrap_or(v);
            prop_assert_eq!(out.args[i], expected);
        }
        let _ = consts;
    }

    /// compose(s1, s2) behaves as "apply s1, then s2" on every symbol.
    #[test]
    fn compose_is_sequential_application(
        raw1 in bindings_strategy(),
        raw2 in bindings_strategy(),
    ) {
        let (mut syms, vars, consts) = setup();
        // Let the second substitution also rebind constants so routing
        // through it is observable.
        let mut s2 = Substitution::new();
        for &(v, c) in &raw2 {
            s2.bind(vars[v], consts[c]);
            s2.bind(consts[v % CONST_COUNT], consts[c]);
        }
        let s1 = build_subst(&raw1, &vars, &consts);
        let mut composed = s1.clone();
        composed.compose(&s2);

        for &x in vars.iter().chain(consts.iter()) {
            prop_assert_eq!(
                composed.apply_sym(x),
                s2.apply_sym(s1.apply_sym(x)),
                "composition must equal sequential application"
            );
        }
        let _ = &mut syms;
    }

    /// get_all never binds anything but source variables, and its
    /// result applied to the source yields the destination.
    #[test]
    fn get_all_unifies_or_fails(
        pattern in prop::collection::vec((0..VAR_COUNT + CONST_COUNT, 0..CONST_COUNT), 1..5)
    ) {
        let (syms, vars, consts) = setup();
        let src: Vec<Sym> = pattern
            .iter()
            .map(|&(s, _)| if s < VAR_COUNT { vars[s] } else { consts[s - VAR_COUNT] })
            .collect();
        let dst: Vec<Sym> = pattern.iter().map(|&(_, d)| consts[d]).collect();

        for sub in Substitution::get_all(&src, &dst, &syms) {
            for (i, &s) in src.iter().enumerate() {
                prop_assert_eq!(
                    sub.apply_sym(s),
                    dst[i],
                    "a returned unifier must map the source onto the destination"
                );
            }
            for (from, _) in sub.iter() {
                prop_assert!(syms.is_variable(from), "only source variables are bound");
            }
        }
    }
}

/// Reference model: a fact/polarity pair may hold at `pos` iff some add
/// at or before `pos` happened and no withdraw after the latest add cut
/// it off — a re-add reopens a withdrawn interval.
#[derive(Clone, Debug)]
enum StateOp {
    Add(usize, bool),
    Withdraw(usize, bool),
}

fn state_ops_strategy() -> impl Strategy<Value = Vec<StateOp>> {
    prop::collection::vec(
        prop_oneof![
            (0usize..8, any::<bool>()).prop_map(|(p, n)| StateOp::Add(p, n)),
            (0usize..8, any::<bool>()).prop_map(|(p, n)| StateOp::Withdraw(p, n)),
        ],
        0..12,
    )
}

proptest! {
    #[test]
    fn layer_state_matches_interval_model(ops in state_ops_strategy()) {
        let mut syms = SymbolTable::new();
        let f = Usig::nullary(syms.intern("f"));
        let mut state = LayerState::new();

        // model: per polarity, (earliest add, withdraw since the latest add)
        let mut first: [Option<usize>; 2] = [None, None];
        let mut cut: [Option<usize>; 2] = [None, None];
        for op in &ops {
            match *op {
                StateOp::Add(p, neg) => {
                    state.add(p, &f.to_sig(neg));
                    let slot = neg as usize;
                    first[slot] = Some(first[slot].map_or(p, |q| q.min(p)));
                    cut[slot] = None;
                }
                StateOp::Withdraw(p, neg) => {
                    state.withdraw(p, &f, neg);
                    if first[neg as usize].is_some() {
                        cut[neg as usize] = Some(p);
                    }
                }
            }
        }

        for neg in [false, true] {
            let slot = neg as usize;
            for pos in 0..10 {
                let expected = match (first[slot], cut[slot]) {
                    (None, _) => false,
                    (Some(fst), None) => pos >= fst,
                    (Some(fst), Some(c)) => pos >= fst && pos < c,
                };
                prop_assert_eq!(
                    state.contains(pos, &f.to_sig(neg)),
                    expected,
                    "polarity {} at {} diverged from the interval model",
                    neg,
                    pos
                );
            }
        }
    }
}
