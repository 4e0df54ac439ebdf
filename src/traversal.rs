//! Preorder traversal of the reduction-decomposition network.
//!
//! Walks the graph of operator signatures connected by "is a possible
//! child of" edges, deduplicating on normalized signatures so recursive
//! domains terminate. Drives the fact-change closure and the
//! precondition ratings.

use crate::htn::HtnInstance;
use crate::sig::{USigSet, Usig};
use crate::subst::Substitution;

/// Visit every signature reachable from `start`, preorder, calling
/// `visit(htn, signature, depth)` once per distinct normalized
/// signature. `start` itself is visited at depth 0.
pub fn traverse<F>(htn: &mut HtnInstance, start: &Usig, mut visit: F)
where
    F: FnMut(&mut HtnInstance, &Usig, usize),
{
    let mut seen = USigSet::default();
    let mut frontier: Vec<(Usig, usize)> = vec![(start.clone(), 0)];

    while let Some((node, depth)) = frontier.pop() {
        // Normalize variable arguments positionally so recursive
        // renamings of the same signature are recognized.
        let mut norm_sub = Substitution::new();
        for (i, &arg) in node.args.iter().enumerate() {
            if htn.symbols.is_variable(arg) && norm_sub.get(arg).is_none() {
                let ph = htn.symbols.intern(&format!("??_{}", i));
                norm_sub.bind(arg, ph);
            }
        }
        let norm = norm_sub.apply_usig(&node);
        if !seen.insert(norm) {
            continue;
        }

        visit(htn, &node, depth);

        for child in possible_children(htn, &node) {
            // Rename variable arguments apart so recursive domains do
            // not capture; positional placeholders stay bound to the
            // root's arguments.
            let mut rename = Substitution::new();
            for &arg in child.args.iter() {
                if htn.symbols.is_variable(arg)
                    && !htn.is_placeholder(arg)
                    && rename.get(arg).is_none()
                {
                    let fresh = format!("{}_", htn.symbols.resolve(arg));
                    let fresh = htn.symbols.intern(&fresh);
                    rename.bind(arg, fresh);
                }
            }
            frontier.push((rename.apply_usig(&child), depth + 1));
        }
    }
}

/// All operator signatures that may implement some subtask of `sig`.
/// Empty unless `sig` names a reduction.
pub fn possible_children(htn: &HtnInstance, sig: &Usig) -> Vec<Usig> {
    let mut result = Vec::new();
    if !htn.is_reduction(sig) {
        return result;
    }
    let red = match htn.to_reduction(sig.name, &sig.args) {
        Ok(r) => r,
        Err(_) => return result,
    };
    for subtask in &red.subtasks {
        if htn.is_action(subtask) {
            result.push(subtask.clone());
        } else {
            for &red_name in htn.reductions_of_task(subtask.name) {
                let subred = match htn.reduction_template(red_name) {
                    Some(r) => r,
                    None => continue,
                };
                for sub in Substitution::get_all(&subred.task.args, &subtask.args, &htn.symbols) {
                    result.push(sub.apply_usig(&subred.signature()));
                }
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{Action, HtnOp, Reduction};
    use crate::sig::Usig;

    /// traverse(?a,?b) -> { step(?a,?c), traverse(?c,?b) } terminates and
    /// visits both the step action and the recursive reduction once.
    #[test]
    fn recursive_network_terminates() {
        let mut htn = HtnInstance::new();
        let loc = htn.declare_sort("loc", &["l1", "l2"]);
        let at = htn.intern("at");
        htn.declare_signature(at, vec![loc]);

        let step = htn.intern("step");
        htn.declare_signature(step, vec![loc, loc]);
        let x = htn.intern("?x");
        let y = htn.intern("?y");
        let mut step_op = HtnOp::new(step, [x, y]);
        step_op.add_precondition(Usig::new(at, [x]).to_sig(false));
        step_op.add_effect(Usig::new(at, [y]).to_sig(false));
        htn.add_action(Action::new(step_op)).unwrap();

        let trav = htn.intern("traverse");
        let m_rec = htn.intern("m_rec");
        htn.declare_signature(m_rec, vec![loc, loc, loc]);
        let a = htn.intern("?a");
        let b = htn.intern("?b");
        let c = htn.intern("?c");
        htn.add_reduction(Reduction::new(
            HtnOp::new(m_rec, [a, b, c]),
            Usig::new(trav, [a, b]),
            vec![Usig::new(step, [a, c]), Usig::new(trav, [c, b])],
        ))
        .unwrap();

        let root = Usig::new(m_rec, [a, b, c]);
        let mut visited_names = Vec::new();
        traverse(&mut htn, &root, |htn, node, _| {
            visited_names.push(htn.symbols.resolve(node.name).to_string());
        });
        assert!(visited_names.contains(&"step".to_string()));
        assert!(visited_names.contains(&"m_rec".to_string()));
        assert!(
            visited_names.len() <= 4,
            "normalized dedup must cut the recursion, got {:?}",
            visited_names
        );
    }
}
