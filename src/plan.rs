//! Extracted plans: the classical action sequence and the decomposition
//! tree that produced it, plus rendering in the HDDL verification
//! format.

use crate::htn::HtnInstance;
use crate::sig::{format_usig_bare, Usig};

/// One operator occurrence in the solution. Classical items carry no
/// reduction; decomposition items link their subtasks by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanItem {
    pub id: i64,
    pub task: Usig,
    pub reduction: Option<Usig>,
    pub subtask_ids: Vec<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub classical: Vec<PlanItem>,
    pub decomposition: Vec<PlanItem>,
}

impl Plan {
    /// Number of real primitive steps.
    pub fn length(&self) -> usize {
        self.classical.len()
    }

    /// Render in the verification format:
    ///
    /// ```text
    /// ==>
    /// <id> <action> <args...>
    /// root <subtask ids>
    /// <id> <task> -> <method> <subtask ids>
    /// <==
    /// ```
    pub fn format(&self, htn: &HtnInstance) -> String {
        let mut out = String::from("==>\n");
        for item in &self.classical {
            out.push_str(&format!(
                "{} {}\n",
                item.id,
                format_usig_bare(&item.task, &htn.symbols)
            ));
        }
        for (i, item) in self.decomposition.iter().enumerate() {
            let ids = item
                .subtask_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(" ");
            if i == 0 {
                out.push_str(&format!("root {}\n", ids));
                continue;
            }
            let reduction = item
                .reduction
                .as_ref()
                .expect("non-root decomposition items carry their reduction");
            out.push_str(&format!(
                "{} {} -> {} {}\n",
                item.id,
                format_usig_bare(&item.task, &htn.symbols),
                format_usig_bare(reduction, &htn.symbols),
                ids
            ));
        }
        out.push_str("<==\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_renders_classical_then_tree() {
        let mut htn = HtnInstance::new();
        let open = htn.intern("open");
        let door = htn.intern("door");
        let achieve = htn.intern("achieve_open");
        let method = htn.intern("m_open");

        let plan = Plan {
            classical: vec![PlanItem {
                id: 0,
                task: Usig::new(open, [door]),
                reduction: None,
                subtask_ids: vec![],
            }],
            decomposition: vec![
                PlanItem {
                    id: 100,
                    task: Usig::nullary(htn.init_task_name),
                    reduction: None,
                    subtask_ids: vec![101],
                },
                PlanItem {
                    id: 101,
                    task: Usig::nullary(achieve),
                    reduction: Some(Usig::nullary(method)),
                    subtask_ids: vec![0],
                },
            ],
        };
        let text = plan.format(&htn);
        assert!(text.starts_with("==>\n"));
        assert!(text.ends_with("<==\n"));
        assert!(text.contains("0 open door\n"));
        assert!(text.contains("root 101\n"));
        assert!(text.contains("101 achieve_open -> m_open 0\n"));
    }
}
