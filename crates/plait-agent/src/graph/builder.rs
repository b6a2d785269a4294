use std::collections::HashSet;

use tracing::debug;

use plait_core::error::{PlaitError, Result};
use plait_core::types::DeclaredAgent;

use super::node::ExecutionNode;

/// Layer declared agents into an execution sequence.
///
/// Each round takes every remaining agent whose dependencies are not among
/// the remaining agents. Dependencies on ids outside the input count as
/// satisfied, which is what lets a revised plan reference finished work.
/// Rounds of one agent become `Serial` nodes, larger rounds `Parallel` nodes;
/// members keep declaration order.
pub fn build_execution_tree(agents: &[DeclaredAgent]) -> Result<ExecutionNode> {
    if agents.is_empty() {
        return Err(PlaitError::EmptyWorkflow);
    }

    let mut remaining: Vec<DeclaredAgent> = agents.to_vec();
    let mut layers: Vec<Vec<DeclaredAgent>> = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<DeclaredAgent>, Vec<DeclaredAgent>) = {
            let pending: HashSet<&str> = remaining.iter().map(|a| a.id.as_str()).collect();
            remaining
                .iter()
                .cloned()
                .partition(|a| a.depends.iter().all(|d| !pending.contains(d.as_str())))
        };

        if ready.is_empty() {
            let ids: Vec<&str> = blocked.iter().map(|a| a.id.as_str()).collect();
            return Err(PlaitError::CircularDependency(ids.join(", ")));
        }

        layers.push(ready);
        remaining = blocked;
    }

    let mut next: Option<Box<ExecutionNode>> = None;
    for mut layer in layers.into_iter().rev() {
        let node = if layer.len() == 1 {
            ExecutionNode::Serial {
                agent: layer.remove(0),
                next,
            }
        } else {
            ExecutionNode::Parallel {
                agents: layer,
                next,
            }
        };
        next = Some(Box::new(node));
    }

    let root = next.map(|n| *n).ok_or(PlaitError::EmptyWorkflow)?;
    debug!(tree = %root, "Built execution tree");
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn agent(id: &str, depends: &[&str]) -> DeclaredAgent {
        DeclaredAgent::new(id, "worker", format!("task {id}"))
            .with_depends(depends.iter().map(|d| d.to_string()).collect())
    }

    /// Every edge points backwards in traversal order and every agent appears once.
    fn assert_respects_edges(agents: &[DeclaredAgent]) {
        let tree = build_execution_tree(agents).unwrap();
        let order: Vec<&str> = tree.flatten().iter().map(|a| a.id.as_str()).collect();
        assert_eq!(order.len(), agents.len());

        let layer_of: HashMap<String, usize> = tree
            .layers()
            .into_iter()
            .enumerate()
            .flat_map(|(i, ids)| ids.into_iter().map(move |id| (id, i)))
            .collect();
        for a in agents {
            for d in &a.depends {
                if let Some(dep_layer) = layer_of.get(d) {
                    assert!(dep_layer < &layer_of[&a.id], "{} must follow {}", a.id, d);
                }
            }
        }
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(matches!(build_execution_tree(&[]), Err(PlaitError::EmptyWorkflow)));
    }

    #[test]
    fn chain_becomes_serial_nodes() {
        let tree = build_execution_tree(&[agent("1", &[]), agent("2", &["1"])]).unwrap();
        assert!(!tree.is_parallel());
        assert_eq!(tree.layers(), vec![vec!["1"], vec!["2"]]);
        assert_eq!(tree.to_string(), "1 -> 2");
    }

    #[test]
    fn independent_agents_become_one_parallel_node() {
        let tree = build_execution_tree(&[
            agent("A", &[]),
            agent("B", &[]),
            agent("C", &[]),
            agent("D", &["A", "B", "C"]),
        ])
        .unwrap();
        assert!(tree.is_parallel());
        assert_eq!(tree.layers(), vec![vec!["A", "B", "C"], vec!["D"]]);
        assert_eq!(tree.to_string(), "[A, B, C] -> D");
    }

    #[test]
    fn diamond_layers() {
        let tree = build_execution_tree(&[
            agent("1", &[]),
            agent("2", &["1"]),
            agent("3", &["1"]),
            agent("4", &["2", "3"]),
        ])
        .unwrap();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.layers(), vec![vec!["1"], vec!["2", "3"], vec!["4"]]);
    }

    #[test]
    fn declaration_order_is_kept_within_a_layer() {
        let tree = build_execution_tree(&[agent("z", &[]), agent("a", &[])]).unwrap();
        assert_eq!(tree.layers(), vec![vec!["z", "a"]]);
    }

    #[test]
    fn unknown_dependencies_count_as_satisfied() {
        let tree = build_execution_tree(&[agent("3", &["1", "2"]), agent("4", &["3"])]).unwrap();
        assert_eq!(tree.layers(), vec![vec!["3"], vec!["4"]]);
    }

    #[test]
    fn cycle_is_rejected() {
        let err = build_execution_tree(&[agent("1", &["2"]), agent("2", &["1"])]).unwrap_err();
        assert!(matches!(err, PlaitError::CircularDependency(ref ids) if ids == "1, 2"));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = build_execution_tree(&[agent("1", &[]), agent("2", &["2"])]).unwrap_err();
        assert!(matches!(err, PlaitError::CircularDependency(ref ids) if ids == "2"));
    }

    #[test]
    fn traversal_respects_dependencies() {
        let shapes: Vec<Vec<DeclaredAgent>> = vec![
            vec![agent("1", &[])],
            vec![agent("b", &["a"]), agent("a", &[])],
            vec![
                agent("5", &["4"]),
                agent("4", &["2", "3"]),
                agent("3", &["1"]),
                agent("2", &["1"]),
                agent("1", &[]),
            ],
            vec![
                agent("x", &[]),
                agent("y", &["x", "gone"]),
                agent("z", &[]),
                agent("w", &["z", "y"]),
                agent("v", &["x"]),
            ],
        ];
        for shape in &shapes {
            assert_respects_edges(shape);
        }
    }
}
