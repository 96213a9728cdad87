//! DAG model and decomposition into Steps.
//!
//! `decompose` converts a node/edge graph into one Step per node, annotated
//! with its direct-parent dependency set. First-layer nodes (no incoming
//! edges) come out `ready`, everything else `created`. Malformed edges and
//! cycles are rejected up front; a cyclic graph never yields a truncated
//! step list.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::FlowError;
use crate::step::{Step, StepAction, StepState};
use crate::types::KV;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub bot: String,
    pub rule_id: String,
    #[serde(default)]
    pub parameters: KV,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dag {
    pub id: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// Decompose a dag into Steps for `job_id`, in layered topological order.
///
/// Each Step's `depend_node_ids` contains exactly its direct parents, never
/// the full ancestor set. Diamond-shaped graphs emit exactly one Step per
/// node.
pub fn decompose(dag: &Dag, job_id: &str) -> Result<Vec<Step>, FlowError> {
    let mut nodes: HashMap<&str, &Node> = HashMap::with_capacity(dag.nodes.len());
    for node in &dag.nodes {
        if nodes.insert(node.id.as_str(), node).is_some() {
            return Err(FlowError::DuplicateNode {
                id: node.id.clone(),
            });
        }
    }

    // Dedup edges so a repeated edge neither inflates in-degrees nor the
    // dependency set.
    let mut children: HashMap<&str, Vec<&str>> = HashMap::with_capacity(nodes.len());
    let mut parents: HashMap<&str, BTreeSet<&str>> = HashMap::with_capacity(nodes.len());
    let mut in_degree: HashMap<&str, usize> = nodes.keys().map(|id| (*id, 0)).collect();
    let mut seen_edges: HashSet<(&str, &str)> = HashSet::with_capacity(dag.edges.len());
    for edge in &dag.edges {
        if !nodes.contains_key(edge.source.as_str()) || !nodes.contains_key(edge.target.as_str()) {
            return Err(FlowError::UnknownNode {
                from: edge.source.clone(),
                to: edge.target.clone(),
            });
        }
        if !seen_edges.insert((edge.source.as_str(), edge.target.as_str())) {
            continue;
        }
        children
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
        parents
            .entry(edge.target.as_str())
            .or_default()
            .insert(edge.source.as_str());
        *in_degree.get_mut(edge.target.as_str()).unwrap() += 1;
    }

    // Kahn layering: the first layer is the root set; a node joins a later
    // layer once all of its parents have been emitted.
    let mut layer: Vec<&str> = dag
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| in_degree[id] == 0)
        .collect();
    let mut result: Vec<Step> = Vec::with_capacity(dag.nodes.len());
    let mut first_layer = true;
    while !layer.is_empty() {
        let mut next: Vec<&str> = Vec::new();
        for id in &layer {
            let node = nodes[id];
            let depend: Vec<String> = parents
                .get(id)
                .map(|p| p.iter().map(|s| s.to_string()).collect())
                .unwrap_or_default();
            let state = if first_layer {
                StepState::Ready
            } else {
                StepState::Created
            };
            let mut step = Step::new(
                job_id,
                id,
                StepAction {
                    bot: node.bot.clone(),
                    rule_id: node.rule_id.clone(),
                    parameters: node.parameters.clone(),
                },
                state,
            );
            step.depend_node_ids = depend;
            result.push(step);

            for child in children.get(id).map(|c| c.as_slice()).unwrap_or(&[]) {
                let deg = in_degree.get_mut(child).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    next.push(child);
                }
            }
        }
        first_layer = false;
        layer = next;
    }

    if result.len() != dag.nodes.len() {
        let emitted: HashSet<&str> = result.iter().map(|s| s.node_id.as_str()).collect();
        let mut remaining: Vec<String> = dag
            .nodes
            .iter()
            .filter(|n| !emitted.contains(n.id.as_str()))
            .map(|n| n.id.clone())
            .collect();
        remaining.sort();
        return Err(FlowError::CycleDetected { remaining });
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            bot: "shell".to_string(),
            rule_id: "run".to_string(),
            parameters: KV::new(),
        }
    }

    fn edge(source: &str, target: &str) -> Edge {
        Edge {
            source: source.to_string(),
            target: target.to_string(),
        }
    }

    fn dag(nodes: &[&str], edges: &[(&str, &str)]) -> Dag {
        Dag {
            id: "dag-1".to_string(),
            nodes: nodes.iter().map(|id| node(id)).collect(),
            edges: edges.iter().map(|(s, t)| edge(s, t)).collect(),
        }
    }

    fn find<'a>(steps: &'a [Step], node_id: &str) -> &'a Step {
        steps.iter().find(|s| s.node_id == node_id).unwrap()
    }

    #[test]
    fn chain_has_direct_parent_depends() {
        let d = dag(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
        let steps = decompose(&d, "job-1").unwrap();
        assert_eq!(steps.len(), 3);

        let a = find(&steps, "a");
        assert_eq!(a.state, StepState::Ready);
        assert!(a.depend_node_ids.is_empty());

        let b = find(&steps, "b");
        assert_eq!(b.state, StepState::Created);
        assert_eq!(b.depend_node_ids, vec!["a"]);

        let c = find(&steps, "c");
        assert_eq!(c.state, StepState::Created);
        assert_eq!(c.depend_node_ids, vec!["b"]);
    }

    #[test]
    fn diamond_emits_each_node_once() {
        let d = dag(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        );
        let steps = decompose(&d, "job-1").unwrap();
        assert_eq!(steps.len(), 4);

        let dd = find(&steps, "d");
        assert_eq!(dd.depend_node_ids, vec!["b", "c"]);
        assert_eq!(steps.iter().filter(|s| s.node_id == "d").count(), 1);
    }

    #[test]
    fn duplicate_edges_do_not_duplicate_depends() {
        let d = dag(&["a", "b"], &[("a", "b"), ("a", "b")]);
        let steps = decompose(&d, "job-1").unwrap();
        assert_eq!(find(&steps, "b").depend_node_ids, vec!["a"]);
    }

    #[test]
    fn multiple_roots_are_all_ready() {
        let d = dag(&["a", "b", "c"], &[("a", "c"), ("b", "c")]);
        let steps = decompose(&d, "job-1").unwrap();
        assert_eq!(find(&steps, "a").state, StepState::Ready);
        assert_eq!(find(&steps, "b").state, StepState::Ready);
        assert_eq!(find(&steps, "c").state, StepState::Created);
        assert_eq!(find(&steps, "c").depend_node_ids, vec!["a", "b"]);
    }

    #[test]
    fn pure_cycle_is_rejected() {
        let d = dag(&["a", "b"], &[("a", "b"), ("b", "a")]);
        match decompose(&d, "job-1") {
            Err(FlowError::CycleDetected { remaining }) => {
                assert_eq!(remaining, vec!["a", "b"]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn cycle_hanging_off_a_dag_is_rejected() {
        // a -> b, b -> c, c -> b: b/c never reach in-degree zero.
        let d = dag(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("c", "b")]);
        match decompose(&d, "job-1") {
            Err(FlowError::CycleDetected { remaining }) => {
                assert_eq!(remaining, vec!["b", "c"]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_edge_endpoint_is_rejected() {
        let d = dag(&["a"], &[("a", "ghost")]);
        let err = decompose(&d, "job-1").unwrap_err();
        assert!(matches!(err, FlowError::UnknownNode { .. }));
        assert_eq!(err.to_string(), "edge a -> ghost references unknown node");
    }

    #[test]
    fn duplicate_node_is_rejected() {
        let mut d = dag(&["a"], &[]);
        d.nodes.push(node("a"));
        assert!(matches!(
            decompose(&d, "job-1"),
            Err(FlowError::DuplicateNode { .. })
        ));
    }

    #[test]
    fn empty_dag_yields_no_steps() {
        let d = dag(&[], &[]);
        assert!(decompose(&d, "job-1").unwrap().is_empty());
    }

    #[test]
    fn steps_carry_node_action() {
        let mut d = dag(&["a"], &[]);
        d.nodes[0].parameters.insert("k", serde_json::json!("v"));
        let steps = decompose(&d, "job-1").unwrap();
        assert_eq!(steps[0].action.bot, "shell");
        assert_eq!(steps[0].action.rule_id, "run");
        assert_eq!(
            steps[0].action.parameters.get("k"),
            Some(&serde_json::json!("v"))
        );
        assert_eq!(steps[0].job_id, "job-1");
    }
}
