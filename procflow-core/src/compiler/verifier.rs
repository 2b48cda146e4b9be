//! Structural verification of a parsed IR graph.

use std::collections::{HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;

use crate::compiler::ir::{IrNode, IrProcedure, NodePayload};
use crate::expression::is_valid_condition;

/// One verification failure.
#[derive(Clone, Debug)]
pub struct VerifyError {
    pub message: String,
    pub node_id: Option<String>,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(id) = &self.node_id {
            write!(f, "[{}] {}", id, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// Verify structural invariants of the IR.
///
/// `known_procedures` is the set of procedure ids subflow nodes may
/// reference. Returns a list of errors; empty means the graph is valid.
pub fn verify(ir: &IrProcedure, known_procedures: &HashSet<String>) -> Vec<VerifyError> {
    let mut errors = Vec::new();

    // 1. Start node present and resolvable.
    if ir.start_node_id.is_empty() {
        errors.push(VerifyError {
            message: "no start_node declared".to_string(),
            node_id: None,
        });
    } else if !ir.nodes.contains_key(&ir.start_node_id) {
        errors.push(VerifyError {
            message: format!("start_node '{}' does not exist", ir.start_node_id),
            node_id: None,
        });
    }

    // 2. Every successor reference resolves to an existing node.
    for (node_id, node) in &ir.nodes {
        for (label, target) in successor_refs(node) {
            if !ir.nodes.contains_key(&target) {
                errors.push(VerifyError {
                    message: format!("{label} references missing node '{target}'"),
                    node_id: Some(node_id.clone()),
                });
            }
        }
    }

    // 3. Per-type structural checks.
    for (node_id, node) in &ir.nodes {
        match &node.payload {
            NodePayload::Logic(logic) => {
                for (i, rule) in logic.rules.iter().enumerate() {
                    if !is_valid_condition(&rule.condition) {
                        errors.push(VerifyError {
                            message: format!(
                                "rule {} has malformed condition '{}'",
                                i, rule.condition
                            ),
                            node_id: Some(node_id.clone()),
                        });
                    }
                }
            }
            NodePayload::Loop(lp) => {
                if lp.body_node_id.is_empty() {
                    errors.push(VerifyError {
                        message: "loop has no body_node".to_string(),
                        node_id: Some(node_id.clone()),
                    });
                }
                if lp.iterator_var.is_empty() {
                    errors.push(VerifyError {
                        message: "loop has no iterator variable".to_string(),
                        node_id: Some(node_id.clone()),
                    });
                }
            }
            NodePayload::Parallel(par) => {
                if par.branches.is_empty() {
                    errors.push(VerifyError {
                        message: "parallel node has no branches".to_string(),
                        node_id: Some(node_id.clone()),
                    });
                }
            }
            NodePayload::Verification(ver) => {
                for check in &ver.checks {
                    if !is_valid_condition(&check.condition) {
                        errors.push(VerifyError {
                            message: format!(
                                "check '{}' has malformed condition '{}'",
                                check.id, check.condition
                            ),
                            node_id: Some(node_id.clone()),
                        });
                    }
                }
            }
            NodePayload::Subflow(sub) => {
                if sub.procedure_id.is_empty() {
                    errors.push(VerifyError {
                        message: "subflow has no procedure_id".to_string(),
                        node_id: Some(node_id.clone()),
                    });
                } else if !known_procedures.contains(&sub.procedure_id) {
                    errors.push(VerifyError {
                        message: format!(
                            "subflow references non-existent procedure '{}'",
                            sub.procedure_id
                        ),
                        node_id: Some(node_id.clone()),
                    });
                }
            }
            _ => {}
        }
    }

    // 4. Reachability from the start node.
    if ir.nodes.contains_key(&ir.start_node_id) {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut indices: HashMap<&str, NodeIndex> = HashMap::new();
        for node_id in ir.nodes.keys() {
            indices.insert(node_id, graph.add_node(node_id));
        }
        for (node_id, node) in &ir.nodes {
            let from = indices[node_id.as_str()];
            for (_, target) in successor_refs(node) {
                if let Some(&to) = indices.get(target.as_str()) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        let mut reachable = HashSet::new();
        let mut dfs = Dfs::new(&graph, indices[ir.start_node_id.as_str()]);
        while let Some(nx) = dfs.next(&graph) {
            reachable.insert(nx);
        }
        // The global on_failure handler is an alternative entry point.
        if let Some(handler) = &ir.global_config.on_failure {
            if let Some(&idx) = indices.get(handler.as_str()) {
                let mut hdfs = Dfs::new(&graph, idx);
                while let Some(nx) = hdfs.next(&graph) {
                    reachable.insert(nx);
                }
            }
        }

        for (node_id, &idx) in &indices {
            if !reachable.contains(&idx) {
                errors.push(VerifyError {
                    message: "node is unreachable from the start node".to_string(),
                    node_id: Some(node_id.to_string()),
                });
            }
        }
    }

    errors
}

/// All successor references a node declares, labelled for diagnostics.
fn successor_refs(node: &IrNode) -> Vec<(String, String)> {
    fn push_opt(refs: &mut Vec<(String, String)>, label: &str, target: &Option<String>) {
        if let Some(t) = target {
            if !t.is_empty() {
                refs.push((label.to_string(), t.clone()));
            }
        }
    }

    let mut refs = Vec::new();
    push_opt(&mut refs, "next_node", &node.next_node_id);

    match &node.payload {
        NodePayload::Logic(logic) => {
            for rule in &logic.rules {
                refs.push(("rule next_node".to_string(), rule.next_node_id.clone()));
            }
            push_opt(&mut refs, "default_next_node", &logic.default_next_node_id);
        }
        NodePayload::Loop(lp) => {
            if !lp.body_node_id.is_empty() {
                refs.push(("body_node".to_string(), lp.body_node_id.clone()));
            }
            push_opt(&mut refs, "loop next_node", &lp.next_node_id);
        }
        NodePayload::Parallel(par) => {
            for branch in &par.branches {
                refs.push((
                    format!("branch '{}' start_node", branch.branch_id),
                    branch.start_node_id.clone(),
                ));
            }
            push_opt(&mut refs, "parallel next_node", &par.next_node_id);
        }
        NodePayload::HumanApproval(appr) => {
            push_opt(&mut refs, "on_approve", &appr.on_approve);
            push_opt(&mut refs, "on_reject", &appr.on_reject);
            push_opt(&mut refs, "on_timeout", &appr.on_timeout);
        }
        NodePayload::Sequence(seq) => {
            for handler in &seq.error_handlers {
                push_opt(&mut refs, "fallback_node", &handler.fallback_node);
            }
        }
        NodePayload::Processing(p) => push_opt(&mut refs, "next_node", &p.next_node_id),
        NodePayload::Verification(p) => push_opt(&mut refs, "next_node", &p.next_node_id),
        NodePayload::LlmAction(p) => push_opt(&mut refs, "next_node", &p.next_node_id),
        NodePayload::Transform(p) => push_opt(&mut refs, "next_node", &p.next_node_id),
        NodePayload::Subflow(p) => push_opt(&mut refs, "next_node", &p.next_node_id),
        NodePayload::Terminate(_) => {}
    }

    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::parse_procedure;
    use serde_json::json;

    fn known() -> HashSet<String> {
        HashSet::new()
    }

    #[test]
    fn valid_graph_has_no_errors() {
        let def = json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "a", "nodes": {
                "a": {"type": "sequence", "next_node": "b",
                      "steps": [{"step_id": "s", "action": "log"}]},
                "b": {"type": "terminate"},
            }},
        });
        let ir = parse_procedure(&def).unwrap();
        assert!(verify(&ir, &known()).is_empty());
    }

    #[test]
    fn missing_successor_is_reported() {
        let def = json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "a", "nodes": {
                "a": {"type": "sequence", "next_node": "ghost", "steps": []},
            }},
        });
        let ir = parse_procedure(&def).unwrap();
        let errors = verify(&ir, &known());
        assert!(errors.iter().any(|e| e.message.contains("ghost")));
    }

    #[test]
    fn missing_start_node_is_reported() {
        let def = json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"nodes": {"a": {"type": "terminate"}}},
        });
        let ir = parse_procedure(&def).unwrap();
        let errors = verify(&ir, &known());
        assert!(errors.iter().any(|e| e.message.contains("start_node")));
    }

    #[test]
    fn loop_without_body_is_reported() {
        let def = json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "l", "nodes": {
                "l": {"type": "loop", "iterator": "items", "iterator_variable": "item"},
            }},
        });
        let ir = parse_procedure(&def).unwrap();
        let errors = verify(&ir, &known());
        assert!(errors.iter().any(|e| e.message.contains("body_node")));
    }

    #[test]
    fn subflow_must_reference_known_procedure() {
        let def = json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "s", "nodes": {
                "s": {"type": "subflow", "procedure_id": "child"},
            }},
        });
        let ir = parse_procedure(&def).unwrap();
        let errors = verify(&ir, &known());
        assert!(errors.iter().any(|e| e.message.contains("child")));

        let mut procs = HashSet::new();
        procs.insert("child".to_string());
        assert!(verify(&ir, &procs).is_empty());
    }

    #[test]
    fn malformed_rule_condition_is_reported() {
        let def = json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "l", "nodes": {
                "l": {"type": "logic",
                      "rules": [{"condition": "   ", "next_node": "t"}],
                      "default_next_node": "t"},
                "t": {"type": "terminate"},
            }},
        });
        let ir = parse_procedure(&def).unwrap();
        let errors = verify(&ir, &known());
        assert!(errors.iter().any(|e| e.message.contains("malformed")));
    }

    #[test]
    fn unreachable_node_is_reported() {
        let def = json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "a", "nodes": {
                "a": {"type": "terminate"},
                "island": {"type": "terminate"},
            }},
        });
        let ir = parse_procedure(&def).unwrap();
        let errors = verify(&ir, &known());
        assert!(errors
            .iter()
            .any(|e| e.node_id.as_deref() == Some("island")));
    }
}
