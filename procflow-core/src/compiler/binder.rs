//! Compile-time binding pass.
//!
//! The binder does not hardcode channel or agent mappings: agents are
//! registered dynamically and resolved at dispatch time. The only thing
//! known at compile time is the set of actions the orchestrator always
//! handles itself; those are tagged here so the dispatcher can short-circuit
//! them. Every other step stays unbound.

use crate::compiler::ir::{ExecutorBinding, IrProcedure, NodePayload};

/// Actions executed in-process by the sequence executor; they never require
/// an external agent or tool.
pub const INTERNAL_ACTIONS: &[&str] = &[
    "log",
    "wait",
    "set_variable",
    "calculate",
    "format_data",
    "parse_json",
    "generate_id",
    "get_timestamp",
];

pub fn is_internal_action(action: &str) -> bool {
    INTERNAL_ACTIONS.contains(&action)
}

/// Tag internal actions in every sequence payload (including error-handler
/// recovery steps). Everything else resolves at runtime from the registry.
pub fn bind_executors(ir: &mut IrProcedure) {
    for node in ir.nodes.values_mut() {
        if let NodePayload::Sequence(seq) = &mut node.payload {
            for step in &mut seq.steps {
                if is_internal_action(&step.action) {
                    step.binding = Some(ExecutorBinding::Internal {
                        action: step.action.clone(),
                    });
                }
            }
            for handler in &mut seq.error_handlers {
                for step in &mut handler.recovery_steps {
                    if is_internal_action(&step.action) {
                        step.binding = Some(ExecutorBinding::Internal {
                            action: step.action.clone(),
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::parse_procedure;
    use serde_json::json;

    #[test]
    fn tags_internal_actions_and_leaves_agent_actions_unbound() {
        let def = json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "n", "nodes": {
                "n": {
                    "type": "sequence",
                    "agent": "web",
                    "steps": [
                        {"step_id": "s1", "action": "log", "message": "hi"},
                        {"step_id": "s2", "action": "navigate", "url": "x"},
                    ],
                    "error_handlers": [{
                        "error_kind": "dispatch",
                        "action": "fail",
                        "recovery_steps": [{"step_id": "r1", "action": "set_variable"}],
                    }],
                },
            }},
        });
        let mut ir = parse_procedure(&def).unwrap();
        bind_executors(&mut ir);

        let NodePayload::Sequence(seq) = &ir.nodes["n"].payload else {
            panic!("expected sequence payload");
        };
        assert_eq!(
            seq.steps[0].binding,
            Some(ExecutorBinding::Internal {
                action: "log".to_string()
            })
        );
        // navigate is not internal: stays unbound for runtime resolution.
        assert!(seq.steps[1].binding.is_none());
        assert!(seq.error_handlers[0].recovery_steps[0].binding.is_some());
    }
}
