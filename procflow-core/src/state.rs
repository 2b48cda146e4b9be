use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reified suspension written by the sequence executor when a step delegates
/// a long-running workflow asynchronously. The graph runner treats it like an
/// approval pause; the resume ingress re-enqueues the job and execution
/// re-enters at `resume_node`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowPending {
    pub resume_node: String,
    pub resume_step: String,
}

/// Approval context recorded while a run is paused for a human decision.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AwaitingApproval {
    pub approval_id: String,
    pub node_id: String,
    pub prompt: String,
    pub decision_type: String,
}

/// Error context carried through the state (and into the on_failure
/// recovery sub-graph).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
    pub node_id: Option<String>,
    pub step_id: Option<String>,
}

/// The single state object carried through a graph execution. Every node
/// executor receives it, mutates only the fields it owns, and sets
/// `next_node_id` to steer the runner.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunState {
    /// User variables + step outputs.
    pub vars: Map<String, Value>,

    /// Resolved at runtime from the vault; NEVER persisted in a checkpoint.
    #[serde(skip)]
    pub secrets: Map<String, Value>,

    pub run_id: String,
    pub procedure_id: String,
    pub procedure_version: String,

    /// Cursor.
    pub current_node_id: String,
    pub current_step_id: Option<String>,

    /// Routing key: set by executors to tell the runner where to go next.
    pub next_node_id: Option<String>,

    pub error: Option<ErrorInfo>,

    /// Loop context. `active_loop` names the loop node currently driving a
    /// body iteration so the runner can route body failures back to it when
    /// the loop continues on error.
    pub loop_index: usize,
    pub loop_item: Option<Value>,
    pub loop_results: Vec<Value>,
    pub active_loop: Option<String>,

    /// Approval context.
    pub approval_decision: Option<String>,
    pub awaiting_approval: Option<AwaitingApproval>,

    /// Async workflow delegation context.
    pub workflow_pending: Option<WorkflowPending>,

    /// Artifacts collected during the run (kind, uri, node, step).
    pub artifacts: Vec<Value>,

    pub telemetry: Map<String, Value>,

    /// Set by the terminate executor.
    pub terminal_status: Option<String>,
}

impl RunState {
    pub fn new(run_id: &str, procedure_id: &str, procedure_version: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            procedure_id: procedure_id.to_string(),
            procedure_version: procedure_version.to_string(),
            ..Default::default()
        }
    }

    pub fn set_var(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }

    /// Template/expression context: variables at the top level plus the
    /// `vars` / `secrets` / `results` namespaces.
    pub fn template_context(&self) -> Value {
        let mut ctx = self.vars.clone();
        ctx.insert("vars".to_string(), Value::Object(self.vars.clone()));
        ctx.insert("secrets".to_string(), Value::Object(self.secrets.clone()));
        ctx.insert("results".to_string(), Value::Object(self.vars.clone()));
        Value::Object(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn secrets_are_not_serialized() {
        let mut state = RunState::new("r1", "p1", "1.0");
        state.set_var("city", json!("Oslo"));
        state
            .secrets
            .insert("api_token".into(), json!("s3cr3t-value"));

        let serialized = serde_json::to_string(&state).unwrap();
        assert!(!serialized.contains("s3cr3t-value"));
        assert!(serialized.contains("Oslo"));

        let restored: RunState = serde_json::from_str(&serialized).unwrap();
        assert!(restored.secrets.is_empty());
        assert_eq!(restored.vars["city"], json!("Oslo"));
    }

    #[test]
    fn template_context_exposes_namespaces() {
        let mut state = RunState::new("r1", "p1", "1.0");
        state.set_var("count", json!(3));
        let ctx = state.template_context();
        assert_eq!(ctx["count"], json!(3));
        assert_eq!(ctx["vars"]["count"], json!(3));
        assert_eq!(ctx["results"]["count"], json!(3));
    }
}
