//! Intermediate representation: the compiled, typed form of a declarative
//! procedure definition.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─── Executor binding ─────────────────────────────────────────

/// How a step is executed. Internal bindings are assigned at compile time;
/// agent/tool bindings are resolved at runtime from the registry so agents
/// can be added without recompiling procedures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorBinding {
    Internal { action: String },
    AgentHttp { base_url: String },
    Tool { url: String },
}

// ─── Step ─────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Block inline until the agent answers.
    #[default]
    Sync,
    /// Fire the dispatch and suspend the run; the agent calls back through
    /// the event ingress to resume.
    Async,
}

/// Retry policy, either per-step or from global_config defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// Base delay; actual delay is exponential with jitter.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
        }
    }
}

/// One action within a sequence node.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IrStep {
    pub step_id: String,
    pub action: String,
    /// May contain `{{template}}` placeholders; rendered before dispatch.
    pub params: Map<String, Value>,
    pub timeout_ms: Option<u64>,
    /// Pre-delay.
    pub wait_ms: Option<u64>,
    /// Post-delay.
    pub wait_after_ms: Option<u64>,
    pub retry_on_failure: bool,
    /// Per-step override of the global retry defaults.
    pub retry: Option<RetryConfig>,
    pub output_variable: Option<String>,
    pub idempotency_key: Option<String>,
    pub workflow_dispatch_mode: Option<DispatchMode>,
    /// Compile-time binding (internal actions only); None = runtime resolve.
    pub binding: Option<ExecutorBinding>,
}

// ─── Error handler ────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerAction {
    Retry,
    Fail,
    Ignore,
    Fallback,
    Escalate,
}

/// Node-level error handler, consulted after per-step retries exhaust.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IrErrorHandler {
    /// Error kind this handler matches (`dispatch`, `agent-error`, ...) or
    /// `*` for any.
    pub error_kind: String,
    pub action: HandlerAction,
    pub max_retries: u32,
    pub delay_ms: u64,
    /// Steps executed before the handler's action is taken.
    pub recovery_steps: Vec<IrStep>,
    pub fallback_node: Option<String>,
}

// ─── Type-specific payloads ───────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SequencePayload {
    pub steps: Vec<IrStep>,
    pub error_handlers: Vec<IrErrorHandler>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogicRule {
    pub condition: String,
    pub next_node_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LogicPayload {
    /// Evaluated in order; first match wins.
    pub rules: Vec<LogicRule>,
    pub default_next_node_id: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LoopPayload {
    /// Variable holding the sequence to iterate.
    pub iterator_var: String,
    /// Variable the current item is written to each iteration.
    pub item_variable: String,
    pub index_variable: Option<String>,
    pub body_node_id: String,
    pub max_iterations: Option<usize>,
    /// Collect body errors into `loop_results` instead of failing.
    pub continue_on_error: bool,
    pub next_node_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParallelBranch {
    pub branch_id: String,
    pub start_node_id: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    /// Join all branches.
    #[default]
    All,
    /// Return on first success.
    Any,
    /// Join the first N successes.
    FirstN(usize),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchFailure {
    /// Record per-branch errors without failing the node.
    #[default]
    Continue,
    /// Abort remaining branches on first failure.
    FailFast,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ParallelPayload {
    pub branches: Vec<ParallelBranch>,
    pub wait_strategy: WaitStrategy,
    pub branch_failure: BranchFailure,
    pub next_node_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessingOp {
    pub action: String,
    pub params: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProcessingPayload {
    pub operations: Vec<ProcessingOp>,
    pub next_node_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerificationCheck {
    pub id: String,
    pub condition: String,
    /// `fail_workflow` (default) or `continue`.
    pub on_fail: String,
    pub message: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VerificationPayload {
    pub checks: Vec<VerificationCheck>,
    pub next_node_id: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LlmActionPayload {
    pub prompt: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
    pub json_mode: bool,
    pub output_variable: Option<String>,
    pub next_node_id: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HumanApprovalPayload {
    pub prompt: String,
    pub decision_type: String,
    pub options: Option<Vec<String>>,
    pub timeout_ms: Option<u64>,
    pub context_data: Option<Value>,
    pub on_approve: Option<String>,
    pub on_reject: Option<String>,
    pub on_timeout: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransformOp {
    pub source_variable: String,
    /// Template expression rendered against the context.
    pub expression: String,
    pub output_variable: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TransformPayload {
    pub transformations: Vec<TransformOp>,
    pub next_node_id: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubflowFailure {
    #[default]
    FailParent,
    Ignore,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubflowPayload {
    pub procedure_id: String,
    /// None = latest.
    pub version: Option<String>,
    /// child var name → parent template expression.
    pub input_mapping: BTreeMap<String, String>,
    /// parent var name → child var name.
    pub output_mapping: BTreeMap<String, String>,
    pub on_failure: SubflowFailure,
    pub next_node_id: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TerminatePayload {
    /// Terminal status recorded in state (`success`, `failure`, ...).
    pub status: String,
    /// Output var name → template expression, rendered at termination.
    pub outputs: BTreeMap<String, String>,
}

// ─── Node ─────────────────────────────────────────────────────

/// Typed payload: one variant per node kind, statically dispatched by the
/// graph runner.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodePayload {
    Sequence(SequencePayload),
    Logic(LogicPayload),
    Loop(LoopPayload),
    Parallel(ParallelPayload),
    Processing(ProcessingPayload),
    Verification(VerificationPayload),
    LlmAction(LlmActionPayload),
    HumanApproval(HumanApprovalPayload),
    Transform(TransformPayload),
    Subflow(SubflowPayload),
    Terminate(TerminatePayload),
}

impl NodePayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodePayload::Sequence(_) => "sequence",
            NodePayload::Logic(_) => "logic",
            NodePayload::Loop(_) => "loop",
            NodePayload::Parallel(_) => "parallel",
            NodePayload::Processing(_) => "processing",
            NodePayload::Verification(_) => "verification",
            NodePayload::LlmAction(_) => "llm_action",
            NodePayload::HumanApproval(_) => "human_approval",
            NodePayload::Transform(_) => "transform",
            NodePayload::Subflow(_) => "subflow",
            NodePayload::Terminate(_) => "terminate",
        }
    }

    /// Default successor carried inside the payload, if any.
    pub fn next_node_id(&self) -> Option<&str> {
        match self {
            NodePayload::Loop(p) => p.next_node_id.as_deref(),
            NodePayload::Parallel(p) => p.next_node_id.as_deref(),
            NodePayload::Processing(p) => p.next_node_id.as_deref(),
            NodePayload::Verification(p) => p.next_node_id.as_deref(),
            NodePayload::LlmAction(p) => p.next_node_id.as_deref(),
            NodePayload::Transform(p) => p.next_node_id.as_deref(),
            NodePayload::Subflow(p) => p.next_node_id.as_deref(),
            NodePayload::Sequence(_)
            | NodePayload::Logic(_)
            | NodePayload::HumanApproval(_)
            | NodePayload::Terminate(_) => None,
        }
    }
}

/// One vertex of the compiled graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IrNode {
    pub node_id: String,
    /// Channel tag (web, desktop, ...) scoping the node's actions to a
    /// class of agents. None = internal-only node.
    pub agent: Option<String>,
    pub description: Option<String>,
    /// Snapshot state after this node.
    pub is_checkpoint: bool,
    pub next_node_id: Option<String>,
    /// Node SLA used as the rate-limit acquisition deadline.
    pub sla_ms: Option<u64>,
    pub payload: NodePayload,
}

// ─── Procedure (top-level IR) ─────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Per-procedure token-bucket capacity, requests per minute.
    pub rate_limit_per_minute: Option<u32>,
    /// Retry defaults for steps without a per-step override.
    pub retry: RetryConfig,
    /// Node to re-enter (under a `:on_failure` thread) when the run fails.
    pub on_failure: Option<String>,
    pub workflow_dispatch_mode: Option<DispatchMode>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IrProcedure {
    pub procedure_id: String,
    pub version: String,
    pub global_config: GlobalConfig,
    /// Flat map: variable name → schema entry (type/required/default/rules).
    pub variables_schema: Map<String, Value>,
    pub start_node_id: String,
    pub nodes: BTreeMap<String, IrNode>,
}

impl IrProcedure {
    /// Effective retry policy for a step (per-step override, else global).
    pub fn retry_for(&self, step: &IrStep) -> RetryConfig {
        step.retry.clone().unwrap_or_else(|| self.global_config.retry.clone())
    }
}
