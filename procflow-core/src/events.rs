use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::redact::redact_value;

/// Every state-changing operation appends one of these to the run's event
/// log. Consumers stream by polling `event_id > cursor`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunCreated,
    RunCompleted,
    RunFailed,
    RunCanceled,
    RunRetryRequested,
    StepStarted,
    StepCompleted,
    StepFailed,
    RetryAttempted,
    ApprovalRequested,
    ApprovalDecisionReceived,
    WorkflowDelegated,
    LoopIteration,
    CheckpointSaved,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RunCreated => "run_created",
            EventType::RunCompleted => "run_completed",
            EventType::RunFailed => "run_failed",
            EventType::RunCanceled => "run_canceled",
            EventType::RunRetryRequested => "run_retry_requested",
            EventType::StepStarted => "step_started",
            EventType::StepCompleted => "step_completed",
            EventType::StepFailed => "step_failed",
            EventType::RetryAttempted => "retry_attempted",
            EventType::ApprovalRequested => "approval_requested",
            EventType::ApprovalDecisionReceived => "approval_decision_received",
            EventType::WorkflowDelegated => "workflow_delegated",
            EventType::LoopIteration => "loop_iteration",
            EventType::CheckpointSaved => "checkpoint_saved",
        }
    }
}

/// One entry in the append-only per-run log. The store assigns the
/// monotonic `event_id` and timestamp on append.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunEvent {
    pub event_type: EventType,
    pub node_id: Option<String>,
    pub step_id: Option<String>,
    pub attempt: Option<u32>,
    pub payload: Option<Value>,
}

impl RunEvent {
    pub fn of(event_type: EventType) -> Self {
        Self {
            event_type,
            node_id: None,
            step_id: None,
            attempt: None,
            payload: None,
        }
    }

    pub fn node(mut self, node_id: &str) -> Self {
        self.node_id = Some(node_id.to_string());
        self
    }

    pub fn step(mut self, step_id: &str) -> Self {
        self.step_id = Some(step_id.to_string());
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Attach a payload. Sensitive fields are redacted here so nothing
    /// secret can reach the persisted log.
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(redact_value(payload));
        self
    }
}
