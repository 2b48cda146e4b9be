use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::state::RunState;

// ─── Run ──────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    WaitingApproval,
    Completed,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::WaitingApproval => "waiting_approval",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Canceled
        )
    }
}

/// One execution of one procedure version.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    /// Checkpoint thread. Defaults to the run_id; recovery sub-graphs run
    /// under `{thread_id}:on_failure`.
    pub thread_id: String,
    pub procedure_id: String,
    pub procedure_version: String,
    pub status: RunStatus,
    pub input_vars: Option<Value>,
    pub cancellation_requested: bool,
    pub last_node_id: Option<String>,
    pub last_step_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(procedure_id: &str, procedure_version: &str, input_vars: Option<Value>) -> Self {
        let run_id = Uuid::now_v7();
        Self {
            run_id,
            thread_id: run_id.to_string(),
            procedure_id: procedure_id.to_string(),
            procedure_version: procedure_version.to_string(),
            status: RunStatus::Created,
            input_vars,
            cancellation_requested: false,
            last_node_id: None,
            last_step_id: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }
}

// ─── Run job (the queue row) ──────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

/// Queue row driving the execution of one run. Unique on `run_id`: an
/// approval resume reuses the existing row instead of inserting a second.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunJob {
    pub job_id: Uuid,
    pub run_id: Uuid,
    pub status: JobStatus,
    /// Higher picked first.
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    /// Earliest pickup time (backoff on retry).
    pub available_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunJob {
    pub fn new(run_id: Uuid, priority: i32, max_attempts: i32) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::now_v7(),
            run_id,
            status: JobStatus::Queued,
            priority,
            attempts: 0,
            max_attempts,
            available_at: now,
            locked_by: None,
            locked_until: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ─── Approval ─────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    TimedOut,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::TimedOut => "timed_out",
        }
    }
}

/// Pending human decision attached to a paused run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Approval {
    pub approval_id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    pub prompt: String,
    pub decision_type: String,
    pub options: Option<Vec<String>>,
    pub context_data: Option<Value>,
    pub status: ApprovalStatus,
    pub decided_by: Option<String>,
    pub decision_payload: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

// ─── Artifact ─────────────────────────────────────────────────

/// File or document produced by a step (screenshot, export, report).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: Uuid,
    pub run_id: Uuid,
    pub node_id: Option<String>,
    pub step_id: Option<String>,
    pub kind: String,
    pub uri: String,
    pub created_at: DateTime<Utc>,
}

// ─── Agent instance ───────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
    Degraded,
}

/// A registered external agent process reachable over HTTP.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentInstance {
    pub agent_id: String,
    pub name: String,
    /// Lowercase channel tag (web, desktop, email, api, ...).
    pub channel: String,
    pub base_url: String,
    pub status: AgentStatus,
    /// Comma-separated action list. Empty or `*` = any action in channel.
    pub capabilities: String,
    /// Lease key shared by all work routed at this agent.
    pub resource_key: String,
    pub concurrency_limit: i32,
    pub consecutive_failures: i32,
    /// Set when the circuit opened; resolution ignores opens older than the
    /// reset window.
    pub circuit_open_at: Option<DateTime<Utc>>,
    /// Optional pool for fair round-robin across a fleet.
    pub pool_id: Option<String>,
}

impl AgentInstance {
    /// True when the step action is within this agent's advertised set.
    pub fn can_handle(&self, action: &str) -> bool {
        if self.capabilities.trim().is_empty() {
            return true;
        }
        self.capabilities
            .split(',')
            .map(str::trim)
            .any(|cap| cap == "*" || cap == action)
    }
}

// ─── Resource lease ───────────────────────────────────────────

/// Time-bounded reservation of a shared resource (an agent pool slot).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceLease {
    pub lease_id: Uuid,
    pub resource_key: String,
    pub run_id: Uuid,
    pub node_id: Option<String>,
    pub step_id: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl ResourceLease {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.released_at.is_none() && self.expires_at > now
    }
}

// ─── Step idempotency ─────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Started,
    Succeeded,
    Failed,
}

/// Ledger entry suppressing duplicate external calls on replay.
/// Keyed by (run_id, node_id, step_id).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepIdempotency {
    pub run_id: Uuid,
    pub node_id: String,
    pub step_id: String,
    pub status: IdempotencyStatus,
    pub result_json: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ─── Checkpoint ───────────────────────────────────────────────

/// Snapshot of the run state taken at a node boundary. Secrets are never
/// serialized into a checkpoint (the state type skips them).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub thread_id: String,
    pub parent_checkpoint_id: Option<String>,
    /// Monotonic per-thread sequence.
    pub step: u64,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
}

// ─── Procedure record ─────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureStatus {
    Draft,
    Active,
    Deprecated,
    Archived,
}

/// Versioned, immutable procedure definition. `latest` resolves to the most
/// recently created version.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcedureRecord {
    pub procedure_id: String,
    pub version: String,
    pub status: ProcedureStatus,
    /// The declarative workflow-graph JSON this version was published with.
    pub definition: Value,
    pub created_at: DateTime<Utc>,
}

// ─── Orchestrator worker ──────────────────────────────────────

/// Row announcing a live worker process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchWorker {
    pub worker_id: String,
    pub status: String,
    pub last_heartbeat_at: DateTime<Utc>,
    pub is_leader: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_matching() {
        let mut agent = AgentInstance {
            agent_id: "a1".into(),
            name: "web-1".into(),
            channel: "web".into(),
            base_url: "http://localhost:9001".into(),
            status: AgentStatus::Online,
            capabilities: String::new(),
            resource_key: "web_default".into(),
            concurrency_limit: 1,
            consecutive_failures: 0,
            circuit_open_at: None,
            pool_id: None,
        };
        assert!(agent.can_handle("navigate"));

        agent.capabilities = "navigate, click".into();
        assert!(agent.can_handle("click"));
        assert!(!agent.can_handle("scroll"));

        agent.capabilities = "*".into();
        assert!(agent.can_handle("anything"));
    }

    #[test]
    fn lease_activity_window() {
        let now = Utc::now();
        let lease = ResourceLease {
            lease_id: Uuid::now_v7(),
            resource_key: "web_default".into(),
            run_id: Uuid::now_v7(),
            node_id: None,
            step_id: None,
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(300),
            released_at: None,
        };
        assert!(lease.is_active(now));
        assert!(!lease.is_active(now + chrono::Duration::seconds(301)));

        let released = ResourceLease {
            released_at: Some(now),
            ..lease
        };
        assert!(!released.is_active(now));
    }
}
