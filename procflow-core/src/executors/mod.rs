//! Per-node-type execution logic.
//!
//! Every executor receives `(node, state)` plus the shared context, mutates
//! only the state fields it owns, and sets `next_node_id` when it wants to
//! steer the graph runner away from the node's static successor.

pub mod control;
pub mod data;
pub mod parallel;
pub mod sequence;

use std::sync::Arc;

use uuid::Uuid;

use crate::compiler::ir::{IrNode, IrProcedure, NodePayload};
use crate::env::RunnerEnv;
use crate::error::{OrchError, OrchResult};
use crate::events::RunEvent;
use crate::state::RunState;

/// Execution context threaded through all executors for one run.
#[derive(Clone)]
pub struct ExecCtx {
    pub env: Arc<RunnerEnv>,
    pub ir: Arc<IrProcedure>,
    pub run_id: Uuid,
}

impl ExecCtx {
    pub async fn emit(&self, event: RunEvent) -> OrchResult<u64> {
        self.env
            .store
            .append_event(self.run_id, &event)
            .await
            .map_err(|e| OrchError::internal(format!("failed to append event: {e:#}")))
    }

    /// Cooperative cancellation check, called at every step boundary.
    pub fn check_cancelled(&self) -> OrchResult<()> {
        if self.env.cancellations.is_cancelled(self.run_id) {
            return Err(OrchError::cancelled(self.run_id));
        }
        Ok(())
    }
}

/// Statically dispatch a node to its executor.
pub async fn execute_node(ctx: &ExecCtx, node: &IrNode, state: &mut RunState) -> OrchResult<()> {
    match &node.payload {
        NodePayload::Sequence(payload) => sequence::execute(ctx, node, payload, state).await,
        NodePayload::Logic(payload) => control::execute_logic(ctx, node, payload, state),
        NodePayload::Loop(payload) => control::execute_loop(ctx, node, payload, state).await,
        NodePayload::Parallel(payload) => parallel::execute(ctx, node, payload, state).await,
        NodePayload::Processing(payload) => data::execute_processing(ctx, node, payload, state).await,
        NodePayload::Verification(payload) => data::execute_verification(node, payload, state),
        NodePayload::LlmAction(payload) => data::execute_llm_action(ctx, node, payload, state).await,
        NodePayload::HumanApproval(payload) => {
            control::execute_human_approval(ctx, node, payload, state).await
        }
        NodePayload::Transform(payload) => data::execute_transform(node, payload, state),
        NodePayload::Subflow(payload) => data::execute_subflow(ctx, node, payload, state).await,
        NodePayload::Terminate(payload) => control::execute_terminate(node, payload, state),
    }
}
