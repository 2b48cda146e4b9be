//! Runtime executor resolution and HTTP dispatch.
//!
//! Resolution is dynamic: the compiler only tags internal actions, so this
//! is the single place where a step's action is mapped to a live executor.
//! Order: compile-time internal binding → node without a channel is
//! internal → registry lookup by (channel, action) → configured tool-server
//! fallback → `no-executor`.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::compiler::ir::{ExecutorBinding, IrNode, IrStep};
use crate::env::RunnerEnv;
use crate::error::{OrchError, OrchResult};
use crate::registry::find_capable_agent;
use crate::types::AgentInstance;

/// Outcome of runtime resolution. Carries the full agent row (not just the
/// URL) so the caller can lease the agent's resource key and report
/// dispatch outcomes back to the circuit breaker.
#[derive(Clone, Debug)]
pub enum Resolution {
    Internal { action: String },
    Agent { agent: AgentInstance },
    Tool { url: String },
}

pub async fn resolve_executor(
    env: &RunnerEnv,
    node: &IrNode,
    step: &IrStep,
) -> OrchResult<Resolution> {
    // 1. Bound at compile time (log, wait, set_variable, ...).
    if let Some(ExecutorBinding::Internal { action }) = &step.binding {
        return Ok(Resolution::Internal {
            action: action.clone(),
        });
    }

    // 2. No channel on the node: generic orchestrator-side step.
    let Some(channel) = node.agent.as_deref().filter(|c| !c.is_empty()) else {
        return Ok(Resolution::Internal {
            action: step.action.clone(),
        });
    };
    let channel = channel.to_lowercase();

    // 3. Registry lookup.
    if let Some(agent) = find_capable_agent(
        &env.store,
        &channel,
        &step.action,
        env.settings.circuit_reset,
    )
    .await?
    {
        return Ok(Resolution::Agent { agent });
    }

    // 4. Tool-server fallback.
    if let Some(url) = &env.settings.tool_base_url {
        return Ok(Resolution::Tool { url: url.clone() });
    }

    // 5. Nothing can run this step.
    Err(OrchError::no_executor(&channel, &step.action))
}

// ─── Agent HTTP protocol ──────────────────────────────────────

/// The agent response envelope: `{status, result?, error?}`.
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum AgentResponse {
    Success { result: Option<Value> },
    Error { error: Option<String> },
}

/// Decode an agent response body. Strict mode rejects anything that is not
/// a valid envelope; permissive mode accepts a bare result object from
/// legacy agents.
pub fn decode_envelope(action: &str, body: Value, strict: bool) -> OrchResult<Value> {
    match serde_json::from_value::<AgentResponse>(body.clone()) {
        Ok(AgentResponse::Success { result }) => Ok(result.unwrap_or_else(|| json!({}))),
        Ok(AgentResponse::Error { error }) => Err(OrchError::agent(
            action,
            error.unwrap_or_else(|| "unknown agent error".to_string()),
        )),
        Err(decode_err) => {
            if strict {
                return Err(OrchError::dispatch(
                    action,
                    format!("invalid agent response envelope: {decode_err}"),
                ));
            }
            match body {
                Value::Object(mut map) => {
                    warn!(action, "legacy agent response accepted (missing envelope)");
                    Ok(map.remove("result").unwrap_or(Value::Object(map)))
                }
                _ => Err(OrchError::dispatch(
                    action,
                    "agent response must be a JSON object",
                )),
            }
        }
    }
}

/// Client for one agent instance, speaking the `/execute` protocol.
pub struct AgentClient<'a> {
    http: &'a reqwest::Client,
    base_url: String,
    timeout: Duration,
    strict: bool,
}

impl<'a> AgentClient<'a> {
    pub fn new(env: &'a RunnerEnv, base_url: &str, timeout: Duration) -> Self {
        Self {
            http: &env.http,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            strict: env.settings.agent_strict_envelope,
        }
    }

    /// `POST {base_url}/execute` with the action payload and correlation
    /// headers. Non-2xx, transport errors, and `status = "error"` all fail
    /// the dispatch.
    pub async fn execute_action(
        &self,
        action: &str,
        params: &Map<String, Value>,
        run_id: &str,
        node_id: &str,
        step_id: &str,
    ) -> OrchResult<Value> {
        let payload = json!({
            "action": action,
            "params": params,
            "run_id": run_id,
            "node_id": node_id,
            "step_id": step_id,
        });

        info!(url = %self.base_url, action, run_id, "dispatching to agent");

        let response = self
            .http
            .post(format!("{}/execute", self.base_url))
            .timeout(self.timeout)
            .header("X-Run-ID", run_id)
            .header("X-Node-ID", node_id)
            .header("X-Step-ID", step_id)
            .json(&payload)
            .send()
            .await
            .map_err(|e| OrchError::dispatch(action, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OrchError::dispatch(action, format!("HTTP {status}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| OrchError::dispatch(action, format!("invalid JSON body: {e}")))?;

        decode_envelope(action, body, self.strict)
    }

    /// `GET {base_url}/health`: true when the agent answers 200.
    pub async fn health_check(&self) -> bool {
        match self
            .http
            .get(format!("{}/health", self.base_url))
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// `GET {base_url}/capabilities`: the advertised action list.
    pub async fn capabilities(&self) -> OrchResult<Vec<String>> {
        #[derive(Deserialize)]
        struct Capabilities {
            capabilities: Vec<String>,
        }
        let response = self
            .http
            .get(format!("{}/capabilities", self.base_url))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| OrchError::dispatch("capabilities", e))?;
        let caps: Capabilities = response
            .json()
            .await
            .map_err(|e| OrchError::dispatch("capabilities", e))?;
        Ok(caps.capabilities)
    }
}
