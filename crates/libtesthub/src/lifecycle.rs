use std::sync::Arc;

use anyhow::anyhow;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::HubError;
use crate::event::{AGENT_RESET, optional_string};
use crate::registry::{ProbeInvocation, Session};
use crate::services::{AgentService, ProbeService};

/// Starts, stops and tears down the probes and agents used by sessions.
#[derive(Clone)]
pub struct LifecycleCoordinator {
    probes: Arc<dyn ProbeService>,
    agents: Arc<dyn AgentService>,
}

impl LifecycleCoordinator {
    pub fn new(probes: Arc<dyn ProbeService>, agents: Arc<dyn AgentService>) -> Self {
        Self { probes, agents }
    }

    pub async fn find_probe(&self, request: &Value) -> Result<Value, HubError> {
        debug!(probe = ?optional_string(request, "name"), "getting probe");
        self.probes
            .find(request)
            .await
            .map_err(|e| HubError::service("probe", e))
    }

    /// Start a probe and attribute it to `session` so it can be reset later.
    pub async fn start_probe(
        &self,
        session: &mut Session,
        request: &Value,
    ) -> Result<Value, HubError> {
        let name = optional_string(request, "name").unwrap_or_default();
        debug!(peer_id = %session.peer_id, probe = %name, "starting probe");
        let res = self
            .probes
            .start(request)
            .await
            .map_err(|e| HubError::service("probe", e))?;

        let raw_call_id = match res.get("callid") {
            Some(Value::Null) | None => {
                return Err(HubError::service(
                    "probe",
                    anyhow!("start reply for '{name}' has no callid"),
                ));
            }
            Some(id) => id.clone(),
        };
        let call_id = match &raw_call_id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        // The stop request carries the callid exactly as the service issued it.
        let mut stored = request.clone();
        if let Value::Object(map) = &mut stored {
            map.insert("callid".to_string(), raw_call_id);
        }
        session.probes.push(ProbeInvocation {
            name,
            call_id,
            request: stored,
        });
        Ok(res)
    }

    pub async fn stop_probe(&self, request: &Value) -> Result<Value, HubError> {
        debug!(probe = ?optional_string(request, "name"), "stopping probe");
        self.probes
            .stop(request)
            .await
            .map_err(|e| HubError::service("probe", e))
    }

    /// Stop every probe recorded on the session, once each, and clear the list.
    /// Returns the number of stop attempts.
    pub async fn reset_probes(&self, session: &mut Session) -> usize {
        let probes = std::mem::take(&mut session.probes);
        if !probes.is_empty() {
            info!(peer_id = %session.peer_id, count = probes.len(), "cleaning up active probes");
        }
        for probe in &probes {
            if let Err(err) = self.probes.stop(&probe.request).await {
                warn!(
                    peer_id = %session.peer_id,
                    probe = %probe.name,
                    call_id = %probe.call_id,
                    "probe stop failed during reset: {err:#}"
                );
            }
        }
        probes.len()
    }

    /// Send `agent-reset` to every bound agent that is still alive and clear
    /// the bindings. Returns the number of agents notified.
    pub async fn reset_agents(&self, session: &mut Session) -> usize {
        let bindings = std::mem::take(&mut session.agents);
        let mut notified = 0;
        for binding in &bindings {
            let agent = match self.agents.lookup(&binding.agent_name).await {
                Ok(Some(agent)) => agent,
                Ok(None) => {
                    debug!(agent = %binding.agent_name, "agent gone, skipping reset");
                    continue;
                }
                Err(err) => {
                    warn!(agent = %binding.agent_name, "agent lookup failed: {err:#}");
                    continue;
                }
            };

            info!(
                agent = %binding.agent_name,
                script_id = %binding.script_id,
                source_adapter = %binding.source_adapter,
                "resetting agent"
            );
            let data = json!({
                "event": AGENT_RESET,
                "script_id": binding.script_id,
                "source-adapter": binding.source_adapter,
                "uuid": binding.uuid,
            });
            match self.agents.notify(&agent.address, data).await {
                Ok(()) => notified += 1,
                Err(err) => warn!(agent = %binding.agent_name, "agent reset failed: {err:#}"),
            }
        }
        notified
    }

    /// Drop bindings released by an explicit `agent-reset` from the runner.
    /// Matches on `uuid` when present, otherwise on the agent name.
    pub fn release_agent(&self, session: &mut Session, event: &Value) -> usize {
        let before = session.agents.len();
        if let Some(uuid) = optional_string(event, "uuid") {
            session.agents.retain(|b| b.uuid != uuid);
        } else if let Some(name) = optional_string(event, "destination-agent") {
            session.agents.retain(|b| b.agent_name != name);
        }
        before - session.agents.len()
    }
}
