//! Collaborators reached over line-delimited JSON on Unix sockets.
//!
//! Each call opens its own connection, writes one [`ServiceCall`] and, when
//! a reply is expected, reads one [`ServiceReply`].

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use libtesthub::{
    AgentHandle, AgentService, Collaborators, MonitorSink, PlanCounts, ProbeService, PublishScope,
    ResultRecord, StatsSink, UserDirectory, UserPresence,
};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use testhub_protocol::{MAX_JSON_LINE_BYTES, PeerId, ServiceCall, ServiceReply, Tid};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::debug;

use crate::config::ServicesConfig;

/// Build the collaborator bundle from the `[services]` table.
pub fn collaborators(services: &ServicesConfig, rpc_timeout: Duration) -> Collaborators {
    let client = |path: &Option<PathBuf>| {
        path.as_ref()
            .map(|p| LineRpcClient::new(p.clone(), rpc_timeout))
    };
    Collaborators {
        probes: Arc::new(RemoteService::new("probe", client(&services.probe_socket))),
        agents: Arc::new(RemoteService::new("agent", client(&services.agent_socket))),
        monitor: Arc::new(RemoteService::new(
            "monitor",
            client(&services.monitor_socket),
        )),
        stats: Arc::new(RemoteService::new("stats", client(&services.stats_socket))),
        users: Arc::new(RemoteService::new("users", client(&services.users_socket))),
    }
}

#[derive(Debug, Clone)]
pub struct LineRpcClient {
    socket_path: PathBuf,
    rpc_timeout: Duration,
}

impl LineRpcClient {
    pub fn new(socket_path: PathBuf, rpc_timeout: Duration) -> Self {
        Self {
            socket_path,
            rpc_timeout,
        }
    }

    /// Call `method` and wait up to the configured timeout for the reply.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        timeout(self.rpc_timeout, self.exchange(method, params))
            .await
            .with_context(|| format!("{method} timed out after {:?}", self.rpc_timeout))?
    }

    /// Send `method` without waiting for an answer.
    pub async fn cast(&self, method: &str, params: Value) -> Result<()> {
        timeout(self.rpc_timeout, self.deliver(method, params))
            .await
            .with_context(|| format!("{method} timed out after {:?}", self.rpc_timeout))?
    }

    /// One request/reply round trip with no time limit of its own.
    async fn exchange(&self, method: &str, params: Value) -> Result<Value> {
        let (mut reader, mut writer) = connect(&self.socket_path).await?;
        send(&mut writer, method, params, true).await?;
        let Some(line) = reader.next().await else {
            bail!("{} closed before replying", self.socket_path.display());
        };
        let reply: ServiceReply =
            serde_json::from_str(&line?).with_context(|| format!("invalid reply to {method}"))?;
        if reply.ok {
            Ok(reply.result)
        } else {
            Err(anyhow!(
                "{method} failed: {}",
                reply.error.as_deref().unwrap_or("unspecified error")
            ))
        }
    }

    async fn deliver(&self, method: &str, params: Value) -> Result<()> {
        let (_reader, mut writer) = connect(&self.socket_path).await?;
        send(&mut writer, method, params, false).await
    }
}

type LineReader = FramedRead<tokio::net::unix::OwnedReadHalf, LinesCodec>;
type LineWriter = FramedWrite<tokio::net::unix::OwnedWriteHalf, LinesCodec>;

async fn connect(socket_path: &Path) -> Result<(LineReader, LineWriter)> {
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("failed to connect to {}", socket_path.display()))?;
    let (r, w) = stream.into_split();
    Ok((
        FramedRead::new(r, LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES)),
        FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES)),
    ))
}

async fn send(
    writer: &mut LineWriter,
    method: &str,
    params: Value,
    expect_reply: bool,
) -> Result<()> {
    let call = ServiceCall {
        method: method.to_string(),
        params,
        expect_reply,
    };
    writer.send(serde_json::to_string(&call)?).await?;
    Ok(())
}

/// One remote collaborator. Without a socket, calls expecting an answer
/// fail, lookups find nothing and notifications are dropped.
pub struct RemoteService {
    name: &'static str,
    client: Option<LineRpcClient>,
}

impl RemoteService {
    pub fn new(name: &'static str, client: Option<LineRpcClient>) -> Self {
        Self { name, client }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        match &self.client {
            Some(client) => client.call(method, params).await,
            None => Err(anyhow!("{} service not configured", self.name)),
        }
    }

    async fn cast(&self, method: &str, params: Value) -> Result<()> {
        match &self.client {
            Some(client) => client.cast(method, params).await,
            None => {
                debug!(service = self.name, method, "service not configured, dropped");
                Ok(())
            }
        }
    }

    async fn fetch_optional<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>> {
        if self.client.is_none() {
            return Ok(None);
        }
        let found = self.call(method, params).await?;
        if found.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(found).with_context(|| {
            format!("invalid {method} result")
        })?))
    }
}

#[async_trait]
impl ProbeService for RemoteService {
    async fn find(&self, request: &Value) -> Result<Value> {
        self.call("probe.find", request.clone()).await
    }

    async fn start(&self, request: &Value) -> Result<Value> {
        self.call("probe.start", request.clone()).await
    }

    async fn stop(&self, request: &Value) -> Result<Value> {
        self.call("probe.stop", request.clone()).await
    }
}

#[async_trait]
impl AgentService for RemoteService {
    async fn forward(&self, peer_id: &PeerId, tid: Tid, event: &Value) -> Result<()> {
        self.cast(
            "agent.forward",
            json!({"peer_id": peer_id, "tid": tid, "event": event}),
        )
        .await
    }

    async fn lookup(&self, agent_name: &str) -> Result<Option<AgentHandle>> {
        self.fetch_optional("agent.lookup", json!({"name": agent_name}))
            .await
    }

    async fn notify(&self, address: &str, data: Value) -> Result<()> {
        self.cast("agent.notify", json!({"address": address, "data": data}))
            .await
    }
}

#[async_trait]
impl MonitorSink for RemoteService {
    async fn publish(&self, event: &Value, scope: PublishScope) -> Result<()> {
        let channel = match scope {
            PublishScope::Broadcast => Value::Null,
            PublishScope::Channel(id) => Value::String(id),
        };
        self.cast("monitor.publish", json!({"event": event, "channel": channel}))
            .await
    }

    async fn interact(&self, body: &Value, limit: Duration) -> Result<Option<Value>> {
        let Some(client) = &self.client else {
            return Ok(None);
        };
        let params = json!({"body": body, "timeout_ms": limit.as_millis() as u64});
        match timeout(limit, client.exchange("monitor.interact", params)).await {
            Ok(Ok(Value::Null)) | Err(_) => Ok(None),
            Ok(Ok(answer)) => Ok(Some(answer)),
            Ok(Err(err)) => Err(err),
        }
    }
}

#[async_trait]
impl StatsSink for RemoteService {
    async fn record_testcase(&self, record: ResultRecord) -> Result<()> {
        self.cast("stats.testcase", json!({"record": record})).await
    }

    async fn record_testabstract(&self, record: ResultRecord, testcases: u64) -> Result<()> {
        self.cast(
            "stats.testabstract",
            json!({"record": record, "testcases": testcases}),
        )
        .await
    }

    async fn record_testunit(&self, record: ResultRecord, testcases: u64) -> Result<()> {
        self.cast(
            "stats.testunit",
            json!({"record": record, "testcases": testcases}),
        )
        .await
    }

    async fn record_testsuite(&self, record: ResultRecord, testcases: u64) -> Result<()> {
        self.cast(
            "stats.testsuite",
            json!({"record": record, "testcases": testcases}),
        )
        .await
    }

    async fn record_testglobal(&self, record: ResultRecord, counts: PlanCounts) -> Result<()> {
        self.cast("stats.testglobal", json!({"record": record, "counts": counts}))
            .await
    }

    async fn record_testplan(&self, record: ResultRecord, counts: PlanCounts) -> Result<()> {
        self.cast("stats.testplan", json!({"record": record, "counts": counts}))
            .await
    }
}

#[async_trait]
impl UserDirectory for RemoteService {
    async fn lookup(&self, login: &str) -> Result<Option<UserPresence>> {
        self.fetch_optional("users.lookup", json!({"login": login}))
            .await
    }
}
