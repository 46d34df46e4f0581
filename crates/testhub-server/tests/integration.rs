use anyhow::{Context, Result, bail};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use testhub_protocol::{
    ControlRequest, ControlResponse, HubStatus, MAX_JSON_LINE_BYTES, Request, Response,
    ServiceCall, ServiceReply, TaskId,
};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

struct TestServer {
    runtime: TempDir,
    socket_path: PathBuf,
    control_path: PathBuf,
    child: Child,
}

impl TestServer {
    async fn spawn(services_toml: &str) -> Result<Self> {
        let runtime = tempfile::tempdir().context("failed to create temp runtime dir")?;
        let socket_path = runtime.path().join("testhub.sock");
        let control_path = runtime.path().join("testhub-control.sock");
        let config_path = runtime.path().join("testhub.toml");
        fs::write(
            &config_path,
            format!(
                "runtime_dir = {:?}\nrpc_timeout_ms = 1000\n{services_toml}",
                runtime.path().join("run").display().to_string()
            ),
        )?;

        let child = Command::new(assert_cmd::cargo::cargo_bin!("testhub"))
            .arg("--socket")
            .arg(&socket_path)
            .arg("--control-socket")
            .arg(&control_path)
            .arg("--config")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn testhub")?;

        let start = Instant::now();
        loop {
            match UnixStream::connect(&control_path).await {
                Ok(stream) => {
                    drop(stream);
                    break;
                }
                Err(_) if start.elapsed() <= Duration::from_secs(5) => {
                    sleep(Duration::from_millis(20)).await;
                }
                Err(err) => bail!("timed out waiting for {}: {err}", control_path.display()),
            }
        }

        Ok(Self {
            runtime,
            socket_path,
            control_path,
            child,
        })
    }

    async fn control(&self, req: ControlRequest) -> Result<Option<Value>> {
        let mut conn = LineConn::connect(&self.control_path).await?;
        conn.send(&req).await?;
        match conn.recv::<ControlResponse>().await? {
            ControlResponse::Ok { data } => Ok(data),
            ControlResponse::Error { message } => bail!("{message}"),
        }
    }

    async fn status(&self) -> Result<HubStatus> {
        let data = self
            .control(ControlRequest::Status)
            .await?
            .context("status without data")?;
        Ok(serde_json::from_value(data)?)
    }

    async fn wait_for_status(&self, check: impl Fn(&HubStatus) -> bool) -> Result<HubStatus> {
        let start = Instant::now();
        loop {
            let status = self.status().await?;
            if check(&status) {
                return Ok(status);
            }
            if start.elapsed() > Duration::from_secs(5) {
                bail!("status never reached expected state: {status:?}");
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        let _ = self.control(ControlRequest::Shutdown).await;
        let start = Instant::now();
        loop {
            if self.child.try_wait()?.is_some() {
                return Ok(());
            }
            if start.elapsed() > Duration::from_secs(5) {
                self.child.kill().context("failed to kill testhub")?;
                let _ = self.child.wait();
                bail!("testhub did not stop on request");
            }
            sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if self.child.try_wait().ok().flatten().is_none() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

struct LineConn {
    reader: FramedRead<tokio::net::unix::OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<tokio::net::unix::OwnedWriteHalf, LinesCodec>,
}

impl LineConn {
    async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("failed to connect {}", path.display()))?;
        Ok(Self::from_stream(stream))
    }

    fn from_stream(stream: UnixStream) -> Self {
        let (r, w) = stream.into_split();
        Self {
            reader: FramedRead::new(r, LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES)),
            writer: FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES)),
        }
    }

    async fn send<T: serde::Serialize>(&mut self, msg: &T) -> Result<()> {
        self.writer.send(serde_json::to_string(msg)?).await?;
        Ok(())
    }

    async fn recv<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        let Some(line) = timeout(Duration::from_secs(5), self.reader.next()).await? else {
            bail!("peer disconnected");
        };
        Ok(serde_json::from_str(&line?)?)
    }
}

/// Probe service answering every call with a fresh call id.
fn fake_probe_service(listener: UnixListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut n = 0;
        while let Ok((stream, _)) = listener.accept().await {
            let mut conn = LineConn::from_stream(stream);
            let Ok(call) = conn.recv::<ServiceCall>().await else {
                continue;
            };
            n += 1;
            let reply = match call.method.as_str() {
                "probe.start" => ServiceReply::success(json!({"callid": format!("c-{n}")})),
                "probe.stop" => ServiceReply::success(json!({"stopped": true})),
                other => ServiceReply::failure(format!("unsupported {other}")),
            };
            let _ = conn.send(&reply).await;
        }
    })
}

fn cmd(tid: u64, body: Value) -> Request {
    Request::Cmd { tid, body }
}

#[tokio::test]
async fn unknown_command_and_script_lifecycle() -> Result<()> {
    let mut server = TestServer::spawn("").await?;
    server
        .control(ControlRequest::RegisterTask {
            task_id: TaskId::from("t1"),
            background: false,
        })
        .await?;

    let mut runner = LineConn::connect(&server.socket_path).await?;
    server.wait_for_status(|s| s.sessions == 1).await?;

    runner
        .send(&cmd(1, json!({"task-id": "t1", "cmd": "frobnicate"})))
        .await?;
    assert_eq!(
        runner.recv::<Response>().await?,
        Response::failed(1, json!({"cmd": "frobnicate", "res": "command_error"}))
    );

    // No probe service is configured: the request is dropped without reply.
    runner
        .send(&cmd(2, json!({"task-id": "t1", "cmd": "get_probe", "name": "x"})))
        .await?;
    runner.send(&cmd(3, json!({"task-id": "t1"}))).await?;
    runner
        .send(&cmd(4, json!({"task-id": "t1", "cmd": "nope"})))
        .await?;
    assert_eq!(runner.recv::<Response>().await?.tid(), 4);

    runner
        .send(&Request::Notify {
            tid: 5,
            body: json!({"task-id": "t1", "event": "script-stopped"}),
        })
        .await?;
    let status = server
        .wait_for_status(|s| s.sessions == 0 && s.tasks == 0)
        .await?;
    assert_eq!(status.interact_submitted, 0);

    server.shutdown().await?;
    assert!(!server.socket_path.exists());
    assert!(!server.control_path.exists());
    assert!(!server.runtime.path().join("run").join("testhub.pid").exists());
    Ok(())
}

#[tokio::test]
async fn probes_started_by_a_script_are_stopped_with_it() -> Result<()> {
    let probe_dir = tempfile::tempdir()?;
    let probe_socket = probe_dir.path().join("probe.sock");
    let probe_service = fake_probe_service(UnixListener::bind(&probe_socket)?);

    let mut server = TestServer::spawn(&format!(
        "[services]\nprobe_socket = {:?}\n",
        probe_socket.display().to_string()
    ))
    .await?;
    server
        .control(ControlRequest::RegisterTask {
            task_id: TaskId::from(9),
            background: false,
        })
        .await?;

    let mut runner = LineConn::connect(&server.socket_path).await?;
    runner
        .send(&cmd(1, json!({"task-id": 9, "cmd": "start_probe", "name": "net"})))
        .await?;
    match runner.recv::<Response>().await? {
        Response::Ok { tid, body } => {
            assert_eq!(tid, 1);
            assert_eq!(body["cmd"], json!("start_probe"));
            assert_eq!(body["res"]["callid"], json!("c-1"));
        }
        other => bail!("unexpected reply {other:?}"),
    }

    runner
        .send(&Request::Notify {
            tid: 2,
            body: json!({"task-id": "9", "event": "script-stopped"}),
        })
        .await?;
    server
        .wait_for_status(|s| s.sessions == 0 && s.tasks == 0)
        .await?;

    server.shutdown().await?;
    probe_service.abort();
    Ok(())
}

#[tokio::test]
async fn closed_runner_connection_leaves_no_session() -> Result<()> {
    let mut server = TestServer::spawn("").await?;
    let runner = LineConn::connect(&server.socket_path).await?;
    server.wait_for_status(|s| s.sessions == 1).await?;
    drop(runner);
    server.wait_for_status(|s| s.sessions == 0).await?;
    server.shutdown().await?;
    Ok(())
}
