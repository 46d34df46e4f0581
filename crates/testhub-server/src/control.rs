use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use libtesthub::Dispatcher;
use std::sync::Arc;
use testhub_protocol::{ControlRequest, ControlResponse, MAX_JSON_LINE_BYTES};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info};

/// Serve one operator connection: one reply per request line.
pub async fn handle_control_client(
    stream: UnixStream,
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: watch::Sender<bool>,
) -> Result<()> {
    let (r, w) = stream.into_split();
    let mut reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES));
    let mut writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES));

    while let Some(line) = reader.next().await {
        let line = line?;
        let (resp, stop) = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(req) => handle_request(&dispatcher, req).await,
            Err(err) => (
                ControlResponse::Error {
                    message: format!("invalid request: {err}"),
                },
                false,
            ),
        };
        writer.send(serde_json::to_string(&resp)?).await?;

        if stop {
            info!("shutdown requested over control socket");
            shutdown_tx.send_replace(true);
            break;
        }
    }
    Ok(())
}

async fn handle_request(dispatcher: &Dispatcher, req: ControlRequest) -> (ControlResponse, bool) {
    match req {
        ControlRequest::RegisterTask {
            task_id,
            background,
        } => {
            debug!(task_id = %task_id, background, "registering task");
            dispatcher.register_task(task_id, background).await;
            (ControlResponse::Ok { data: None }, false)
        }
        ControlRequest::Status => {
            let status = dispatcher.status().await;
            match serde_json::to_value(status) {
                Ok(data) => (ControlResponse::Ok { data: Some(data) }, false),
                Err(err) => (
                    ControlResponse::Error {
                        message: err.to_string(),
                    },
                    false,
                ),
            }
        }
        ControlRequest::Shutdown => (ControlResponse::Ok { data: None }, true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libtesthub::mock::MockServices;
    use serde_json::json;
    use testhub_protocol::HubStatus;

    type Reader = FramedRead<tokio::net::unix::OwnedReadHalf, LinesCodec>;
    type Writer = FramedWrite<tokio::net::unix::OwnedWriteHalf, LinesCodec>;

    async fn roundtrip(reader: &mut Reader, writer: &mut Writer, line: String) -> ControlResponse {
        writer.send(line).await.expect("send");
        let reply = reader.next().await.expect("open").expect("line");
        serde_json::from_str(&reply).expect("decode")
    }

    #[tokio::test]
    async fn register_then_status() {
        let mocks = MockServices::new();
        let dispatcher = Arc::new(Dispatcher::new(mocks.collaborators()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (server, client) = UnixStream::pair().expect("pair");
        let task = tokio::spawn(handle_control_client(
            server,
            Arc::clone(&dispatcher),
            shutdown_tx,
        ));

        let (r, w) = client.into_split();
        let mut reader = FramedRead::new(r, LinesCodec::new());
        let mut writer = FramedWrite::new(w, LinesCodec::new());
        let resp = roundtrip(
            &mut reader,
            &mut writer,
            json!({"cmd": "register_task", "task_id": 5, "background": true}).to_string(),
        )
        .await;
        assert!(matches!(resp, ControlResponse::Ok { data: None }));

        match roundtrip(&mut reader, &mut writer, json!({"cmd": "status"}).to_string()).await {
            ControlResponse::Ok { data: Some(data) } => {
                let status: HubStatus = serde_json::from_value(data).expect("status");
                assert_eq!(status.tasks, 1);
                assert_eq!(status.sessions, 0);
            }
            other => panic!("unexpected {other:?}"),
        }

        match roundtrip(&mut reader, &mut writer, "{\"cmd\":\"explode\"}".to_string()).await {
            ControlResponse::Error { message } => assert!(message.contains("invalid request")),
            other => panic!("unexpected {other:?}"),
        }

        let shutdown = json!({"cmd": "shutdown"}).to_string();
        let resp = roundtrip(&mut reader, &mut writer, shutdown).await;
        assert!(matches!(resp, ControlResponse::Ok { .. }));
        task.await.expect("join").expect("control client");
        assert!(*shutdown_rx.borrow());
    }
}
