use futures_util::{SinkExt, StreamExt};
use libtesthub::Dispatcher;
use std::sync::Arc;
use std::time::Duration;
use testhub_protocol::{MAX_JSON_LINE_BYTES, Request, Response};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RuntimeConfig;

/// Serve one runner connection until it closes, idles out or fails.
pub async fn handle_connection(
    stream: UnixStream,
    dispatcher: Arc<Dispatcher>,
    cfg: Arc<RuntimeConfig>,
) {
    let peer_id = Uuid::new_v4().to_string();
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
    );

    let (out_tx, mut out_rx) = mpsc::channel::<Response>(cfg.outbound_queue);
    let mut writer = FramedWrite::new(
        write_half,
        LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
    );

    let writer_peer = peer_id.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(resp) = out_rx.recv().await {
            let line = match serde_json::to_string(&resp) {
                Ok(line) => line,
                Err(err) => {
                    error!(peer_id = %writer_peer, "failed to encode response: {err}");
                    continue;
                }
            };

            if let Err(err) = writer.send(line).await {
                warn!(peer_id = %writer_peer, "socket write failed: {err}");
                break;
            }
        }
    });

    let connected_at_ms = dispatcher.connect(peer_id.clone(), out_tx.clone()).await;
    info!(peer_id = %peer_id, connected_at_ms, "runner connected");

    loop {
        let line = match next_line(&mut reader, cfg.inactivity_timeout).await {
            Ok(Some(Ok(line))) => line,
            Ok(Some(Err(err))) => {
                warn!(peer_id = %peer_id, "socket read failed: {err}");
                break;
            }
            Ok(None) => break,
            Err(idle) => {
                info!(peer_id = %peer_id, "no traffic for {idle:?}, closing connection");
                break;
            }
        };

        let req: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(err) => {
                warn!(peer_id = %peer_id, "undecodable request ignored: {err}");
                continue;
            }
        };
        dispatcher.handle(&peer_id, req).await;
    }

    if dispatcher.disconnect(&peer_id).await {
        info!(peer_id = %peer_id, "runner disconnected");
    } else {
        debug!(peer_id = %peer_id, "connection closed after session end");
    }

    // Pending interactive replies still hold a sender; the writer ends
    // once the last one is delivered or dropped.
    drop(out_tx);
    let _ = writer_task.await;
}

type LineReader = FramedRead<tokio::net::unix::OwnedReadHalf, LinesCodec>;
type LineResult = Option<Result<String, tokio_util::codec::LinesCodecError>>;

async fn next_line(
    reader: &mut LineReader,
    idle: Option<Duration>,
) -> Result<LineResult, Duration> {
    match idle {
        Some(limit) => timeout(limit, reader.next()).await.map_err(|_| limit),
        None => Ok(reader.next().await),
    }
}
