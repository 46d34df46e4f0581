use anyhow::{Result, anyhow};
use testhub_protocol::Response;
use tokio::sync::mpsc;

/// Bounded reply queue of one runner connection, drained by its writer task.
pub type Outbound = mpsc::Sender<Response>;

/// Queue a reply without waiting; a full or closed queue is an error.
pub fn enqueue_response(out_tx: &Outbound, response: Response) -> Result<()> {
    match out_tx.try_send(response) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => Err(anyhow!("client outbound queue full")),
        Err(mpsc::error::TrySendError::Closed(_)) => Err(anyhow!("connection closed")),
    }
}
