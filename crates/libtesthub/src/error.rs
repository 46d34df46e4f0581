use thiserror::Error;
use testhub_protocol::PeerId;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("request body is missing field '{0}'")]
    MissingField(&'static str),

    #[error("malformed {kind} event: {reason}")]
    MalformedEvent { kind: String, reason: String },

    #[error("unknown session: {0}")]
    UnknownSession(PeerId),

    #[error("{service} service failed: {source}")]
    Service {
        service: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("interactive executor is stopped")]
    ExecutorStopped,
}

impl HubError {
    pub fn service(service: &'static str, source: anyhow::Error) -> Self {
        HubError::Service { service, source }
    }

    /// Protocol anomalies are caused by the runner, not by the hub or a collaborator.
    pub fn is_protocol_anomaly(&self) -> bool {
        matches!(
            self,
            HubError::MissingField(_)
                | HubError::MalformedEvent { .. }
                | HubError::UnknownSession(_)
        )
    }
}
