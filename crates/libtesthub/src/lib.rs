pub mod dispatcher;
pub mod error;
pub mod event;
pub mod executor;
pub mod lifecycle;
pub mod mock;
pub mod outbound;
pub mod registry;
pub mod router;
pub mod services;

pub use dispatcher::Dispatcher;
pub use error::HubError;
pub use event::{NotifyEvent, TerminalRecord};
pub use executor::{InteractExecutor, InteractJob};
pub use lifecycle::LifecycleCoordinator;
pub use outbound::{Outbound, enqueue_response};
pub use registry::{AgentBinding, ProbeInvocation, Session, SessionRegistry};
pub use router::{EventRouter, Visibility};
pub use services::{
    AgentHandle, AgentService, Collaborators, MonitorSink, PlanCounts, ProbeService, PublishScope,
    ResultRecord, StatsSink, UserDirectory, UserPresence,
};
