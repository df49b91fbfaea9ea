//! Remoting service: invocation engine and inbound dispatch.

mod engine;
mod inbound;

pub use engine::{RemotingService, ServiceState, ServiceStats};
