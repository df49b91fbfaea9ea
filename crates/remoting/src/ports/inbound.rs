//! # Driving Ports (Inbound API)
//!
//! Interfaces applications implement to plug into the engine: request
//! processors for inbound requests and RPC hooks for observation.

use crate::domain::command::RemotingCommand;
use crate::ports::outbound::ConnectionHandle;
use async_trait::async_trait;

/// Context handed to a processor alongside the request.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    /// Connection the request arrived on; the response goes back on it
    pub connection: ConnectionHandle,
}

impl ProcessContext {
    pub fn remote_addr(&self) -> &str {
        self.connection.remote_addr()
    }
}

/// Handler for one or more request codes.
///
/// Returning `Ok(None)` sends nothing back. Returning `Err` (or panicking) is
/// converted into a `SYSTEM_ERROR` response by the dispatcher.
///
/// A returned command is bound to the request's correlation ID and marked as
/// a response before it is sent, so echoing the request back is valid.
#[async_trait]
pub trait RequestProcessor: Send + Sync {
    async fn process_request(
        &self,
        ctx: &ProcessContext,
        request: RemotingCommand,
    ) -> anyhow::Result<Option<RemotingCommand>>;

    /// Refuse new work before it is queued.
    fn reject_request(&self) -> bool {
        false
    }
}

/// Observer invoked around requests. Hooks cannot alter control flow.
pub trait RpcHook: Send + Sync {
    /// Called before a request is sent (client side) or processed (server side).
    fn do_before_request(&self, remote_addr: &str, request: &RemotingCommand);

    /// Called once a response is received (client side) or produced (server side).
    fn do_after_response(
        &self,
        remote_addr: &str,
        request: &RemotingCommand,
        response: &RemotingCommand,
    );
}
