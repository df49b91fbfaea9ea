//! Domain types for the remoting engine.
//!
//! Commands, correlation, the pending-call state machine and the dispatch
//! table. Nothing in here touches a transport directly.

pub mod command;
pub mod config;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod pending;

// Re-exports for convenience
pub use command::{codes, Direction, RemotingCommand};
pub use config::{ConfigError, RemotingConfig};
pub use correlation::CorrelationId;
pub use dispatch::{default_rejection_policy, DispatchEntry, DispatchTable, RejectionPolicy};
pub use error::{ErrorKind, RemotingError, RemotingResult};
pub use pending::{CallState, CompletionSink, InvokeCallback, InvokeOutcome, PendingCallTable};
