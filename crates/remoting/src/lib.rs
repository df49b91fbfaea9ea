//! # Remoting - Bidirectional RPC Invocation Engine
//!
//! Turns a fire-and-forget frame transport into synchronous, asynchronous
//! and one-way request/response semantics. Requests and responses share
//! long-lived duplex connections and are matched by correlation ID, so many
//! concurrent calls can be in flight on one connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       RemotingService                           │
//! │  invoke_sync / invoke_async / invoke_oneway                     │
//! │        │ register               ▲ complete / expire / cancel    │
//! │        ▼                        │                               │
//! │  ┌──────────────────┐   ┌───────┴──────────┐   ┌─────────────┐  │
//! │  │ PendingCallTable │   │  inbound loop    │──►│DispatchTable│  │
//! │  │ (CAS per record) │   │ (arrival order)  │   │ code→handler│  │
//! │  └────────┬─────────┘   └───────▲──────────┘   └──────┬──────┘  │
//! │           │ callbacks           │ TransportEvent       │ jobs   │
//! │           ▼                     │                      ▼        │
//! │   callback WorkerPool      Transport port        WorkerPools    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **Domain:** commands, correlation IDs, the pending-call state machine,
//!   the dispatch table, errors and configuration
//! - **Ports:** `Transport` (driven) and `RequestProcessor` / `RpcHook` (driving)
//! - **Service:** the engine wiring domain to ports
//! - **Adapters:** worker pools, the reference frame codec and an in-memory
//!   transport
//!
//! ## Guarantees
//!
//! - Every registered call resolves exactly once: response, timeout or
//!   cancellation.
//! - Async admission never blocks; an exhausted limit fails with
//!   `TOO_MANY_REQUESTS` before anything is sent.
//! - Unknown request codes are answered with `REQUEST_CODE_NOT_SUPPORTED`,
//!   handler failures with `SYSTEM_ERROR`, overload with `SYSTEM_BUSY`.

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod service;

// =============================================================================
// PUBLIC API
// =============================================================================

pub use adapters::{CodecError, ExecutorError, FrameCodec, MemoryNetwork, MemoryTransport, WorkerPool};
pub use domain::{
    codes, default_rejection_policy, CallState, ConfigError, CorrelationId, Direction, ErrorKind,
    InvokeOutcome, RejectionPolicy, RemotingCommand, RemotingConfig, RemotingError,
    RemotingResult,
};
pub use ports::{
    ConnectionHandle, ProcessContext, RequestProcessor, RpcHook, Transport, TransportError,
    TransportEvent,
};
pub use service::{RemotingService, ServiceState, ServiceStats};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
