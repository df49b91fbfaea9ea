//! Ports layer: traits at the engine's boundaries.
//!
//! - `inbound`: what applications implement (processors, hooks)
//! - `outbound`: what the engine requires (the transport channel)

pub mod inbound;
pub mod outbound;

pub use inbound::{ProcessContext, RequestProcessor, RpcHook};
pub use outbound::{ConnectionHandle, Transport, TransportError, TransportEvent};
