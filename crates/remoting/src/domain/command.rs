//! Remoting command - the unit of exchange between peers.
//!
//! A command is either a request (code names the operation) or a response
//! (code carries the result). Both carry the correlation ID of the request.

use crate::domain::correlation::CorrelationId;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;

/// Result codes carried by response commands
pub mod codes {
    /// Request handled successfully
    pub const SUCCESS: i32 = 0;
    /// Handler failed while processing the request
    pub const SYSTEM_ERROR: i32 = 1;
    /// Handler rejected the request because it is overloaded
    pub const SYSTEM_BUSY: i32 = 2;
    /// No handler registered for the request code
    pub const REQUEST_CODE_NOT_SUPPORTED: i32 = 3;
}

/// Whether a command asks for work or answers a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Request,
    Response,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Request => write!(f, "request"),
            Direction::Response => write!(f, "response"),
        }
    }
}

/// A request or response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotingCommand {
    /// Operation code (requests) or result code (responses)
    pub code: i32,
    /// Human-readable status or error text, set on responses
    pub remark: Option<String>,
    /// Side-channel metadata
    pub ext_fields: HashMap<String, String>,
    /// Opaque payload
    pub body: Option<Bytes>,
    correlation_id: CorrelationId,
    direction: Direction,
    oneway: bool,
}

impl RemotingCommand {
    /// Create a request command with a fresh correlation ID.
    pub fn create_request(code: i32, body: Option<Bytes>) -> Self {
        Self {
            code,
            remark: None,
            ext_fields: HashMap::new(),
            body,
            correlation_id: CorrelationId::next(),
            direction: Direction::Request,
            oneway: false,
        }
    }

    /// Create the response to `request` with the given result code and remark.
    pub fn create_response(request: &RemotingCommand, code: i32, remark: Option<String>) -> Self {
        Self {
            code,
            remark,
            ext_fields: HashMap::new(),
            body: None,
            correlation_id: request.correlation_id,
            direction: Direction::Response,
            oneway: false,
        }
    }

    /// Successful response to `request` carrying `body`.
    pub fn success(request: &RemotingCommand, body: Option<Bytes>) -> Self {
        Self::create_response(request, codes::SUCCESS, None).with_body_opt(body)
    }

    /// Rebuild a command decoded off the wire.
    pub(crate) fn from_parts(
        code: i32,
        correlation_id: CorrelationId,
        direction: Direction,
        oneway: bool,
        remark: Option<String>,
        ext_fields: HashMap<String, String>,
        body: Option<Bytes>,
    ) -> Self {
        Self {
            code,
            remark,
            ext_fields,
            body,
            correlation_id,
            direction,
            oneway,
        }
    }

    /// Turn a request into its own response in place.
    ///
    /// The correlation ID is kept; the oneway flag is cleared.
    pub fn mark_response(&mut self) {
        self.direction = Direction::Response;
        self.oneway = false;
    }

    /// Bind a handler-produced command to the request it answers.
    pub(crate) fn into_response_for(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self.mark_response();
        self
    }

    /// Mark this request as not needing a response.
    pub fn mark_oneway(&mut self) {
        self.oneway = true;
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_request(&self) -> bool {
        self.direction == Direction::Request
    }

    pub fn is_response(&self) -> bool {
        self.direction == Direction::Response
    }

    pub fn is_oneway(&self) -> bool {
        self.oneway
    }

    /// True for a response carrying [`codes::SUCCESS`].
    pub fn is_success(&self) -> bool {
        self.is_response() && self.code == codes::SUCCESS
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    fn with_body_opt(mut self, body: Option<Bytes>) -> Self {
        self.body = body;
        self
    }

    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = Some(remark.into());
        self
    }

    pub fn with_ext_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ext_fields.insert(key.into(), value.into());
        self
    }

    pub fn ext_field(&self, key: &str) -> Option<&str> {
        self.ext_fields.get(key).map(String::as_str)
    }

    /// Body length in bytes (0 when absent)
    pub fn body_len(&self) -> usize {
        self.body.as_ref().map_or(0, Bytes::len)
    }

    /// Size of this command once framed by the reference codec.
    pub fn encoded_len(&self) -> usize {
        crate::adapters::codec::encoded_len(self)
    }
}

impl fmt::Display for RemotingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RemotingCommand [code={}, {}, correlation_id={}, oneway={}, remark={:?}, body_len={}]",
            self.code,
            self.direction,
            self.correlation_id,
            self.oneway,
            self.remark,
            self.body_len()
        )
    }
}
