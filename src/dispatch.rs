use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::{CompletionCode, IpmiRequest};

/// Outcome of a handled command: a completion code plus response data bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    /// Completion code for the response.
    pub code: CompletionCode,
    /// Response data following the completion code.
    pub data: Vec<u8>,
}

impl CommandReply {
    /// Reply with a bare completion code and no data.
    pub fn code(code: CompletionCode) -> Self {
        Self {
            code,
            data: Vec::new(),
        }
    }

    /// Successful reply carrying response data.
    pub fn ok(data: Vec<u8>) -> Self {
        Self {
            code: CompletionCode::Completed,
            data,
        }
    }
}

/// Frame-level context accompanying a dispatched request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestContext {
    /// Session id from the enclosing frame's session header (zero outside a
    /// session).
    pub session_id: u32,
}

/// A command handler bound to one (network function, command) pair.
///
/// Handlers translate already-validated requests into actions and completion
/// codes; they never see frames that failed decoding or authentication.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle a request and produce the reply.
    async fn handle(&self, ctx: &RequestContext, request: &IpmiRequest) -> CommandReply;
}

/// Dispatch table mapping (network function, command) to a handler.
///
/// Built once at instance construction and read-only afterwards, so lookups
/// need no synchronization.
#[derive(Default)]
pub struct CommandTable {
    handlers: HashMap<(u8, u8), Arc<dyn CommandHandler>>,
}

impl CommandTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Registering the same pair twice replaces the
    /// earlier handler; registration only happens during construction.
    pub fn register(&mut self, netfn: u8, cmd: u8, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert((netfn, cmd), handler);
    }

    /// Dispatch a request to its handler.
    ///
    /// A lookup miss yields `InvalidCommand` without invoking anything.
    pub async fn dispatch(&self, ctx: &RequestContext, request: &IpmiRequest) -> CommandReply {
        match self.handlers.get(&(request.netfn, request.cmd)) {
            Some(handler) => handler.handle(ctx, request).await,
            None => {
                tracing::debug!(
                    netfn = request.netfn,
                    cmd = request.cmd,
                    "no handler registered for command"
                );
                CommandReply::code(CompletionCode::InvalidCommand)
            }
        }
    }
}
