//! Downstream transport layer
//!
//! A transport session is one bidirectional JSON-RPC channel to one server:
//! - Local: spawned process, newline-delimited JSON over stdin/stdout
//! - Remote (http): streamable HTTP, one POST per message
//! - Remote (sse): legacy persistent event stream plus POST endpoint
//!
//! Every transport hands inbound messages to its owner through an mpsc
//! channel. The channel closing, or an `Err` item, means the link is gone.

mod http;
mod stdio;

pub use http::{SseDecoder, SseEvent, SseTransport, StreamableHttpTransport};
pub use stdio::{BoxReader, BoxWriter, LineTransport};

use crate::config::{RemoteMode, ServerDefinition, TransportConfig, TransportKind};
use crate::error::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Inbound half of an established session.
pub type Inbound = mpsc::Receiver<Result<Value>>;

/// Buffer between a transport's reader and its owner.
pub(crate) const INBOUND_BUFFER: usize = 256;

/// Outbound half of a transport session.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Write one JSON-RPC message.
    async fn send(&self, message: Value) -> Result<()>;

    /// Release the session. Must be idempotent.
    async fn close(&self);
}

/// A freshly opened transport session.
pub struct Established {
    pub transport: Arc<dyn Transport>,
    pub inbound: Inbound,
}

/// Opens transport sessions for server definitions.
///
/// The router only talks to this trait, so embedders and tests can supply
/// their own way of reaching a server.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, definition: &ServerDefinition) -> Result<Established>;
}

/// Connector for the transports defined in configuration.
#[derive(Debug, Clone)]
pub struct DefaultConnector {
    shutdown_grace: Duration,
    connect_timeout: Duration,
}

impl DefaultConnector {
    pub fn new(shutdown_grace: Duration, connect_timeout: Duration) -> Self {
        Self {
            shutdown_grace,
            connect_timeout,
        }
    }
}

impl Default for DefaultConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(30))
    }
}

#[async_trait::async_trait]
impl Connector for DefaultConnector {
    async fn connect(&self, definition: &ServerDefinition) -> Result<Established> {
        let server = definition.id.to_string();
        match &definition.transport {
            TransportConfig::Local {
                command,
                args,
                env,
                cwd,
            } => LineTransport::spawn(server, command, args, env, cwd.as_deref(), self.shutdown_grace),
            TransportConfig::Remote {
                url,
                headers,
                auth,
                mode: RemoteMode::Http,
            } => StreamableHttpTransport::connect(server, url, headers, auth.as_ref(), self.connect_timeout),
            TransportConfig::Remote {
                url,
                headers,
                auth,
                mode: RemoteMode::Sse,
            } => SseTransport::connect(server, url, headers, auth.as_ref(), self.connect_timeout).await,
        }
    }
}
