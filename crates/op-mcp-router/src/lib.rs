//! op-mcp-router: MCP Protocol Router
//!
//! Puts any number of downstream MCP servers behind one endpoint. Clients
//! see a single merged catalog of tools, prompts and resources; the router
//! forwards each call to the server that owns it.
//!
//! ## Naming
//!
//! Every capability is reachable under a namespaced id that can never
//! collide:
//!
//! - tools: `{server}_t_{tool}`
//! - prompts: `{server}_p_{prompt}`
//! - resources: `{server}:{uri}`
//!
//! The first server to publish a name also owns it as a friendly alias.
//! In strict mode a second server publishing the same name is rejected
//! instead of falling back to its namespaced id.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      op-mcp-router                          │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │         Upstream: stdio / TCP, one session each       │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! │                           │                                  │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │  Router: access checks, forwarding, notification      │  │
//! │  │  fan-out scoped by profile                            │  │
//! │  │  /profile/dev  → [fs, git]                            │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! │                           │                                  │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │  Capability Registry (namespaced ids + aliases)       │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! │                           │                                  │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │  Connection Registry                                  │  │
//! │  │  ┌─────────┐ ┌─────────┐ ┌─────────────┐              │  │
//! │  │  │ fs      │ │ git     │ │ search      │              │  │
//! │  │  │ (stdio) │ │ (stdio) │ │ (HTTP/SSE)  │              │  │
//! │  │  └─────────┘ └─────────┘ └─────────────┘              │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use op_mcp_router::prelude::*;
//!
//! let config = RouterConfig::load("/etc/op-dbus/mcp-router.yaml")?;
//! let router = Router::from_config(&config).await;
//!
//! let (session, _notifications) = router.open_session(Some("dev"))?;
//! let result = router
//!     .call(&session, CapabilityKind::Tool, "git_t_commit", json!({"arguments": {}}))
//!     .await?;
//! ```

pub mod capability;
pub mod config;
pub mod connection;
pub mod error;
pub mod namespace;
pub mod profile;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod transport;
pub mod upstream;
pub mod watcher;

// Re-exports
pub use capability::{CapabilityRegistry, CapabilitySet, CatalogChange, CatalogEntry};
pub use config::{
    ProfileConfig, ReconnectPolicy, RemoteMode, RouterConfig, ServerAuth, ServerDefinition,
    TransportConfig, TransportKind,
};
pub use connection::{ConnectionStatus, ServerConnection, ServerNotification, ServerStatusReport};
pub use error::{Result, RouterError};
pub use namespace::{CapabilityKind, ServerId};
pub use profile::{ProfileScope, ProfileStore, ProfileSummary};
pub use router::Router;
pub use session::{ClientSession, SessionStream};
pub use transport::{Connector, DefaultConnector, Established, Transport};
pub use upstream::{serve_connection, serve_stdio, serve_tcp};
pub use watcher::{ApplyOutcome, ConfigChange, ConfigWatcher};

/// Prelude for convenient imports
pub mod prelude {
    pub use super::{
        CapabilityKind, ConfigChange, ConfigWatcher, ConnectionStatus, ProfileConfig, Router,
        RouterConfig, RouterError, ServerDefinition, ServerId,
    };
    pub use serde_json::json;
}
