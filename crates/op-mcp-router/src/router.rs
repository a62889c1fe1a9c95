//! Router - ties together connections, catalog, profiles and sessions
//!
//! This is the primary interface of the crate. Upstream transports hand
//! every client message to [`Router::handle_message`]; administrative
//! tooling uses the `register_server`/`list_servers` family.

use crate::capability::{CapabilityRegistry, CatalogChange, CatalogEntry};
use crate::config::{ProfileConfig, RouterConfig, ServerDefinition};
use crate::connection::{ConnectionOptions, ServerConnection, ServerNotification, ServerStatusReport};
use crate::error::{Result, RouterError};
use crate::namespace::{self, CapabilityKind, ServerId};
use crate::profile::{ProfileScope, ProfileStore, ProfileSummary};
use crate::protocol::{
    methods, next_request_id, numeric_id, JsonRpcError, McpRequest, McpResponse, Message,
    IMPLEMENTATION_NAME, PROTOCOL_VERSION,
};
use crate::registry::ConnectionRegistry;
use crate::session::{ClientSession, SessionManager, SessionStream};
use crate::transport::{Connector, DefaultConnector};
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// What a resolved request is forwarded as.
#[derive(Debug, Clone, Copy)]
enum Call {
    Capability(CapabilityKind),
    Completion,
}

/// The MCP router.
pub struct Router {
    strict: bool,
    options: ConnectionOptions,
    connector: Arc<dyn Connector>,
    catalog: Arc<CapabilityRegistry>,
    connections: ConnectionRegistry,
    profiles: Arc<ProfileStore>,
    sessions: Arc<SessionManager>,
    fanout_tasks: Mutex<HashMap<ServerId, JoinHandle<()>>>,
    catalog_task: Mutex<Option<JoinHandle<()>>>,
}

impl Router {
    /// Create a router with no servers registered. Profiles are loaded from
    /// the config; servers are not. Must be called inside a Tokio runtime.
    pub fn new(config: &RouterConfig) -> Arc<Self> {
        let connector = DefaultConnector::new(config.shutdown_grace(), config.init_timeout());
        Self::with_connector(config, Arc::new(connector))
    }

    /// Like [`new`](Self::new) with a custom way of reaching servers.
    pub fn with_connector(config: &RouterConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        let catalog = Arc::new(CapabilityRegistry::new(config.strict));
        let fanout = Fanout {
            sessions: Arc::new(SessionManager::new(config.notification_buffer)),
            profiles: Arc::new(ProfileStore::from_config(&config.profiles)),
        };
        let catalog_task = tokio::spawn(fanout.clone().run_catalog_changes(catalog.subscribe()));

        Arc::new(Self {
            strict: config.strict,
            options: ConnectionOptions::from_config(config),
            connector,
            catalog,
            connections: ConnectionRegistry::new(),
            profiles: fanout.profiles,
            sessions: fanout.sessions,
            fanout_tasks: Mutex::new(HashMap::new()),
            catalog_task: Mutex::new(Some(catalog_task)),
        })
    }

    /// Create a router and register every enabled server from the config.
    /// Servers that fail to come up are logged and left retrying.
    pub async fn from_config(config: &RouterConfig) -> Arc<Self> {
        let router = Self::new(config);
        router.register_all(config).await;
        router
    }

    pub async fn register_all(&self, config: &RouterConfig) {
        let servers: Vec<_> = config.servers.iter().filter(|s| s.enabled).cloned().collect();
        info!("Registering {} servers", servers.len());

        let results = join_all(servers.into_iter().map(|server| {
            let id = server.id.clone();
            async move { (id, self.register_server(server).await) }
        }))
        .await;

        for (id, result) in results {
            if let Err(e) = result {
                warn!(server = %id, "Server not available at startup: {}", e);
            }
        }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn catalog(&self) -> &Arc<CapabilityRegistry> {
        &self.catalog
    }

    /// Configured profile names, sorted.
    pub fn profile_names(&self) -> Vec<String> {
        self.profiles.names()
    }

    /// The servers a profile may reach. Absent or empty means every server.
    pub fn resolve_profile(&self, name: Option<&str>) -> Result<ProfileScope> {
        self.profiles.resolve(name)
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn connection(&self, id: &str) -> Option<Arc<ServerConnection>> {
        self.connections.get(id)
    }

    pub fn server_ids(&self) -> BTreeSet<ServerId> {
        self.connections.ids()
    }

    // ------------------------------------------------------------------
    // Server lifecycle
    // ------------------------------------------------------------------

    /// Register a server and wait for its first connection attempt.
    ///
    /// A strict-mode capability conflict rolls the registration back. Any
    /// other failure is returned but the server stays registered and keeps
    /// retrying in the background.
    pub async fn register_server(&self, definition: ServerDefinition) -> Result<()> {
        let id = definition.id.clone();
        let connection = ServerConnection::new(
            definition,
            self.options.clone(),
            self.connector.clone(),
            self.catalog.clone(),
        );
        self.connections.insert(connection.clone())?;

        let fanout = Fanout {
            sessions: self.sessions.clone(),
            profiles: self.profiles.clone(),
        };
        let notifications = connection.notifications();
        let task = tokio::spawn(async move {
            tokio::pin!(notifications);
            while let Some(notification) = notifications.next().await {
                fanout.deliver_notification(notification);
            }
        });
        if let Some(previous) = self.fanout_tasks.lock().insert(id.clone(), task) {
            previous.abort();
        }

        info!(server = %id, "Registered {:?} server", connection.transport_kind());
        match connection.connect().await {
            Ok(()) => Ok(()),
            Err(e @ RouterError::CapabilityConflict { .. }) => {
                warn!(server = %id, "Rejected: {}", e);
                self.unregister_server(id.as_str()).await.ok();
                Err(e)
            }
            Err(e) => {
                warn!(server = %id, "Initial connection failed, retrying in background: {}", e);
                Err(e)
            }
        }
    }

    /// Remove a server. Its calls in flight fail with `ConnectionTerminated`
    /// and its capabilities disappear from the catalog.
    pub async fn unregister_server(&self, id: &str) -> Result<()> {
        let connection = self
            .connections
            .remove(id)
            .ok_or_else(|| RouterError::ServerNotFound { id: id.to_string() })?;
        if let Some(task) = self.fanout_tasks.lock().remove(id) {
            task.abort();
        }
        connection.shutdown().await;
        info!(server = %id, "Unregistered server");
        Ok(())
    }

    /// Drop the server's link and reconnect now, resetting its retry budget.
    pub fn reconnect_server(&self, id: &str) -> Result<()> {
        let connection = self
            .connections
            .get(id)
            .ok_or_else(|| RouterError::ServerNotFound { id: id.to_string() })?;
        info!(server = %id, "Reconnect requested");
        connection.request_reconnect();
        Ok(())
    }

    pub fn list_servers(&self) -> Vec<ServerStatusReport> {
        self.connections.snapshot().iter().map(|c| c.report()).collect()
    }

    pub fn list_profiles(&self) -> Vec<ProfileSummary> {
        self.profiles.summaries(&self.connections.ids())
    }

    /// Create or replace a profile. Sessions bound to it are told their
    /// view may have changed.
    pub fn put_profile(&self, name: &str, profile: ProfileConfig) -> bool {
        let changed = self.profiles.put(name, profile);
        if changed {
            self.fanout().profile_changed(name);
        }
        changed
    }

    pub fn remove_profile(&self, name: &str) -> bool {
        let removed = self.profiles.delete_profile(name);
        if removed {
            self.fanout().profile_changed(name);
        }
        removed
    }

    /// Add one server to an existing profile.
    pub fn add_profile_server(&self, profile: &str, server: ServerId) -> Result<bool> {
        let changed = self.profiles.add_server(profile, server)?;
        if changed {
            self.fanout().profile_changed(profile);
        }
        Ok(changed)
    }

    pub fn remove_profile_server(&self, profile: &str, server: &str) -> Result<bool> {
        let changed = self.profiles.remove_server(profile, server)?;
        if changed {
            self.fanout().profile_changed(profile);
        }
        Ok(changed)
    }

    fn fanout(&self) -> Fanout {
        Fanout {
            sessions: self.sessions.clone(),
            profiles: self.profiles.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Open a client session bound to a profile. Unknown profiles are
    /// rejected with `ProfileNotFound`.
    pub fn open_session(&self, profile: Option<&str>) -> Result<(Arc<ClientSession>, SessionStream)> {
        self.profiles.resolve(profile)?;
        let profile = profile.filter(|p| !p.trim().is_empty()).map(str::to_string);
        Ok(self.sessions.open(profile))
    }

    /// Close a session and cancel whatever it left in flight.
    pub async fn close_session(&self, id: &str) -> Result<()> {
        let abandoned = self.sessions.close(id)?;
        for (request_id, pending) in abandoned {
            if let Some(connection) = self.connections.get(pending.server.as_str()) {
                if let Err(e) = connection.cancel(request_id, "client disconnected").await {
                    debug!(server = %pending.server, "Cancel not delivered: {}", e);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Capability access
    // ------------------------------------------------------------------

    /// Catalog entries of one kind visible to a session.
    pub fn list(&self, session: &ClientSession, kind: CapabilityKind) -> Vec<CatalogEntry> {
        match self.profiles.resolve(session.profile()) {
            Ok(scope) => self.catalog.list(kind, &scope),
            Err(e) => {
                debug!(session = %session.id(), "Listing with stale profile: {}", e);
                Vec::new()
            }
        }
    }

    /// Invoke a capability by the id the session sees.
    pub async fn call(
        &self,
        session: &ClientSession,
        kind: CapabilityKind,
        id: &str,
        params: Value,
    ) -> Result<Value> {
        self.forward(session, Value::Null, Call::Capability(kind), id, params)
            .await
    }

    /// Map an exposed id to a connection and the server's own id, applying
    /// every access check. All failures are `CapabilityUnavailable`.
    fn resolve(
        &self,
        session: &ClientSession,
        kind: CapabilityKind,
        exposed: &str,
    ) -> Result<(Arc<ServerConnection>, String)> {
        let unavailable = |reason: &str| RouterError::unavailable(exposed, reason);

        let scope = self
            .profiles
            .resolve(session.profile())
            .map_err(|_| unavailable("profile no longer exists"))?;

        let (server, original) = match namespace::split(kind, exposed) {
            Some((server, original)) if self.connections.contains(server.as_str()) => (server, original),
            _ => match self.catalog.alias_owner(kind, exposed) {
                Some(owner) => (owner, exposed.to_string()),
                None => return Err(unavailable("unknown capability")),
            },
        };

        if !scope.includes(server.as_str()) {
            return Err(unavailable("not in profile"));
        }
        let connection = self
            .connections
            .get(server.as_str())
            .ok_or_else(|| unavailable("server not registered"))?;

        let status = connection.status();
        if !status.is_serving() {
            return Err(unavailable(&format!("server is {}", status)));
        }
        if !connection.has_capability(kind, &original) {
            return Err(unavailable("unknown capability"));
        }
        Ok((connection, original))
    }

    async fn forward(
        &self,
        session: &ClientSession,
        client_id: Value,
        call: Call,
        exposed: &str,
        params: Value,
    ) -> Result<Value> {
        let kind = match call {
            Call::Capability(kind) => kind,
            Call::Completion => completion_kind(&params)?,
        };
        let (connection, original) = self.resolve(session, kind, exposed)?;
        let namespaced = namespace::namespace(connection.id(), kind, &original);

        let mut params = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err(RouterError::InvalidRequest("params must be an object".into())),
        };
        let progress_token = self.rewrite_progress_token(session, &mut params);

        let request_id = next_request_id();
        session.track(request_id, client_id, connection.id().clone());
        debug!(
            session = %session.id(),
            server = %connection.id(),
            "Forwarding {} as request {}",
            namespaced,
            request_id
        );

        let result = match call {
            Call::Capability(kind) => {
                connection
                    .invoke_as(request_id, kind, &original, Value::Object(params))
                    .await
            }
            Call::Completion => {
                if let Some(reference) = params.get_mut("ref").and_then(Value::as_object_mut) {
                    reference.insert(ref_field(kind).to_string(), Value::String(original.clone()));
                }
                connection
                    .request_as(request_id, methods::COMPLETION_COMPLETE, Some(Value::Object(params)))
                    .await
            }
        };

        session.complete(request_id);
        if let Some(token) = progress_token {
            self.sessions.finish_progress(&token);
        }
        result.map_err(|e| e.for_capability(&namespaced))
    }

    /// Replace the client's progress token with a router-wide unique one so
    /// progress from a shared server reaches only this session.
    fn rewrite_progress_token(&self, session: &ClientSession, params: &mut Map<String, Value>) -> Option<String> {
        let meta = params.get_mut("_meta")?.as_object_mut()?;
        let original = meta.get("progressToken")?.clone();
        let token = self.sessions.register_progress(session.id(), original);
        meta.insert("progressToken".to_string(), Value::String(token.clone()));
        Some(token)
    }

    // ------------------------------------------------------------------
    // Upstream protocol
    // ------------------------------------------------------------------

    /// Handle one client message. Returns the response to send, if any.
    pub async fn handle_message(&self, session: &ClientSession, message: Value) -> Option<Value> {
        let request = match Message::parse(message) {
            Ok(Message::Request(request)) => request,
            Ok(Message::Response(response)) => {
                debug!(session = %session.id(), "Ignoring client response {}", response.id);
                return None;
            }
            Err(e) => return Some(McpResponse::error(Value::Null, e).to_value()),
        };

        if request.is_notification() {
            self.handle_notification(session, request).await;
            return None;
        }

        let id = request.id.clone().unwrap_or(Value::Null);
        let response = match self.dispatch(session, &request).await {
            Ok(result) => McpResponse::success(id, result),
            Err(error) => {
                debug!(session = %session.id(), "{} failed: {}", request.method, error.message);
                McpResponse::error(id, error)
            }
        };
        Some(response.to_value())
    }

    async fn dispatch(&self, session: &ClientSession, request: &McpRequest) -> std::result::Result<Value, JsonRpcError> {
        let params = request.params.clone().unwrap_or(Value::Null);
        let client_id = request.id.clone().unwrap_or(Value::Null);

        let forwarded = |kind: CapabilityKind| -> std::result::Result<(Call, String), JsonRpcError> {
            let id = string_param(&params, kind.id_field()).map_err(|e| e.to_rpc_error())?;
            Ok((Call::Capability(kind), id))
        };

        let (call, exposed) = match request.method.as_str() {
            methods::INITIALIZE => return Ok(self.initialize_result()),
            methods::PING => return Ok(json!({})),
            methods::TOOLS_LIST => return Ok(self.list_result(session, CapabilityKind::Tool)),
            methods::PROMPTS_LIST => return Ok(self.list_result(session, CapabilityKind::Prompt)),
            methods::RESOURCES_LIST => return Ok(self.list_result(session, CapabilityKind::Resource)),
            methods::RESOURCE_TEMPLATES_LIST => {
                return Ok(self.list_result(session, CapabilityKind::ResourceTemplate))
            }
            methods::TOOLS_CALL => forwarded(CapabilityKind::Tool)?,
            methods::PROMPTS_GET => forwarded(CapabilityKind::Prompt)?,
            methods::RESOURCES_READ => forwarded(CapabilityKind::Resource)?,
            methods::COMPLETION_COMPLETE => {
                let kind = completion_kind(&params).map_err(|e| e.to_rpc_error())?;
                let reference = params.get("ref").cloned().unwrap_or(Value::Null);
                let id = string_param(&reference, ref_field(kind)).map_err(|e| e.to_rpc_error())?;
                (Call::Completion, id)
            }
            other => return Err(JsonRpcError::method_not_found(other)),
        };

        self.forward(session, client_id, call, &exposed, params)
            .await
            .map_err(|e| e.to_rpc_error())
    }

    async fn handle_notification(&self, session: &ClientSession, notification: McpRequest) {
        match notification.method.as_str() {
            methods::INITIALIZED => debug!(session = %session.id(), "Client initialized"),
            methods::CANCELLED => {
                let params = notification.params.unwrap_or(Value::Null);
                let Some(client_id) = params.get("requestId") else {
                    return;
                };
                let Some((request_id, server)) = session.find_by_client_id(client_id) else {
                    debug!(session = %session.id(), "Cancel for unknown request {}", client_id);
                    return;
                };
                let reason = params
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("cancelled by client");
                if let Some(connection) = self.connections.get(server.as_str()) {
                    if let Err(e) = connection.cancel(request_id, reason).await {
                        debug!(server = %server, "Cancel not delivered: {}", e);
                    }
                }
            }
            other => debug!(session = %session.id(), "Ignoring client notification {}", other),
        }
    }

    fn initialize_result(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": true },
                "prompts": { "listChanged": true },
                "resources": { "listChanged": true },
                "completions": {},
            },
            "serverInfo": {
                "name": IMPLEMENTATION_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            }
        })
    }

    fn list_result(&self, session: &ClientSession, kind: CapabilityKind) -> Value {
        let listings: Vec<Value> = self.list(session, kind).iter().map(CatalogEntry::to_listing).collect();
        let mut result = Map::new();
        result.insert(kind.result_field().to_string(), Value::Array(listings));
        Value::Object(result)
    }

    /// Close every session and connection.
    pub async fn shutdown(&self) {
        info!("Shutting down router");
        for session in self.sessions.snapshot() {
            if let Err(e) = self.close_session(session.id()).await {
                debug!("Session already gone: {}", e);
            }
        }

        let connections = self.connections.snapshot();
        for connection in &connections {
            self.connections.remove(connection.id().as_str());
        }
        for (_, task) in self.fanout_tasks.lock().drain() {
            task.abort();
        }
        join_all(connections.iter().map(|c| c.shutdown())).await;

        if let Some(task) = self.catalog_task.lock().take() {
            task.abort();
        }
    }
}

/// Delivers push messages to the sessions entitled to see them.
#[derive(Clone)]
struct Fanout {
    sessions: Arc<SessionManager>,
    profiles: Arc<ProfileStore>,
}

impl Fanout {
    fn sees(&self, session: &ClientSession, server: &str) -> bool {
        self.profiles
            .resolve(session.profile())
            .map(|scope| scope.includes(server))
            .unwrap_or(false)
    }

    fn deliver_notification(&self, notification: ServerNotification) {
        let ServerNotification { server, method, params } = notification;

        match method.as_str() {
            methods::PROGRESS => {
                let Some(token) = params
                    .as_ref()
                    .and_then(|p| p.get("progressToken"))
                    .and_then(Value::as_str)
                else {
                    return;
                };
                let Some((session, original)) = self.sessions.route_progress(token) else {
                    debug!(server = %server, "Progress for unknown token {}", token);
                    return;
                };
                let mut params = tag_server(params.clone(), &server);
                params["progressToken"] = original;
                session.deliver(McpRequest::new(method).with_params(params).to_value());
            }
            methods::CANCELLED => {
                let Some(request_id) = params.as_ref().and_then(|p| p.get("requestId")).and_then(numeric_id) else {
                    return;
                };
                for session in self.sessions.snapshot() {
                    if let Some(pending) = session.pending(request_id) {
                        let mut params = tag_server(params.clone(), &server);
                        params["requestId"] = pending.client_id;
                        session.deliver(McpRequest::new(method).with_params(params).to_value());
                        return;
                    }
                }
            }
            _ => {
                let mut params = tag_server(params, &server);
                if method == methods::RESOURCE_UPDATED {
                    if let Some(uri) = params.get("uri").and_then(Value::as_str) {
                        params["uri"] = Value::String(namespace::namespace(&server, CapabilityKind::Resource, uri));
                    }
                }
                let message = McpRequest::new(method).with_params(params).to_value();
                for session in self.sessions.snapshot() {
                    if self.sees(&session, server.as_str()) {
                        session.deliver(message.clone());
                    }
                }
            }
        }
    }

    fn catalog_changed(&self, change: &CatalogChange) {
        let notices: BTreeSet<&str> = change.kinds.iter().map(|k| k.list_changed_method()).collect();
        for session in self.sessions.snapshot() {
            if self.sees(&session, change.server.as_str()) {
                for method in &notices {
                    session.deliver(McpRequest::new(*method).to_value());
                }
            }
        }
    }

    fn list_changed(&self, session: &ClientSession) {
        for method in [
            methods::TOOLS_LIST_CHANGED,
            methods::PROMPTS_LIST_CHANGED,
            methods::RESOURCES_LIST_CHANGED,
        ] {
            session.deliver(McpRequest::new(method).to_value());
        }
    }

    fn profile_changed(&self, profile: &str) {
        for session in self.sessions.snapshot() {
            if session.profile() == Some(profile) {
                self.list_changed(&session);
            }
        }
    }

    async fn run_catalog_changes(self, mut changes: broadcast::Receiver<CatalogChange>) {
        loop {
            match changes.recv().await {
                Ok(change) => self.catalog_changed(&change),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Catalog change stream lagged by {}, notifying every session", skipped);
                    for session in self.sessions.snapshot() {
                        self.list_changed(&session);
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

/// Attach the originating server to a notification's `_meta`.
fn tag_server(params: Option<Value>, server: &ServerId) -> Value {
    let mut params = match params {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let meta = params.entry("_meta").or_insert_with(|| json!({}));
    if let Some(meta) = meta.as_object_mut() {
        meta.insert("server".to_string(), Value::String(server.to_string()));
    }
    Value::Object(params)
}

fn string_param(params: &Value, field: &str) -> Result<String> {
    params
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RouterError::InvalidRequest(format!("missing '{}'", field)))
}

fn completion_kind(params: &Value) -> Result<CapabilityKind> {
    match params.pointer("/ref/type").and_then(Value::as_str) {
        Some("ref/prompt") => Ok(CapabilityKind::Prompt),
        Some("ref/resource") => Ok(CapabilityKind::ResourceTemplate),
        other => Err(RouterError::InvalidRequest(format!(
            "unsupported completion ref {:?}",
            other
        ))),
    }
}

/// Field of a completion `ref` naming its target.
fn ref_field(kind: CapabilityKind) -> &'static str {
    match kind {
        CapabilityKind::Prompt => "name",
        _ => "uri",
    }
}
