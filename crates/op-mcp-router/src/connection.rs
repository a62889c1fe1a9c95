//! Server connection lifecycle
//!
//! Each [`ServerConnection`] owns one downstream server. A supervisor task
//! drives the state machine:
//!
//! ```text
//! Uninitialized ─► Connecting ─► Initializing ─► Healthy / Degraded
//!                      ▲                               │ link lost
//!                      └──── backoff ◄── Disconnected ◄┘
//!                                             │ shutdown()
//!                                             ▼
//!                                         Terminated
//! ```
//!
//! While serving, the connection's capabilities are published to the
//! [`CapabilityRegistry`]; on any loss they are withdrawn and every call in
//! flight fails with `ConnectionTerminated`.

use crate::capability::{CapabilityRegistry, CapabilitySet};
use crate::config::{ReconnectPolicy, RouterConfig, ServerDefinition, TransportKind};
use crate::error::{Result, RouterError};
use crate::namespace::{CapabilityKind, ServerId};
use crate::protocol::{
    codes, methods, next_request_id, numeric_id, JsonRpcError, McpRequest, McpResponse, Message,
    IMPLEMENTATION_NAME, PROTOCOL_VERSION,
};
use crate::transport::{Connector, Established, Inbound, Transport};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

/// Guard against servers that hand out cursors forever.
const MAX_LIST_PAGES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Uninitialized,
    Connecting,
    Initializing,
    Healthy,
    Degraded,
    Disconnected,
    Terminated,
}

impl ConnectionStatus {
    /// Whether the connection currently contributes capabilities.
    pub fn is_serving(self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Connecting => "connecting",
            Self::Initializing => "initializing",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Disconnected => "disconnected",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// A push message from a downstream server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerNotification {
    pub server: ServerId,
    pub method: String,
    pub params: Option<Value>,
}

/// Status of one server for administrative tooling.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatusReport {
    pub id: ServerId,
    pub transport: TransportKind,
    pub status: ConnectionStatus,
    pub tools: usize,
    pub prompts: usize,
    pub resources: usize,
    pub resource_templates: usize,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
    pub retries_exhausted: bool,
    pub connected_since: Option<DateTime<Utc>>,
}

/// Timing knobs shared by every connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub call_timeout: Duration,
    pub init_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub notification_buffer: usize,
}

impl ConnectionOptions {
    pub fn from_config(config: &RouterConfig) -> Self {
        Self {
            call_timeout: config.call_timeout(),
            init_timeout: config.init_timeout(),
            reconnect: config.reconnect.clone(),
            notification_buffer: config.notification_buffer,
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from_config(&RouterConfig::default())
    }
}

struct ConnectionState {
    status: ConnectionStatus,
    capabilities: CapabilitySet,
    server_info: Option<Value>,
    last_error: Option<RouterError>,
    reconnect_attempts: u32,
    retries_exhausted: bool,
    connected_since: Option<DateTime<Utc>>,
    link: Option<Arc<dyn Transport>>,
    /// Bumped every time a link is dropped
    generation: u64,
}

struct PendingCall {
    method: String,
    reply: oneshot::Sender<Result<Value>>,
}

enum LinkLoss {
    Requested,
    Failed(String),
}

pub struct ServerConnection {
    definition: ServerDefinition,
    options: ConnectionOptions,
    connector: Arc<dyn Connector>,
    catalog: Arc<CapabilityRegistry>,
    state: RwLock<ConnectionState>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    notifications: broadcast::Sender<ServerNotification>,
    status_tx: watch::Sender<ConnectionStatus>,
    shutdown_tx: watch::Sender<bool>,
    reconnect: Notify,
    /// Fired when a write to the link cannot complete
    stalled: Notify,
    /// Serializes discovery against link teardown
    refresh_lock: tokio::sync::Mutex<()>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ServerConnection {
    pub fn new(
        definition: ServerDefinition,
        options: ConnectionOptions,
        connector: Arc<dyn Connector>,
        catalog: Arc<CapabilityRegistry>,
    ) -> Arc<Self> {
        let (notifications, _) = broadcast::channel(options.notification_buffer.max(1));
        let (status_tx, _) = watch::channel(ConnectionStatus::Uninitialized);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            definition,
            options,
            connector,
            catalog,
            state: RwLock::new(ConnectionState {
                status: ConnectionStatus::Uninitialized,
                capabilities: CapabilitySet::default(),
                server_info: None,
                last_error: None,
                reconnect_attempts: 0,
                retries_exhausted: false,
                connected_since: None,
                link: None,
                generation: 0,
            }),
            pending: Mutex::new(HashMap::new()),
            notifications,
            status_tx,
            shutdown_tx,
            reconnect: Notify::new(),
            stalled: Notify::new(),
            refresh_lock: tokio::sync::Mutex::new(()),
            supervisor: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &ServerId {
        &self.definition.id
    }

    pub fn definition(&self) -> &ServerDefinition {
        &self.definition
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.definition.kind()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.read().status
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.state.read().capabilities.clone()
    }

    /// Whether a capability is currently offered. Resources also match
    /// through the server's templates.
    pub fn has_capability(&self, kind: CapabilityKind, original: &str) -> bool {
        let state = self.state.read();
        match kind {
            CapabilityKind::Resource => state.capabilities.can_read(original),
            _ => state.capabilities.contains(kind, original),
        }
    }

    pub fn last_error(&self) -> Option<RouterError> {
        self.state.read().last_error.clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn report(&self) -> ServerStatusReport {
        let state = self.state.read();
        let caps = &state.capabilities;
        ServerStatusReport {
            id: self.definition.id.clone(),
            transport: self.definition.kind(),
            status: state.status,
            tools: caps.count(CapabilityKind::Tool),
            prompts: caps.count(CapabilityKind::Prompt),
            resources: caps.count(CapabilityKind::Resource),
            resource_templates: caps.count(CapabilityKind::ResourceTemplate),
            last_error: state.last_error.as_ref().map(|e| e.to_string()),
            reconnect_attempts: state.reconnect_attempts,
            retries_exhausted: state.retries_exhausted,
            connected_since: state.connected_since,
        }
    }

    /// Push messages from this server. Survives reconnects; a slow consumer
    /// loses the oldest messages rather than stalling the connection.
    pub fn notifications(&self) -> impl Stream<Item = ServerNotification> + Send + 'static {
        let server = self.definition.id.clone();
        BroadcastStream::new(self.notifications.subscribe()).filter_map(move |item| match item {
            Ok(notification) => Some(notification),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(server = %server, "Notification consumer lagged, skipped {}", skipped);
                None
            }
        })
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = std::mem::replace(&mut self.state.write().status, status);
        if previous != status {
            debug!(server = %self.id(), "Status {} -> {}", previous, status);
        }
        self.status_tx.send_replace(status);
    }

    fn call_timeout(&self) -> Duration {
        self.definition
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.options.call_timeout)
    }

    /// Start the connection and wait for the outcome of the first attempt.
    ///
    /// A failed attempt leaves the connection `Disconnected` with retries
    /// scheduled in the background.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let first = {
            let mut supervisor = self.supervisor.lock();
            if supervisor.is_some() || *self.shutdown_tx.borrow() {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                *supervisor = Some(tokio::spawn(self.clone().supervise(tx)));
                Some(rx)
            }
        };

        match first {
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| Err(RouterError::terminated(self.id().as_str()))),
            None => match self.status() {
                status if status.is_serving() => Ok(()),
                ConnectionStatus::Terminated => Err(RouterError::terminated(self.id().as_str())),
                _ => Err(self
                    .last_error()
                    .unwrap_or_else(|| RouterError::transport(self.id().as_str(), "not connected"))),
            },
        }
    }

    /// Ask the supervisor to drop the current link and reconnect now,
    /// clearing any exhausted retry budget.
    pub fn request_reconnect(&self) {
        {
            let mut state = self.state.write();
            state.reconnect_attempts = 0;
            state.retries_exhausted = false;
        }
        self.reconnect.notify_one();
    }

    async fn supervise(self: Arc<Self>, first: oneshot::Sender<Result<()>>) {
        let mut first = Some(first);
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let attempt = tokio::select! {
                attempt = self.establish() => attempt,
                _ = shutdown.changed() => break,
            };

            let attempts = match attempt {
                Ok(reader) => {
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Ok(()));
                    }
                    let Some(lost) = self.watch_link(reader, &mut shutdown).await else {
                        break;
                    };
                    let reason = match &lost {
                        LinkLoss::Requested => "reconnect requested".to_string(),
                        LinkLoss::Failed(reason) => reason.clone(),
                    };
                    warn!(server = %self.id(), "Connection lost: {}", reason);
                    self.drop_link(Some(RouterError::transport(self.id().as_str(), &reason)))
                        .await;
                    if matches!(lost, LinkLoss::Requested) {
                        continue;
                    }
                    self.count_failure()
                }
                Err(err) => {
                    warn!(server = %self.id(), "Connection attempt failed: {}", err);
                    self.drop_link(Some(err.clone())).await;
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Err(err));
                    }
                    self.count_failure()
                }
            };

            if !self.backoff(attempts, &mut shutdown).await {
                break;
            }
        }

        self.finish_shutdown().await;
    }

    /// Wait for the live link to go away. A link that outlives the
    /// stability window clears the failure count. `None` means shutdown.
    async fn watch_link(
        &self,
        mut reader: JoinHandle<String>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<LinkLoss> {
        let stable = tokio::time::sleep(self.options.reconnect.stable_after());
        tokio::pin!(stable);
        let mut settled = false;

        let lost = loop {
            tokio::select! {
                reason = &mut reader => {
                    break Some(LinkLoss::Failed(
                        reason.unwrap_or_else(|e| format!("reader task failed: {}", e)),
                    ));
                }
                _ = self.reconnect.notified() => break Some(LinkLoss::Requested),
                _ = self.stalled.notified() => break Some(LinkLoss::Failed("link stalled".to_string())),
                _ = &mut stable, if !settled => {
                    settled = true;
                    let mut state = self.state.write();
                    state.reconnect_attempts = 0;
                    state.retries_exhausted = false;
                }
                _ = shutdown.changed() => break None,
            }
        };
        reader.abort();
        lost
    }

    fn count_failure(&self) -> u32 {
        let mut state = self.state.write();
        state.reconnect_attempts += 1;
        state.reconnect_attempts
    }

    /// Sleep before the next attempt, or park once the retry budget is
    /// spent. Returns false when shutdown was requested instead.
    async fn backoff(&self, attempts: u32, shutdown: &mut watch::Receiver<bool>) -> bool {
        if self.options.reconnect.exhausted(attempts) {
            error!(server = %self.id(), "Giving up after {} attempts", attempts);
            self.state.write().retries_exhausted = true;
            return tokio::select! {
                _ = self.reconnect.notified() => true,
                _ = shutdown.changed() => false,
            };
        }

        let delay = self.options.reconnect.delay_for(attempts);
        debug!(server = %self.id(), "Retrying in {:?}", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.reconnect.notified() => true,
            _ = shutdown.changed() => false,
        }
    }

    /// Connect, initialize and discover. Returns the reader task, which
    /// completes with a reason when the link goes away.
    async fn establish(self: &Arc<Self>) -> Result<JoinHandle<String>> {
        self.set_status(ConnectionStatus::Connecting);
        let Established { transport, inbound } = self.connector.connect(&self.definition).await?;

        let generation = {
            let mut state = self.state.write();
            state.link = Some(transport.clone());
            state.generation
        };
        let reader = tokio::spawn(self.clone().read_loop(inbound, transport, generation));

        self.set_status(ConnectionStatus::Initializing);
        let ready = match self.initialize().await {
            Ok(()) => self.discover_capabilities().await,
            Err(e) => Err(e),
        };

        match ready {
            Ok(status) => {
                info!(server = %self.id(), "Connected ({})", status);
                Ok(reader)
            }
            Err(e) => {
                reader.abort();
                Err(e)
            }
        }
    }

    async fn initialize(&self) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": IMPLEMENTATION_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        let result = self
            .request_with_timeout(
                next_request_id(),
                methods::INITIALIZE,
                Some(params),
                self.options.init_timeout,
            )
            .await?;

        debug!(server = %self.id(), "Initialized: {}", result);
        self.state.write().server_info = Some(result);
        self.notify(methods::INITIALIZED, None).await
    }

    /// Run every listing the server advertises, store the result, and
    /// publish it. A listing that fails leaves the server `Degraded` with
    /// the kinds it could report.
    pub async fn discover_capabilities(&self) -> Result<ConnectionStatus> {
        let _guard = self.refresh_lock.lock().await;
        let generation = self.state.read().generation;

        let (capabilities, complete) = self.fetch_capabilities().await?;

        {
            let state = self.state.read();
            if state.generation != generation || state.link.is_none() {
                return Err(RouterError::terminated(self.id().as_str()));
            }
        }
        self.catalog.publish(self.id(), capabilities.clone())?;

        let status = if complete {
            ConnectionStatus::Healthy
        } else {
            ConnectionStatus::Degraded
        };
        {
            let mut state = self.state.write();
            state.capabilities = capabilities;
            state.connected_since.get_or_insert_with(Utc::now);
        }
        self.set_status(status);
        Ok(status)
    }

    async fn fetch_capabilities(&self) -> Result<(CapabilitySet, bool)> {
        let advertised = self
            .state
            .read()
            .server_info
            .as_ref()
            .and_then(|info| info.get("capabilities"))
            .and_then(Value::as_object)
            .cloned();

        let mut capabilities = CapabilitySet::default();
        let mut attempted = 0;
        let mut last_failure = None;

        for kind in CapabilityKind::ALL {
            if let Some(advertised) = &advertised {
                if !advertised.contains_key(kind.server_capability()) {
                    continue;
                }
            }
            attempted += 1;
            match self.list_all(kind).await {
                Ok(entries) => capabilities.set(kind, entries),
                // Without an advertisement, a missing method just means "none".
                Err(RouterError::Downstream { code, .. })
                    if advertised.is_none() && code == codes::METHOD_NOT_FOUND =>
                {
                    attempted -= 1;
                }
                Err(e) => {
                    warn!(server = %self.id(), "Listing {}s failed: {}", kind, e);
                    last_failure = Some(e);
                }
            }
        }

        match last_failure {
            Some(e) if capabilities.reported.is_empty() && attempted > 0 => Err(e),
            Some(_) => Ok((capabilities, false)),
            None => Ok((capabilities, true)),
        }
    }

    async fn list_all(&self, kind: CapabilityKind) -> Result<BTreeMap<String, Value>> {
        let mut entries = BTreeMap::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.take().map(|c| json!({ "cursor": c }));
            let result = self.request(kind.list_method(), params).await?;

            let items = result
                .get(kind.result_field())
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for item in items {
                match item.get(kind.id_field()).and_then(Value::as_str) {
                    Some(id) => {
                        entries.insert(id.to_string(), item.clone());
                    }
                    None => warn!(server = %self.id(), "Skipping {} without '{}'", kind, kind.id_field()),
                }
            }

            match result.get("nextCursor").and_then(Value::as_str) {
                Some(next) if !next.is_empty() => cursor = Some(next.to_string()),
                _ => return Ok(entries),
            }
        }

        warn!(server = %self.id(), "Stopped paging {}s after {} pages", kind, MAX_LIST_PAGES);
        Ok(entries)
    }

    /// Forward one capability call.
    pub async fn invoke(&self, kind: CapabilityKind, original_id: &str, params: Value) -> Result<Value> {
        self.invoke_as(next_request_id(), kind, original_id, params).await
    }

    /// Like [`invoke`](Self::invoke) with a caller-chosen request id, so the
    /// caller can correlate cancellations.
    pub async fn invoke_as(
        &self,
        request_id: u64,
        kind: CapabilityKind,
        original_id: &str,
        params: Value,
    ) -> Result<Value> {
        let mut params = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err(RouterError::InvalidRequest("params must be an object".into())),
        };
        let (method, field) = match kind {
            CapabilityKind::Tool => (methods::TOOLS_CALL, "name"),
            CapabilityKind::Prompt => (methods::PROMPTS_GET, "name"),
            CapabilityKind::Resource | CapabilityKind::ResourceTemplate => (methods::RESOURCES_READ, "uri"),
        };
        params.insert(field.to_string(), Value::String(original_id.to_string()));
        self.request_as(request_id, method, Some(Value::Object(params))).await
    }

    /// Send an arbitrary request and wait for its response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.request_as(next_request_id(), method, params).await
    }

    pub async fn request_as(&self, request_id: u64, method: &str, params: Option<Value>) -> Result<Value> {
        self.request_with_timeout(request_id, method, params, self.call_timeout())
            .await
    }

    async fn request_with_timeout(
        &self,
        request_id: u64,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let link = self
            .state
            .read()
            .link
            .clone()
            .ok_or_else(|| RouterError::terminated(self.id().as_str()))?;

        let (reply, rx) = oneshot::channel();
        self.pending.lock().insert(
            request_id,
            PendingCall {
                method: method.to_string(),
                reply,
            },
        );

        let message = McpRequest::new(method)
            .with_id(request_id)
            .with_optional_params(params)
            .to_value();
        let deadline = tokio::time::Instant::now() + timeout;
        if let Err(e) = self.send_by(&link, message, deadline, timeout).await {
            self.pending.lock().remove(&request_id);
            warn!(server = %self.id(), "Failed to send {}: {}", method, e);
            return Err(e);
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RouterError::terminated(self.id().as_str())),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                debug!(server = %self.id(), "Request {} ({}) timed out", request_id, method);
                let _ = self.cancel(request_id, "timeout").await;
                Err(self.timeout_error(timeout))
            }
        }
    }

    /// Write one message, giving up at `deadline`. A write that cannot
    /// finish leaves the link unusable, so the supervisor is told to drop it.
    async fn send_by(
        &self,
        link: &Arc<dyn Transport>,
        message: Value,
        deadline: tokio::time::Instant,
        timeout: Duration,
    ) -> Result<()> {
        match tokio::time::timeout_at(deadline, link.send(message)).await {
            Ok(sent) => sent,
            Err(_) => {
                warn!(server = %self.id(), "Write did not complete within {:?}, dropping link", timeout);
                self.stalled.notify_waiters();
                Err(self.timeout_error(timeout))
            }
        }
    }

    fn timeout_error(&self, timeout: Duration) -> RouterError {
        RouterError::Timeout {
            server: self.id().to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Send a notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let link = self
            .state
            .read()
            .link
            .clone()
            .ok_or_else(|| RouterError::terminated(self.id().as_str()))?;
        let message = McpRequest::new(method).with_optional_params(params).to_value();
        let timeout = self.call_timeout();
        self.send_by(&link, message, tokio::time::Instant::now() + timeout, timeout)
            .await
    }

    /// Best-effort cancellation of a request issued on this connection.
    pub async fn cancel(&self, request_id: u64, reason: &str) -> Result<()> {
        self.notify(
            methods::CANCELLED,
            Some(json!({ "requestId": request_id, "reason": reason })),
        )
        .await
    }

    async fn read_loop(self: Arc<Self>, mut inbound: Inbound, link: Arc<dyn Transport>, generation: u64) -> String {
        let reason = loop {
            match inbound.recv().await {
                Some(Ok(value)) => self.route_inbound(value, &link).await,
                Some(Err(e)) => break e.to_string(),
                None => break "transport closed".to_string(),
            }
        };

        if self.state.read().generation == generation {
            self.fail_pending();
        }
        reason
    }

    async fn route_inbound(self: &Arc<Self>, value: Value, link: &Arc<dyn Transport>) {
        match Message::parse(value) {
            Ok(Message::Response(response)) => self.complete_call(response),
            Ok(Message::Request(request)) if !request.is_notification() => {
                self.answer_server_request(request, link).await
            }
            Ok(Message::Request(notification)) => self.dispatch_notification(notification),
            Err(e) => warn!(server = %self.id(), "Ignoring invalid message: {}", e.message),
        }
    }

    fn complete_call(&self, response: McpResponse) {
        let Some(request_id) = numeric_id(&response.id) else {
            debug!(server = %self.id(), "Response with foreign id {}", response.id);
            return;
        };
        let Some(call) = self.pending.lock().remove(&request_id) else {
            debug!(server = %self.id(), "Late response for request {}", request_id);
            return;
        };

        let result = response.into_result().map_err(|e| RouterError::Downstream {
            server: self.id().to_string(),
            capability: call.method.clone(),
            code: e.code,
            message: e.message,
            data: e.data,
        });
        let _ = call.reply.send(result);
    }

    /// Servers may call back (ping, sampling, roots). Only ping is served;
    /// everything else is refused so the server never waits on us.
    async fn answer_server_request(&self, request: McpRequest, link: &Arc<dyn Transport>) {
        let id = request.id.clone().unwrap_or(Value::Null);
        let response = if request.method == methods::PING {
            McpResponse::success(id, json!({}))
        } else {
            debug!(server = %self.id(), "Refusing server request {}", request.method);
            McpResponse::error(id, JsonRpcError::method_not_found(&request.method))
        };
        let timeout = self.call_timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        if let Err(e) = self.send_by(link, response.to_value(), deadline, timeout).await {
            debug!(server = %self.id(), "Failed to answer server request: {}", e);
        }
    }

    fn dispatch_notification(self: &Arc<Self>, notification: McpRequest) {
        match notification.method.as_str() {
            methods::TOOLS_LIST_CHANGED
            | methods::PROMPTS_LIST_CHANGED
            | methods::RESOURCES_LIST_CHANGED => {
                debug!(server = %self.id(), "{} received, rediscovering", notification.method);
                let connection = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = connection.discover_capabilities().await {
                        warn!(server = %connection.id(), "Rediscovery failed: {}", e);
                    }
                });
            }
            _ => {
                // Dropped when nobody is subscribed.
                let _ = self.notifications.send(ServerNotification {
                    server: self.id().clone(),
                    method: notification.method,
                    params: notification.params,
                });
            }
        }
    }

    fn fail_pending(&self) {
        let calls: Vec<PendingCall> = self.pending.lock().drain().map(|(_, call)| call).collect();
        if !calls.is_empty() {
            debug!(server = %self.id(), "Failing {} in-flight calls", calls.len());
        }
        for call in calls {
            let _ = call.reply.send(Err(RouterError::terminated(self.id().as_str())));
        }
    }

    /// Tear down the current link: fail in-flight calls, forget
    /// capabilities, withdraw from the catalog.
    async fn drop_link(&self, error: Option<RouterError>) {
        let link = {
            let mut state = self.state.write();
            state.generation += 1;
            state.link.take()
        };
        self.fail_pending();
        if let Some(link) = link {
            link.close().await;
        }

        let _guard = self.refresh_lock.lock().await;
        {
            let mut state = self.state.write();
            state.capabilities = CapabilitySet::default();
            state.connected_since = None;
            if error.is_some() {
                state.last_error = error;
            }
        }
        self.catalog.withdraw(self.id());
        self.set_status(ConnectionStatus::Disconnected);
    }

    async fn finish_shutdown(&self) {
        if self.status() == ConnectionStatus::Terminated {
            return;
        }
        self.drop_link(None).await;
        self.set_status(ConnectionStatus::Terminated);
        info!(server = %self.id(), "Connection terminated");
    }

    /// Close the link and stop reconnecting. Every call in flight fails
    /// with `ConnectionTerminated`. Safe to call more than once.
    pub async fn shutdown(&self) {
        let already_requested = self.shutdown_tx.send_replace(true);
        if already_requested {
            let mut status = self.subscribe_status();
            let _ = status
                .wait_for(|s| *s == ConnectionStatus::Terminated)
                .await;
            return;
        }

        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                error!(server = %self.id(), "Supervisor task failed: {}", e);
            }
        }
        self.finish_shutdown().await;
    }
}
