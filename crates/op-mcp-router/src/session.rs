//! Upstream client sessions
//!
//! A session owns its correlation table (downstream request id to the id
//! the client used) and a bounded outbox for push messages. Closing the
//! session drops the outbox sender, which ends the session's stream.

use crate::error::{Result, RouterError};
use crate::namespace::ServerId;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a progress route outlives its call. Progress sent just before
/// the response may still be queued for fan-out when the call returns.
const PROGRESS_LINGER: Duration = Duration::from_secs(5);

/// Push messages for one session; ends when the session closes.
pub type SessionStream = ReceiverStream<Value>;

/// An in-flight call forwarded on behalf of a client.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub client_id: Value,
    pub server: ServerId,
    pub issued_at: Instant,
}

pub struct ClientSession {
    id: String,
    profile: Option<String>,
    opened_at: DateTime<Utc>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    outbox: Mutex<Option<mpsc::Sender<Value>>>,
}

impl ClientSession {
    fn new(profile: Option<String>, buffer: usize) -> (Self, SessionStream) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let session = Self {
            id: Uuid::new_v4().to_string(),
            profile,
            opened_at: Utc::now(),
            pending: Mutex::new(HashMap::new()),
            outbox: Mutex::new(Some(tx)),
        };
        (session, ReceiverStream::new(rx))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn profile(&self) -> Option<&str> {
        self.profile.as_deref()
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn is_open(&self) -> bool {
        self.outbox.lock().is_some()
    }

    /// Queue a push message. Never blocks; a full or closed outbox drops it.
    pub fn deliver(&self, message: Value) -> bool {
        let outbox = self.outbox.lock();
        let Some(sender) = outbox.as_ref() else {
            return false;
        };
        match sender.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session = %self.id, "Session outbox full, dropping notification");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn track(&self, downstream_id: u64, client_id: Value, server: ServerId) {
        self.pending.lock().insert(
            downstream_id,
            PendingRequest {
                client_id,
                server,
                issued_at: Instant::now(),
            },
        );
    }

    pub fn complete(&self, downstream_id: u64) -> Option<PendingRequest> {
        self.pending.lock().remove(&downstream_id)
    }

    pub fn pending(&self, downstream_id: u64) -> Option<PendingRequest> {
        self.pending.lock().get(&downstream_id).cloned()
    }

    /// Find the downstream call issued for a client request id.
    pub fn find_by_client_id(&self, client_id: &Value) -> Option<(u64, ServerId)> {
        self.pending
            .lock()
            .iter()
            .find(|(_, pending)| &pending.client_id == client_id)
            .map(|(id, pending)| (*id, pending.server.clone()))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Stop delivery and abandon pending requests.
    fn close(&self) -> Vec<(u64, PendingRequest)> {
        self.outbox.lock().take();
        self.pending.lock().drain().collect()
    }
}

struct ProgressRoute {
    session: String,
    original: Value,
    finished: Option<Instant>,
}

/// Owns every open client session.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<ClientSession>>>,
    progress: Mutex<HashMap<String, ProgressRoute>>,
    buffer: usize,
}

impl SessionManager {
    pub fn new(buffer: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            progress: Mutex::new(HashMap::new()),
            buffer,
        }
    }

    /// Open a session. Profile validation is the caller's job.
    pub fn open(&self, profile: Option<String>) -> (Arc<ClientSession>, SessionStream) {
        let (session, stream) = ClientSession::new(profile, self.buffer);
        let session = Arc::new(session);
        self.sessions.write().insert(session.id.clone(), session.clone());
        info!(
            session = %session.id,
            "Opened client session (profile: {})",
            session.profile.as_deref().unwrap_or("<all>")
        );
        (session, stream)
    }

    /// Close a session. Returns the requests it abandoned, keyed by
    /// downstream request id.
    pub fn close(&self, id: &str) -> Result<Vec<(u64, PendingRequest)>> {
        let session = self
            .sessions
            .write()
            .remove(id)
            .ok_or_else(|| RouterError::SessionNotFound { id: id.to_string() })?;
        self.progress.lock().retain(|_, route| route.session != id);
        let abandoned = session.close();
        info!(session = %id, "Closed client session, abandoned {} pending", abandoned.len());
        Ok(abandoned)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ClientSession>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swap a client's progress token for a router-wide unique one.
    pub fn register_progress(&self, session: &str, original: Value) -> String {
        let token = format!("{}:{}", session, Uuid::new_v4());
        let mut progress = self.progress.lock();
        progress.retain(|_, route| route.finished.map_or(true, |at| at.elapsed() < PROGRESS_LINGER));
        progress.insert(
            token.clone(),
            ProgressRoute {
                session: session.to_string(),
                original,
                finished: None,
            },
        );
        token
    }

    /// Session and original token for a rewritten progress token.
    pub fn route_progress(&self, token: &str) -> Option<(Arc<ClientSession>, Value)> {
        let (session, original) = {
            let progress = self.progress.lock();
            let route = progress.get(token)?;
            (route.session.clone(), route.original.clone())
        };
        match self.get(&session) {
            Some(session) => Some((session, original)),
            None => {
                debug!("Progress for closed session {}", session);
                None
            }
        }
    }

    /// Mark a route's call as done. The route lingers briefly for progress
    /// still in flight and is pruned later.
    pub fn finish_progress(&self, token: &str) {
        if let Some(route) = self.progress.lock().get_mut(token) {
            route.finished = Some(Instant::now());
        }
    }
}
