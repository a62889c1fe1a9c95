//! Remote transports over HTTP.

use super::{Established, Transport, INBOUND_BUFFER};
use crate::config::{resolve_env_var, ServerAuth, TransportKind};
use crate::error::{Result, RouterError};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SESSION_HEADER: &str = "mcp-session-id";
const STREAMABLE_ACCEPT: &str = "application/json, text/event-stream";
const EVENT_STREAM: &str = "text/event-stream";

type InboundSender = mpsc::Sender<Result<Value>>;

fn build_client(
    server: &str,
    headers: &BTreeMap<String, String>,
    auth: Option<&ServerAuth>,
    connect_timeout: Duration,
) -> Result<reqwest::Client> {
    let mut header_map = HeaderMap::new();
    let auth_header = auth.map(ServerAuth::header);
    let configured = headers.iter().map(|(k, v)| (k.clone(), resolve_env_var(v)));

    for (name, value) in configured.chain(auth_header) {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| RouterError::Config(format!("invalid header name '{}' for {}", name, server)))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|_| RouterError::Config(format!("invalid value for header '{}' on {}", name.as_str(), server)))?;
        header_map.insert(name, value);
    }

    reqwest::Client::builder()
        .default_headers(header_map)
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| RouterError::transport(server, format!("failed to build HTTP client: {}", e)))
}

/// Streamable HTTP session: each message is its own POST, replies come back
/// as a JSON body or as an event stream on that POST.
pub struct StreamableHttpTransport {
    server: String,
    url: String,
    client: reqwest::Client,
    session_id: parking_lot::Mutex<Option<String>>,
    inbound: parking_lot::Mutex<Option<InboundSender>>,
}

impl StreamableHttpTransport {
    pub fn connect(
        server: impl Into<String>,
        url: &str,
        headers: &BTreeMap<String, String>,
        auth: Option<&ServerAuth>,
        connect_timeout: Duration,
    ) -> Result<Established> {
        let server = server.into();
        let client = build_client(&server, headers, auth, connect_timeout)?;
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);

        info!(server = %server, "Using streamable HTTP transport: {}", url);
        let transport = Arc::new(Self {
            server,
            url: url.to_string(),
            client,
            session_id: parking_lot::Mutex::new(None),
            inbound: parking_lot::Mutex::new(Some(tx)),
        });
        Ok(Established {
            transport,
            inbound: rx,
        })
    }

    fn lose_link(&self, sender: &InboundSender, err: &RouterError) {
        let _ = sender.try_send(Err(err.clone()));
        self.inbound.lock().take();
    }
}

#[async_trait::async_trait]
impl Transport for StreamableHttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Remote
    }

    async fn send(&self, message: Value) -> Result<()> {
        let sender = self
            .inbound
            .lock()
            .clone()
            .ok_or_else(|| RouterError::transport(&self.server, "transport closed"))?;

        let mut request = self
            .client
            .post(&self.url)
            .header(ACCEPT, STREAMABLE_ACCEPT)
            .json(&message);
        let session_id = self.session_id.lock().clone();
        if let Some(session_id) = session_id {
            request = request.header(SESSION_HEADER, session_id);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let err = RouterError::transport(&self.server, e);
                self.lose_link(&sender, &err);
                return Err(err);
            }
        };

        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock() = Some(id.to_string());
        }

        let status = response.status();
        debug!(server = %self.server, "Received MCP HTTP response: {}", status);
        if status == StatusCode::NOT_FOUND {
            // Server forgot our session; the connection has to start over.
            let err = RouterError::transport(&self.server, "HTTP session expired");
            self.lose_link(&sender, &err);
            return Err(err);
        }
        if !status.is_success() {
            return Err(RouterError::transport(&self.server, format!("HTTP error: {}", status)));
        }
        if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT {
            return Ok(());
        }

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with(EVENT_STREAM))
            .unwrap_or(false);

        let server = self.server.clone();
        if is_stream {
            tokio::spawn(async move {
                let mut decoder = SseDecoder::default();
                let mut body = response.bytes_stream();
                while let Some(chunk) = body.next().await {
                    match chunk {
                        Ok(bytes) => {
                            if !forward_events(&server, decoder.feed(&bytes), &sender).await {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(server = %server, "Event stream response interrupted: {}", e);
                            return;
                        }
                    }
                }
                forward_events(&server, decoder.finish().into_iter().collect(), &sender).await;
            });
        } else {
            tokio::spawn(async move {
                match response.bytes().await {
                    Ok(body) if body.iter().all(u8::is_ascii_whitespace) => {}
                    Ok(body) => match serde_json::from_slice::<Value>(&body) {
                        Ok(value) => {
                            forward_value(value, &sender).await;
                        }
                        Err(e) => warn!(server = %server, "Discarding non-JSON response body: {}", e),
                    },
                    Err(e) => warn!(server = %server, "Failed to read response body: {}", e),
                }
            });
        }
        Ok(())
    }

    async fn close(&self) {
        if self.inbound.lock().take().is_none() {
            return;
        }
        let session_id = self.session_id.lock().take();
        if let Some(session_id) = session_id {
            let result = self
                .client
                .delete(&self.url)
                .header(SESSION_HEADER, session_id)
                .send()
                .await;
            if let Err(e) = result {
                debug!(server = %self.server, "Session delete failed: {}", e);
            }
        }
    }
}

/// Legacy HTTP+SSE session: a long-lived GET stream carries everything the
/// server sends, and its first `endpoint` event names where to POST.
pub struct SseTransport {
    server: String,
    endpoint: String,
    client: reqwest::Client,
    stream_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    pub async fn connect(
        server: impl Into<String>,
        url: &str,
        headers: &BTreeMap<String, String>,
        auth: Option<&ServerAuth>,
        connect_timeout: Duration,
    ) -> Result<Established> {
        let server = server.into();
        let client = build_client(&server, headers, auth, connect_timeout)?;
        let base = reqwest::Url::parse(url)
            .map_err(|e| RouterError::Config(format!("invalid url '{}' for {}: {}", url, server, e)))?;

        let response = client
            .get(base.clone())
            .header(ACCEPT, EVENT_STREAM)
            .send()
            .await
            .map_err(|e| RouterError::transport(&server, e))?;
        if !response.status().is_success() {
            return Err(RouterError::transport(
                &server,
                format!("SSE stream rejected: {}", response.status()),
            ));
        }

        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let task_server = server.clone();
        let stream_task = tokio::spawn(async move {
            let mut endpoint_tx = Some(endpoint_tx);
            let mut decoder = SseDecoder::default();
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(RouterError::transport(&task_server, e))).await;
                        return;
                    }
                };
                let mut messages = Vec::new();
                for event in decoder.feed(&bytes) {
                    if event.event.as_deref() == Some("endpoint") {
                        if let Some(sender) = endpoint_tx.take() {
                            let _ = sender.send(event.data);
                        }
                    } else {
                        messages.push(event);
                    }
                }
                if !forward_events(&task_server, messages, &tx).await {
                    return;
                }
            }
            debug!(server = %task_server, "SSE stream ended");
        });

        let endpoint = match tokio::time::timeout(connect_timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            _ => {
                stream_task.abort();
                return Err(RouterError::transport(&server, "SSE stream sent no endpoint event"));
            }
        };
        let endpoint = base
            .join(endpoint.trim())
            .map_err(|e| RouterError::transport(&server, format!("invalid endpoint: {}", e)))?;

        info!(server = %server, "Using SSE transport, posting to {}", endpoint);
        let transport = Arc::new(Self {
            server,
            endpoint: endpoint.to_string(),
            client,
            stream_task: parking_lot::Mutex::new(Some(stream_task)),
        });
        Ok(Established {
            transport,
            inbound: rx,
        })
    }
}

#[async_trait::async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Remote
    }

    async fn send(&self, message: Value) -> Result<()> {
        if self.stream_task.lock().is_none() {
            return Err(RouterError::transport(&self.server, "transport closed"));
        }
        let response = self
            .client
            .post(&self.endpoint)
            .json(&message)
            .send()
            .await
            .map_err(|e| RouterError::transport(&self.server, e))?;
        if !response.status().is_success() {
            return Err(RouterError::transport(
                &self.server,
                format!("HTTP error: {}", response.status()),
            ));
        }
        Ok(())
    }

    async fn close(&self) {
        if let Some(task) = self.stream_task.lock().take() {
            task.abort();
        }
    }
}

async fn forward_events(server: &str, events: Vec<SseEvent>, sender: &InboundSender) -> bool {
    for event in events {
        match event.event.as_deref() {
            None | Some("message") => {}
            Some(other) => {
                debug!(server = %server, "Ignoring SSE event '{}'", other);
                continue;
            }
        }
        match serde_json::from_str::<Value>(&event.data) {
            Ok(value) => {
                if !forward_value(value, sender).await {
                    return false;
                }
            }
            Err(e) => warn!(server = %server, "Discarding non-JSON SSE data: {}", e),
        }
    }
    true
}

async fn forward_value(value: Value, sender: &InboundSender) -> bool {
    let messages = match value {
        Value::Array(batch) => batch,
        single => vec![single],
    };
    for message in messages {
        if sender.send(Ok(message)).await.is_err() {
            return false;
        }
    }
    true
}

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` parser.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed raw bytes, returning every event completed by them.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw);
            let line = text.trim_end_matches(|c| c == '\n' || c == '\r');

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }
        events
    }

    /// Flush an event left unterminated at end of stream.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let mut tail = std::mem::take(&mut self.buffer);
            tail.push(b'\n');
            if let Some(event) = self.feed(&tail).pop() {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: self.event.take(),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.feed(b"event: endpoint\nda").is_empty());
        let events = decoder.feed(b"ta: /messages?sessionId=1\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: Some("endpoint".into()),
                data: "/messages?sessionId=1".into()
            }]
        );
    }

    #[test]
    fn test_decoder_joins_multiline_data_and_skips_comments() {
        let mut decoder = SseDecoder::default();
        let events = decoder.feed(b": keepalive\r\ndata: {\"a\":\r\ndata: 1}\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, None);
        assert_eq!(events[0].data, "{\"a\":\n1}");
    }

    #[test]
    fn test_decoder_finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.feed(b"data: {\"id\":1}").is_empty());
        let event = decoder.finish().unwrap();
        assert_eq!(event.data, "{\"id\":1}");
        assert!(decoder.finish().is_none());
    }

    #[tokio::test]
    async fn test_forward_value_splits_batches() {
        let (tx, mut rx) = mpsc::channel(8);
        assert!(forward_value(serde_json::json!([{"id": 1}, {"id": 2}]), &tx).await);
        assert_eq!(rx.recv().await.unwrap().unwrap()["id"], 1);
        assert_eq!(rx.recv().await.unwrap().unwrap()["id"], 2);
    }

    #[test]
    fn test_build_client_rejects_bad_header() {
        let mut headers = BTreeMap::new();
        headers.insert("bad header".to_string(), "v".to_string());
        let err = build_client("web", &headers, None, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, RouterError::Config(_)));
    }
}
