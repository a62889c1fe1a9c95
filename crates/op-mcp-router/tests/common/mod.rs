//! Scripted in-memory MCP servers for router tests.
//!
//! Each fake server speaks newline-delimited JSON-RPC over a
//! `tokio::io::duplex` pipe, exactly like a spawned process would over its
//! stdio. Tool names select behaviors:
//!
//! - `slow`: waits `arguments.ms` (default 5s) before answering
//! - `progress`: emits two progress notifications first
//! - `notify`: emits a log message notification first
//! - `fail`: answers with a JSON-RPC error
//! - anything else: answers `"{server}:{tool}"`
//!
//! Notifications sent to a fake server are recorded and can be read back
//! with [`FakeConnector::received`].

#![allow(dead_code)]

use async_trait::async_trait;
use op_mcp_router::config::ReconnectPolicy;
use op_mcp_router::error::Result;
use op_mcp_router::transport::{Connector, Established, LineTransport};
use op_mcp_router::{RouterConfig, RouterError, ServerDefinition, ServerId, TransportKind};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const PAGE_SIZE: usize = 2;

#[derive(Debug, Clone, Default)]
pub struct FakeServer {
    pub tools: Vec<String>,
    pub prompts: Vec<String>,
    pub resources: Vec<String>,
    pub templates: Vec<String>,
    /// List methods that answer with an internal error.
    pub failing_lists: Vec<String>,
}

fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

impl FakeServer {
    pub fn tools(names: &[&str]) -> Self {
        Self {
            tools: owned(names),
            ..Self::default()
        }
    }

    pub fn with_prompts(mut self, names: &[&str]) -> Self {
        self.prompts = owned(names);
        self
    }

    pub fn with_resources(mut self, uris: &[&str]) -> Self {
        self.resources = owned(uris);
        self
    }

    pub fn with_templates(mut self, templates: &[&str]) -> Self {
        self.templates = owned(templates);
        self
    }

    pub fn with_failing_list(mut self, method: &str) -> Self {
        self.failing_lists.push(method.to_string());
        self
    }
}

struct Link {
    task: JoinHandle<()>,
    out: mpsc::UnboundedSender<Value>,
}

#[derive(Default)]
struct Inner {
    scripts: HashMap<String, Arc<RwLock<FakeServer>>>,
    connects: HashMap<String, usize>,
    failing: HashSet<String>,
    lifetimes: HashMap<String, Duration>,
    received: HashMap<String, Arc<Mutex<Vec<Value>>>>,
    links: HashMap<String, Link>,
}

#[derive(Default)]
pub struct FakeConnector {
    inner: Mutex<Inner>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, id: &str, server: FakeServer) {
        self.inner
            .lock()
            .scripts
            .insert(id.to_string(), Arc::new(RwLock::new(server)));
    }

    /// Make connection attempts to `id` fail (or succeed again).
    pub fn set_failing(&self, id: &str, failing: bool) {
        let mut inner = self.inner.lock();
        if failing {
            inner.failing.insert(id.to_string());
        } else {
            inner.failing.remove(id);
        }
    }

    /// Close every new link to `id` this long after it is established.
    pub fn set_lifetime(&self, id: &str, lifetime: Option<Duration>) {
        let mut inner = self.inner.lock();
        match lifetime {
            Some(lifetime) => inner.lifetimes.insert(id.to_string(), lifetime),
            None => inner.lifetimes.remove(id),
        };
    }

    /// Notifications with the given method that `id` has received.
    pub fn received(&self, id: &str, method: &str) -> Vec<Value> {
        let inner = self.inner.lock();
        let Some(log) = inner.received.get(id) else {
            return Vec::new();
        };
        let log = log.lock();
        log.iter().filter(|m| m["method"] == method).cloned().collect()
    }

    pub fn connects(&self, id: &str) -> usize {
        self.inner.lock().connects.get(id).copied().unwrap_or(0)
    }

    /// Simulate the server process dying.
    pub fn kill_link(&self, id: &str) {
        if let Some(link) = self.inner.lock().links.remove(id) {
            link.task.abort();
        }
    }

    /// Change the server's tools and announce it on the live link.
    pub fn set_tools(&self, id: &str, tools: &[&str]) {
        let inner = self.inner.lock();
        if let Some(script) = inner.scripts.get(id) {
            script.write().tools = owned(tools);
        }
        if let Some(link) = inner.links.get(id) {
            let _ = link.out.send(json!({
                "jsonrpc": "2.0",
                "method": "notifications/tools/list_changed"
            }));
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, definition: &ServerDefinition) -> Result<Established> {
        let id = definition.id.to_string();
        let mut inner = self.inner.lock();
        *inner.connects.entry(id.clone()).or_default() += 1;

        if inner.failing.contains(&id) {
            return Err(RouterError::transport(id, "connection refused"));
        }
        let script = inner
            .scripts
            .get(&id)
            .cloned()
            .ok_or_else(|| RouterError::transport(id.clone(), "no such server"))?;

        let lifetime = inner.lifetimes.get(&id).copied();
        let received = inner.received.entry(id.clone()).or_default().clone();

        let (ours, theirs) = tokio::io::duplex(1 << 16);
        let (out, out_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_server(
            id.clone(),
            script,
            theirs,
            Channel { out: out.clone(), out_rx, received },
            lifetime,
        ));
        if let Some(previous) = inner.links.insert(id.clone(), Link { task, out }) {
            previous.task.abort();
        }

        let (reader, writer) = tokio::io::split(ours);
        Ok(LineTransport::from_streams(
            id,
            TransportKind::Local,
            Box::new(reader),
            Box::new(writer),
        ))
    }
}

struct Channel {
    out: mpsc::UnboundedSender<Value>,
    out_rx: mpsc::UnboundedReceiver<Value>,
    received: Arc<Mutex<Vec<Value>>>,
}

async fn run_server(
    name: String,
    script: Arc<RwLock<FakeServer>>,
    stream: DuplexStream,
    channel: Channel,
    lifetime: Option<Duration>,
) {
    let Channel { out, mut out_rx, received } = channel;
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();
    let hang_up = async move {
        match lifetime {
            Some(lifetime) => tokio::time::sleep(lifetime).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(hang_up);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let Ok(message) = serde_json::from_str::<Value>(&line) else { continue };
                if message.get("id").is_none() {
                    received.lock().push(message);
                    continue;
                }
                let name = name.clone();
                let script = script.read().clone();
                let out = out.clone();
                tokio::spawn(async move { handle(&name, &script, message, &out).await });
            }
            Some(message) = out_rx.recv() => {
                let mut bytes = serde_json::to_vec(&message).unwrap();
                bytes.push(b'\n');
                if writer.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            _ = &mut hang_up => break,
        }
    }
}

async fn handle(name: &str, script: &FakeServer, message: Value, out: &mpsc::UnboundedSender<Value>) {
    let Some(id) = message.get("id").cloned() else {
        return;
    };
    let method = message["method"].as_str().unwrap_or_default().to_string();
    let params = message.get("params").cloned().unwrap_or_else(|| json!({}));

    let result = match method.as_str() {
        list if script.failing_lists.iter().any(|m| m == list) => {
            Err((-32603, format!("{} unavailable", list)))
        }
        "initialize" => {
            let mut caps = Map::new();
            if !script.tools.is_empty() {
                caps.insert("tools".into(), json!({"listChanged": true}));
            }
            if !script.prompts.is_empty() {
                caps.insert("prompts".into(), json!({}));
            }
            if !script.resources.is_empty() || !script.templates.is_empty() {
                caps.insert("resources".into(), json!({}));
            }
            Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": caps,
                "serverInfo": {"name": name, "version": "0.0.1"}
            }))
        }
        "tools/list" => Ok(page(&script.tools, "tools", "name", &params)),
        "prompts/list" => Ok(page(&script.prompts, "prompts", "name", &params)),
        "resources/list" => Ok(page(&script.resources, "resources", "uri", &params)),
        "resources/templates/list" => Ok(page(&script.templates, "resourceTemplates", "uriTemplate", &params)),
        "tools/call" => call_tool(name, &params, out).await,
        "prompts/get" => Ok(json!({
            "messages": [{
                "role": "user",
                "content": {"type": "text", "text": format!("{}:{}", name, params["name"].as_str().unwrap_or_default())}
            }]
        })),
        "resources/read" => Ok(json!({
            "contents": [{"uri": params["uri"], "text": format!("{} contents", name)}]
        })),
        "completion/complete" => Ok(json!({
            "completion": {"values": [format!("{}-completion", name)], "ref": params["ref"]}
        })),
        _ => Err((-32601, format!("Method not found: {}", method))),
    };

    let response = match result {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, message)) => json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}}),
    };
    let _ = out.send(response);
}

fn page(items: &[String], field: &str, id_field: &str, params: &Value) -> Value {
    let start: usize = params["cursor"].as_str().and_then(|c| c.parse().ok()).unwrap_or(0);
    let end = (start + PAGE_SIZE).min(items.len());
    let entries: Vec<Value> = items[start.min(end)..end]
        .iter()
        .map(|item| json!({ id_field: item, "description": format!("{} entry", item) }))
        .collect();

    let mut result = Map::new();
    result.insert(field.to_string(), Value::Array(entries));
    if end < items.len() {
        result.insert("nextCursor".into(), json!(end.to_string()));
    }
    Value::Object(result)
}

async fn call_tool(server: &str, params: &Value, out: &mpsc::UnboundedSender<Value>) -> std::result::Result<Value, (i64, String)> {
    let tool = params["name"].as_str().unwrap_or_default();
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
    let text = json!({
        "content": [{"type": "text", "text": format!("{}:{}", server, tool)}],
        "arguments": arguments,
    });

    match tool {
        "slow" => {
            let ms = arguments["ms"].as_u64().unwrap_or(5000);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(text)
        }
        "progress" => {
            let token = params["_meta"]["progressToken"].clone();
            for step in 1..=2 {
                let _ = out.send(json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/progress",
                    "params": {
                        "progressToken": token,
                        "progress": step,
                        "total": 2,
                        "message": arguments["label"],
                    }
                }));
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(text)
        }
        "notify" => {
            let _ = out.send(json!({
                "jsonrpc": "2.0",
                "method": "notifications/message",
                "params": {"level": "info", "logger": server, "data": arguments["text"]}
            }));
            Ok(text)
        }
        "fail" => Err((-32602, "bad arguments".to_string())),
        _ => Ok(text),
    }
}

pub fn id(s: &str) -> ServerId {
    ServerId::new(s).unwrap()
}

pub fn local(name: &str) -> ServerDefinition {
    ServerDefinition::local(id(name), "fake-mcp-server", &[])
}

/// Fast retries so reconnect tests finish quickly.
pub fn config() -> RouterConfig {
    RouterConfig::builder()
        .reconnect(ReconnectPolicy {
            initial_delay_ms: 20,
            max_delay_ms: 100,
            max_attempts: None,
            ..ReconnectPolicy::default()
        })
        .build()
}

/// Poll until `check` passes or two seconds elapse.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
