//! Line-delimited JSON-RPC transport.
//!
//! Used for spawned local servers (child stdin/stdout) and for any other
//! pair of byte streams, such as an in-memory duplex.

use super::{Established, Transport, INBOUND_BUFFER};
use crate::config::{resolve_env_var, TransportKind};
use crate::error::{Result, RouterError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Minimum time `close` waits for an in-progress write to release stdin.
const MIN_WRITER_WAIT: Duration = Duration::from_millis(100);

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Writes newline-terminated JSON, reads it back on a background task.
pub struct LineTransport {
    server: String,
    kind: TransportKind,
    writer: Mutex<Option<BoxWriter>>,
    child: Mutex<Option<Child>>,
    shutdown_grace: Duration,
}

impl LineTransport {
    /// Wrap an arbitrary reader/writer pair.
    pub fn from_streams(
        server: impl Into<String>,
        kind: TransportKind,
        reader: BoxReader,
        writer: BoxWriter,
    ) -> Established {
        let server = server.into();
        let transport = Arc::new(Self {
            server: server.clone(),
            kind,
            writer: Mutex::new(Some(writer)),
            child: Mutex::new(None),
            shutdown_grace: Duration::ZERO,
        });
        let inbound = spawn_reader(server, reader);
        Established { transport, inbound }
    }

    /// Spawn a local server process.
    pub fn spawn(
        server: impl Into<String>,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        cwd: Option<&Path>,
        shutdown_grace: Duration,
    ) -> Result<Established> {
        let server = server.into();
        info!(server = %server, "Spawning local MCP server: {} {}", command, args.join(" "));

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, resolve_env_var(value));
        }
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| RouterError::transport(&server, format!("failed to spawn '{}': {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RouterError::transport(&server, "child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RouterError::transport(&server, "child stdout unavailable"))?;
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_drain(server.clone(), stderr);
        }

        let transport = Arc::new(Self {
            server: server.clone(),
            kind: TransportKind::Local,
            writer: Mutex::new(Some(Box::new(stdin))),
            child: Mutex::new(Some(child)),
            shutdown_grace,
        });
        let inbound = spawn_reader(server, Box::new(stdout));
        Ok(Established { transport, inbound })
    }
}

#[async_trait::async_trait]
impl Transport for LineTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn send(&self, message: Value) -> Result<()> {
        let mut line = serde_json::to_string(&message)
            .map_err(|e| RouterError::transport(&self.server, format!("encode failed: {}", e)))?;
        line.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| RouterError::transport(&self.server, "transport closed"))?;

        let io_err = |e: std::io::Error| RouterError::transport(&self.server, e);
        writer.write_all(line.as_bytes()).await.map_err(io_err)?;
        writer.flush().await.map_err(io_err)?;
        Ok(())
    }

    async fn close(&self) {
        // Dropping the writer closes the child's stdin, which is the
        // polite way to ask a stdio server to exit. A writer stuck on a full
        // pipe is skipped; the kill below still bounds the close.
        let wait = self.shutdown_grace.max(MIN_WRITER_WAIT);
        match tokio::time::timeout(wait, self.writer.lock()).await {
            Ok(mut guard) => {
                if let Some(mut writer) = guard.take() {
                    let _ = tokio::time::timeout(wait, writer.shutdown()).await;
                }
            }
            Err(_) => warn!(server = %self.server, "Writer still busy, closing without flushing"),
        }

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => debug!(server = %self.server, "Local server exited: {}", status),
            Ok(Err(e)) => warn!(server = %self.server, "Failed waiting for local server: {}", e),
            Err(_) => {
                warn!(server = %self.server, "Local server ignored stdin close, killing it");
                if let Err(e) = child.kill().await {
                    warn!(server = %self.server, "Failed to kill local server: {}", e);
                }
            }
        }
    }
}

fn spawn_reader(server: String, reader: BoxReader) -> mpsc::Receiver<Result<Value>> {
    let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(line) {
                        Ok(value) => {
                            if tx.send(Ok(value)).await.is_err() {
                                break;
                            }
                        }
                        // Servers sometimes print banners on stdout
                        Err(_) => debug!(server = %server, "Skipping non-JSON line: {}", line),
                    }
                }
                Ok(None) => {
                    debug!(server = %server, "Transport reached end of stream");
                    break;
                }
                Err(e) => {
                    let _ = tx.send(Err(RouterError::transport(&server, e))).await;
                    break;
                }
            }
        }
    });
    rx
}

fn spawn_stderr_drain(server: String, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(server = %server, "stderr: {}", line);
        }
    });
}
