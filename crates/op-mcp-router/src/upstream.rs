//! Upstream transport
//!
//! Serves one client session over any line-delimited byte stream: stdin and
//! stdout for a client that spawned us, or a TCP socket per client.
//! Requests are handled concurrently, so responses leave in completion
//! order interleaved with the session's notifications.

use crate::protocol::{JsonRpcError, McpResponse};
use crate::router::Router;
use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

/// Serve a single client until its input closes.
///
/// Fails up front with `ProfileNotFound` if `profile` names no profile.
pub async fn serve_connection<R, W>(router: Arc<Router>, profile: Option<&str>, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (session, notifications) = router.open_session(profile)?;
    let (responses, responses_rx) = mpsc::channel::<Value>(64);
    let writer_task = tokio::spawn(write_loop(
        writer,
        ReceiverStream::new(responses_rx).merge(notifications),
    ));

    let mut lines = BufReader::new(reader).lines();
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    debug!(session = %session.id(), request = %line, "Received message");

                    let message: Value = match serde_json::from_str(line) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(session = %session.id(), error = %e, "Parse error");
                            let response = McpResponse::error(Value::Null, JsonRpcError::parse_error(e.to_string()));
                            let _ = responses.send(response.to_value()).await;
                            continue;
                        }
                    };

                    let router = router.clone();
                    let session = session.clone();
                    let responses = responses.clone();
                    in_flight.spawn(async move {
                        if let Some(response) = router.handle_message(&session, message).await {
                            let _ = responses.send(response).await;
                        }
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    error!(session = %session.id(), error = %e, "Read failed");
                    break;
                }
            },
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
        }
    }

    // Nobody is left to read answers; cancel downstream work right away.
    if let Err(e) = router.close_session(session.id()).await {
        debug!(session = %session.id(), "Session already closed: {}", e);
    }
    in_flight.abort_all();
    while in_flight.join_next().await.is_some() {}
    drop(responses);

    match writer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(session = %session.id(), "Writer stopped: {}", e),
        Err(e) => error!(session = %session.id(), "Writer task failed: {}", e),
    }
    info!(session = %session.id(), "Client disconnected");
    Ok(())
}

async fn write_loop<W, S>(mut writer: W, mut outgoing: S) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    S: Stream<Item = Value> + Unpin,
{
    while let Some(message) = outgoing.next().await {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Serve one client over stdin/stdout.
pub async fn serve_stdio(router: Arc<Router>, profile: Option<&str>) -> Result<()> {
    info!("Starting stdio transport");
    serve_connection(router, profile, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Accept clients on a TCP listener, one session per socket, all bound to
/// the same profile. Runs until the listener fails.
pub async fn serve_tcp(router: Arc<Router>, listener: TcpListener, profile: Option<String>) -> Result<()> {
    router.resolve_profile(profile.as_deref())?;
    let local = listener.local_addr().context("listener has no local address")?;
    info!("Listening on {}", local);

    loop {
        let (stream, peer) = listener.accept().await.context("accept failed")?;
        let router = router.clone();
        let profile = profile.clone();
        tokio::spawn(async move {
            info!(peer = %peer, "Client connected");
            let (reader, writer) = stream.into_split();
            if let Err(e) = serve_connection(router, profile.as_deref(), reader, writer).await {
                warn!(peer = %peer, "Session ended with error: {:#}", e);
            }
        });
    }
}
