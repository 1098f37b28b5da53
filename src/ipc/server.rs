//! TCP server for the automation link.
//!
//! One accept task, one task per connection. Frames are newline-delimited
//! JSON envelopes. Every request gets exactly one response; a malformed
//! message is answered with an error and the connection stays open. Only an
//! oversized frame ends the connection.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handlers::HandlerRegistry;
use super::protocol::{Envelope, MessageKind};

/// Upper bound for one frame; screenshots travel host-to-sandbox only.
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct Listening {
    addr: SocketAddr,
    token: CancellationToken,
    accept: JoinHandle<()>,
}

pub struct AutomationServer {
    host: String,
    port: Mutex<u16>,
    handlers: Arc<HandlerRegistry>,
    listening: tokio::sync::Mutex<Option<Listening>>,
}

impl AutomationServer {
    pub fn new(host: impl Into<String>, port: u16, handlers: HandlerRegistry) -> Self {
        Self {
            host: host.into(),
            port: Mutex::new(port),
            handlers: Arc::new(handlers),
            listening: tokio::sync::Mutex::new(None),
        }
    }

    /// Configured port (0 binds an ephemeral one).
    pub fn port(&self) -> u16 {
        self.port.lock().map(|p| *p).unwrap_or_default()
    }

    pub async fn is_running(&self) -> bool {
        self.listening.lock().await.is_some()
    }

    /// Bound address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listening.lock().await.as_ref().map(|l| l.addr)
    }

    /// Bind and start accepting. A running server is left as is.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut listening = self.listening.lock().await;
        if let Some(current) = listening.as_ref() {
            return Ok(current.addr);
        }

        let bind = format!("{}:{}", self.host, self.port());
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("Failed to bind automation server on {}", bind))?;
        let addr = listener.local_addr()?;
        let token = CancellationToken::new();
        let accept = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.handlers),
            token.clone(),
        ));

        info!(addr = %addr, "Automation server listening");
        *listening = Some(Listening { addr, token, accept });
        Ok(addr)
    }

    /// Close the listener and every live connection.
    pub async fn stop(&self) {
        let current = self.listening.lock().await.take();
        let Some(current) = current else {
            return;
        };
        current.token.cancel();
        let mut accept = current.accept;
        if tokio::time::timeout(STOP_TIMEOUT, &mut accept).await.is_err() {
            warn!("Automation server did not stop in time, aborting");
            accept.abort();
        }
        info!(addr = %current.addr, "Automation server stopped");
    }

    /// Move to a new port: stop, rebind, restart if it was running.
    pub async fn set_port(&self, port: u16) -> Result<()> {
        let was_running = self.is_running().await;
        self.stop().await;
        if let Ok(mut current) = self.port.lock() {
            *current = port;
        }
        if was_running {
            self.start().await?;
        }
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, handlers: Arc<HandlerRegistry>, token: CancellationToken) {
    let mut connections = tokio::task::JoinSet::new();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Automation client connected");
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        Arc::clone(&handlers),
                        token.child_token(),
                    ));
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            // Reap finished connections.
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drop(listener);
    while connections.join_next().await.is_some() {}
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handlers: Arc<HandlerRegistry>,
    token: CancellationToken,
) {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = framed.next() => frame,
        };
        let line = match frame {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                warn!(peer = %peer, error = %e, "Unreadable frame");
                let reply = Envelope::response_err("", format!("Invalid frame: {}", e));
                if let Ok(text) = reply.to_line() {
                    let _ = framed.send(text).await;
                }
                break;
            }
            None => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = dispatch(&handlers, &line).await;
        let text = match reply.to_line() {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "Failed to encode response");
                continue;
            }
        };
        if let Err(e) = framed.send(text).await {
            debug!(peer = %peer, error = %e, "Client went away");
            break;
        }
    }
    debug!(peer = %peer, "Automation client disconnected");
}

/// Decode one frame, run its handler, build the response.
pub async fn dispatch(handlers: &HandlerRegistry, line: &str) -> Envelope {
    let envelope = match Envelope::from_line(line) {
        Ok(envelope) => envelope,
        Err(e) => return Envelope::response_err("", format!("Invalid message: {}", e)),
    };
    if envelope.kind != MessageKind::Request {
        return Envelope::response_err(&envelope.id, "Expected a request");
    }
    let request = match envelope.request_payload() {
        Ok(request) => request,
        Err(e) => return Envelope::response_err(&envelope.id, format!("Invalid request: {}", e)),
    };
    let Some(handler) = handlers.get(&request.action) else {
        return Envelope::response_err(&envelope.id, format!("Unknown action: {}", request.action));
    };

    let action = request.action.clone();
    let params = request.params;
    match tokio::task::spawn_blocking(move || handler(&params)).await {
        Ok(Ok(result)) => Envelope::response_ok(&envelope.id, result),
        Ok(Err(e)) => {
            debug!(action = %action, error = %e, "Action failed");
            Envelope::response_err(&envelope.id, format!("{:#}", e))
        }
        Err(e) => {
            error!(action = %action, error = %e, "Action handler panicked");
            Envelope::response_err(&envelope.id, format!("Action {} failed unexpectedly", action))
        }
    }
}
