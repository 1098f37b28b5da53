//! Gateway liveness probe.

use std::time::Duration;
use tokio_tungstenite::connect_async;
use tracing::debug;

/// WebSocket endpoint of a gateway.
pub fn gateway_url(host: &str, port: u16) -> String {
    format!("ws://{}:{}/ws", host, port)
}

/// Whether a WebSocket handshake with the gateway completes within `timeout`.
///
/// Only liveness is checked; the connection is closed right after the handshake.
pub async fn probe_gateway(host: &str, port: u16, timeout: Duration) -> bool {
    let url = gateway_url(host, port);
    match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
        Ok(Ok((mut stream, _response))) => {
            let _ = stream.close(None).await;
            true
        }
        Ok(Err(e)) => {
            debug!(url = %url, error = %e, "Gateway probe failed");
            false
        }
        Err(_) => {
            debug!(url = %url, "Gateway probe timed out");
            false
        }
    }
}
