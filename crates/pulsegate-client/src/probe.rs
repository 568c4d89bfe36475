//! One-shot transport viability probe.
//!
//! [`probe`] answers a single question -- can this environment open a
//! websocket to the given endpoint right now? -- with a hard deadline. It is
//! a diagnostic for fallback decisions, not part of the steady-state
//! channel: each call owns a throwaway connection, and all failure paths
//! resolve `false` so callers need no error handling.

use std::time::Duration;

use futures_util::SinkExt;
use tracing::{debug, warn};

use crate::config::is_websocket_url;

/// Probes transport viability against `url`, resolving within `timeout`.
///
/// Returns `true` iff the websocket handshake completes before the
/// deadline. Unsupported schemes, handshake failures, and timeouts all
/// resolve `false`; the timeout path abandons the in-flight handshake,
/// which closes the underlying socket. Safe to call concurrently -- calls
/// share no state.
#[allow(clippy::cast_possible_truncation)]
pub async fn probe(url: &str, timeout: Duration) -> bool {
    if !is_websocket_url(url) {
        warn!(url = %url, "transport probe: unsupported transport scheme");
        return false;
    }

    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
        Ok(Ok((mut stream, _response))) => {
            // Throwaway connection; close politely, ignore the outcome.
            let _ = stream.send(tungstenite::Message::Close(None)).await;
            let _ = stream.close(None).await;
            debug!(url = %url, "transport probe succeeded");
            true
        }
        Ok(Err(e)) => {
            debug!(url = %url, error = %e, "transport probe failed");
            false
        }
        Err(_elapsed) => {
            warn!(
                url = %url,
                timeout_ms = timeout.as_millis() as u64,
                "transport probe timed out, handshake abandoned"
            );
            false
        }
    }
}
