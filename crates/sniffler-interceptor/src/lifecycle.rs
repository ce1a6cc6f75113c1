//! Listener lifecycle: `start()`/`stop()`, the accept loop, the
//! stale-pending sweep timer, and the `test_connection` probe (§4.2).

use sniffler_core::model::RunState;
use sniffler_core::{Error, Result, UpstreamErrorType};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::registry::{ListenerState, Registry};

const GRACE_MS: u64 = 1000;
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// `start()` (§4.2): binds the listener's port and spawns the accept loop.
/// An upstream that cannot be reached yet is not fatal -- only a bind
/// failure is.
pub async fn start(registry: Arc<Registry>, state: Arc<ListenerState>) -> Result<()> {
    let (port, upstream_host, upstream_port, protocol) = {
        let meta = state.snapshot();
        (meta.port, meta.upstream_host.clone(), meta.upstream_port, meta.protocol)
    };

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| Error::bind(port, e.to_string()))?;

    {
        let mut meta = state.meta.write().expect("listener metadata lock poisoned");
        meta.state = RunState::Running;
        meta.was_running = true;
        meta.last_started_at = Some(sniffler_core::model::now_millis());
    }

    tokio::spawn(accept_loop(registry.clone(), state.clone(), listener, protocol, port, upstream_host, upstream_port));
    tokio::spawn(sweep_loop(registry, state));
    Ok(())
}

async fn accept_loop(
    registry: Arc<Registry>,
    state: Arc<ListenerState>,
    listener: tokio::net::TcpListener,
    protocol: sniffler_core::model::Protocol,
    port: u16,
    upstream_host: String,
    upstream_port: u16,
) {
    loop {
        tokio::select! {
            biased;
            () = state.shutdown.notified() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, _addr)) => {
                        tokio::spawn(crate::connection::run(
                            registry.clone(),
                            state.clone(),
                            protocol,
                            port,
                            socket,
                            upstream_host.clone(),
                            upstream_port,
                        ));
                    }
                    Err(err) => {
                        tracing::warn!(port, error = %err, "accept failed");
                    }
                }
            }
        }
    }
}

async fn sweep_loop(registry: Arc<Registry>, state: Arc<ListenerState>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            biased;
            () = state.shutdown.notified() => break,
            _ = interval.tick() => {
                let timeout_ms = registry.settings.read().expect("settings lock poisoned").stale_pending_timeout_ms;
                let port = state.snapshot().port;
                let swept = crate::pipeline::sweep_stale_pending(&state, timeout_ms);
                for operation in swept {
                    state.events.publish(sniffler_core::events::Event::OperationResponse { port, operation });
                }
            }
        }
    }
}

/// `stop()` (§4.2): stop accepting, signal every owned connection to
/// close, and wait up to `grace_ms` before considering it done. Survivors
/// past the grace period are left to the OS to reap when their sockets
/// error out on the next read/write.
pub async fn stop(state: &Arc<ListenerState>) {
    state.shutdown.notify_waiters();
    tokio::time::sleep(Duration::from_millis(GRACE_MS)).await;
    state.meta.write().expect("listener metadata lock poisoned").state = RunState::Stopped;
}

/// `test_connection()` (§4.2, §6): probe an upstream without creating a
/// listener, returning a structured result instead of propagating an
/// error.
pub async fn test_connection(host: &str, port: u16) -> (bool, String, Option<UpstreamErrorType>) {
    match timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => (true, "connected".to_string(), None),
        Ok(Err(err)) => {
            let kind = crate::pipeline::classify_connect_error(&err);
            (false, err.to_string(), Some(kind))
        }
        Err(_) => (false, "connection attempt timed out".to_string(), Some(UpstreamErrorType::Timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_reports_refused() {
        let (success, _message, error_type) = test_connection("127.0.0.1", 1).await;
        assert!(!success);
        assert!(error_type.is_some());
    }
}
