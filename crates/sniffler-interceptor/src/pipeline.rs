//! Operation processing pipeline (§4.2 "Operation processing") and
//! response correlation.

use sniffler_core::events::Event;
use sniffler_core::model::{now_millis, Operation, OperationStatus, Protocol};
use sniffler_core::{Settings, UpstreamErrorType};
use sniffler_proto::{ParsedOp, ParsedResponse};
use std::collections::HashMap;

use crate::registry::ListenerState;

/// What a caller should do with the raw bytes that produced a parsed
/// client operation.
pub enum Outcome {
    /// The operation was filtered out before ever being recorded (empty,
    /// auth traffic, or a configured health check).
    Dropped,
    /// An identical fingerprint was already in flight on another
    /// connection within the deduplication window; nothing new recorded.
    Deduplicated(Operation),
    /// An enabled mock answered the request. The slice must be swallowed,
    /// not forwarded, and `response_bytes` written to the client instead.
    Mocked {
        /// The (already-resolved) recorded operation.
        operation: Operation,
        /// Wire bytes to write back to the client.
        response_bytes: Vec<u8>,
    },
    /// No mock applied; forward the originating slice to upstream as-is.
    Forward(Operation),
}

fn replace_operation(listener: &ListenerState, updated: &Operation) {
    let mut ops = listener.operations.lock().expect("operations lock poisoned");
    if let Some(slot) = ops.iter_mut().find(|o| o.id == updated.id) {
        *slot = updated.clone();
    }
}

/// Steps 1-5 of §4.2 "Operation processing", run for one parsed client
/// operation.
pub fn process_client_operation(
    settings: &Settings,
    listener: &ListenerState,
    protocol: Protocol,
    port: u16,
    connection_id: &str,
    parsed: ParsedOp,
) -> Outcome {
    // Step 1: drop empty/auth/health-check traffic.
    if parsed.is_auth || parsed.fingerprint.trim().is_empty() {
        return Outcome::Dropped;
    }
    if settings.is_health_check(&parsed.fingerprint) {
        return Outcome::Dropped;
    }

    // Step 2: deduplicate against recent history from other connections.
    if settings.enable_deduplication {
        let ops = listener.operations.lock().expect("operations lock poisoned");
        let now = now_millis();
        if let Some(existing) = ops.iter().rev().find(|o| {
            o.fingerprint == parsed.fingerprint
                && o.connection_id != connection_id
                && now.saturating_sub(o.started_at) <= settings.deduplication_window_ms
        }) {
            return Outcome::Deduplicated(existing.clone());
        }
    }

    // Step 3: record as pending.
    let mut operation = Operation::new_pending(
        uuid::Uuid::new_v4().to_string(),
        connection_id.to_string(),
        port,
        protocol,
        parsed.fingerprint.clone(),
        parsed.params.clone(),
        parsed.op_type,
    );
    {
        let mut ops = listener.operations.lock().expect("operations lock poisoned");
        ops.push_back(operation.clone());
        while ops.len() > settings.max_request_history.max(1) {
            ops.pop_front();
        }
    }
    listener.events.publish(Event::OperationReceived { port, operation: operation.clone() });
    listener.meta.write().expect("listener metadata lock poisoned").counters.total_operations += 1;

    // Step 4: consult the mock store.
    if !settings.testing_mode {
        let mock = {
            let store = listener.mocks.lock().expect("mock store lock poisoned");
            store.find_enabled(&parsed.fingerprint).cloned()
        };
        if let Some(mock) = mock {
            let response_bytes = crate::engine::synthesize_response(protocol, &mock, parsed.op_type, parsed.request_id);
            let is_error = mock.response.get("error").is_some_and(|v| !v.is_null());
            if is_error {
                operation.resolve_failed("mocked error response");
            } else {
                operation.resolve_success(mock.response.clone());
            }
            operation.mocked_by = Some(mock.id.clone());
            operation.is_mocked = true;
            replace_operation(listener, &operation);

            {
                let mut store = listener.mocks.lock().expect("mock store lock poisoned");
                store.update(&mock.fingerprint, |m| m.usage_count += 1);
            }
            {
                let mut meta = listener.meta.write().expect("listener metadata lock poisoned");
                meta.counters.mocks_served += 1;
                if is_error {
                    meta.counters.failed_operations += 1;
                } else {
                    meta.counters.successful_operations += 1;
                }
            }
            listener.events.publish(Event::MockServed {
                port,
                mock_id: mock.id.clone(),
                operation_id: operation.id.clone(),
            });
            listener.events.publish(Event::OperationResponse { port, operation: operation.clone() });
            return Outcome::Mocked { operation, response_bytes };
        }
    }

    // Step 5: nothing applies; let the caller forward the original bytes.
    Outcome::Forward(operation)
}

/// Attach a server-originated response to the operation it answers (§4.2
/// "Correlation") and run the auto-save/auto-replace hooks (§4.3) on
/// success. `pending_by_request_id` is the connection-local map from an
/// engine-provided request id (Mongo `response_to`) to operation id; it is
/// consulted before falling back to FIFO.
pub fn resolve_server_response(
    settings: &Settings,
    listener: &ListenerState,
    port: u16,
    connection_id: &str,
    response: ParsedResponse,
    pending_by_request_id: &mut HashMap<u32, String>,
) {
    let operation_id = response
        .response_to
        .and_then(|rid| pending_by_request_id.remove(&rid))
        .or_else(|| {
            let ops = listener.operations.lock().expect("operations lock poisoned");
            ops.iter()
                .rev()
                .find(|o| o.connection_id == connection_id && o.status == OperationStatus::Pending)
                .map(|o| o.id.clone())
        });

    let Some(operation_id) = operation_id else { return };

    let resolved = {
        let mut ops = listener.operations.lock().expect("operations lock poisoned");
        let Some(op) = ops.iter_mut().find(|o| o.id == operation_id) else { return };
        if response.is_error {
            let message = response
                .payload
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("protocol-level error")
                .to_string();
            op.resolve_failed(message);
        } else {
            op.resolve_success(response.payload.clone());
        }
        op.clone()
    };
    {
        let mut meta = listener.meta.write().expect("listener metadata lock poisoned");
        match resolved.status {
            OperationStatus::Success => meta.counters.successful_operations += 1,
            OperationStatus::Failed | OperationStatus::Timeout => meta.counters.failed_operations += 1,
            OperationStatus::Pending => {}
        }
    }
    listener.events.publish(Event::OperationResponse { port, operation: resolved.clone() });

    if resolved.status == OperationStatus::Success {
        run_mock_hooks(settings, listener, port, &resolved);
    }
}

/// Resolve a forwarded operation directly from a structured response value,
/// for engines that get their own response representation rather than a
/// `sniffler_proto::ParsedResponse` correlated off the wire (the HTTP
/// engine, whose response arrives as a `reqwest::Response` it has already
/// read to completion). Mirrors `resolve_server_response`'s
/// correlation-independent tail: counters, the `operation-response` event,
/// and the auto-save/auto-replace hooks.
pub fn finish_forwarded_operation(
    settings: &Settings,
    listener: &ListenerState,
    port: u16,
    operation_id: &str,
    outcome: Result<serde_json::Value, String>,
) -> Option<Operation> {
    let resolved = {
        let mut ops = listener.operations.lock().expect("operations lock poisoned");
        let op = ops.iter_mut().find(|o| o.id == operation_id)?;
        match outcome {
            Ok(response) => op.resolve_success(response),
            Err(message) => op.resolve_failed(message),
        }
        op.clone()
    };
    {
        let mut meta = listener.meta.write().expect("listener metadata lock poisoned");
        match resolved.status {
            OperationStatus::Success => meta.counters.successful_operations += 1,
            OperationStatus::Failed | OperationStatus::Timeout => meta.counters.failed_operations += 1,
            OperationStatus::Pending => {}
        }
    }
    listener.events.publish(Event::OperationResponse { port, operation: resolved.clone() });
    if resolved.status == OperationStatus::Success {
        run_mock_hooks(settings, listener, port, &resolved);
    }
    Some(resolved)
}

/// `auto_save_as_mocks` and `auto_replace_on_difference` (§4.3), run after
/// a real (non-mocked) operation resolves successfully.
fn run_mock_hooks(settings: &Settings, listener: &ListenerState, port: u16, operation: &Operation) {
    let Some(response) = &operation.response else { return };
    let mut store = listener.mocks.lock().expect("mock store lock poisoned");

    if store.find(&operation.fingerprint).is_none() {
        if settings.auto_save_as_mocks {
            if let Some(mock) = store.auto_create(&operation.fingerprint, port, response.clone()) {
                listener.events.publish(Event::MockAutoCreated { port, mock_id: mock.id });
            }
        }
        return;
    }

    if let Some((comparison, replaced)) = store.compare_and_maybe_replace(&operation.fingerprint, response, settings.auto_replace_on_difference) {
        if !comparison.is_identical() {
            let mock_id = store.find(&operation.fingerprint).map(|m| m.id.clone()).unwrap_or_default();
            listener.events.publish(Event::MockDifferenceDetected {
                port,
                mock_id: mock_id.clone(),
                comparison,
            });
            if replaced {
                listener.events.publish(Event::MockAutoReplaced { port, mock_id });
            }
        }
    }
}

/// Mark every operation still `pending` past `stale_pending_timeout_ms` as
/// `timeout` (§4.2 "Stale-pending sweep"), returning the operations that
/// were swept so the caller can publish `operation-response` for each.
pub fn sweep_stale_pending(listener: &ListenerState, timeout_ms: u64) -> Vec<Operation> {
    let now = now_millis();
    let mut swept = Vec::new();
    let mut ops = listener.operations.lock().expect("operations lock poisoned");
    for op in ops.iter_mut() {
        if op.status == OperationStatus::Pending && now.saturating_sub(op.started_at) > timeout_ms {
            op.resolve_timeout("stale-pending sweep");
            swept.push(op.clone());
        }
    }
    drop(ops);
    if !swept.is_empty() {
        listener.meta.write().expect("listener metadata lock poisoned").counters.failed_operations += swept.len() as u64;
    }
    swept
}

/// Classify a connect failure for `test_connection` / non-fatal `start()`
/// failures (§4.2 "Error semantics").
pub fn classify_connect_error(err: &std::io::Error) -> UpstreamErrorType {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::ConnectionRefused => UpstreamErrorType::ServiceNotRunning,
        ErrorKind::TimedOut => UpstreamErrorType::Timeout,
        ErrorKind::NotFound | ErrorKind::InvalidInput => UpstreamErrorType::HostnameNotFound,
        _ => UpstreamErrorType::ConnectionError,
    }
}
