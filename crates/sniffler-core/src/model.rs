//! Core data model (§3): listeners, connections, operations, mocks.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// The wire protocol a listener speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// HTTP/1.1 reverse proxy.
    Http,
    /// PostgreSQL frontend/backend protocol.
    Postgresql,
    /// MySQL client/server protocol.
    Mysql,
    /// Microsoft SQL Server TDS.
    Sqlserver,
    /// MongoDB wire protocol.
    Mongodb,
    /// Redis RESP.
    Redis,
}

impl Protocol {
    /// Parse the protocol tag used on the command surface (`listener.create`).
    pub fn parse_tag(tag: &str) -> crate::Result<Self> {
        match tag {
            "http" => Ok(Self::Http),
            "postgresql" => Ok(Self::Postgresql),
            "mysql" => Ok(Self::Mysql),
            "sqlserver" => Ok(Self::Sqlserver),
            "mongodb" => Ok(Self::Mongodb),
            "redis" => Ok(Self::Redis),
            other => Err(crate::Error::config(format!("unknown protocol: {other}"))),
        }
    }
}

/// Run state of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Created but not yet accepting connections.
    Stopped,
    /// Bound and accepting connections.
    Running,
}

/// Aggregate, monotonically-increasing counters for a listener (except
/// `active_connections`, which may decrease).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Counters {
    /// Total operations observed.
    pub total_operations: u64,
    /// Operations that resolved `success`.
    pub successful_operations: u64,
    /// Operations that resolved `failed` or `timeout`.
    pub failed_operations: u64,
    /// Operations served from the mock store.
    pub mocks_served: u64,
    /// Currently open client connections.
    pub active_connections: u64,
}

/// A named configuration bound to a local port and an upstream `(host,
/// port)` pair (§3 `Listener`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listener {
    /// Unique id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Local port. Primary key: unique across listeners.
    pub port: u16,
    /// Upstream host.
    pub upstream_host: String,
    /// Upstream port.
    pub upstream_port: u16,
    /// Protocol tag.
    pub protocol: Protocol,
    /// Current run state.
    pub state: RunState,
    /// Whether this listener should start automatically.
    pub auto_start: bool,
    /// Whether the listener was running the last time state was persisted.
    pub was_running: bool,
    /// Creation timestamp (epoch millis).
    pub created_at: u64,
    /// Last-started timestamp (epoch millis), if ever started.
    pub last_started_at: Option<u64>,
    /// Aggregate counters.
    pub counters: Counters,
}

impl Listener {
    /// Construct a new, stopped listener.
    pub fn new(id: String, name: String, port: u16, upstream_host: String, upstream_port: u16, protocol: Protocol) -> Self {
        Self {
            id,
            name,
            port,
            upstream_host,
            upstream_port,
            protocol,
            state: RunState::Stopped,
            auto_start: false,
            was_running: false,
            created_at: now_millis(),
            last_started_at: None,
            counters: Counters::default(),
        }
    }

    /// Self-loop guard: a listener cannot proxy to itself on the same
    /// host+port (§3 invariant, §4.1.1 circular-loop guard, §8 boundary
    /// behavior).
    pub fn is_self_loop(&self) -> bool {
        let upstream_is_local = matches!(
            self.upstream_host.as_str(),
            "localhost" | "127.0.0.1" | "::1"
        );
        upstream_is_local && self.upstream_port == self.port
    }

    /// §9 "Dual auto-start logic", defined precisely:
    /// `auto_start_effective = global_autostart AND (per_proxy.auto_start != false)
    /// AND (per_proxy.was_running OR per_proxy.auto_start = true)`.
    pub fn auto_start_effective(&self, global_autostart: bool) -> bool {
        global_autostart && self.auto_start && (self.was_running || self.auto_start)
    }
}

/// Status of an [`Operation`]. Transitions only into one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// Awaiting a response.
    Pending,
    /// Resolved successfully.
    Success,
    /// Resolved with an error.
    Failed,
    /// Resolved via the stale-pending sweep or a read deadline.
    Timeout,
}

/// Coarse classifier for an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    /// SQL `SELECT`.
    Select,
    /// SQL `INSERT`.
    Insert,
    /// SQL `UPDATE`.
    Update,
    /// SQL `DELETE`.
    Delete,
    /// Mongo `find`-family command.
    Find,
    /// Generic read (Redis `READ` class, e.g.).
    Read,
    /// Generic write.
    Write,
    /// Connection-management command (auth, hello, ping, ...).
    Connection,
    /// Server-administration command.
    Server,
    /// A frame that failed to parse.
    ParseError,
}

/// Error detail attached to a failed or timed-out operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationError {
    /// Human-readable message.
    pub message: String,
    /// A hex-encoded prefix of the offending bytes, present for
    /// `parse_error` operations.
    pub hex_prefix: Option<String>,
}

/// Outcome of comparing a live response against its fingerprint's stored
/// mock (§3 `MockComparison`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockComparison {
    /// Whether the status code matched exactly.
    pub status_code_matches: bool,
    /// Whether all non-ignored headers matched.
    pub headers_match: bool,
    /// Whether the body matched (JSON-canonical or raw-byte comparison).
    pub body_matches: bool,
    /// Individual differences found.
    pub differences: Vec<Difference>,
}

impl MockComparison {
    /// True if every category matched.
    pub fn is_identical(&self) -> bool {
        self.status_code_matches && self.headers_match && self.body_matches
    }

    /// A textual summary enumerating which categories differ.
    pub fn summary(&self) -> String {
        if self.is_identical() {
            return "identical".to_string();
        }
        let mut parts = Vec::new();
        if !self.status_code_matches {
            parts.push("status code differs");
        }
        if !self.headers_match {
            parts.push("headers differ");
        }
        if !self.body_matches {
            parts.push("body differs");
        }
        parts.join(", ")
    }
}

/// The kind of thing that differed between a live response and its mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DifferenceKind {
    /// HTTP/protocol status code.
    StatusCode,
    /// A header value or presence.
    Header,
    /// The response body.
    Body,
}

/// One concrete difference reported by [`MockComparison`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Difference {
    /// Category of the difference.
    pub kind: DifferenceKind,
    /// Expected value (from the stored mock), as text.
    pub expected: String,
    /// Actual value (from the live response), as text.
    pub actual: String,
    /// Field name, for header differences.
    pub field: Option<String>,
}

/// The normalized record for one client-originated request (§3
/// `Operation`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Unique id.
    pub id: String,
    /// Owning connection id.
    pub connection_id: String,
    /// Owning listener port.
    pub listener_port: u16,
    /// Protocol tag.
    pub protocol: Protocol,
    /// Textual fingerprint.
    pub fingerprint: String,
    /// Structured parameters extracted from the request, if any.
    pub params: serde_json::Value,
    /// Coarse classifier.
    pub op_type: OperationType,
    /// Current status.
    pub status: OperationStatus,
    /// Start timestamp (epoch millis).
    pub started_at: u64,
    /// Duration in milliseconds, once resolved.
    pub duration_ms: Option<u64>,
    /// Response payload, once resolved successfully.
    pub response: Option<serde_json::Value>,
    /// Error detail, once resolved with failure.
    pub error: Option<OperationError>,
    /// Id of the mock that served this operation, if any.
    pub mocked_by: Option<String>,
    /// Whether this operation was served from the mock store.
    pub is_mocked: bool,
    /// Diff between the live response and the stored mock, if one exists.
    pub mock_comparison: Option<MockComparison>,
    /// Free-form tags attached during processing (`replaced`,
    /// `mock-replaced`, ...).
    pub tags: Vec<String>,
}

impl Operation {
    /// Construct a new `pending` operation.
    pub fn new_pending(
        id: String,
        connection_id: String,
        listener_port: u16,
        protocol: Protocol,
        fingerprint: String,
        params: serde_json::Value,
        op_type: OperationType,
    ) -> Self {
        Self {
            id,
            connection_id,
            listener_port,
            protocol,
            fingerprint,
            params,
            op_type,
            status: OperationStatus::Pending,
            started_at: now_millis(),
            duration_ms: None,
            response: None,
            error: None,
            mocked_by: None,
            is_mocked: false,
            mock_comparison: None,
            tags: Vec::new(),
        }
    }

    /// Resolve with a successful response.
    pub fn resolve_success(&mut self, response: serde_json::Value) {
        self.response = Some(response);
        self.status = OperationStatus::Success;
        self.duration_ms = Some(now_millis().saturating_sub(self.started_at));
    }

    /// Resolve with a failure.
    pub fn resolve_failed(&mut self, message: impl Into<String>) {
        self.error = Some(OperationError {
            message: message.into(),
            hex_prefix: None,
        });
        self.status = OperationStatus::Failed;
        self.duration_ms = Some(now_millis().saturating_sub(self.started_at));
    }

    /// Resolve as timed out (stale-pending sweep or read deadline).
    pub fn resolve_timeout(&mut self, message: impl Into<String>) {
        self.error = Some(OperationError {
            message: message.into(),
            hex_prefix: None,
        });
        self.status = OperationStatus::Timeout;
        self.duration_ms = Some(now_millis().saturating_sub(self.started_at));
    }

    /// True once terminal.
    pub fn is_terminal(&self) -> bool {
        self.status != OperationStatus::Pending
    }
}

/// A structured response, keyed by fingerprint, stored for a listener
/// (§3 `Mock`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mock {
    /// Unique id.
    pub id: String,
    /// Owning listener port.
    pub listener_port: u16,
    /// Normalized fingerprint this mock answers.
    pub fingerprint: String,
    /// Structured response payload (protocol-specific shape).
    pub response: serde_json::Value,
    /// Whether this mock is eligible to be served.
    pub enabled: bool,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Human-assigned name.
    pub name: Option<String>,
    /// Human-assigned description.
    pub description: Option<String>,
    /// Creation timestamp (epoch millis). Preserved across updates.
    pub created_at: u64,
    /// Last-update timestamp (epoch millis).
    pub updated_at: u64,
    /// Execution-time hint in milliseconds, for latency simulation.
    pub execution_time_hint_ms: Option<u64>,
    /// Usage count, derived from served operations.
    pub usage_count: u64,
}

impl Mock {
    /// Construct a new mock. New mocks default to `enabled=false`
    /// unless explicitly created enabled by the caller.
    pub fn new(id: String, listener_port: u16, fingerprint: String, response: serde_json::Value, enabled: bool) -> Self {
        let now = now_millis();
        Self {
            id,
            listener_port,
            fingerprint,
            response,
            enabled,
            tags: Vec::new(),
            name: None,
            description: None,
            created_at: now,
            updated_at: now,
            execution_time_hint_ms: None,
            usage_count: 0,
        }
    }
}

/// Lightweight, serializable metadata about an in-progress [`Connection`].
/// The connection's sockets and per-direction buffers live in the
/// interceptor runtime; this is the subset that is safe to put on the
/// event bus or in snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Unique connection id (`{proto}-conn-{now}-{rand}`).
    pub id: String,
    /// Owning listener port.
    pub listener_port: u16,
    /// Connection start timestamp (epoch millis).
    pub started_at: u64,
    /// Number of operations observed on this connection.
    pub query_count: u64,
    /// Last-activity timestamp (epoch millis).
    pub last_activity_at: u64,
}

impl ConnectionInfo {
    /// Build a new connection id of the form `{proto}-conn-{now}-{rand}`.
    pub fn new_id(proto: &str) -> String {
        let rand_suffix: u32 = rand::random();
        format!("{proto}-conn-{}-{:08x}", now_millis(), rand_suffix)
    }
}

/// Current epoch milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Headers ignored during `MockComparison` (§3), case-insensitive.
pub fn is_ignored_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    matches!(
        lower.as_str(),
        "date" | "server" | "connection" | "transfer-encoding" | "x-powered-by" | "x-sniffler-mock"
    ) || lower.starts_with("x-request-")
        || lower.starts_with("x-correlation-")
        || lower.starts_with("x-trace-")
        || lower.starts_with("x-runtime")
}

/// Compare a live HTTP-shaped response against a stored mock's response,
/// both represented as `{status, headers, body}` JSON values (§4.3
/// "Comparison algorithm").
pub fn compare_responses(live: &serde_json::Value, mock: &serde_json::Value) -> MockComparison {
    let mut differences = Vec::new();

    let live_status = live.get("status").and_then(serde_json::Value::as_i64);
    let mock_status = mock.get("status").and_then(serde_json::Value::as_i64);
    let status_code_matches = live_status == mock_status;
    if !status_code_matches {
        differences.push(Difference {
            kind: DifferenceKind::StatusCode,
            expected: mock_status.map_or_else(|| "none".to_string(), |s| s.to_string()),
            actual: live_status.map_or_else(|| "none".to_string(), |s| s.to_string()),
            field: None,
        });
    }

    let empty = serde_json::Map::new();
    let live_headers = live.get("headers").and_then(serde_json::Value::as_object).unwrap_or(&empty);
    let mock_headers = mock.get("headers").and_then(serde_json::Value::as_object).unwrap_or(&empty);

    let mut headers_match = true;
    let mut seen: HashMap<String, ()> = HashMap::new();
    for (key, mock_value) in mock_headers {
        let lower = key.to_ascii_lowercase();
        if is_ignored_header(&lower) || seen.contains_key(&lower) {
            continue;
        }
        seen.insert(lower.clone(), ());
        match live_headers.iter().find(|(k, _)| k.to_ascii_lowercase() == lower) {
            None => {
                headers_match = false;
                differences.push(Difference {
                    kind: DifferenceKind::Header,
                    expected: mock_value.to_string(),
                    actual: "missing".to_string(),
                    field: Some(lower),
                });
            }
            Some((_, live_value)) if live_value != mock_value => {
                headers_match = false;
                differences.push(Difference {
                    kind: DifferenceKind::Header,
                    expected: mock_value.to_string(),
                    actual: live_value.to_string(),
                    field: Some(lower),
                });
            }
            Some(_) => {}
        }
    }

    let live_body = live.get("body");
    let mock_body = mock.get("body");
    let body_matches = bodies_match(live_body, mock_body);
    if !body_matches {
        differences.push(Difference {
            kind: DifferenceKind::Body,
            expected: mock_body.map_or_else(|| "none".to_string(), ToString::to_string),
            actual: live_body.map_or_else(|| "none".to_string(), ToString::to_string),
            field: None,
        });
    }

    MockComparison {
        status_code_matches,
        headers_match,
        body_matches,
        differences,
    }
}

fn bodies_match(live: Option<&serde_json::Value>, mock: Option<&serde_json::Value>) -> bool {
    match (live, mock) {
        (None, None) => true,
        (Some(l), Some(m)) => {
            // Both are already canonical serde_json::Value trees (the
            // engines parse bodies as JSON when they can); comparing the
            // values directly is equivalent to comparing canonical JSON
            // forms. Non-JSON bodies are represented as raw-byte strings
            // and compared as plain equality, satisfying the "otherwise
            // compare raw bytes" fallback.
            l == m
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_loop_detection() {
        let l = Listener::new("1".into(), "x".into(), 8080, "localhost".into(), 8080, Protocol::Http);
        assert!(l.is_self_loop());
        let l2 = Listener::new("2".into(), "x".into(), 8080, "localhost".into(), 9090, Protocol::Http);
        assert!(!l2.is_self_loop());
    }

    #[test]
    fn auto_start_precedence() {
        let mut l = Listener::new("1".into(), "x".into(), 8080, "up".into(), 9090, Protocol::Http);
        l.auto_start = true;
        l.was_running = false;
        assert!(l.auto_start_effective(true));
        assert!(!l.auto_start_effective(false));
        l.auto_start = false;
        assert!(!l.auto_start_effective(true));
    }

    #[test]
    fn operation_lifecycle() {
        let mut op = Operation::new_pending(
            "op1".into(), "conn1".into(), 5432, Protocol::Postgresql,
            "select 1".into(), serde_json::json!({}), OperationType::Select,
        );
        assert_eq!(op.status, OperationStatus::Pending);
        op.resolve_success(serde_json::json!({"rows": []}));
        assert!(op.is_terminal());
        assert_eq!(op.status, OperationStatus::Success);
    }

    #[test]
    fn comparison_ignores_volatile_headers() {
        let live = serde_json::json!({"status": 200, "headers": {"Date": "today", "X-Request-Id": "abc"}, "body": {"n": 1}});
        let mock = serde_json::json!({"status": 200, "headers": {}, "body": {"n": 1}});
        let cmp = compare_responses(&live, &mock);
        assert!(cmp.is_identical());
    }

    #[test]
    fn comparison_detects_body_difference() {
        let live = serde_json::json!({"status": 200, "headers": {}, "body": {"n": 2}});
        let mock = serde_json::json!({"status": 200, "headers": {}, "body": {"n": 1}});
        let cmp = compare_responses(&live, &mock);
        assert!(!cmp.is_identical());
        assert!(!cmp.body_matches);
    }
}
