//! The axum-fronted capture side and reqwest-driven forwarding side of the
//! HTTP listener, wired through `sniffler-interceptor`'s operation
//! pipeline so mocking, deduplication, and the auto-save/auto-replace
//! hooks behave the same as the raw-TCP listeners.

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use sniffler_core::fingerprint;
use sniffler_core::model::{now_millis, Operation, Protocol, RunState};
use sniffler_core::{Error, Result};
use sniffler_interceptor::pipeline::{self, Outcome};
use sniffler_interceptor::{ListenerState, Registry};
use sniffler_proto::ParsedOp;
use std::net::SocketAddr;
use std::sync::Arc;

const MOCK_HEADER: &str = "x-sniffler-mock";

#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
    listener: Arc<ListenerState>,
    port: u16,
    upstream_base: String,
    client: reqwest::Client,
}

/// Bind the listener's port and serve HTTP reverse-proxy traffic until
/// `sniffler_interceptor::lifecycle::stop` signals shutdown. A bind
/// failure is fatal, matching the other five listeners (§4.2); an upstream
/// that cannot be reached only fails the individual request, via a `502`.
pub async fn start(registry: Arc<Registry>, state: Arc<ListenerState>) -> Result<()> {
    let (port, upstream_host, upstream_port) = {
        let meta = state.snapshot();
        (meta.port, meta.upstream_host.clone(), meta.upstream_port)
    };

    let tcp_listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| Error::bind(port, e.to_string()))?;

    {
        let mut meta = state.meta.write().expect("listener metadata lock poisoned");
        meta.state = RunState::Running;
        meta.was_running = true;
        meta.last_started_at = Some(now_millis());
    }

    let app_state = AppState {
        registry,
        listener: state.clone(),
        port,
        upstream_base: format!("http://{upstream_host}:{upstream_port}"),
        client: reqwest::Client::new(),
    };
    let app = Router::new().fallback(any(proxy_handler)).with_state(app_state);
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    tokio::spawn(async move {
        let result = axum::serve(tcp_listener, make_service)
            .with_graceful_shutdown(async move { state.shutdown.notified().await })
            .await;
        if let Err(err) = result {
            tracing::warn!(port, error = %err, "http listener exited with error");
        }
    });
    Ok(())
}

async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let url = uri.path_and_query().map(|pq| pq.as_str().to_string()).unwrap_or_else(|| uri.path().to_string());
    let settings = state.registry.settings.read().expect("settings lock poisoned").clone();
    let parsed = ParsedOp {
        fingerprint: fingerprint::http(method.as_str(), &url),
        op_type: fingerprint::classify_http(method.as_str()),
        params: capture_params(&method, &url, &headers, &body),
        request_id: None,
        is_auth: false,
    };
    let connection_id = format!("http-{addr}");

    match pipeline::process_client_operation(&settings, &state.listener, Protocol::Http, state.port, &connection_id, parsed) {
        Outcome::Dropped | Outcome::Deduplicated(_) => forward(&state, &method, &url, &headers, &body).await,
        Outcome::Mocked { operation, .. } => mocked_response(&operation),
        Outcome::Forward(operation) => match forward_and_capture(&state, &method, &url, &headers, &body).await {
            Ok((status, resp_headers, resp_body)) => {
                let response_json = serde_json::json!({
                    "status": status.as_u16(),
                    "headers": headers_to_json(&resp_headers),
                    "body": body_to_json(&resp_body),
                });
                pipeline::finish_forwarded_operation(&settings, &state.listener, state.port, &operation.id, Ok(response_json));
                build_response(status, resp_headers, resp_body)
            }
            Err(message) => {
                pipeline::finish_forwarded_operation(&settings, &state.listener, state.port, &operation.id, Err(message.clone()));
                (StatusCode::BAD_GATEWAY, message).into_response()
            }
        },
    }
}

fn capture_params(method: &Method, url: &str, headers: &HeaderMap, body: &Bytes) -> serde_json::Value {
    serde_json::json!({
        "method": method.as_str(),
        "url": url,
        "headers": headers_to_json(headers),
        "body": body_to_json(body),
    })
}

fn headers_to_json(headers: &HeaderMap) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        if let Ok(text) = value.to_str() {
            map.insert(name.as_str().to_string(), serde_json::Value::String(text.to_string()));
        }
    }
    serde_json::Value::Object(map)
}

fn body_to_json(body: &Bytes) -> serde_json::Value {
    if body.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_slice(body).unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(body).into_owned()))
}

/// Forward without operation tracking: used for dropped/deduplicated
/// requests, which the raw-TCP pump forwards unconditionally too.
async fn forward(state: &AppState, method: &Method, url: &str, headers: &HeaderMap, body: &Bytes) -> Response {
    match forward_and_capture(state, method, url, headers, body).await {
        Ok((status, resp_headers, resp_body)) => build_response(status, resp_headers, resp_body),
        Err(message) => (StatusCode::BAD_GATEWAY, message).into_response(),
    }
}

async fn forward_and_capture(
    state: &AppState,
    method: &Method,
    url: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> std::result::Result<(StatusCode, HeaderMap, Bytes), String> {
    let target = format!("{}{}", state.upstream_base, url);
    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes()).map_err(|e| e.to_string())?;
    let mut builder = state.client.request(reqwest_method, &target);
    for (name, value) in headers {
        if name == axum::http::header::HOST {
            continue;
        }
        if let Ok(text) = value.to_str() {
            builder = builder.header(name.as_str(), text);
        }
    }
    let response = builder.body(body.clone()).send().await.map_err(|e| e.to_string())?;
    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut resp_headers = HeaderMap::new();
    for (name, value) in response.headers() {
        if let (Ok(header_name), Ok(header_value)) = (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_bytes())) {
            resp_headers.insert(header_name, header_value);
        }
    }
    let resp_body = response.bytes().await.map_err(|e| e.to_string())?;
    Ok((status, resp_headers, resp_body))
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    builder.body(axum::body::Body::from(body)).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Build the client-facing response for a mock hit, injecting the
/// `X-Sniffler-Mock: true` header (§4.1.1).
fn mocked_response(operation: &Operation) -> Response {
    let Some(response) = &operation.response else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let status = response
        .get("status")
        .and_then(serde_json::Value::as_u64)
        .and_then(|n| u16::try_from(n).ok())
        .and_then(|n| StatusCode::from_u16(n).ok())
        .unwrap_or(StatusCode::OK);

    let mut builder = Response::builder().status(status);
    if let Some(serde_json::Value::Object(header_map)) = response.get("headers") {
        for (key, value) in header_map {
            if let Some(text) = value.as_str() {
                builder = builder.header(key, text);
            }
        }
    }
    builder = builder.header(MOCK_HEADER, "true");

    let body_bytes = match response.get("body") {
        Some(serde_json::Value::String(text)) => text.clone().into_bytes(),
        Some(other) => serde_json::to_vec(other).unwrap_or_default(),
        None => Vec::new(),
    };
    builder.body(axum::body::Body::from(body_bytes)).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mocked_response_sets_header_and_status() {
        let mut operation = Operation::new_pending(
            "op1".to_string(),
            "conn1".to_string(),
            8080,
            Protocol::Http,
            "GET:/users".to_string(),
            serde_json::json!({}),
            sniffler_core::model::OperationType::Read,
        );
        operation.resolve_success(serde_json::json!({
            "status": 201,
            "headers": {"content-type": "application/json"},
            "body": {"ok": true},
        }));
        let response = mocked_response(&operation);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get(MOCK_HEADER).unwrap(), "true");
    }

    #[test]
    fn body_to_json_falls_back_to_string_on_non_json() {
        let value = body_to_json(&Bytes::from_static(b"not json"));
        assert_eq!(value, serde_json::Value::String("not json".to_string()));
    }

    #[test]
    fn empty_body_is_null() {
        assert_eq!(body_to_json(&Bytes::new()), serde_json::Value::Null);
    }
}
