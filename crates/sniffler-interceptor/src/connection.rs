//! The per-connection duplex pipeline (§4.2 "Connection handling").

use sniffler_core::events::Event;
use sniffler_core::model::{ConnectionInfo, OperationStatus, Protocol};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::engine::ClientState;
use crate::pipeline::{self, Outcome};
use crate::registry::{ListenerState, Registry};

const READ_CHUNK: usize = 64 * 1024;

fn protocol_tag(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Http => "http",
        Protocol::Postgresql => "postgresql",
        Protocol::Mysql => "mysql",
        Protocol::Sqlserver => "sqlserver",
        Protocol::Mongodb => "mongodb",
        Protocol::Redis => "redis",
    }
}

/// Drive one accepted client connection for its whole lifetime: connect
/// upstream, pump both directions, process operations, and clean up on
/// close. Runs until either side closes or errors.
pub async fn run(registry: Arc<Registry>, listener: Arc<ListenerState>, protocol: Protocol, port: u16, mut client: TcpStream, upstream_host: String, upstream_port: u16) {
    let connection_id = ConnectionInfo::new_id(protocol_tag(protocol));
    registry.adjust_active_connections(&listener, 1);

    let upstream = match TcpStream::connect((upstream_host.as_str(), upstream_port)).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(port, %upstream_host, upstream_port, error = %err, "upstream connect failed; closing client connection");
            listener.events.publish(Event::Error {
                port: Some(port),
                kind: "UpstreamError".to_string(),
                message: format!("{:?}: {err}", pipeline::classify_connect_error(&err)),
            });
            let _ = client.shutdown().await;
            registry.adjust_active_connections(&listener, -1);
            return;
        }
    };

    let connection_info = ConnectionInfo {
        id: connection_id.clone(),
        listener_port: port,
        started_at: sniffler_core::model::now_millis(),
        query_count: 0,
        last_activity_at: sniffler_core::model::now_millis(),
    };
    listener.events.publish(Event::ConnectionOpened { port, connection: connection_info });

    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let mut client_buf: Vec<u8> = Vec::new();
    let mut server_buf: Vec<u8> = Vec::new();
    let mut client_state = ClientState::new(protocol);
    let mut pending_by_request_id: HashMap<u32, String> = HashMap::new();

    let mut client_tmp = vec![0u8; READ_CHUNK];
    let mut server_tmp = vec![0u8; READ_CHUNK];

    let close_reason = loop {
        let settings = registry.settings.read().expect("settings lock poisoned").clone();
        tokio::select! {
            biased;

            () = listener.shutdown.notified() => {
                break None;
            }

            result = client_read.read(&mut client_tmp) => {
                match result {
                    Ok(0) => break None,
                    Ok(n) => {
                        client_buf.extend_from_slice(&client_tmp[..n]);
                        let (ops, consumed) = crate::engine::parse_client(protocol, &client_buf, &mut client_state);
                        let mut any_mocked = false;
                        for op in ops {
                            let request_id = op.request_id;
                            match pipeline::process_client_operation(&settings, &listener, protocol, port, &connection_id, op) {
                                Outcome::Dropped | Outcome::Deduplicated(_) => {}
                                Outcome::Forward(operation) => {
                                    if let Some(rid) = request_id {
                                        if operation.status == OperationStatus::Pending {
                                            pending_by_request_id.insert(rid, operation.id.clone());
                                        }
                                    }
                                }
                                Outcome::Mocked { response_bytes, .. } => {
                                    any_mocked = true;
                                    if client_write.write_all(&response_bytes).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        client_buf.drain(..consumed);
                        if !any_mocked && upstream_write.write_all(&client_tmp[..n]).await.is_err() {
                            break None;
                        }
                    }
                    Err(err) => break Some(err.to_string()),
                }
            }

            result = upstream_read.read(&mut server_tmp) => {
                match result {
                    Ok(0) => break None,
                    Ok(n) => {
                        server_buf.extend_from_slice(&server_tmp[..n]);
                        let (responses, consumed) = crate::engine::parse_server(protocol, &server_buf);
                        for response in responses {
                            pipeline::resolve_server_response(&settings, &listener, port, &connection_id, response, &mut pending_by_request_id);
                        }
                        server_buf.drain(..consumed);
                        if client_write.write_all(&server_tmp[..n]).await.is_err() {
                            break None;
                        }
                    }
                    Err(err) => break Some(err.to_string()),
                }
            }
        }
    };

    if let Some(message) = close_reason {
        let mut ops = listener.operations.lock().expect("operations lock poisoned");
        for op in ops.iter_mut() {
            if op.connection_id == connection_id && op.status == OperationStatus::Pending {
                op.resolve_failed(message.clone());
            }
        }
    }

    listener.events.publish(Event::ConnectionClosed { port, connection_id });
    registry.adjust_active_connections(&listener, -1);
}
