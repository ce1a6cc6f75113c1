//! `sniffler serve`: the long-running daemon. Everything else in the
//! command surface is a one-shot file mutation; this is the only command
//! that binds sockets and keeps the operation/mock event pipeline flowing
//! to disk (§4.4).

use sniffler_core::events::Event;
use sniffler_core::model::{Listener, Mock, Protocol};
use sniffler_core::{Result, Settings, Store};
use sniffler_interceptor::{lifecycle, ListenerState, Registry};
use std::path::PathBuf;
use std::sync::Arc;

fn mocks_path(port: u16) -> String {
    format!("mocks/mocks-{port}.json")
}

fn requests_path(port: u16) -> String {
    format!("requests/requests-{port}.json")
}

/// Load persisted state into a fresh [`Registry`], start every listener
/// whose `auto_start_effective(global_autostart)` is true, and block until
/// a shutdown signal arrives.
pub async fn run(data_root: PathBuf, global_autostart: bool) -> Result<()> {
    let store = Store::new(data_root);
    let settings: Settings = {
        let mut rows: Vec<Settings> = store.read("settings.json").await?;
        rows.pop().unwrap_or_default()
    };
    let listeners: Vec<Listener> = store.read("proxies.json").await?;

    let registry = Arc::new(Registry::new());
    *registry.settings.write().expect("settings lock poisoned") = settings;

    let mut states = Vec::new();
    for listener in listeners {
        let auto_start = listener.auto_start_effective(global_autostart);
        let protocol = listener.protocol;
        let state = registry.create(listener)?;
        let mocks: Vec<Mock> = store.read(&mocks_path(state.snapshot().port)).await?;
        {
            let mut store_guard = state.mocks.lock().expect("mock store lock poisoned");
            for mock in mocks {
                store_guard.add(mock, true);
            }
        }
        tokio::spawn(spawn_persistence_subscriber(store.clone(), state.clone()));
        if auto_start {
            dispatch_start(protocol, registry.clone(), state.clone()).await?;
        }
        states.push(state);
    }

    tracing::info!(listeners = states.len(), "sniffler serve started");
    wait_for_shutdown_signal().await;
    tracing::info!("shutting down");

    for state in &states {
        lifecycle::stop(state).await;
    }

    let snapshot: Vec<Listener> = states.iter().map(|s| s.snapshot()).collect();
    store.write("proxies.json", &snapshot).await?;
    Ok(())
}

async fn dispatch_start(protocol: Protocol, registry: Arc<Registry>, state: Arc<ListenerState>) -> Result<()> {
    match protocol {
        Protocol::Http => sniffler_http::start(registry, state).await,
        _ => lifecycle::start(registry, state).await,
    }
}

/// Persist `operation-response` and mock-mutation events for one listener
/// as they're published, so a one-shot admin command can read them back
/// without the daemon running.
async fn spawn_persistence_subscriber(store: Store, state: Arc<ListenerState>) {
    let port = state.snapshot().port;
    let mut receiver = state.events.subscribe();
    loop {
        match receiver.recv().await {
            Ok(Event::OperationResponse { operation, .. }) => {
                if let Err(err) = persist_operation(&store, port, operation).await {
                    tracing::warn!(port, error = %err, "failed to persist operation");
                }
            }
            Ok(Event::MockAdded { .. })
            | Ok(Event::MockUpdated { .. })
            | Ok(Event::MockRemoved { .. })
            | Ok(Event::MockToggled { .. })
            | Ok(Event::MockAutoCreated { .. })
            | Ok(Event::MockAutoReplaced { .. }) => {
                if let Err(err) = persist_mocks(&store, port, &state).await {
                    tracing::warn!(port, error = %err, "failed to persist mocks");
                }
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(port, skipped, "persistence subscriber lagged behind event bus");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

const MAX_PERSISTED_OPERATIONS: usize = 1000;

async fn persist_operation(store: &Store, port: u16, operation: sniffler_core::model::Operation) -> Result<()> {
    let path = requests_path(port);
    let mut operations: Vec<sniffler_core::model::Operation> = store.read(&path).await?;
    if let Some(existing) = operations.iter_mut().find(|o| o.id == operation.id) {
        *existing = operation;
    } else {
        operations.push(operation);
    }
    if operations.len() > MAX_PERSISTED_OPERATIONS {
        let overflow = operations.len() - MAX_PERSISTED_OPERATIONS;
        operations.drain(0..overflow);
    }
    store.write(&path, &operations).await
}

async fn persist_mocks(store: &Store, port: u16, state: &ListenerState) -> Result<()> {
    let mocks = state.mocks.lock().expect("mock store lock poisoned").list();
    store.write(&mocks_path(port), &mocks).await
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
