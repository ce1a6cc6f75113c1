//! Process-wide listener registry (§4.2 "Listener operations").

use sniffler_core::model::{Listener, Operation, RunState};
use sniffler_core::{EventBus, MockStore, Result, Settings};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use tokio::sync::Notify;

/// Everything a running listener needs that isn't safe to serialize
/// directly onto the event bus: the mock store, the operation ring
/// buffer, and a shutdown signal for `stop()`.
pub struct ListenerState {
    /// Listener metadata and counters.
    pub meta: RwLock<Listener>,
    /// Fingerprint -> mock mapping for this listener.
    pub mocks: Mutex<MockStore>,
    /// Event bus for this listener's lifecycle, operations, and mocks.
    pub events: EventBus,
    /// Bounded ring buffer of recorded operations, newest at the back.
    pub operations: Mutex<VecDeque<Operation>>,
    /// Signaled by `stop()`; the accept loop and connection pumps select
    /// on this to shut down cooperatively.
    pub shutdown: Notify,
    /// Currently open connections, mirrored into `meta.counters` on change.
    pub active_connections: AtomicU64,
}

impl ListenerState {
    fn new(listener: Listener, max_mock_history: usize) -> Self {
        Self {
            meta: RwLock::new(listener),
            mocks: Mutex::new(MockStore::new(max_mock_history)),
            events: EventBus::default(),
            operations: Mutex::new(VecDeque::new()),
            shutdown: Notify::new(),
            active_connections: AtomicU64::new(0),
        }
    }

    /// Snapshot the listener's metadata.
    pub fn snapshot(&self) -> Listener {
        self.meta.read().expect("listener metadata lock poisoned").clone()
    }
}

/// Process-wide map from port to listener state, plus the single
/// process-wide [`Settings`] instance (§3: settings are global, not
/// per-listener).
#[derive(Default)]
pub struct Registry {
    /// Process-wide settings, mutated only through `update_settings`.
    pub settings: RwLock<Settings>,
    listeners: RwLock<HashMap<u16, std::sync::Arc<ListenerState>>>,
}

impl Registry {
    /// Build an empty registry with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// `listener.create` (§4.2): validates port uniqueness and the
    /// self-loop guard before registering a new, stopped listener.
    pub fn create(&self, listener: Listener) -> Result<std::sync::Arc<ListenerState>> {
        if listener.is_self_loop() {
            return Err(sniffler_core::Error::config(format!(
                "listener on port {} cannot proxy to itself",
                listener.port
            )));
        }
        let mut listeners = self.listeners.write().expect("listener registry lock poisoned");
        if listeners.contains_key(&listener.port) {
            return Err(sniffler_core::Error::config(format!("a listener already exists on port {}", listener.port)));
        }
        let max_mock_history = self.settings.read().expect("settings lock poisoned").max_mock_history;
        let state = std::sync::Arc::new(ListenerState::new(listener, max_mock_history));
        listeners.insert(state.snapshot().port, state.clone());
        Ok(state)
    }

    /// Look up a listener's runtime state by port.
    pub fn get(&self, port: u16) -> Option<std::sync::Arc<ListenerState>> {
        self.listeners.read().expect("listener registry lock poisoned").get(&port).cloned()
    }

    /// List all registered listeners' current metadata.
    pub fn list(&self) -> Vec<Listener> {
        self.listeners
            .read()
            .expect("listener registry lock poisoned")
            .values()
            .map(|state| state.snapshot())
            .collect()
    }

    /// `listener.update` (§4.2): only `name` may change while running.
    pub fn rename(&self, port: u16, name: String) -> Result<()> {
        let state = self.get(port).ok_or_else(|| sniffler_core::Error::config(format!("no listener on port {port}")))?;
        state.meta.write().expect("listener metadata lock poisoned").name = name;
        Ok(())
    }

    /// `listener.remove` (§4.2): requires the listener to be stopped.
    pub fn remove(&self, port: u16) -> Result<()> {
        let mut listeners = self.listeners.write().expect("listener registry lock poisoned");
        match listeners.get(&port) {
            None => Err(sniffler_core::Error::config(format!("no listener on port {port}"))),
            Some(state) => {
                if state.snapshot().state == RunState::Running {
                    return Err(sniffler_core::Error::config("listener must be stopped before removal"));
                }
                listeners.remove(&port);
                Ok(())
            }
        }
    }

    /// Increment or decrement the live connection counter for `port`.
    pub fn adjust_active_connections(&self, state: &ListenerState, delta: i64) {
        if delta >= 0 {
            state.active_connections.fetch_add(delta as u64, Ordering::SeqCst);
        } else {
            state.active_connections.fetch_sub((-delta) as u64, Ordering::SeqCst);
        }
        let count = state.active_connections.load(Ordering::SeqCst);
        state.meta.write().expect("listener metadata lock poisoned").counters.active_connections = count;
    }
}
