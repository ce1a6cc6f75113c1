//! One-shot administrative commands (§6's command surface), operating
//! directly on the persisted JSON store rather than a live `serve` process.
//! `listener.start`/`listener.stop` issued here cannot themselves bind or
//! release a socket -- a one-shot CLI invocation exits before a bound
//! listener would be useful -- so they flip the persisted `auto_start` /
//! `was_running` flags that the next `serve` honors (§3 `auto_start_effective`).

use crate::error_helpers::{listener_exists_error, no_listener_error, no_mock_error, self_loop_error, unsupported_bundle_version_error};
use crate::progress::CliError;
use sniffler_core::model::RunState;
use sniffler_core::{now_millis, Listener, Mock, Operation, Protocol, Settings, Store};
use std::collections::HashMap;
use std::path::PathBuf;

const BUNDLE_VERSION: &str = "1.0";

fn mocks_path(port: u16) -> String {
    format!("mocks/mocks-{port}.json")
}

fn requests_path(port: u16) -> String {
    format!("requests/requests-{port}.json")
}

/// Thin wrapper around [`Store`] implementing each command in §6's table.
pub struct Admin {
    store: Store,
}

impl Admin {
    pub fn new(data_root: PathBuf) -> Self {
        Self { store: Store::new(data_root) }
    }

    async fn load_listeners(&self) -> Result<Vec<Listener>, CliError> {
        Ok(self.store.read("proxies.json").await?)
    }

    async fn save_listeners(&self, listeners: &[Listener]) -> Result<(), CliError> {
        Ok(self.store.write("proxies.json", listeners).await?)
    }

    async fn load_settings(&self) -> Result<Settings, CliError> {
        let mut rows: Vec<Settings> = self.store.read("settings.json").await?;
        Ok(rows.pop().unwrap_or_default())
    }

    async fn save_settings(&self, settings: &Settings) -> Result<(), CliError> {
        Ok(self.store.write("settings.json", std::slice::from_ref(settings)).await?)
    }

    pub async fn listener_create(&self, port: u16, upstream_host: String, upstream_port: u16, protocol: Protocol, name: Option<String>) -> Result<Listener, CliError> {
        let mut listeners = self.load_listeners().await?;
        if listeners.iter().any(|l| l.port == port) {
            return Err(listener_exists_error(port));
        }
        let default_name = format!("{protocol:?} on {port}");
        let listener = Listener::new(uuid::Uuid::new_v4().to_string(), name.unwrap_or(default_name), port, upstream_host, upstream_port, protocol);
        if listener.is_self_loop() {
            return Err(self_loop_error(port));
        }
        listeners.push(listener.clone());
        self.save_listeners(&listeners).await?;
        Ok(listener)
    }

    pub async fn listener_list(&self) -> Result<Vec<Listener>, CliError> {
        self.load_listeners().await
    }

    pub async fn listener_rename(&self, port: u16, name: String) -> Result<Listener, CliError> {
        let mut listeners = self.load_listeners().await?;
        let listener = listeners.iter_mut().find(|l| l.port == port).ok_or_else(|| no_listener_error(port))?;
        listener.name = name;
        let updated = listener.clone();
        self.save_listeners(&listeners).await?;
        Ok(updated)
    }

    pub async fn listener_mark_start(&self, port: u16) -> Result<Listener, CliError> {
        let mut listeners = self.load_listeners().await?;
        let listener = listeners.iter_mut().find(|l| l.port == port).ok_or_else(|| no_listener_error(port))?;
        listener.auto_start = true;
        listener.was_running = true;
        let updated = listener.clone();
        self.save_listeners(&listeners).await?;
        Ok(updated)
    }

    pub async fn listener_mark_stop(&self, port: u16) -> Result<Listener, CliError> {
        let mut listeners = self.load_listeners().await?;
        let listener = listeners.iter_mut().find(|l| l.port == port).ok_or_else(|| no_listener_error(port))?;
        listener.state = RunState::Stopped;
        listener.was_running = false;
        let updated = listener.clone();
        self.save_listeners(&listeners).await?;
        Ok(updated)
    }

    pub async fn listener_remove(&self, port: u16) -> Result<(), CliError> {
        let mut listeners = self.load_listeners().await?;
        let index = listeners.iter().position(|l| l.port == port).ok_or_else(|| no_listener_error(port))?;
        if listeners[index].state == RunState::Running {
            return Err(CliError::new(format!("listener on port {port} must be stopped before removal"), crate::progress::ExitCode::ConfigurationError));
        }
        listeners.remove(index);
        self.save_listeners(&listeners).await
    }

    pub async fn listener_test(host: &str, port: u16) -> (bool, String, Option<sniffler_core::UpstreamErrorType>) {
        sniffler_interceptor::lifecycle::test_connection(host, port).await
    }

    pub async fn mock_add(&self, port: u16, fingerprint: String, response: serde_json::Value, enabled: bool) -> Result<Mock, CliError> {
        let path = mocks_path(port);
        let mut mocks: Vec<Mock> = self.store.read(&path).await?;
        if mocks.iter().any(|m| m.fingerprint == fingerprint) {
            return Err(CliError::new(
                format!("a mock already exists for fingerprint {fingerprint:?} on port {port}"),
                crate::progress::ExitCode::ConfigurationError,
            )
            .with_suggestion(format!("sniffler mock update --port {port} --fingerprint {fingerprint:?} --response ...")));
        }
        let mock = Mock::new(uuid::Uuid::new_v4().to_string(), port, fingerprint, response, enabled);
        mocks.push(mock.clone());
        self.store.write(&path, &mocks).await?;
        Ok(mock)
    }

    pub async fn mock_update(&self, port: u16, fingerprint: &str, response: serde_json::Value) -> Result<Mock, CliError> {
        let path = mocks_path(port);
        let mut mocks: Vec<Mock> = self.store.read(&path).await?;
        let mock = mocks.iter_mut().find(|m| m.fingerprint == fingerprint).ok_or_else(|| no_mock_error(port, fingerprint))?;
        mock.response = response;
        mock.updated_at = now_millis();
        let updated = mock.clone();
        self.store.write(&path, &mocks).await?;
        Ok(updated)
    }

    pub async fn mock_toggle(&self, port: u16, fingerprint: &str) -> Result<Mock, CliError> {
        let path = mocks_path(port);
        let mut mocks: Vec<Mock> = self.store.read(&path).await?;
        let mock = mocks.iter_mut().find(|m| m.fingerprint == fingerprint).ok_or_else(|| no_mock_error(port, fingerprint))?;
        mock.enabled = !mock.enabled;
        mock.updated_at = now_millis();
        let updated = mock.clone();
        self.store.write(&path, &mocks).await?;
        Ok(updated)
    }

    pub async fn mock_remove(&self, port: u16, fingerprint: &str) -> Result<(), CliError> {
        let path = mocks_path(port);
        let mut mocks: Vec<Mock> = self.store.read(&path).await?;
        let before = mocks.len();
        mocks.retain(|m| m.fingerprint != fingerprint);
        if mocks.len() == before {
            return Err(no_mock_error(port, fingerprint));
        }
        Ok(self.store.write(&path, &mocks).await?)
    }

    pub async fn mock_list(&self, port: Option<u16>) -> Result<Vec<Mock>, CliError> {
        match port {
            Some(port) => Ok(self.store.read(&mocks_path(port)).await?),
            None => {
                let mut all = Vec::new();
                for listener in self.load_listeners().await? {
                    all.extend(self.store.read::<Mock>(&mocks_path(listener.port)).await?);
                }
                Ok(all)
            }
        }
    }

    pub async fn operation_list(&self, port: Option<u16>) -> Result<Vec<Operation>, CliError> {
        let mut ops = match port {
            Some(port) => self.store.read(&requests_path(port)).await?,
            None => {
                let mut all = Vec::new();
                for listener in self.load_listeners().await? {
                    all.extend(self.store.read::<Operation>(&requests_path(listener.port)).await?);
                }
                all
            }
        };
        ops.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(ops)
    }

    pub async fn operation_clear(&self, port: Option<u16>) -> Result<(), CliError> {
        match port {
            Some(port) => Ok(self.store.write::<Operation>(&requests_path(port), &[]).await?),
            None => {
                for listener in self.load_listeners().await? {
                    self.store.write::<Operation>(&requests_path(listener.port), &[]).await?;
                }
                Ok(())
            }
        }
    }

    pub async fn settings_get(&self) -> Result<Settings, CliError> {
        self.load_settings().await
    }

    pub async fn settings_update(&self, partial: &serde_json::Value) -> Result<Settings, CliError> {
        let mut settings = self.load_settings().await?;
        settings.apply_partial(partial).map_err(|e| CliError::new(e.to_string(), crate::progress::ExitCode::InvalidArguments))?;
        self.save_settings(&settings).await?;
        Ok(settings)
    }

    pub async fn data_export(&self) -> Result<serde_json::Value, CliError> {
        let listeners = self.load_listeners().await?;
        let settings = self.load_settings().await?;
        let mut mocks = Vec::new();
        for listener in &listeners {
            mocks.extend(self.store.read::<Mock>(&mocks_path(listener.port)).await?);
        }
        Ok(serde_json::json!({
            "version": BUNDLE_VERSION,
            "listeners": listeners,
            "settings": settings,
            "mocks": mocks,
        }))
    }

    pub async fn data_import(&self, bundle: serde_json::Value) -> Result<(), CliError> {
        let version = bundle.get("version").and_then(|v| v.as_str()).unwrap_or(BUNDLE_VERSION);
        if version != BUNDLE_VERSION {
            return Err(unsupported_bundle_version_error(version));
        }
        let parse_err = |e: serde_json::Error| CliError::new(format!("malformed bundle: {e}"), crate::progress::ExitCode::InvalidArguments);

        let listeners: Vec<Listener> = serde_json::from_value(bundle.get("listeners").cloned().unwrap_or_else(|| serde_json::json!([]))).map_err(parse_err)?;
        let settings: Settings = match bundle.get("settings").cloned() {
            Some(value) => serde_json::from_value(value).map_err(parse_err)?,
            None => Settings::default(),
        };
        let mocks: Vec<Mock> = serde_json::from_value(bundle.get("mocks").cloned().unwrap_or_else(|| serde_json::json!([]))).map_err(parse_err)?;

        self.save_listeners(&listeners).await?;
        self.save_settings(&settings).await?;

        let mut by_port: HashMap<u16, Vec<Mock>> = HashMap::new();
        for mock in mocks {
            by_port.entry(mock.listener_port).or_default().push(mock);
        }
        for (port, port_mocks) in by_port {
            self.store.write(&mocks_path(port), &port_mocks).await?;
        }
        Ok(())
    }
}

impl From<sniffler_core::Error> for CliError {
    fn from(err: sniffler_core::Error) -> Self {
        Self::new(err.to_string(), crate::progress::ExitCode::GeneralError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn create_then_list_round_trips() {
        let dir = TempDir::new().unwrap();
        let admin = Admin::new(dir.path().to_path_buf());
        admin.listener_create(5432, "127.0.0.1".to_string(), 5433, Protocol::Postgresql, None).await.unwrap();
        let listeners = admin.listener_list().await.unwrap();
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].port, 5432);
    }

    #[tokio::test]
    async fn create_rejects_self_loop() {
        let dir = TempDir::new().unwrap();
        let admin = Admin::new(dir.path().to_path_buf());
        let err = admin.listener_create(5432, "127.0.0.1".to_string(), 5432, Protocol::Postgresql, None).await.unwrap_err();
        assert_eq!(err.exit_code, crate::progress::ExitCode::ConfigurationError);
    }

    #[tokio::test]
    async fn mock_lifecycle() {
        let dir = TempDir::new().unwrap();
        let admin = Admin::new(dir.path().to_path_buf());
        let mock = admin.mock_add(5432, "select * from users".to_string(), serde_json::json!({"rows": []}), false).await.unwrap();
        assert!(!mock.enabled);
        let toggled = admin.mock_toggle(5432, &mock.fingerprint).await.unwrap();
        assert!(toggled.enabled);
        admin.mock_remove(5432, &mock.fingerprint).await.unwrap();
        assert!(admin.mock_list(Some(5432)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn export_then_import_round_trips() {
        let dir = TempDir::new().unwrap();
        let admin = Admin::new(dir.path().to_path_buf());
        admin.listener_create(6379, "127.0.0.1".to_string(), 6380, Protocol::Redis, None).await.unwrap();
        admin.mock_add(6379, "GET foo".to_string(), serde_json::json!({"type": "string", "value": "bar"}), true).await.unwrap();
        let bundle = admin.data_export().await.unwrap();

        let other_dir = TempDir::new().unwrap();
        let other_admin = Admin::new(other_dir.path().to_path_buf());
        other_admin.data_import(bundle).await.unwrap();
        let listeners = other_admin.listener_list().await.unwrap();
        assert_eq!(listeners.len(), 1);
        let mocks = other_admin.mock_list(Some(6379)).await.unwrap();
        assert_eq!(mocks.len(), 1);
    }
}
