//! Process-wide settings (§3 `Settings`).

use serde::{Deserialize, Serialize};

/// Process-wide options with enumerated effects. Mutated only through an
/// explicit `update_settings` path that takes a global lock (see
/// `SettingsStore`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// On operation success, create a disabled mock for its fingerprint if
    /// none exists yet.
    pub auto_save_as_mocks: bool,
    /// On a detected difference between a live response and the stored mock,
    /// overwrite the stored mock with the live response.
    pub auto_replace_on_difference: bool,
    /// Suppress identical concurrent operations within
    /// `deduplication_window_ms` of each other.
    pub enable_deduplication: bool,
    /// Drop trivial health-check queries (`select 1`, `select now()`, ...)
    /// before they become operations.
    pub filter_health_checks: bool,
    /// Enable pattern-based fingerprint matching in addition to exact match.
    pub enable_pattern_matching: bool,
    /// Upper bound on retained operations per listener.
    pub max_request_history: usize,
    /// Upper bound on retained mocks per listener.
    pub max_mock_history: usize,
    /// Window, in milliseconds, used by `enable_deduplication`.
    pub deduplication_window_ms: u64,
    /// Age, in milliseconds, after which a `pending` operation is marked
    /// `failed` by the stale-pending sweep.
    pub stale_pending_timeout_ms: u64,
    /// Whether the HTTP engine should offer HTTPS MITM (the core never
    /// terminates TLS itself; this only gates whether the capability is
    /// invoked when available).
    pub enable_https: bool,
    /// Global kill switch: when true, the mock store is never consulted and
    /// all traffic is forwarded, regardless of enabled mocks.
    pub testing_mode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_save_as_mocks: false,
            auto_replace_on_difference: false,
            enable_deduplication: true,
            filter_health_checks: true,
            enable_pattern_matching: false,
            max_request_history: 1000,
            max_mock_history: 1000,
            deduplication_window_ms: 1000,
            stale_pending_timeout_ms: 30_000,
            enable_https: false,
            testing_mode: false,
        }
    }
}

impl Settings {
    /// Normalized SQL health-check statements dropped when
    /// `filter_health_checks` is set (§4.2 step 1).
    pub fn is_health_check(&self, normalized_sql: &str) -> bool {
        const HEALTH_CHECKS: &[&str] = &["select 1", "select now()", "show tables"];
        self.filter_health_checks && HEALTH_CHECKS.contains(&normalized_sql)
    }

    /// Merge a partial update, rejecting unknown keys with a `ConfigError`
    /// (§9 "Dynamic config objects").
    pub fn apply_partial(&mut self, partial: &serde_json::Value) -> crate::Result<()> {
        let serde_json::Value::Object(map) = partial else {
            return Err(crate::Error::config("settings update must be a JSON object"));
        };
        let known = [
            "auto_save_as_mocks",
            "auto_replace_on_difference",
            "enable_deduplication",
            "filter_health_checks",
            "enable_pattern_matching",
            "max_request_history",
            "max_mock_history",
            "deduplication_window_ms",
            "stale_pending_timeout_ms",
            "enable_https",
            "testing_mode",
        ];
        for key in map.keys() {
            if !known.contains(&key.as_str()) {
                return Err(crate::Error::config(format!("unknown setting: {key}")));
            }
        }
        let mut current = serde_json::to_value(&*self)?;
        if let serde_json::Value::Object(current_map) = &mut current {
            for (key, value) in map {
                current_map.insert(key.clone(), value.clone());
            }
        }
        *self = serde_json::from_value(current)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_design() {
        let s = Settings::default();
        assert!(!s.auto_save_as_mocks);
        assert_eq!(s.stale_pending_timeout_ms, 30_000);
        assert_eq!(s.deduplication_window_ms, 1000);
    }

    #[test]
    fn health_check_detection() {
        let s = Settings::default();
        assert!(s.is_health_check("select 1"));
        assert!(s.is_health_check("show tables"));
        assert!(!s.is_health_check("select * from users"));
    }

    #[test]
    fn rejects_unknown_setting() {
        let mut s = Settings::default();
        let err = s.apply_partial(&serde_json::json!({"bogus": true})).unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
    }

    #[test]
    fn applies_known_partial() {
        let mut s = Settings::default();
        s.apply_partial(&serde_json::json!({"auto_save_as_mocks": true})).unwrap();
        assert!(s.auto_save_as_mocks);
    }
}
