//! Mock store & matcher (§4.3).

use crate::model::{compare_responses, Mock, MockComparison};
use std::collections::HashMap;

/// Per-listener mapping from fingerprint to [`Mock`], bounded by
/// `max_mock_history`.
#[derive(Debug, Default)]
pub struct MockStore {
    by_fingerprint: HashMap<String, Mock>,
    max_size: usize,
}

impl MockStore {
    /// Create a store bounded to `max_size` entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            by_fingerprint: HashMap::new(),
            max_size,
        }
    }

    /// Add a mock. Returns the existing mock on a fingerprint collision
    /// unless `force_update` is set, matching `(listener_port, fingerprint)`
    /// uniqueness (§3 invariant).
    pub fn add(&mut self, mock: Mock, force_update: bool) -> Mock {
        if let Some(existing) = self.by_fingerprint.get(&mock.fingerprint) {
            if !force_update {
                return existing.clone();
            }
        }
        self.evict_if_full(&mock.fingerprint);
        self.by_fingerprint.insert(mock.fingerprint.clone(), mock.clone());
        mock
    }

    /// Update a stored mock's response and/or metadata, preserving
    /// `created_at` and the existing `enabled` flag unless explicitly
    /// overridden by the caller via `partial`.
    pub fn update(&mut self, fingerprint: &str, partial: impl FnOnce(&mut Mock)) -> Option<Mock> {
        let mock = self.by_fingerprint.get_mut(fingerprint)?;
        partial(mock);
        mock.updated_at = crate::model::now_millis();
        Some(mock.clone())
    }

    /// Flip a mock's `enabled` flag.
    pub fn toggle(&mut self, fingerprint: &str) -> Option<Mock> {
        self.update(fingerprint, |m| m.enabled = !m.enabled)
    }

    /// Remove a mock by fingerprint.
    pub fn remove(&mut self, fingerprint: &str) -> Option<Mock> {
        self.by_fingerprint.remove(fingerprint)
    }

    /// List all stored mocks.
    pub fn list(&self) -> Vec<Mock> {
        self.by_fingerprint.values().cloned().collect()
    }

    /// Look up an enabled mock for a fingerprint.
    pub fn find_enabled(&self, fingerprint: &str) -> Option<&Mock> {
        self.by_fingerprint
            .get(fingerprint)
            .filter(|mock| mock.enabled)
    }

    /// Look up any mock (enabled or not) for a fingerprint, used by the
    /// auto-creation/auto-replacement hooks below.
    pub fn find(&self, fingerprint: &str) -> Option<&Mock> {
        self.by_fingerprint.get(fingerprint)
    }

    /// Auto-creation hook: when an operation resolves `success` and
    /// `auto_save_as_mocks` is on, add a mock derived from the live
    /// response with `enabled=false`, if one doesn't already exist.
    pub fn auto_create(&mut self, fingerprint: &str, listener_port: u16, live_response: serde_json::Value) -> Option<Mock> {
        if self.find(fingerprint).is_some() {
            return None;
        }
        let mock = Mock::new(uuid_like(), listener_port, fingerprint.to_string(), live_response, false);
        self.evict_if_full(fingerprint);
        self.by_fingerprint.insert(fingerprint.to_string(), mock.clone());
        Some(mock)
    }

    /// Compare a live response against the stored mock for `fingerprint`,
    /// and, if `auto_replace_on_difference` is on and a difference was
    /// found, overwrite the mock while preserving `created_at` and
    /// `enabled`. Returns the comparison (if a mock existed) and whether a
    /// replacement occurred.
    pub fn compare_and_maybe_replace(
        &mut self,
        fingerprint: &str,
        live_response: &serde_json::Value,
        auto_replace_on_difference: bool,
    ) -> Option<(MockComparison, bool)> {
        let existing = self.by_fingerprint.get(fingerprint)?;
        let comparison = compare_responses(live_response, &existing.response);
        if comparison.is_identical() {
            return Some((comparison, false));
        }
        if !auto_replace_on_difference {
            return Some((comparison, false));
        }
        let mock = self.by_fingerprint.get_mut(fingerprint)?;
        mock.response = live_response.clone();
        mock.updated_at = crate::model::now_millis();
        Some((comparison, true))
    }

    fn evict_if_full(&mut self, incoming_fingerprint: &str) {
        if self.max_size == 0 || self.by_fingerprint.len() < self.max_size {
            return;
        }
        if self.by_fingerprint.contains_key(incoming_fingerprint) {
            return;
        }
        if let Some(oldest_key) = self
            .by_fingerprint
            .values()
            .min_by_key(|m| m.created_at)
            .map(|m| m.fingerprint.clone())
        {
            self.by_fingerprint.remove(&oldest_key);
        }
    }
}

fn uuid_like() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock(fp: &str, body: serde_json::Value) -> Mock {
        Mock::new(uuid_like(), 8080, fp.to_string(), serde_json::json!({"status": 200, "headers": {}, "body": body}), true)
    }

    #[test]
    fn add_then_collision_returns_existing() {
        let mut store = MockStore::new(10);
        let m1 = store.add(mock("GET:/x", serde_json::json!({"n": 1})), false);
        let m2 = store.add(mock("GET:/x", serde_json::json!({"n": 2})), false);
        assert_eq!(m1.id, m2.id);
        assert_eq!(store.find("GET:/x").unwrap().response["body"]["n"], 1);
    }

    #[test]
    fn force_update_overwrites() {
        let mut store = MockStore::new(10);
        store.add(mock("GET:/x", serde_json::json!({"n": 1})), false);
        store.add(mock("GET:/x", serde_json::json!({"n": 2})), true);
        assert_eq!(store.find("GET:/x").unwrap().response["body"]["n"], 2);
    }

    #[test]
    fn auto_create_defaults_disabled() {
        let mut store = MockStore::new(10);
        let created = store
            .auto_create("GET:/y", 8080, serde_json::json!({"status": 200, "headers": {}, "body": {"ok": true}}))
            .unwrap();
        assert!(!created.enabled);
        assert!(store.auto_create("GET:/y", 8080, serde_json::json!({})).is_none());
    }

    #[test]
    fn auto_replace_preserves_created_at_and_enabled() {
        let mut store = MockStore::new(10);
        let original = store.add(mock("GET:/z", serde_json::json!({"n": 1})), false);
        let live = serde_json::json!({"status": 200, "headers": {}, "body": {"n": 2}});
        let (cmp, replaced) = store.compare_and_maybe_replace("GET:/z", &live, true).unwrap();
        assert!(!cmp.is_identical());
        assert!(replaced);
        let updated = store.find("GET:/z").unwrap();
        assert_eq!(updated.created_at, original.created_at);
        assert!(updated.enabled);
        assert_eq!(updated.response["body"]["n"], 2);
    }

    #[test]
    fn eviction_drops_oldest_when_full() {
        let mut store = MockStore::new(1);
        store.add(mock("a", serde_json::json!({})), false);
        store.add(mock("b", serde_json::json!({})), false);
        assert!(store.find("a").is_none());
        assert!(store.find("b").is_some());
    }
}
