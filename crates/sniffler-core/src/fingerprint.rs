//! Fingerprint derivation rules (§3 `Fingerprint`).
//!
//! Every protocol reduces a request to a single normalized string used as
//! the mock store's lookup key. Derivation is idempotent: `fp(fp(x)) ==
//! fp(x)` (§8 round-trip law), because each function below only ever
//! narrows its input further.

/// HTTP fingerprint: `"{METHOD}:{path-with-query}"`.
pub fn http(method: &str, path_with_query: &str) -> String {
    format!("{}:{}", method.to_ascii_uppercase(), path_with_query)
}

/// SQL-family fingerprint (PostgreSQL, MySQL, TDS): lower-cased SQL with
/// internal whitespace collapsed to single spaces, trimmed.
pub fn sql(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.to_ascii_lowercase()
}

/// Mongo fingerprint: `db.{collection}.{operation}({json})`.
pub fn mongo(collection: &str, operation: &str, filter_or_document: &serde_json::Value) -> String {
    format!("db.{collection}.{operation}({filter_or_document})")
}

/// Redis fingerprint: verb (upper-cased) + space-joined args.
pub fn redis(verb: &str, args: &[String]) -> String {
    let mut parts = vec![verb.to_ascii_uppercase()];
    parts.extend(args.iter().cloned());
    parts.join(" ")
}

/// Classify an HTTP request by method: the safe, idempotent methods read,
/// everything else writes.
pub fn classify_http(method: &str) -> crate::model::OperationType {
    use crate::model::OperationType;
    match method.to_ascii_uppercase().as_str() {
        "GET" | "HEAD" | "OPTIONS" => OperationType::Read,
        _ => OperationType::Write,
    }
}

/// Classify the leading SQL keyword of a normalized statement into an
/// `OperationType` (§4.1.2 "classifies the operation type from the first
/// SQL keyword").
pub fn classify_sql(normalized: &str) -> crate::model::OperationType {
    use crate::model::OperationType;
    let first_word = normalized.split_whitespace().next().unwrap_or("");
    match first_word {
        "select" => OperationType::Select,
        "insert" => OperationType::Insert,
        "update" => OperationType::Update,
        "delete" => OperationType::Delete,
        _ => OperationType::Read,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_fingerprint_is_method_and_path() {
        assert_eq!(http("get", "/users?id=1"), "GET:/users?id=1");
    }

    #[test]
    fn sql_collapses_whitespace_and_lowercases() {
        assert_eq!(sql("  SELECT   *  FROM   users \n"), "select * from users");
    }

    #[test]
    fn fingerprint_is_idempotent() {
        let once = sql("SELECT 1");
        let twice = sql(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn mongo_fingerprint_shape() {
        let fp = mongo("u", "find", &serde_json::json!({"a": 1}));
        assert_eq!(fp, "db.u.find({\"a\":1})");
    }

    #[test]
    fn redis_fingerprint_shape() {
        let fp = redis("get", &["foo".to_string()]);
        assert_eq!(fp, "GET foo");
    }

    #[test]
    fn classify_http_methods() {
        assert!(matches!(classify_http("get"), crate::model::OperationType::Read));
        assert!(matches!(classify_http("POST"), crate::model::OperationType::Write));
    }

    #[test]
    fn classify_sql_keywords() {
        assert!(matches!(classify_sql("select 1"), crate::model::OperationType::Select));
        assert!(matches!(classify_sql("insert into t values (1)"), crate::model::OperationType::Insert));
    }
}
