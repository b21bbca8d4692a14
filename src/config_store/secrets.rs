//! Secret detection and masking.
//!
//! Single source of truth for deciding which configuration keys hold
//! sensitive values and for masking them in anything that leaves the
//! process (API responses, logs).

use serde_json::Value;

/// Substring patterns that flag a key as sensitive.
pub const SENSITIVE_PATTERNS: &[&str] =
    &["key", "secret", "password", "token", "credential", "auth", "pass"];

/// Whether a key name (or dotted path) indicates sensitive data.
pub fn is_secret_key(name: &str) -> bool {
    let lower = name.to_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Mask a sensitive value, showing only the last 4 characters.
pub fn mask_value(value: &str) -> String {
    if value.is_empty() || value.chars().count() <= 4 {
        return "****".to_string();
    }
    let tail: String = value
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("****{}", tail)
}

/// Whether a value is already in masked form (and so must never be
/// written back into a layer file).
pub fn is_masked(value: &str) -> bool {
    value.starts_with("****")
}

/// Recursively mask sensitive string values in a JSON tree.
pub fn mask_json_secrets(data: &Value) -> Value {
    match data {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, value) in map {
                let masked = match value {
                    Value::Object(_) | Value::Array(_) => mask_json_secrets(value),
                    Value::String(s) if !s.trim().is_empty() && is_secret_key(key) => {
                        Value::String(mask_value(s))
                    }
                    other => other.clone(),
                };
                out.insert(key.clone(), masked);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(mask_json_secrets).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_secret_key_patterns() {
        assert!(is_secret_key("OPENAI_API_KEY"));
        assert!(is_secret_key("admin_password"));
        assert!(is_secret_key("api_keys.openai"));
        assert!(is_secret_key("security.auth_secret_key"));
        assert!(!is_secret_key("environment.name"));
        assert!(!is_secret_key("service_preferences.chronicle.model"));
    }

    #[test]
    fn test_mask_value_shows_last_four() {
        assert_eq!(mask_value("sk-SECRET"), "****CRET");
        assert_eq!(mask_value("abcd"), "****");
        assert_eq!(mask_value(""), "****");
    }

    #[test]
    fn test_mask_json_secrets_recursive() {
        let input = json!({
            "api_keys": { "openai": "sk-TESTVALUE" },
            "environment": { "name": "ushadow" },
            "providers": [ { "api_token": "tok-12345678" } ],
        });
        let masked = mask_json_secrets(&input);
        assert_eq!(masked["api_keys"]["openai"], "****ALUE");
        assert_eq!(masked["environment"]["name"], "ushadow");
        assert_eq!(masked["providers"][0]["api_token"], "****5678");
    }

    #[test]
    fn test_mask_json_leaves_empty_values_alone() {
        let input = json!({ "api_keys": { "openai": "" } });
        let masked = mask_json_secrets(&input);
        assert_eq!(masked["api_keys"]["openai"], "");
    }
}
