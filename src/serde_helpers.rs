//! Serde helpers for envelope payloads.
//!
//! When the `tracing` feature is enabled, unknown fields in a recognized
//! envelope are logged, as is the JSON path of any field that fails to
//! deserialize. This surfaces protocol drift between client and backend.

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Deserialize `value`, logging unknown fields and failure paths.
///
/// ```ignore
/// let json = serde_json::json!({ "type": "pong", "timestamp": 1, "server": "a" });
/// let beat: Beat = deserialize_with_warnings(json)?;
/// // Logs: DEBUG unknown field "server" with value "a" in Beat
/// ```
#[cfg(feature = "tracing")]
pub fn deserialize_with_warnings<T: DeserializeOwned>(value: Value) -> crate::Result<T> {
    use std::any::type_name;

    let original = value.clone();
    let mut unknown_paths: Vec<String> = Vec::new();

    let result: T = serde_ignored::deserialize(value, |path| {
        unknown_paths.push(path.to_string());
    })
    .inspect_err(|_| {
        // Re-deserialize with serde_path_to_error to get the error path
        let path_result: Result<T, _> = serde_path_to_error::deserialize(original.clone());
        if let Err(path_err) = path_result {
            let path = path_err.path().to_string();
            tracing::warn!(
                type_name = %type_name::<T>(),
                path = %path,
                value = %format_value(lookup_value(&original, &path)),
                error = %path_err.inner(),
                "envelope deserialization failed"
            );
        }
    })?;

    for path in unknown_paths {
        tracing::debug!(
            type_name = %type_name::<T>(),
            field = %path,
            value = %format_value(lookup_value(&original, &path)),
            "unknown field in envelope"
        );
    }

    Ok(result)
}

/// Pass-through deserialization when tracing is disabled.
#[cfg(not(feature = "tracing"))]
pub fn deserialize_with_warnings<T: DeserializeOwned>(value: Value) -> crate::Result<T> {
    Ok(serde_json::from_value(value)?)
}

/// Look up a value by a dotted path such as `data.status` or `items.0`.
///
/// `?` segments emitted by `serde_ignored` for `Option` wrappers are skipped.
#[cfg(feature = "tracing")]
fn lookup_value<'value>(value: &'value Value, path: &str) -> Option<&'value Value> {
    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() || segment == "?" {
            continue;
        }
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Render a value for a log line, truncating long payloads.
#[cfg(feature = "tracing")]
fn format_value(value: Option<&Value>) -> String {
    const MAX_LEN: usize = 120;

    let Some(value) = value else {
        return "<missing>".to_owned();
    };
    let rendered = value.to_string();
    if rendered.chars().count() <= MAX_LEN {
        return rendered;
    }
    let truncated: String = rendered.chars().take(MAX_LEN).collect();
    format!("{truncated}...")
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        task_id: String,
        attempts: Option<u32>,
    }

    #[test]
    fn deserialize_known_fields_only() {
        let sample: Sample =
            deserialize_with_warnings(json!({ "task_id": "t-1", "attempts": 2 })).unwrap();
        assert_eq!(
            sample,
            Sample {
                task_id: "t-1".to_owned(),
                attempts: Some(2),
            }
        );
    }

    #[test]
    fn deserialize_with_unknown_fields() {
        let sample: Sample =
            deserialize_with_warnings(json!({ "task_id": "t-1", "extra": true })).unwrap();
        assert_eq!(sample.task_id, "t-1");
        assert_eq!(sample.attempts, None);
    }

    #[test]
    fn deserialize_missing_required_field_fails() {
        let result: crate::Result<Sample> = deserialize_with_warnings(json!({ "attempts": 1 }));
        assert!(result.is_err());
    }

    #[cfg(feature = "tracing")]
    mod tracing_helpers {
        use super::*;

        #[test]
        fn lookup_nested_path() {
            let value = json!({ "data": { "status": "running", "steps": [1, 2] } });
            assert_eq!(
                lookup_value(&value, "data.status"),
                Some(&json!("running"))
            );
            assert_eq!(lookup_value(&value, "data.steps.1"), Some(&json!(2)));
            assert_eq!(lookup_value(&value, "data.?.status"), Some(&json!("running")));
            assert_eq!(lookup_value(&value, "data.missing"), None);
        }

        #[test]
        fn format_value_truncates() {
            let long = Value::String("x".repeat(500));
            let rendered = format_value(Some(&long));
            assert!(rendered.ends_with("..."));
            assert_eq!(rendered.chars().count(), 123);
            assert_eq!(format_value(None), "<missing>");
        }
    }
}
