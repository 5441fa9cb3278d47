//! Comparison of a finished instance's output against an expected artifact.

use log::{info, warn};
use serde_json::Value;
use std::fs;
use std::path::Path;

use crate::common::error::Result;

/// Compare `actual` with the JSON document stored at `expected_path`.
///
/// Comparison is structural, so key order and whitespace in the file do not
/// matter.
pub fn results_match(instance_id: &str, actual: &Value, expected_path: &Path) -> Result<bool> {
    let content = fs::read_to_string(expected_path)?;
    let expected: Value = serde_json::from_str(&content)?;

    if *actual == expected {
        info!(
            "✅ Results of instance {} match {}",
            instance_id,
            expected_path.display()
        );
        Ok(true)
    } else {
        warn!(
            "❌ Results of instance {} differ from {}",
            instance_id,
            expected_path.display()
        );
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_structural_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("expected.json");
        fs::write(&path, r#"{ "b": [1, 2], "a": "x" }"#).unwrap();

        assert!(results_match("i1", &json!({"a": "x", "b": [1, 2]}), &path).unwrap());
        assert!(!results_match("i1", &json!({"a": "y", "b": [1, 2]}), &path).unwrap());
    }

    #[test]
    fn test_missing_or_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(results_match("i1", &json!({}), &missing).is_err());

        let invalid = dir.path().join("invalid.json");
        fs::write(&invalid, "not json").unwrap();
        assert!(results_match("i1", &json!({}), &invalid).is_err());
    }
}
