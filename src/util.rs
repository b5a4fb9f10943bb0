//! Shared utility functions for the Steadfast crate.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Atomically replace `path` with `content`.
///
/// The content is written to a temporary file in the same directory, fsynced,
/// then renamed over the target, so readers observe either the previous file
/// or the new one and never a partial write.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

    let mut temp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in: {}", dir.display()))?;
    temp.write_all(content)
        .context("Failed to write content to temporary file")?;
    temp.as_file()
        .sync_all()
        .context("Failed to fsync temporary file")?;
    temp.persist(path)
        .map_err(|e| anyhow::anyhow!(e.error))
        .with_context(|| format!("Failed to rename temporary file over {}", path.display()))?;

    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    write_atomic(path, json.as_bytes())
}

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

/// Serde helpers for `Duration` as whole milliseconds.
pub mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_atomic_creates_file_and_parent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/state.json");
        write_atomic(&path, b"{\"a\":1}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn test_write_atomic_replaces_existing_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_atomic(&path, b"first version that is longer").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");

        // No temporary files are left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path() != path)
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_write_json_atomic_pretty_prints() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("value.json");
        write_json_atomic(&path, &serde_json::json!({"key": "value"})).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"key\": \"value\""));
    }

    #[test]
    fn test_extract_json_object_with_prefix() {
        let text = r#"done: {"output_refs": ["a.txt"]}"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"output_refs": ["a.txt"]}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"outer": {"inner": "value"}} trailing"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"outer": {"inner": "value"}}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_no_json() {
        assert_eq!(extract_json_object("No JSON here"), None);
    }

    #[test]
    fn test_extract_json_object_unclosed() {
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
    }
}
