//! Persisted training records.
//!
//! A record is a single JSON object written atomically: the payload goes to a
//! `.tmp` sibling which is then renamed over the target, so a crash mid-save
//! never leaves a truncated checkpoint behind.

use serde_json::{Map, Value};
use std::io;
use std::path::Path;

use crate::error::{EngineError, EngineResult};

/// A keyed persisted record.
pub type Record = Map<String, Value>;

/// Write `record` to `path`, creating parent directories as needed.
pub fn write_record(path: &Path, record: &Record) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let payload = serde_json::to_vec_pretty(record)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, payload)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read the record stored at `path`.
///
/// The top-level JSON value must be an object.
pub fn read_record(path: &Path) -> EngineResult<Record> {
    let data = std::fs::read(path)?;
    match serde_json::from_slice(&data)? {
        Value::Object(record) => Ok(record),
        other => Err(EngineError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "{} does not hold a training record (found {})",
                path.display(),
                kind_of(&other)
            ),
        ))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let record = json!({"epoch": 3, "lr": 0.1}).as_object().unwrap().clone();

        write_record(&path, &record).unwrap();
        assert_eq!(read_record(&path).unwrap(), record);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_write_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs").join("a").join("state.json");
        write_record(&path, &Record::new()).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_read_missing_file() {
        let err = read_record(Path::new("/nonexistent/trainloop/state.json")).unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
    }

    #[test]
    fn test_read_rejects_non_object() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("list.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();
        let err = read_record(&path).unwrap_err();
        assert!(err.to_string().contains("an array"));
    }
}
