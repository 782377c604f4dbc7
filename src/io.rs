// src/io.rs
// JSON file helpers. Device configs, batch configs, summaries and per-image
// metadata all go through these two functions, so read and parse failures
// carry the offending path.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Read and deserialize a JSON file.
pub fn read_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| Error::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Serialize a value as pretty JSON and write it, replacing any existing file.
pub fn write_json<T: Serialize + ?Sized>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let path = path.as_ref();
    let json = serde_json::to_string_pretty(value).map_err(|source| Error::Json {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, json).map_err(|source| Error::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::tempdir;

    #[test]
    fn test_write_then_read_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("value.json");
        write_json(&path, &serde_json::json!({"steps": 20})).unwrap();

        let value: Value = read_json(&path).unwrap();
        assert_eq!(value["steps"], 20);
    }

    #[test]
    fn test_read_json_reports_missing_and_malformed_files() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        match read_json::<Value>(&missing) {
            Err(Error::Read { path, .. }) => assert_eq!(path, missing),
            other => panic!("expected read error, got {:?}", other),
        }

        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{ not json").unwrap();
        assert!(matches!(read_json::<Value>(&broken), Err(Error::Json { .. })));
    }
}
