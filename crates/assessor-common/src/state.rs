//! JSON state files shared between process invocations
//!
//! Schedule state and last-run summaries are small JSON documents that
//! separate `assessor` processes read and write. Writes go through a
//! temporary sibling file and a rename so readers never observe a torn
//! document.

use crate::error::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

/// Load a JSON document, returning `None` when the file does not exist
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Option<T>> {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Replace a JSON document atomically, creating parent directories as needed
pub fn save_json<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let content = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Marker {
        enabled: bool,
        expression: String,
    }

    #[test]
    fn test_missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Option<Marker> = load_json(dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_save_creates_parents_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state/schedule.json");

        let first = Marker { enabled: true, expression: "@daily".into() };
        save_json(&path, &first).unwrap();
        let second = Marker { enabled: false, expression: "@daily".into() };
        save_json(&path, &second).unwrap();

        let loaded: Marker = load_json(&path).unwrap().unwrap();
        assert_eq!(loaded, second);
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_corrupt_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_json::<Marker>(&path).is_err());
    }
}
