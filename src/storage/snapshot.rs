//! Atomic snapshot read/write, generic over whatever the bandit wants to persist.
//! Write-then-rename avoids ever observing a half-written snapshot file.

use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};

use crate::errors::{AppError, AppResult};

pub fn load<T: DeserializeOwned>(path: &Path) -> AppResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(path)
        .map_err(|e| AppError::internal(format!("read snapshot {}: {e}", path.display())))?;
    let value = serde_json::from_slice(&bytes)
        .map_err(|e| AppError::internal(format!("parse snapshot {}: {e}", path.display())))?;
    Ok(Some(value))
}

pub fn save<T: Serialize>(path: &Path, value: &T) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| AppError::internal(format!("create snapshot dir: {e}")))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| AppError::internal(format!("serialize snapshot: {e}")))?;
    std::fs::write(&tmp_path, &bytes)
        .map_err(|e| AppError::internal(format!("write snapshot tmp: {e}")))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| AppError::internal(format!("rename snapshot into place: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        n: i64,
    }

    #[test]
    fn round_trips_through_atomic_rename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        assert!(load::<Sample>(&path).unwrap().is_none());
        save(&path, &Sample { n: 7 }).unwrap();
        assert_eq!(load::<Sample>(&path).unwrap(), Some(Sample { n: 7 }));
        assert!(!path.with_extension("json.tmp").exists());
    }
}
