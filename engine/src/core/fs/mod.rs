//! Filesystem utilities.
//!
//! Crash-tolerant writes for the settings document and path checks for
//! identifiers that end up in file names (transcript exports, data files).

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::core::{CoreError, CoreResult};

// =============================================================================
// Path Validation
// =============================================================================

/// Validates that an identifier component is safe to use in file paths.
///
/// Rejects empty identifiers, traversal sequences (`..`), path separators,
/// drive letter indicators (`:`) and control characters.
pub fn validate_path_id_component(id: &str, label: &str) -> Result<(), String> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(format!("{label} is empty or contains only whitespace"));
    }
    if trimmed.contains("..")
        || trimmed.contains('/')
        || trimmed.contains('\\')
        || trimmed.contains(':')
    {
        return Err(format!("Invalid {label}: contains path traversal characters"));
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(format!("Invalid {label}: contains control characters"));
    }
    Ok(())
}

/// Ensures `dir` exists and is a directory, creating it when missing.
pub fn ensure_data_dir(dir: &Path) -> CoreResult<PathBuf> {
    if dir.exists() && !dir.is_dir() {
        return Err(CoreError::ValidationError(format!(
            "Data directory is not a directory: {}",
            dir.display()
        )));
    }
    std::fs::create_dir_all(dir)?;
    Ok(dir.to_path_buf())
}

// =============================================================================
// Atomic Writes
// =============================================================================

/// Write bytes to `path` using an atomic replace pattern.
///
/// Implementation notes:
/// - Write to a sibling temporary file.
/// - Flush and sync the temp file.
/// - Swap into place by renaming.
/// - If the destination exists, it is first moved aside as a `.bak` file, then removed.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = sibling_path(path, "tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    atomic_replace(path, &tmp_path)
}

/// Write a JSON file atomically with pretty formatting.
pub fn atomic_write_json_pretty<T: serde::Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| suffix.to_string());
    path.with_file_name(format!("{file_name}.{suffix}"))
}

fn atomic_replace(dest: &Path, src_tmp: &Path) -> CoreResult<()> {
    if !dest.exists() {
        std::fs::rename(src_tmp, dest)?;
        return Ok(());
    }

    // Rename-over-existing is not portable; swap through a backup.
    let bak = sibling_path(dest, "bak");
    if bak.exists() {
        let _ = std::fs::remove_file(&bak);
    }

    std::fs::rename(dest, &bak)?;
    match std::fs::rename(src_tmp, dest) {
        Ok(()) => {
            let _ = std::fs::remove_file(&bak);
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::rename(&bak, dest);
            let _ = std::fs::remove_file(src_tmp);
            Err(CoreError::IoError(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_bytes_creates_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        atomic_write_bytes(&path, b"one").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one");

        atomic_write_bytes(&path, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");

        assert!(!sibling_path(&path, "tmp").exists());
        assert!(!sibling_path(&path, "bak").exists());
    }

    #[test]
    fn atomic_write_json_pretty_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("value.json");

        atomic_write_json_pretty(&path, &serde_json::json!({ "version": 1 })).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["version"], 1);
    }

    // =========================================================================
    // Path Validation Tests
    // =========================================================================

    #[test]
    fn test_validate_path_id_component_valid() {
        assert!(validate_path_id_component("Xh57mMlfuMk", "videoId").is_ok());
        assert!(validate_path_id_component("a-b_c", "videoId").is_ok());
    }

    #[test]
    fn test_validate_path_id_component_invalid() {
        assert!(validate_path_id_component("", "videoId").is_err());
        assert!(validate_path_id_component("   ", "videoId").is_err());
        assert!(validate_path_id_component("../x", "videoId").is_err());
        assert!(validate_path_id_component("a/b", "videoId").is_err());
        assert!(validate_path_id_component("a\\b", "videoId").is_err());
        assert!(validate_path_id_component("C:x", "videoId").is_err());
        assert!(validate_path_id_component("a\0b", "videoId").is_err());
    }

    #[test]
    fn test_ensure_data_dir_rejects_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();

        assert!(ensure_data_dir(&file).is_err());
        assert!(ensure_data_dir(&dir.path().join("data")).unwrap().is_dir());
    }
}
