use anyhow::Result;
use std::path::{Path, PathBuf};

/// Resolve the log folder (absolute path).
///
/// The configured folder wins when it can be created. On a read-only or
/// not-yet-mounted `/var/log` we fall back to `<tmp>/setup-tool` so the
/// wizard still leaves a trail for the operator.
pub fn resolve_log_folder(preferred: &Path) -> Result<PathBuf> {
    if std::fs::create_dir_all(preferred).is_ok() {
        return Ok(preferred.to_path_buf());
    }

    let fallback = std::env::temp_dir().join("setup-tool");
    std::fs::create_dir_all(&fallback)
        .map_err(|e| anyhow::anyhow!("Failed to create log folder {:?}: {}", fallback, e))?;
    Ok(fallback)
}

/// Directory that holds `path`, or `.` for bare file names.
pub fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
