//! Atomic file replacement.
//!
//! Content is written to a temp file next to the target, flushed, then
//! renamed over the target and the directory entry is flushed. A staged file
//! that is never committed is removed on drop and the target is untouched.

use crate::error::WizardError;
use crate::utils::path_resolver::parent_dir;
use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct StagedFile {
    temp: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StagedFile {
    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Rename the staged file over the target and flush the directory.
    pub fn commit(mut self) -> Result<PathBuf, WizardError> {
        std::fs::rename(&self.temp, &self.target)
            .map_err(|e| WizardError::write(&self.target, format!("rename failed: {}", e)))?;
        self.committed = true;
        fsync_dir(&parent_dir(&self.target))?;
        debug!(
            "[PHASE: apply] [STEP: files] committed {:?}",
            self.target
        );
        Ok(self.target.clone())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.temp) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "[PHASE: apply] [STEP: files] failed to remove staged file {:?}: {}",
                    self.temp, e
                );
            }
        }
    }
}

/// Write `content` to a fresh temp file beside `target`.
///
/// On unix the temp file is created with `mode` from the start, so it is
/// never readable with wider permissions.
pub fn stage(target: &Path, content: &[u8], mode: u32) -> Result<StagedFile, WizardError> {
    let dir = parent_dir(target);
    std::fs::create_dir_all(&dir)
        .map_err(|e| WizardError::write(&dir, format!("create_dir_all failed: {}", e)))?;

    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| WizardError::write(target, "target has no file name"))?;
    let temp = dir.join(format!(".{}.tmp-{}", file_name, uuid::Uuid::new_v4()));

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options
        .open(&temp)
        .map_err(|e| WizardError::write(&temp, format!("create failed: {}", e)))?;

    // From here on, drop of `staged` cleans up the temp file on any error.
    let staged = StagedFile {
        temp,
        target: target.to_path_buf(),
        committed: false,
    };

    file.write_all(content)
        .map_err(|e| WizardError::write(&staged.temp, format!("write failed: {}", e)))?;
    file.sync_all()
        .map_err(|e| WizardError::write(&staged.temp, format!("fsync failed: {}", e)))?;

    Ok(staged)
}

/// Copy an existing `target` to `<target>.backup.<YYYYmmdd_HHMMSS>`.
///
/// Returns the backup path, or `None` when there is nothing to keep. An
/// existing backup is never overwritten; a numeric suffix is added instead.
pub fn backup_existing(target: &Path) -> Result<Option<PathBuf>, WizardError> {
    if !target.exists() {
        return Ok(None);
    }
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let base = format!("{}.backup.{}", target.display(), stamp);
    let mut backup = PathBuf::from(&base);
    let mut n = 1;
    while backup.exists() {
        backup = PathBuf::from(format!("{}.{}", base, n));
        n += 1;
    }
    std::fs::copy(target, &backup)
        .map_err(|e| WizardError::write(&backup, format!("backup failed: {}", e)))?;
    debug!(
        "[PHASE: apply] [STEP: files] backed up {:?} -> {:?}",
        target, backup
    );
    Ok(Some(backup))
}

pub fn fsync_dir(dir: &Path) -> Result<(), WizardError> {
    #[cfg(unix)]
    {
        let handle = File::open(dir)
            .map_err(|e| WizardError::write(dir, format!("open dir failed: {}", e)))?;
        handle
            .sync_all()
            .map_err(|e| WizardError::write(dir, format!("fsync dir failed: {}", e)))?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}
