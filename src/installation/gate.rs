// Completion marker
//
// Presence of the marker file means the device has been configured. The boot
// unit is conditioned on its absence; the wizard checks it at startup.

use crate::error::WizardError;
use crate::installation::files;
use log::info;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct CompletionGate {
    marker: PathBuf,
}

impl CompletionGate {
    pub fn new(marker: impl Into<PathBuf>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    pub fn marker(&self) -> &Path {
        &self.marker
    }

    pub fn is_set(&self) -> bool {
        self.marker.exists()
    }

    /// Create the (empty) marker. Idempotent.
    pub fn mark(&self) -> Result<(), WizardError> {
        if self.is_set() {
            return Ok(());
        }
        files::stage(&self.marker, b"", 0o644)?.commit()?;
        info!(
            "[PHASE: apply] [STEP: gate] completion marker created ({:?})",
            self.marker
        );
        Ok(())
    }

    /// Remove the marker so the wizard runs again on next boot.
    ///
    /// Operator maintenance only (`--reset`); the session flow never clears it.
    pub fn clear(&self) -> Result<bool, WizardError> {
        match std::fs::remove_file(&self.marker) {
            Ok(()) => {
                info!(
                    "[PHASE: maintenance] [STEP: gate] completion marker removed ({:?})",
                    self.marker
                );
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(WizardError::write(&self.marker, format!("remove failed: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_is_idempotent_and_empty() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let gate = CompletionGate::new(tmp.path().join("state").join(".configured"));
        assert!(!gate.is_set());

        gate.mark().expect("mark");
        gate.mark().expect("mark again");

        assert!(gate.is_set());
        assert_eq!(std::fs::read(gate.marker()).expect("read").len(), 0);
    }

    #[test]
    fn clear_reports_whether_marker_existed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let gate = CompletionGate::new(tmp.path().join(".configured"));
        assert!(!gate.clear().expect("clear missing"));
        gate.mark().expect("mark");
        assert!(gate.clear().expect("clear"));
        assert!(!gate.is_set());
    }
}
