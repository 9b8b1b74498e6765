// Secret file persistence (runner registration token)
//
// The file is created 0600 before any byte is written, handed to the service
// account while still a temp file, then renamed into place. The secret value
// is never logged; only a hash prefix is.

use crate::error::WizardError;
use crate::installation::files;
use crate::security::crypto::secret_fingerprint;
use log::{debug, info, warn};
use secrecy::{ExposeSecret, SecretString};
use std::path::Path;

pub const SECRET_FILE_MODE: u32 = 0o600;

/// Persist `secret` at `path`, owned by `owner` when that account exists.
///
/// Trailing newlines are stripped; the file holds the bare value.
pub fn write_secret_file(
    path: &Path,
    secret: &SecretString,
    owner: &str,
) -> Result<(), WizardError> {
    let value = secret.expose_secret().trim_end_matches(['\r', '\n']);
    if value.is_empty() {
        return Err(WizardError::validation("Secret value is empty"));
    }

    let staged = files::stage(path, value.as_bytes(), SECRET_FILE_MODE)?;
    hand_over(staged.temp_path(), owner)?;
    staged.commit()?;
    verify_restricted(path)?;

    info!(
        "[PHASE: apply] [STEP: token] secret written (path={:?}, owner={}, fingerprint={})",
        path,
        owner,
        secret_fingerprint(value)
    );
    Ok(())
}

#[cfg(unix)]
fn lookup_account(name: &str) -> Option<(u32, u32)> {
    nix::unistd::User::from_name(name)
        .ok()
        .flatten()
        .map(|u| (u.uid.as_raw(), u.gid.as_raw()))
}

#[cfg(unix)]
fn hand_over(temp: &Path, owner: &str) -> Result<(), WizardError> {
    let Some((uid, gid)) = lookup_account(owner) else {
        warn!(
            "[PHASE: apply] [STEP: token] account '{}' does not exist; token stays owned by the current user",
            owner
        );
        return Ok(());
    };

    if !nix::unistd::geteuid().is_root() {
        debug!(
            "[PHASE: apply] [STEP: token] not running as root; skipping chown to '{}'",
            owner
        );
        return Ok(());
    }

    std::os::unix::fs::chown(temp, Some(uid), Some(gid))
        .map_err(|e| WizardError::permission(temp, format!("chown to '{}' failed: {}", owner, e)))
}

#[cfg(not(unix))]
fn hand_over(_temp: &Path, _owner: &str) -> Result<(), WizardError> {
    Ok(())
}

/// Group and other must have no access at all.
#[cfg(unix)]
pub fn verify_restricted(path: &Path) -> Result<(), WizardError> {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(path)
        .map_err(|e| WizardError::permission(path, format!("stat failed: {}", e)))?
        .permissions()
        .mode();
    if mode & 0o077 != 0 {
        return Err(WizardError::permission(
            path,
            format!("mode {:o} grants group/other access", mode & 0o777),
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn verify_restricted(_path: &Path) -> Result<(), WizardError> {
    Ok(())
}
