//! Fixtures shared by unit tests.

use base64::Engine as _;

/// Build a structurally valid public key line for `key_type`.
pub fn sample_key(key_type: &str, seed: u8, comment: &str) -> String {
    let mut blob = Vec::new();
    blob.extend_from_slice(&(key_type.len() as u32).to_be_bytes());
    blob.extend_from_slice(key_type.as_bytes());
    blob.extend_from_slice(&32u32.to_be_bytes());
    blob.extend(std::iter::repeat(seed).take(32));
    let body = base64::engine::general_purpose::STANDARD.encode(blob);
    format!("{} {} {}", key_type, body, comment).trim().to_string()
}

/// Settings with every writable path under `root` and a rebuild command that
/// runs `script` through `sh -c`.
pub fn sandbox_settings(root: &std::path::Path, script: &str) -> crate::settings::WizardSettings {
    let mut settings = crate::settings::WizardSettings::defaults()
        .expect("defaults")
        .rooted_at(root);
    settings.rebuild.command = vec!["sh".into(), "-c".into(), script.into()];
    settings.wizard.require_root = false;
    settings
}
