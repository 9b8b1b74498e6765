// Input validation utilities
//
// Structural checks only: these guard the rendered configuration document and
// the key endpoint request, they do not try to prove a value is usable.

use crate::error::WizardError;
use base64::Engine as _;
use regex::Regex;
use std::sync::OnceLock;
use url::Url;

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> Result<&'static Regex, WizardError> {
    if let Some(re) = cell.get() {
        return Ok(re);
    }
    let re = Regex::new(pattern).map_err(|e| {
        WizardError::validation(format!("Internal error: failed to compile pattern: {}", e))
    })?;
    Ok(cell.get_or_init(|| re))
}

/// Validate a hostname as a single RFC 1123 DNS label.
pub fn validate_hostname(name: &str) -> Result<(), WizardError> {
    static LABEL: OnceLock<Regex> = OnceLock::new();
    if name.is_empty() {
        return Err(WizardError::validation("Hostname cannot be empty"));
    }
    if name.len() > 63 {
        return Err(WizardError::validation(
            "Hostname cannot exceed 63 characters",
        ));
    }
    let re = regex(&LABEL, r"^[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?$")?;
    if !re.is_match(name) {
        return Err(WizardError::validation(
            "Hostname may only contain letters, digits and '-', and cannot start or end with '-'",
        ));
    }
    Ok(())
}

/// Validate an account name for the public key endpoint (GitHub username rules).
pub fn validate_account_name(name: &str) -> Result<(), WizardError> {
    static ACCOUNT: OnceLock<Regex> = OnceLock::new();
    if name.is_empty() {
        return Err(WizardError::validation("Account name is required"));
    }
    if name.len() > 39 {
        return Err(WizardError::validation(
            "Account name cannot exceed 39 characters",
        ));
    }
    if !regex(&ACCOUNT, r"^[A-Za-z0-9-]+$")?.is_match(name) {
        return Err(WizardError::validation(format!(
            "Invalid account name: '{}'",
            name
        )));
    }
    Ok(())
}

/// Validate a runner name (also used as a systemd unit fragment).
pub fn validate_runner_name(name: &str) -> Result<(), WizardError> {
    static RUNNER: OnceLock<Regex> = OnceLock::new();
    if name.is_empty() {
        return Err(WizardError::validation("Runner name cannot be empty"));
    }
    if name.len() > 64 {
        return Err(WizardError::validation(
            "Runner name cannot exceed 64 characters",
        ));
    }
    if !regex(&RUNNER, r"^[A-Za-z0-9][A-Za-z0-9_.-]*$")?.is_match(name) {
        return Err(WizardError::validation(format!(
            "Invalid runner name: '{}'",
            name
        )));
    }
    Ok(())
}

/// Split a comma/whitespace separated label list, dropping duplicates but
/// keeping first-seen order.
pub fn parse_labels(raw: &str) -> Result<Vec<String>, WizardError> {
    static LABEL: OnceLock<Regex> = OnceLock::new();
    let re = regex(&LABEL, r"^[A-Za-z0-9][A-Za-z0-9_.:-]*$")?;
    let mut out: Vec<String> = Vec::new();
    for part in raw.split([',', ' ', '\t']).map(str::trim) {
        if part.is_empty() {
            continue;
        }
        if !re.is_match(part) {
            return Err(WizardError::validation(format!(
                "Invalid runner label: '{}'",
                part
            )));
        }
        if !out.iter().any(|l| l == part) {
            out.push(part.to_string());
        }
    }
    Ok(out)
}

/// Validate a runner registration URL: http(s) scheme and a host.
pub fn validate_http_url(raw: &str) -> Result<Url, WizardError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| WizardError::validation(format!("Invalid URL: {}", e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(WizardError::validation(format!(
            "URL scheme must be http or https (got '{}')",
            url.scheme()
        )));
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(WizardError::validation("URL must include a host"));
    }
    Ok(url)
}

/// Validate a wifi network name (SSID is 1..=32 bytes).
pub fn validate_ssid(ssid: &str) -> Result<(), WizardError> {
    if ssid.is_empty() {
        return Err(WizardError::validation("WiFi network name is required"));
    }
    if ssid.len() > 32 {
        return Err(WizardError::validation(
            "WiFi network name cannot exceed 32 bytes",
        ));
    }
    if ssid.chars().any(char::is_control) {
        return Err(WizardError::validation(
            "WiFi network name contains control characters",
        ));
    }
    Ok(())
}

/// Validate a WPA-PSK passphrase: 8..=63 printable ASCII, or 64 hex digits.
///
/// Error messages never include the passphrase.
pub fn validate_wpa_passphrase(psk: &str) -> Result<(), WizardError> {
    if psk.len() == 64 && psk.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(());
    }
    if !(8..=63).contains(&psk.len()) {
        return Err(WizardError::validation(
            "WiFi passphrase must be 8 to 63 characters",
        ));
    }
    if !psk.chars().all(|c| (' '..='~').contains(&c)) {
        return Err(WizardError::validation(
            "WiFi passphrase must be printable ASCII",
        ));
    }
    Ok(())
}

/// Public key algorithms accepted in `authorized_keys` lines.
pub const SSH_KEY_TYPES: &[&str] = &[
    "ssh-rsa",
    "ssh-ed25519",
    "ssh-dss",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "sk-ssh-ed25519@openssh.com",
    "sk-ecdsa-sha2-nistp256@openssh.com",
];

/// Validate one public key line (`<type> <base64> [comment]`).
///
/// The base64 body must decode and start with the same algorithm name as
/// the type token. Returns the trimmed line on success.
pub fn validate_ssh_public_key(line: &str) -> Result<String, WizardError> {
    let line = line.trim();
    let mut parts = line.split_whitespace();
    let (Some(key_type), Some(body)) = (parts.next(), parts.next()) else {
        return Err(WizardError::validation(
            "Invalid SSH key format (expected '<type> <key> [comment]')",
        ));
    };

    if !SSH_KEY_TYPES.contains(&key_type) {
        return Err(WizardError::validation(format!(
            "Unsupported SSH key type: '{}'",
            key_type
        )));
    }

    let blob = base64::engine::general_purpose::STANDARD
        .decode(body)
        .map_err(|_| WizardError::validation("Invalid SSH key data (not valid base64)"))?;

    if blob.len() < 4 {
        return Err(WizardError::validation("Invalid SSH key data (truncated)"));
    }
    let name_len = u32::from_be_bytes([blob[0], blob[1], blob[2], blob[3]]) as usize;
    let embedded = blob
        .get(4..4 + name_len)
        .ok_or_else(|| WizardError::validation("Invalid SSH key data (truncated)"))?;
    if embedded != key_type.as_bytes() {
        return Err(WizardError::validation(format!(
            "SSH key data does not match its type '{}'",
            key_type
        )));
    }

    Ok(line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_key;

    #[test]
    fn hostname_accepts_dns_labels() {
        for ok in ["pi4-smoke-test", "a", "node01", "A1-b2"] {
            assert!(validate_hostname(ok).is_ok(), "{} should be valid", ok);
        }
    }

    #[test]
    fn hostname_rejects_structural_errors() {
        for bad in ["", "-lead", "trail-", "has.dot", "under_score", "sp ace"] {
            assert!(validate_hostname(bad).is_err(), "{} should be rejected", bad);
        }
        assert!(validate_hostname(&"a".repeat(64)).is_err());
        assert!(validate_hostname(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn account_name_rules() {
        assert!(validate_account_name("alice").is_ok());
        assert!(validate_account_name("denys-vitali").is_ok());
        assert!(validate_account_name("").is_err());
        assert!(validate_account_name("../etc/passwd").is_err());
        assert!(validate_account_name("a/b").is_err());
        assert!(validate_account_name(&"x".repeat(40)).is_err());
    }

    #[test]
    fn labels_are_deduplicated_in_order() {
        let labels = parse_labels("nixos, aarch64 pi4,nixos,,").expect("valid labels");
        assert_eq!(labels, vec!["nixos", "aarch64", "pi4"]);
        assert!(parse_labels("ok,bad\"label").is_err());
        assert!(parse_labels("").expect("empty ok").is_empty());
    }

    #[test]
    fn url_requires_http_scheme_and_host() {
        assert!(validate_http_url("https://github.com/denysvitali/nix-hil-rpi").is_ok());
        assert!(validate_http_url("http://git.local/org").is_ok());
        assert!(validate_http_url("ftp://github.com/x").is_err());
        assert!(validate_http_url("github.com/x").is_err());
        assert!(validate_http_url("file:///etc/passwd").is_err());
    }

    #[test]
    fn ssid_bounds() {
        assert!(validate_ssid("HomeNet").is_ok());
        assert!(validate_ssid("").is_err());
        assert!(validate_ssid(&"s".repeat(33)).is_err());
        assert!(validate_ssid("bad\nname").is_err());
    }

    #[test]
    fn passphrase_rules_do_not_echo_secret() {
        assert!(validate_wpa_passphrase("correct horse").is_ok());
        assert!(validate_wpa_passphrase(&"a".repeat(64)).is_ok());
        let err = validate_wpa_passphrase("short").expect_err("too short");
        assert!(!err.to_string().contains("short"));
        assert!(validate_wpa_passphrase(&"z".repeat(64)).is_err());
        assert!(validate_wpa_passphrase("pässwörter-sind-toll").is_err());
    }

    #[test]
    fn ssh_key_with_matching_blob_is_accepted() {
        let key = sample_key("ssh-ed25519", 7, "alice@laptop");
        assert_eq!(validate_ssh_public_key(&format!("  {}\n", key)).expect("valid"), key);
        let no_comment = sample_key("ecdsa-sha2-nistp256", 1, "");
        assert!(validate_ssh_public_key(&no_comment).is_ok());
    }

    #[test]
    fn ssh_key_structural_failures() {
        assert!(validate_ssh_public_key("").is_err());
        assert!(validate_ssh_public_key("ssh-ed25519").is_err());
        assert!(validate_ssh_public_key("ssh-foo AAAA").is_err());
        assert!(validate_ssh_public_key("ssh-ed25519 not*base64").is_err());
        assert!(validate_ssh_public_key("ssh-ed25519 AAAA").is_err());
    }

    #[test]
    fn ssh_key_type_must_match_blob() {
        let ed = sample_key("ssh-ed25519", 3, "");
        let body = ed.split_whitespace().nth(1).expect("body");
        let err = validate_ssh_public_key(&format!("ssh-rsa {}", body)).expect_err("mismatch");
        assert!(err.to_string().contains("does not match"));
    }
}
