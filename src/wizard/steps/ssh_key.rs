//! SSH key step: fetch by account, paste, or load from a file.
//!
//! Every source goes through the same line parser. Malformed lines are
//! reported one by one and never abort the batch; only structurally valid
//! keys reach the [`KeySet`].

use super::Prompt;
use crate::error::WizardError;
use crate::models::{Answer, KeyProvenance, KeySet, SshKeyEntry};
use crate::settings::WizardSettings;
use crate::utils::logging::mask_url;
use crate::utils::validation::{validate_account_name, validate_ssh_public_key};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug)]
pub struct RejectedLine {
    /// 1-based line number in the source text.
    pub line_no: usize,
    pub error: WizardError,
}

/// Result of parsing one key source.
#[derive(Debug, Default)]
pub struct KeyBatch {
    pub accepted: Vec<SshKeyEntry>,
    pub rejected: Vec<RejectedLine>,
}

#[derive(Debug, Clone)]
pub struct SshKeyStep {
    endpoint: String,
    timeout: Duration,
}

impl SshKeyStep {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &WizardSettings) -> Self {
        Self::new(
            settings.keys.endpoint.clone(),
            Duration::from_secs(settings.keys.timeout_secs),
        )
    }

    pub fn prompt(&self) -> Prompt {
        Prompt {
            title: "SSH keys",
            help: format!(
                "Add keys for root login: fetch them from {}/<account>.keys, paste them, or load a .pub file. \
                 Without a key, password login stays enabled.",
                self.endpoint.trim_end_matches('/')
            ),
            default: None,
        }
    }

    /// Only structurally valid keys may be submitted; an empty set is allowed.
    pub fn validate(&self, keys: &KeySet) -> Result<(), WizardError> {
        for (idx, entry) in keys.iter().enumerate() {
            if !entry.valid {
                return Err(WizardError::validation(format!(
                    "Key {} ({}) is not valid",
                    idx + 1,
                    entry.summary()
                )));
            }
            validate_ssh_public_key(&entry.key).map_err(|e| {
                WizardError::validation(format!("Key {}: {}", idx + 1, e))
            })?;
        }
        Ok(())
    }

    pub fn collect(&self, keys: KeySet) -> Result<Answer, WizardError> {
        self.validate(&keys)?;
        info!(
            "[PHASE: wizard] [STEP: ssh-key] collected {} key(s)",
            keys.len()
        );
        Ok(Answer::SshKeys(keys))
    }

    /// GET `<endpoint>/<account>.keys` with a bounded timeout.
    pub async fn fetch_by_account(&self, account: &str) -> Result<KeyBatch, WizardError> {
        let account = account.trim();
        validate_account_name(account)?;

        let url = format!("{}/{}.keys", self.endpoint.trim_end_matches('/'), account);
        info!(
            "[PHASE: wizard] [STEP: ssh-key] fetching keys (url={}, timeout_s={})",
            mask_url(&url),
            self.timeout.as_secs()
        );

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("setup-tool/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| WizardError::Network(format!("failed to build HTTP client: {}", e)))?;

        let response = client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                WizardError::Network(format!(
                    "request to {} timed out after {}s",
                    mask_url(&url),
                    self.timeout.as_secs()
                ))
            } else {
                WizardError::Network(format!("request to {} failed: {}", mask_url(&url), e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(WizardError::Network(format!(
                "{} returned HTTP {}",
                mask_url(&url),
                status.as_u16()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| WizardError::Network(format!("failed to read response body: {}", e)))?;

        let batch = parse_lines(&body, KeyProvenance::FetchedByAccount(account.to_string()));
        log_rejections(&batch, "fetch");
        if batch.accepted.is_empty() {
            return Err(WizardError::EmptyResult {
                account: account.to_string(),
            });
        }
        info!(
            "[PHASE: wizard] [STEP: ssh-key] fetched {} key(s) for {} ({} rejected)",
            batch.accepted.len(),
            account,
            batch.rejected.len()
        );
        Ok(batch)
    }
}

/// Parse newline-delimited key lines; blank lines and `#` comments are skipped.
pub fn parse_lines(text: &str, provenance: KeyProvenance) -> KeyBatch {
    let mut batch = KeyBatch::default();
    for (idx, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match validate_ssh_public_key(trimmed) {
            Ok(key) => batch
                .accepted
                .push(SshKeyEntry::valid(key, provenance.clone())),
            Err(error) => batch.rejected.push(RejectedLine {
                line_no: idx + 1,
                error,
            }),
        }
    }
    batch
}

pub fn parse_pasted(text: &str) -> KeyBatch {
    let batch = parse_lines(text, KeyProvenance::Pasted);
    log_rejections(&batch, "paste");
    batch
}

/// Read keys from a local file (`~` expands to `$HOME`).
pub fn load_from_path(raw: &str) -> Result<KeyBatch, WizardError> {
    let path = expand_home(raw.trim());
    let text = std::fs::read_to_string(&path).map_err(|e| {
        WizardError::validation(format!("Cannot read {}: {}", path.display(), e))
    })?;
    let batch = parse_lines(&text, KeyProvenance::LoadedFromPath(path.clone()));
    log_rejections(&batch, "file");
    if batch.accepted.is_empty() {
        return Err(WizardError::validation(format!(
            "No valid SSH keys in {}",
            path.display()
        )));
    }
    Ok(batch)
}

fn expand_home(raw: &str) -> PathBuf {
    match (raw.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => Path::new(&home).join(rest),
        _ => PathBuf::from(raw),
    }
}

fn log_rejections(batch: &KeyBatch, source: &str) {
    for rejected in &batch.rejected {
        warn!(
            "[PHASE: wizard] [STEP: ssh-key] rejected line {} from {}: {}",
            rejected.line_no, source, rejected.error
        );
    }
}
