use super::Prompt;
use crate::error::WizardError;
use crate::installation::run_cmd_with_timeout;
use crate::models::{Answer, WifiCredentials};
use crate::utils::validation::{validate_ssid, validate_wpa_passphrase};
use log::{debug, warn};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

#[derive(Debug)]
pub enum WifiInput {
    Skip,
    Configure {
        ssid: String,
        passphrase: SecretString,
    },
}

#[derive(Debug, Clone)]
pub struct WifiStep {
    interface: String,
}

impl WifiStep {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }

    pub fn prompt(&self) -> Prompt {
        Prompt {
            title: "WiFi",
            help: format!(
                "Optional. Network name and WPA passphrase for {} (8-63 characters).",
                self.interface
            ),
            default: None,
        }
    }

    /// Visible networks, best effort; empty when scanning is not possible.
    pub async fn scan_networks(&self) -> Vec<String> {
        let args = vec![
            "dev".to_string(),
            self.interface.clone(),
            "scan".to_string(),
        ];
        match run_cmd_with_timeout("iw", &args, Duration::from_secs(15), "wifi_scan").await {
            Ok(out) if out.exit_code == Some(0) => {
                let networks = parse_iw_scan(&out.stdout);
                debug!(
                    "[PHASE: wizard] [STEP: wifi] scan found {} network(s)",
                    networks.len()
                );
                networks
            }
            Ok(out) => {
                warn!(
                    "[PHASE: wizard] [STEP: wifi] iw scan failed (exit_code={:?}): {}",
                    out.exit_code,
                    out.stderr.trim()
                );
                Vec::new()
            }
            Err(e) => {
                warn!("[PHASE: wizard] [STEP: wifi] iw unavailable: {:#}", e);
                Vec::new()
            }
        }
    }

    pub fn validate(&self, input: &WifiInput) -> Result<(), WizardError> {
        match input {
            WifiInput::Skip => Ok(()),
            WifiInput::Configure { ssid, passphrase } => {
                validate_ssid(ssid)?;
                validate_wpa_passphrase(passphrase.expose_secret())
            }
        }
    }

    pub fn collect(&self, input: WifiInput) -> Result<Answer, WizardError> {
        self.validate(&input)?;
        Ok(Answer::Wifi(match input {
            WifiInput::Skip => None,
            WifiInput::Configure { ssid, passphrase } => Some(WifiCredentials { ssid, passphrase }),
        }))
    }
}

/// SSIDs from `iw dev <iface> scan` output, first-seen order, hidden ones dropped.
pub fn parse_iw_scan(output: &str) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for line in output.lines() {
        let Some(ssid) = line.trim_start().strip_prefix("SSID:") else {
            continue;
        };
        let ssid = ssid.trim();
        if ssid.is_empty() || ssid.starts_with("\\x00") {
            continue;
        }
        if !seen.iter().any(|s| s == ssid) {
            seen.push(ssid.to_string());
        }
    }
    seen
}
