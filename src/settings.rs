//! Wizard settings.
//!
//! Layered with the `config` crate: embedded defaults, then the optional
//! settings file (`/etc/setup-tool/settings.toml` or `--config`), then
//! `SETUP_TOOL__SECTION__KEY` environment overrides.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_SETTINGS_PATH: &str = "/etc/setup-tool/settings.toml";

const DEFAULT_SETTINGS: &str = r#"
[paths]
config_dir = "/etc/nixos"
document = "/etc/nixos/setup.nix"
marker = "/var/lib/setup-tool/.configured"
log_dir = "/var/log/setup-tool"

[defaults]
hostname = "pi4-smoke-test"
timezone = "UTC"
runner_url = "https://github.com/denysvitali/nix-hil-rpi"

[runner]
attribute = "device"
token_file = "/var/lib/github-runner/.runner_token"
service_account = "github-runner"

[keys]
endpoint = "https://github.com"
timeout_secs = 10

[rebuild]
command = []
preferred_configs = ["pi4-aarch64", "pi4-cross"]

[wizard]
wifi_interface = "wlan0"
require_root = true
restart_units = []
"#;

#[derive(Debug, Clone, Deserialize)]
pub struct WizardSettings {
    pub paths: PathSettings,
    pub defaults: DefaultAnswers,
    pub runner: RunnerSettings,
    pub keys: KeyFetchSettings,
    pub rebuild: RebuildSettings,
    pub wizard: BehaviourSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathSettings {
    /// Directory handed to the rebuild command (holds `configuration.nix` or `flake.nix`).
    pub config_dir: PathBuf,
    /// The document the wizard mutates.
    pub document: PathBuf,
    /// Completion marker; its existence means "already configured".
    pub marker: PathBuf,
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DefaultAnswers {
    pub hostname: String,
    pub timezone: String,
    pub runner_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSettings {
    /// Attribute name under `services.github-runners`.
    pub attribute: String,
    pub token_file: PathBuf,
    /// Account that owns the token file; root keeps it when the account is missing.
    pub service_account: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyFetchSettings {
    /// Base URL; keys are read from `<endpoint>/<account>.keys`.
    pub endpoint: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RebuildSettings {
    /// Full command override. Empty means `nixos-rebuild switch` with flake detection.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub flake_config: Option<String>,
    #[serde(default)]
    pub preferred_configs: Vec<String>,
    /// Repository cloned into `config_dir` when it holds no configuration yet.
    #[serde(default)]
    pub config_repo: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BehaviourSettings {
    pub wifi_interface: String,
    pub require_root: bool,
    /// Units restarted (best effort) after a successful apply.
    #[serde(default)]
    pub restart_units: Vec<String>,
}

impl WizardSettings {
    /// Built-in defaults only; no file or environment lookups.
    pub fn defaults() -> Result<Self> {
        Config::builder()
            .add_source(File::from_str(DEFAULT_SETTINGS, FileFormat::Toml))
            .build()
            .context("Failed to build default settings")?
            .try_deserialize()
            .context("Failed to deserialize default settings")
    }

    /// Load defaults, the settings file (optional unless given explicitly) and env overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut builder =
            Config::builder().add_source(File::from_str(DEFAULT_SETTINGS, FileFormat::Toml));

        builder = match explicit {
            Some(path) => builder.add_source(File::from(path.to_path_buf()).required(true)),
            None => builder
                .add_source(File::from(PathBuf::from(DEFAULT_SETTINGS_PATH)).required(false)),
        };

        builder = builder.add_source(
            Environment::with_prefix("SETUP_TOOL")
                .prefix_separator("__")
                .separator("__"),
        );

        let settings: WizardSettings = builder
            .build()
            .context("Failed to load settings")?
            .try_deserialize()
            .context("Invalid settings")?;
        settings.check()?;
        Ok(settings)
    }

    fn check(&self) -> Result<()> {
        if self.paths.document.file_name().is_none() {
            anyhow::bail!("paths.document must name a file: {:?}", self.paths.document);
        }
        if self.runner.token_file.file_name().is_none() {
            anyhow::bail!(
                "runner.token_file must name a file: {:?}",
                self.runner.token_file
            );
        }
        if self.keys.timeout_secs == 0 {
            anyhow::bail!("keys.timeout_secs must be greater than zero");
        }
        Ok(())
    }

    /// Point every writable path below `root` (tests and dry runs).
    pub fn rooted_at(mut self, root: &Path) -> Self {
        let rebase = |p: &Path| root.join(p.strip_prefix("/").unwrap_or(p));
        self.paths.config_dir = rebase(&self.paths.config_dir);
        self.paths.document = rebase(&self.paths.document);
        self.paths.marker = rebase(&self.paths.marker);
        self.paths.log_dir = rebase(&self.paths.log_dir);
        self.runner.token_file = rebase(&self.runner.token_file);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_device_layout() {
        let s = WizardSettings::defaults().expect("defaults");
        assert_eq!(s.paths.document, PathBuf::from("/etc/nixos/setup.nix"));
        assert_eq!(s.defaults.hostname, "pi4-smoke-test");
        assert_eq!(s.defaults.timezone, "UTC");
        assert_eq!(s.keys.timeout_secs, 10);
        assert!(s.rebuild.command.is_empty());
        assert!(s.rebuild.config_repo.is_none());
        assert_eq!(s.rebuild.preferred_configs, vec!["pi4-aarch64", "pi4-cross"]);
        assert!(s.wizard.require_root);
    }

    #[test]
    fn explicit_file_overrides_defaults() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("settings.toml");
        std::fs::write(
            &path,
            r#"
[defaults]
hostname = "lab-pi"
timezone = "Europe/Zurich"
runner_url = "https://github.com/example/fleet"

[rebuild]
command = ["sh", "-c", "true"]
flake_config = "pi4-aarch64"
"#,
        )
        .expect("write settings");

        let s = WizardSettings::load(Some(&path)).expect("load");
        assert_eq!(s.defaults.hostname, "lab-pi");
        assert_eq!(s.rebuild.command, vec!["sh", "-c", "true"]);
        assert_eq!(s.rebuild.flake_config.as_deref(), Some("pi4-aarch64"));
        // Untouched sections keep their defaults.
        assert_eq!(s.runner.attribute, "device");
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert!(WizardSettings::load(Some(&tmp.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn rooted_at_rebases_writable_paths() {
        let s = WizardSettings::defaults()
            .expect("defaults")
            .rooted_at(Path::new("/tmp/sandbox"));
        assert_eq!(
            s.paths.document,
            PathBuf::from("/tmp/sandbox/etc/nixos/setup.nix")
        );
        assert_eq!(
            s.runner.token_file,
            PathBuf::from("/tmp/sandbox/var/lib/github-runner/.runner_token")
        );
    }
}
