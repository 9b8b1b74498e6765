//! CI runner step.
//!
//! The registration token is held as a [`SecretString`] and never shown
//! again once typed. The URL is either literal or read from a file given by
//! absolute path.

use super::Prompt;
use crate::error::WizardError;
use crate::models::{Answer, RunnerConfig, UrlSource};
use crate::settings::WizardSettings;
use crate::utils::validation::{parse_labels, validate_http_url, validate_runner_name};
use log::info;
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum RunnerInput {
    Skip,
    Configure {
        token: SecretString,
        /// Empty selects the default name.
        name: String,
        /// Comma/space separated.
        labels: String,
        /// Literal URL, absolute path to a URL file, or empty for the default.
        url: String,
    },
}

#[derive(Debug, Clone)]
pub struct RunnerStep {
    default_name: String,
    default_url: String,
}

impl RunnerStep {
    pub fn new(default_name: impl Into<String>, default_url: impl Into<String>) -> Self {
        Self {
            default_name: default_name.into(),
            default_url: default_url.into(),
        }
    }

    pub fn from_settings(settings: &WizardSettings) -> Self {
        Self::new(
            settings.defaults.hostname.clone(),
            settings.defaults.runner_url.clone(),
        )
    }

    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    pub fn default_url(&self) -> &str {
        &self.default_url
    }

    pub fn prompt(&self) -> Prompt {
        Prompt {
            title: "CI runner",
            help: "Registration token from the repository's Settings > Actions > Runners page. \
                   Leave the token empty to skip the runner."
                .to_string(),
            default: Some(self.default_url.clone()),
        }
    }

    fn resolve_url(&self, raw: &str) -> Result<UrlSource, WizardError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(UrlSource::Literal(validate_http_url(&self.default_url)?));
        }
        if raw.starts_with('/') {
            let path = PathBuf::from(raw);
            let url = read_url_file(&path)?;
            return Ok(UrlSource::File { path, url });
        }
        Ok(UrlSource::Literal(validate_http_url(raw)?))
    }

    fn check_token(token: &SecretString) -> Result<(), WizardError> {
        let value = token.expose_secret().trim();
        if value.is_empty() {
            return Err(WizardError::validation("Runner token is required"));
        }
        if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(WizardError::validation(
                "Runner token must not contain whitespace",
            ));
        }
        Ok(())
    }

    pub fn validate(&self, input: &RunnerInput) -> Result<(), WizardError> {
        match input {
            RunnerInput::Skip => Ok(()),
            RunnerInput::Configure {
                token,
                name,
                labels,
                url,
            } => {
                Self::check_token(token)?;
                let name = name.trim();
                validate_runner_name(if name.is_empty() {
                    self.default_name.as_str()
                } else {
                    name
                })?;
                parse_labels(labels)?;
                self.resolve_url(url)?;
                Ok(())
            }
        }
    }

    pub fn collect(&self, input: RunnerInput) -> Result<Answer, WizardError> {
        self.validate(&input)?;
        match input {
            RunnerInput::Skip => {
                info!("[PHASE: wizard] [STEP: runner] runner skipped");
                Ok(Answer::Runner(None))
            }
            RunnerInput::Configure {
                token,
                name,
                labels,
                url,
            } => {
                let name = match name.trim() {
                    "" => self.default_name.clone(),
                    value => value.to_string(),
                };
                let url = self.resolve_url(&url)?;
                let token = SecretString::from(token.expose_secret().trim().to_string());
                info!(
                    "[PHASE: wizard] [STEP: runner] runner configured (name={}, url={})",
                    name,
                    crate::utils::logging::mask_url(url.url().as_str())
                );
                Ok(Answer::Runner(Some(RunnerConfig {
                    name,
                    labels: parse_labels(&labels)?,
                    url,
                    token: Some(token),
                })))
            }
        }
    }
}

fn read_url_file(path: &Path) -> Result<url::Url, WizardError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        WizardError::validation(format!("Cannot read URL file {}: {}", path.display(), e))
    })?;
    validate_http_url(content.trim()).map_err(|e| {
        WizardError::validation(format!("URL file {}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step() -> RunnerStep {
        RunnerStep::new("pi4-smoke-test", "https://github.com/denysvitali/nix-hil-rpi")
    }

    fn configure(token: &str, name: &str, labels: &str, url: &str) -> RunnerInput {
        RunnerInput::Configure {
            token: SecretString::from(token.to_string()),
            name: name.into(),
            labels: labels.into(),
            url: url.into(),
        }
    }

    #[test]
    fn defaults_fill_empty_fields() {
        let answer = step()
            .collect(configure(" AABBCCDD1122 ", "", "nixos,pi4", ""))
            .expect("collect");
        let Answer::Runner(Some(runner)) = answer else {
            panic!("expected configured runner");
        };
        assert_eq!(runner.name, "pi4-smoke-test");
        assert_eq!(runner.labels, vec!["nixos", "pi4"]);
        assert_eq!(
            runner.url.url().as_str(),
            "https://github.com/denysvitali/nix-hil-rpi"
        );
        assert_eq!(
            runner.token.as_ref().map(|t| t.expose_secret().to_string()),
            Some("AABBCCDD1122".to_string())
        );
    }

    #[test]
    fn skip_renders_disabled() {
        assert!(matches!(
            step().collect(RunnerInput::Skip),
            Ok(Answer::Runner(None))
        ));
    }

    #[test]
    fn token_errors_do_not_echo_the_token() {
        let err = step()
            .collect(configure("has space", "", "", ""))
            .expect_err("whitespace");
        assert!(!err.to_string().contains("has space"));
        assert!(step().validate(&configure("   ", "", "", "")).is_err());
    }

    #[test]
    fn url_must_be_http() {
        assert!(step()
            .validate(&configure("tok123", "", "", "ftp://example.com/x"))
            .is_err());
        assert!(step()
            .validate(&configure("tok123", "", "", "https://git.example.com/org"))
            .is_ok());
    }

    #[test]
    fn url_file_is_read_and_validated() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join(".runner_url");
        std::fs::write(&file, "https://github.com/org/fleet\n").expect("write");

        let answer = step()
            .collect(configure("tok123", "runner-1", "", &file.display().to_string()))
            .expect("collect");
        let Answer::Runner(Some(runner)) = answer else {
            panic!("expected configured runner");
        };
        assert_eq!(
            runner.url,
            UrlSource::File {
                path: file.clone(),
                url: url::Url::parse("https://github.com/org/fleet").expect("url"),
            }
        );

        std::fs::write(&file, "not a url").expect("write");
        assert!(step()
            .validate(&configure("tok123", "", "", &file.display().to_string()))
            .is_err());
        assert!(step()
            .validate(&configure("tok123", "", "", "/definitely/missing/url"))
            .is_err());
    }
}
