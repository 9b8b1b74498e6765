//! Non-interactive front end.
//!
//! Answers come from command-line flags and drive the same [`Controller`] as
//! the terminal UI. Anything not given falls back to the step defaults; the
//! runner and wifi steps are skipped when their credentials are missing.

use crate::error::WizardError;
use crate::models::KeySet;
use crate::wizard::steps::{ssh_key, RunnerInput, Step, StepInput, WifiInput};
use crate::wizard::Controller;
use log::info;
use secrecy::SecretString;

/// Where `--ssh-key` points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyMethod {
    /// Account name on the key endpoint.
    Github,
    /// The key line itself.
    #[default]
    Direct,
    /// Path to a public key file.
    File,
}

#[derive(Debug, Default)]
pub struct HeadlessAnswers {
    pub ssh_key: Option<String>,
    pub ssh_method: KeyMethod,
    pub runner_token: Option<SecretString>,
    pub runner_url: Option<String>,
    pub runner_name: Option<String>,
    pub runner_labels: Option<String>,
    pub skip_runner: bool,
    pub hostname: Option<String>,
    pub timezone: Option<String>,
    pub wifi_ssid: Option<String>,
    pub wifi_password: Option<SecretString>,
    pub skip_wifi: bool,
}

impl HeadlessAnswers {
    /// Walk the controller from `Welcome` to `Review`.
    pub async fn fill(mut self, controller: &mut Controller) -> Result<(), WizardError> {
        controller.start()?;
        while let Some(step) = controller.current_step().cloned() {
            let input = self.input_for(&step).await?;
            controller.advance(input)?;
        }
        info!(
            "[PHASE: wizard] [STEP: headless] {} answer(s) collected",
            controller.answers().len()
        );
        Ok(())
    }

    async fn input_for(&mut self, step: &Step) -> Result<StepInput, WizardError> {
        Ok(match step {
            Step::SshKey(s) => StepInput::SshKeys(self.keys(s).await?),
            Step::Runner(_) => StepInput::Runner(match self.runner_token.take() {
                Some(token) if !self.skip_runner => RunnerInput::Configure {
                    token,
                    name: self.runner_name.take().unwrap_or_default(),
                    labels: self.runner_labels.take().unwrap_or_default(),
                    url: self.runner_url.take().unwrap_or_default(),
                },
                _ => RunnerInput::Skip,
            }),
            Step::Hostname(_) => StepInput::Hostname(self.hostname.take().unwrap_or_default()),
            Step::Timezone(_) => StepInput::Timezone(self.timezone.take().unwrap_or_default()),
            Step::Wifi(_) => StepInput::Wifi(match self.wifi_ssid.take() {
                Some(ssid) if !self.skip_wifi => WifiInput::Configure {
                    ssid,
                    passphrase: self
                        .wifi_password
                        .take()
                        .unwrap_or_else(|| SecretString::from(String::new())),
                },
                _ => WifiInput::Skip,
            }),
        })
    }

    async fn keys(&mut self, step: &ssh_key::SshKeyStep) -> Result<KeySet, WizardError> {
        let mut keys = KeySet::new();
        let Some(source) = self.ssh_key.take() else {
            return Ok(keys);
        };
        let batch = match self.ssh_method {
            KeyMethod::Github => step.fetch_by_account(&source).await?.accepted,
            KeyMethod::File => ssh_key::load_from_path(&source)?.accepted,
            KeyMethod::Direct => {
                let ssh_key::KeyBatch { accepted, rejected } = ssh_key::parse_pasted(&source);
                if let Some(first) = rejected.into_iter().next() {
                    return Err(first.error);
                }
                accepted
            }
        };
        keys.extend(batch);
        Ok(keys)
    }
}
