//! Wizard steps.
//!
//! Each step exposes the same capabilities (prompt, validate, collect); the
//! [`Step`] enum dispatches to the concrete implementation. Steps never touch
//! the system: they only turn operator input into an [`Answer`].

pub mod hostname;
pub mod runner;
pub mod ssh_key;
pub mod timezone;
pub mod wifi;

pub use hostname::HostnameStep;
pub use runner::{RunnerInput, RunnerStep};
pub use ssh_key::{KeyBatch, SshKeyStep};
pub use timezone::TimezoneStep;
pub use wifi::{WifiInput, WifiStep};

use crate::error::WizardError;
use crate::models::{Answer, KeySet, StepId};
use crate::settings::WizardSettings;

/// What a front end shows for a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub title: &'static str,
    pub help: String,
    pub default: Option<String>,
}

/// Raw operator input for one step.
#[derive(Debug)]
pub enum StepInput {
    SshKeys(KeySet),
    Runner(RunnerInput),
    Hostname(String),
    Timezone(String),
    Wifi(WifiInput),
}

impl StepInput {
    fn step_id(&self) -> StepId {
        match self {
            StepInput::SshKeys(_) => StepId::SshKey,
            StepInput::Runner(_) => StepId::Runner,
            StepInput::Hostname(_) => StepId::Hostname,
            StepInput::Timezone(_) => StepId::Timezone,
            StepInput::Wifi(_) => StepId::Wifi,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    SshKey(SshKeyStep),
    Runner(RunnerStep),
    Hostname(HostnameStep),
    Timezone(TimezoneStep),
    Wifi(WifiStep),
}

impl Step {
    pub fn id(&self) -> StepId {
        match self {
            Step::SshKey(_) => StepId::SshKey,
            Step::Runner(_) => StepId::Runner,
            Step::Hostname(_) => StepId::Hostname,
            Step::Timezone(_) => StepId::Timezone,
            Step::Wifi(_) => StepId::Wifi,
        }
    }

    pub fn prompt(&self) -> Prompt {
        match self {
            Step::SshKey(s) => s.prompt(),
            Step::Runner(s) => s.prompt(),
            Step::Hostname(s) => s.prompt(),
            Step::Timezone(s) => s.prompt(),
            Step::Wifi(s) => s.prompt(),
        }
    }

    fn mismatch(&self, input: &StepInput) -> WizardError {
        WizardError::InvalidState(format!(
            "{} input given to the {} step",
            input.step_id().as_str(),
            self.id().as_str()
        ))
    }

    pub fn validate(&self, input: &StepInput) -> Result<(), WizardError> {
        match (self, input) {
            (Step::SshKey(s), StepInput::SshKeys(keys)) => s.validate(keys),
            (Step::Runner(s), StepInput::Runner(r)) => s.validate(r),
            (Step::Hostname(s), StepInput::Hostname(h)) => s.validate(h),
            (Step::Timezone(s), StepInput::Timezone(tz)) => s.validate(tz),
            (Step::Wifi(s), StepInput::Wifi(w)) => s.validate(w),
            _ => Err(self.mismatch(input)),
        }
    }

    pub fn collect(&self, input: StepInput) -> Result<Answer, WizardError> {
        if input.step_id() != self.id() {
            return Err(self.mismatch(&input));
        }
        match (self, input) {
            (Step::SshKey(s), StepInput::SshKeys(keys)) => s.collect(keys),
            (Step::Runner(s), StepInput::Runner(r)) => s.collect(r),
            (Step::Hostname(s), StepInput::Hostname(h)) => s.collect(&h),
            (Step::Timezone(s), StepInput::Timezone(tz)) => s.collect(&tz),
            (Step::Wifi(s), StepInput::Wifi(w)) => s.collect(w),
            _ => Err(WizardError::InvalidState("step/input mismatch".to_string())),
        }
    }
}

/// The standard step sequence.
pub fn default_steps(settings: &WizardSettings, timezones: Vec<String>) -> Vec<Step> {
    vec![
        Step::SshKey(SshKeyStep::from_settings(settings)),
        Step::Runner(RunnerStep::from_settings(settings)),
        Step::Hostname(HostnameStep::new(settings.defaults.hostname.clone())),
        Step::Timezone(TimezoneStep::new(
            settings.defaults.timezone.clone(),
            timezones,
        )),
        Step::Wifi(WifiStep::new(settings.wizard.wifi_interface.clone())),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps() -> Vec<Step> {
        let settings = WizardSettings::defaults().expect("defaults");
        default_steps(&settings, vec!["UTC".to_string()])
    }

    #[test]
    fn default_order_is_keys_runner_hostname_timezone_wifi() {
        let ids: Vec<StepId> = steps().iter().map(Step::id).collect();
        assert_eq!(
            ids,
            vec![
                StepId::SshKey,
                StepId::Runner,
                StepId::Hostname,
                StepId::Timezone,
                StepId::Wifi
            ]
        );
    }

    #[test]
    fn mismatched_input_is_invalid_state() {
        let steps = steps();
        let err = steps[2]
            .collect(StepInput::Timezone("UTC".into()))
            .expect_err("mismatch");
        assert!(matches!(err, WizardError::InvalidState(_)));
        assert!(steps[0]
            .validate(&StepInput::Hostname("x".into()))
            .is_err());
    }

    #[test]
    fn prompts_carry_defaults() {
        let steps = steps();
        assert_eq!(
            steps[2].prompt().default.as_deref(),
            Some("pi4-smoke-test")
        );
        assert_eq!(steps[3].prompt().default.as_deref(), Some("UTC"));
    }
}
