use super::Prompt;
use crate::error::WizardError;
use crate::models::Answer;
use crate::utils::validation::validate_hostname;

#[derive(Debug, Clone)]
pub struct HostnameStep {
    default: String,
}

impl HostnameStep {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            default: default.into(),
        }
    }

    pub fn prompt(&self) -> Prompt {
        Prompt {
            title: "Hostname",
            help: "Single DNS label: letters, digits and '-' (max 63).".to_string(),
            default: Some(self.default.clone()),
        }
    }

    fn resolve<'a>(&'a self, raw: &'a str) -> &'a str {
        match raw.trim() {
            "" => self.default.as_str(),
            value => value,
        }
    }

    /// Empty input selects the default.
    pub fn validate(&self, raw: &str) -> Result<(), WizardError> {
        validate_hostname(self.resolve(raw))
    }

    pub fn collect(&self, raw: &str) -> Result<Answer, WizardError> {
        self.validate(raw)?;
        Ok(Answer::Hostname(self.resolve(raw).to_string()))
    }
}
