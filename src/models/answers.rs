// Collected answers (in-memory only)
//
// Owned by the wizard controller for the lifetime of one session. The runner
// token lives here only until it has been written to its secret file.

use super::keys::KeySet;
use secrecy::SecretString;
use std::collections::BTreeMap;
use std::path::PathBuf;
use url::Url;

/// Step identifiers, in wizard order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StepId {
    SshKey,
    Runner,
    Hostname,
    Timezone,
    Wifi,
}

impl StepId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepId::SshKey => "ssh-key",
            StepId::Runner => "runner",
            StepId::Hostname => "hostname",
            StepId::Timezone => "timezone",
            StepId::Wifi => "wifi",
        }
    }
}

/// Where the runner registration URL comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlSource {
    Literal(Url),
    /// URL read from a file at collection time.
    File { path: PathBuf, url: Url },
}

impl UrlSource {
    pub fn url(&self) -> &Url {
        match self {
            UrlSource::Literal(url) => url,
            UrlSource::File { url, .. } => url,
        }
    }
}

#[derive(Debug)]
pub struct RunnerConfig {
    pub name: String,
    pub labels: Vec<String>,
    pub url: UrlSource,
    /// `None` once persisted to the token file.
    pub token: Option<SecretString>,
}

#[derive(Debug)]
pub struct WifiCredentials {
    pub ssid: String,
    pub passphrase: SecretString,
}

#[derive(Debug)]
pub enum Answer {
    SshKeys(KeySet),
    /// `None` when the runner was skipped.
    Runner(Option<RunnerConfig>),
    Hostname(String),
    Timezone(String),
    /// `None` when wifi was skipped.
    Wifi(Option<WifiCredentials>),
}

impl Answer {
    pub fn step_id(&self) -> StepId {
        match self {
            Answer::SshKeys(_) => StepId::SshKey,
            Answer::Runner(_) => StepId::Runner,
            Answer::Hostname(_) => StepId::Hostname,
            Answer::Timezone(_) => StepId::Timezone,
            Answer::Wifi(_) => StepId::Wifi,
        }
    }
}

#[derive(Debug, Default)]
pub struct Answers {
    values: BTreeMap<StepId, Answer>,
}

impl Answers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an answer, replacing the previous one for the same step.
    pub fn set(&mut self, answer: Answer) {
        self.values.insert(answer.step_id(), answer);
    }

    pub fn get(&self, id: StepId) -> Option<&Answer> {
        self.values.get(&id)
    }

    pub fn contains(&self, id: StepId) -> bool {
        self.values.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> Option<&KeySet> {
        match self.values.get(&StepId::SshKey) {
            Some(Answer::SshKeys(keys)) => Some(keys),
            _ => None,
        }
    }

    /// The runner configuration, or `None` when skipped or not yet answered.
    pub fn runner(&self) -> Option<&RunnerConfig> {
        match self.values.get(&StepId::Runner) {
            Some(Answer::Runner(runner)) => runner.as_ref(),
            _ => None,
        }
    }

    pub fn hostname(&self) -> Option<&str> {
        match self.values.get(&StepId::Hostname) {
            Some(Answer::Hostname(h)) => Some(h.as_str()),
            _ => None,
        }
    }

    pub fn timezone(&self) -> Option<&str> {
        match self.values.get(&StepId::Timezone) {
            Some(Answer::Timezone(tz)) => Some(tz.as_str()),
            _ => None,
        }
    }

    pub fn wifi(&self) -> Option<&WifiCredentials> {
        match self.values.get(&StepId::Wifi) {
            Some(Answer::Wifi(wifi)) => wifi.as_ref(),
            _ => None,
        }
    }

    /// Remove the runner token; the caller becomes its only owner.
    pub fn take_runner_token(&mut self) -> Option<SecretString> {
        match self.values.get_mut(&StepId::Runner) {
            Some(Answer::Runner(Some(runner))) => runner.token.take(),
            _ => None,
        }
    }

    /// One line per answered step, safe to display or log.
    pub fn summary(&self) -> Vec<(StepId, String)> {
        self.values
            .iter()
            .map(|(id, answer)| {
                let text = match answer {
                    Answer::SshKeys(keys) if keys.is_empty() => {
                        "none (password login stays enabled)".to_string()
                    }
                    Answer::SshKeys(keys) => format!("{} key(s)", keys.len()),
                    Answer::Runner(None) => "skipped".to_string(),
                    Answer::Runner(Some(r)) => {
                        let token = if r.token.is_some() {
                            "token pending"
                        } else {
                            "token stored"
                        };
                        let labels = if r.labels.is_empty() {
                            String::new()
                        } else {
                            format!(" [{}]", r.labels.join(", "))
                        };
                        format!(
                            "{} -> {}{} ({})",
                            r.name,
                            crate::utils::logging::mask_url(r.url.url().as_str()),
                            labels,
                            token
                        )
                    }
                    Answer::Hostname(h) => h.clone(),
                    Answer::Timezone(tz) => tz.clone(),
                    Answer::Wifi(None) => "disabled".to_string(),
                    Answer::Wifi(Some(w)) => format!("{} (passphrase set)", w.ssid),
                };
                (*id, text)
            })
            .collect()
    }
}
