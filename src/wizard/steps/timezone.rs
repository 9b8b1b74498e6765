use super::Prompt;
use crate::error::WizardError;
use crate::installation::run_cmd_with_timeout;
use crate::models::Answer;
use log::{debug, warn};
use std::time::Duration;

/// Used when `timedatectl` is unavailable.
pub const FALLBACK_TIMEZONES: &[&str] = &[
    "UTC",
    "Europe/London",
    "Europe/Paris",
    "Europe/Berlin",
    "Europe/Zurich",
    "Europe/Rome",
    "America/New_York",
    "America/Los_Angeles",
    "America/Chicago",
    "Asia/Tokyo",
    "Asia/Shanghai",
    "Australia/Sydney",
];

/// Zone catalogue from `timedatectl list-timezones`, or the built-in list.
pub async fn load_timezones() -> Vec<String> {
    let args = vec!["list-timezones".to_string()];
    match run_cmd_with_timeout("timedatectl", &args, Duration::from_secs(10), "list_timezones")
        .await
    {
        Ok(out) if out.exit_code == Some(0) => {
            let zones: Vec<String> = out
                .stdout
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
            if !zones.is_empty() {
                debug!(
                    "[PHASE: wizard] [STEP: timezone] loaded {} zones from timedatectl",
                    zones.len()
                );
                return zones;
            }
            warn!("[PHASE: wizard] [STEP: timezone] timedatectl returned no zones; using built-in list");
        }
        Ok(out) => warn!(
            "[PHASE: wizard] [STEP: timezone] timedatectl failed (exit_code={:?}); using built-in list",
            out.exit_code
        ),
        Err(e) => warn!(
            "[PHASE: wizard] [STEP: timezone] timedatectl unavailable ({:#}); using built-in list",
            e
        ),
    }
    FALLBACK_TIMEZONES.iter().map(|z| z.to_string()).collect()
}

#[derive(Debug, Clone)]
pub struct TimezoneStep {
    default: String,
    zones: Vec<String>,
}

impl TimezoneStep {
    pub fn new(default: impl Into<String>, mut zones: Vec<String>) -> Self {
        let default = default.into();
        if !zones.contains(&default) {
            zones.push(default.clone());
        }
        Self { default, zones }
    }

    pub fn zones(&self) -> &[String] {
        &self.zones
    }

    /// Case-insensitive substring match, catalogue order, at most `limit` results.
    pub fn suggestions(&self, query: &str, limit: usize) -> Vec<&str> {
        let needle = query.trim().to_ascii_lowercase();
        self.zones
            .iter()
            .filter(|z| needle.is_empty() || z.to_ascii_lowercase().contains(&needle))
            .take(limit)
            .map(String::as_str)
            .collect()
    }

    pub fn prompt(&self) -> Prompt {
        Prompt {
            title: "Timezone",
            help: "Zone name such as UTC, Europe/Zurich or America/New_York.".to_string(),
            default: Some(self.default.clone()),
        }
    }

    fn resolve<'a>(&'a self, raw: &'a str) -> &'a str {
        match raw.trim() {
            "" => self.default.as_str(),
            value => value,
        }
    }

    pub fn validate(&self, raw: &str) -> Result<(), WizardError> {
        let zone = self.resolve(raw);
        if self.zones.iter().any(|z| z == zone) {
            Ok(())
        } else {
            Err(WizardError::validation(format!("Unknown timezone '{}'", zone)))
        }
    }

    pub fn collect(&self, raw: &str) -> Result<Answer, WizardError> {
        self.validate(raw)?;
        Ok(Answer::Timezone(self.resolve(raw).to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step() -> TimezoneStep {
        TimezoneStep::new(
            "UTC",
            FALLBACK_TIMEZONES.iter().map(|z| z.to_string()).collect(),
        )
    }

    #[test]
    fn known_zone_is_accepted_unknown_rejected() {
        let s = step();
        assert!(s.validate("Europe/Zurich").is_ok());
        assert!(s.validate("Mars/Olympus_Mons").is_err());
        match s.collect("").expect("default") {
            Answer::Timezone(tz) => assert_eq!(tz, "UTC"),
            other => panic!("unexpected answer {:?}", other),
        }
    }

    #[test]
    fn default_is_always_in_catalogue() {
        let s = TimezoneStep::new("Etc/UTC", vec!["Europe/Rome".to_string()]);
        assert!(s.validate("").is_ok());
        assert_eq!(s.zones().len(), 2);
    }

    #[test]
    fn suggestions_filter_case_insensitively() {
        let s = step();
        assert_eq!(s.suggestions("europe/z", 5), vec!["Europe/Zurich"]);
        assert_eq!(s.suggestions("", 3).len(), 3);
    }

    #[tokio::test]
    async fn catalogue_is_never_empty() {
        let zones = load_timezones().await;
        assert!(!zones.is_empty());
    }
}
