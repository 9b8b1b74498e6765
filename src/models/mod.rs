pub mod answers;
pub mod keys;

pub use answers::{Answer, Answers, RunnerConfig, StepId, UrlSource, WifiCredentials};
pub use keys::{KeyProvenance, KeySet, SshKeyEntry};
