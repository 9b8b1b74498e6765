// System rebuild/activation
//
// Builds the `nixos-rebuild` invocation (flake-aware), runs it once with
// streamed output and classifies the result. There is no timeout and no
// retry: a failed rebuild leaves the previous generation active and the
// operator decides what to do next.

use crate::error::WizardError;
use crate::installation::{run_cmd_with_timeout, run_streaming, OutputLine};
use crate::settings::WizardSettings;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;

const NIX_CONFIG: &str = "experimental-features = nix-command flakes";
const FLAKE_SHOW_TIMEOUT: Duration = Duration::from_secs(120);
const CLONE_TIMEOUT: Duration = Duration::from_secs(600);

/// Fully resolved rebuild command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildPlan {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl RebuildPlan {
    /// Command line an operator can paste to retry by hand.
    pub fn manual_hint(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        format!("sudo {}", parts.join(" "))
    }
}

#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub plan: RebuildPlan,
    pub duration_ms: u128,
}

#[derive(Debug, Clone)]
pub struct SystemApplier {
    config_dir: PathBuf,
    command: Vec<String>,
    flake_config: Option<String>,
    preferred_configs: Vec<String>,
    config_repo: Option<String>,
}

impl SystemApplier {
    pub fn from_settings(settings: &WizardSettings) -> Self {
        Self {
            config_dir: settings.paths.config_dir.clone(),
            command: settings.rebuild.command.clone(),
            flake_config: settings.rebuild.flake_config.clone(),
            preferred_configs: settings.rebuild.preferred_configs.clone(),
            config_repo: settings.rebuild.config_repo.clone(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    fn has_configuration(&self) -> bool {
        self.config_dir.join("configuration.nix").exists()
            || self.config_dir.join("flake.nix").exists()
    }

    /// Clone the configuration repository when the config dir holds nothing
    /// to rebuild from. No-op when a configuration exists or no repo is set.
    pub async fn prepare(&self) -> Result<(), WizardError> {
        let Some(repo) = self.config_repo.as_deref() else {
            return Ok(());
        };
        if self.has_configuration() {
            return Ok(());
        }

        let occupied = std::fs::read_dir(&self.config_dir)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if occupied {
            return Err(WizardError::Apply {
                exit_code: None,
                diagnostics: format!(
                    "{} has no configuration.nix or flake.nix but is not empty; refusing to clone {}",
                    self.config_dir.display(),
                    crate::utils::logging::mask_url(repo)
                ),
            });
        }

        info!(
            "[PHASE: apply] [STEP: bootstrap] cloning configuration (repo={}, dir={:?})",
            crate::utils::logging::mask_url(repo),
            self.config_dir
        );
        let args = vec![
            "clone".to_string(),
            repo.to_string(),
            self.config_dir.display().to_string(),
        ];
        let out = run_cmd_with_timeout("git", &args, CLONE_TIMEOUT, "git_clone")
            .await
            .map_err(|e| WizardError::Apply {
                exit_code: None,
                diagnostics: format!("{:#}", e),
            })?;
        if out.exit_code != Some(0) {
            return Err(WizardError::Apply {
                exit_code: out.exit_code,
                diagnostics: out.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Resolve the command that will be run.
    pub async fn plan(&self) -> RebuildPlan {
        if let Some((program, args)) = self.command.split_first() {
            return RebuildPlan {
                program: program.clone(),
                args: args.to_vec(),
                env: Vec::new(),
            };
        }

        let env = vec![("NIX_CONFIG".to_string(), NIX_CONFIG.to_string())];
        if self.config_dir.join("flake.nix").exists() {
            let available = match self.flake_config {
                Some(_) => Vec::new(),
                None => detect_flake_configurations(&self.config_dir).await,
            };
            let target = match select_configuration(
                &available,
                self.flake_config.as_deref(),
                &self.preferred_configs,
            ) {
                Some(name) => format!("{}#{}", self.config_dir.display(), name),
                None => self.config_dir.display().to_string(),
            };
            return RebuildPlan {
                program: "nixos-rebuild".to_string(),
                args: vec!["switch".to_string(), "--flake".to_string(), target],
                env,
            };
        }

        let mut env = env;
        if std::env::var_os("NIX_PATH").is_none() {
            env.push((
                "NIX_PATH".to_string(),
                format!(
                    "nixos-config={}:/nix/var/nix/profiles/per-user/root/channels",
                    self.config_dir.join("configuration.nix").display()
                ),
            ));
        }
        RebuildPlan {
            program: "nixos-rebuild".to_string(),
            args: vec!["switch".to_string()],
            env,
        }
    }

    /// Resolve the plan and run it once.
    #[cfg(test)]
    pub async fn apply<F>(&self, on_line: F) -> Result<ApplyReport, WizardError>
    where
        F: FnMut(OutputLine),
    {
        let plan = self.plan().await;
        self.run(plan, on_line).await
    }

    /// Run `plan` once, streaming each output line to `on_line`.
    pub async fn run<F>(&self, plan: RebuildPlan, on_line: F) -> Result<ApplyReport, WizardError>
    where
        F: FnMut(OutputLine),
    {
        info!(
            "[PHASE: apply] [STEP: rebuild] starting (program={}, args={:?})",
            plan.program, plan.args
        );

        if let Err(e) = which::which(&plan.program) {
            return Err(WizardError::Apply {
                exit_code: None,
                diagnostics: format!("{} not found: {}", plan.program, e),
            });
        }

        let out = run_streaming(
            &plan.program,
            &plan.args,
            &plan.env,
            Some(&self.config_dir).filter(|d| d.is_dir()).map(PathBuf::as_path),
            "rebuild",
            on_line,
        )
        .await
        .map_err(|e| WizardError::Apply {
            exit_code: None,
            diagnostics: format!("{:#}", e),
        })?;

        if out.exit_code == Some(0) {
            info!(
                "[PHASE: apply] [STEP: rebuild] succeeded (duration_ms={})",
                out.duration_ms
            );
            return Ok(ApplyReport {
                plan,
                duration_ms: out.duration_ms,
            });
        }

        warn!(
            "[PHASE: apply] [STEP: rebuild] failed (exit_code={:?}); retry manually with: {}",
            out.exit_code,
            plan.manual_hint()
        );
        Err(WizardError::Apply {
            exit_code: out.exit_code,
            diagnostics: out.tail.join("\n"),
        })
    }
}

/// Names under `nixosConfigurations` in `nix flake show --json` output.
pub fn parse_flake_configurations(json: &str) -> Vec<String> {
    serde_json::from_str::<serde_json::Value>(json)
        .ok()
        .and_then(|v| {
            v.get("nixosConfigurations")
                .and_then(|c| c.as_object())
                .map(|o| o.keys().cloned().collect())
        })
        .unwrap_or_default()
}

/// Configured name first, then the preference list, then the first available.
pub fn select_configuration(
    available: &[String],
    configured: Option<&str>,
    preferred: &[String],
) -> Option<String> {
    if let Some(name) = configured {
        return Some(name.to_string());
    }
    preferred
        .iter()
        .find(|p| available.contains(p))
        .or_else(|| available.first())
        .cloned()
}

async fn detect_flake_configurations(dir: &Path) -> Vec<String> {
    let args = vec![
        "--extra-experimental-features".to_string(),
        "nix-command flakes".to_string(),
        "flake".to_string(),
        "show".to_string(),
        "--json".to_string(),
        dir.display().to_string(),
    ];
    match run_cmd_with_timeout("nix", &args, FLAKE_SHOW_TIMEOUT, "flake_show").await {
        Ok(out) if out.exit_code == Some(0) => parse_flake_configurations(&out.stdout),
        Ok(out) => {
            warn!(
                "[PHASE: apply] [STEP: flake] nix flake show failed (exit_code={:?})",
                out.exit_code
            );
            Vec::new()
        }
        Err(e) => {
            warn!("[PHASE: apply] [STEP: flake] nix flake show unavailable: {:#}", e);
            Vec::new()
        }
    }
}
