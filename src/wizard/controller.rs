//! Session state machine.
//!
//! `Welcome -> Step[0..n] -> Review -> Applying -> Done | Failed`, with
//! `Aborted` reachable by cancel (before Applying, or from Failed) and by
//! fatal write/permission errors. Nothing touches the system before
//! [`Controller::submit`].

use super::steps::{Step, StepInput};
use crate::error::WizardError;
use crate::installation::applier::{ApplyReport, SystemApplier};
use crate::installation::config_writer::ConfigWriter;
use crate::installation::gate::CompletionGate;
use crate::installation::{service, OutputLine};
use crate::models::Answers;
use crate::security::secret_file::write_secret_file;
use crate::settings::WizardSettings;
use log::{error, info, warn};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Welcome,
    Step(usize),
    Review,
    Applying,
    Done,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    InProgress,
    Reviewing,
    Applying,
    Done,
    Failed,
    Aborted,
}

impl Phase {
    pub fn status(&self) -> SessionStatus {
        match self {
            Phase::Welcome | Phase::Step(_) => SessionStatus::InProgress,
            Phase::Review => SessionStatus::Reviewing,
            Phase::Applying => SessionStatus::Applying,
            Phase::Done => SessionStatus::Done,
            Phase::Failed => SessionStatus::Failed,
            Phase::Aborted => SessionStatus::Aborted,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Aborted)
    }
}

/// Details of the last failed apply attempt, for display.
#[derive(Debug, Clone)]
pub struct ApplyFailure {
    pub exit_code: Option<i32>,
    pub diagnostics: String,
    pub manual_hint: Option<String>,
}

pub struct Controller {
    steps: Vec<Step>,
    phase: Phase,
    answers: Answers,
    gate: CompletionGate,
    writer: ConfigWriter,
    applier: SystemApplier,
    token_file: PathBuf,
    token_owner: String,
    restart_units: Vec<String>,
    attempts: u32,
    last_failure: Option<ApplyFailure>,
    already_configured: bool,
}

impl Controller {
    /// Start a session. When the gate is set and `force` is false the session
    /// is immediately `Done`.
    pub fn open(settings: &WizardSettings, steps: Vec<Step>, force: bool) -> Self {
        let gate = CompletionGate::new(&settings.paths.marker);
        let already_configured = gate.is_set() && !force;
        let phase = if already_configured {
            info!(
                "[PHASE: wizard] [STEP: open] completion marker present ({:?}); nothing to do",
                gate.marker()
            );
            Phase::Done
        } else {
            if force && gate.is_set() {
                warn!("[PHASE: wizard] [STEP: open] completion marker present; continuing because of --force");
            }
            Phase::Welcome
        };

        Self {
            steps,
            phase,
            answers: Answers::new(),
            gate,
            writer: ConfigWriter::from_settings(settings),
            applier: SystemApplier::from_settings(settings),
            token_file: settings.runner.token_file.clone(),
            token_owner: settings.runner.service_account.clone(),
            restart_units: settings.wizard.restart_units.clone(),
            attempts: 0,
            last_failure: None,
            already_configured,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn status(&self) -> SessionStatus {
        self.phase.status()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn current_step(&self) -> Option<&Step> {
        match self.phase {
            Phase::Step(i) => self.steps.get(i),
            _ => None,
        }
    }

    pub fn answers(&self) -> &Answers {
        &self.answers
    }

    pub fn gate(&self) -> &CompletionGate {
        &self.gate
    }

    pub fn applier(&self) -> &SystemApplier {
        &self.applier
    }

    /// True when the session ended immediately because the gate was set.
    pub fn already_configured(&self) -> bool {
        self.already_configured
    }

    pub fn last_failure(&self) -> Option<&ApplyFailure> {
        self.last_failure.as_ref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn invalid(&self, op: &str) -> WizardError {
        WizardError::InvalidState(format!("{} is not allowed in {:?}", op, self.phase))
    }

    fn first_step_or_review(&self, index: usize) -> Phase {
        if index < self.steps.len() {
            Phase::Step(index)
        } else {
            Phase::Review
        }
    }

    pub fn start(&mut self) -> Result<Phase, WizardError> {
        if self.phase != Phase::Welcome {
            return Err(self.invalid("start"));
        }
        self.phase = self.first_step_or_review(0);
        info!("[PHASE: wizard] [STEP: start] session started");
        Ok(self.phase)
    }

    /// Validate and store the answer for the current step. On error the
    /// session stays on the same step.
    pub fn advance(&mut self, input: StepInput) -> Result<Phase, WizardError> {
        let Phase::Step(index) = self.phase else {
            return Err(self.invalid("advance"));
        };
        let step = &self.steps[index];
        let answer = step.collect(input).map_err(|e| {
            warn!(
                "[PHASE: wizard] [STEP: {}] input rejected: {}",
                step.id().as_str(),
                e
            );
            e
        })?;
        self.answers.set(answer);
        self.phase = self.first_step_or_review(index + 1);
        Ok(self.phase)
    }

    pub fn back(&mut self) -> Result<Phase, WizardError> {
        self.phase = match self.phase {
            Phase::Step(0) => Phase::Welcome,
            Phase::Step(i) => Phase::Step(i - 1),
            Phase::Review if self.steps.is_empty() => Phase::Welcome,
            Phase::Review => Phase::Step(self.steps.len() - 1),
            Phase::Failed => Phase::Review,
            _ => return Err(self.invalid("back")),
        };
        Ok(self.phase)
    }

    pub fn cancel(&mut self) -> Result<Phase, WizardError> {
        match self.phase {
            Phase::Welcome | Phase::Step(_) | Phase::Review | Phase::Failed => {
                info!("[PHASE: wizard] [STEP: cancel] session cancelled by operator");
                self.phase = Phase::Aborted;
                Ok(self.phase)
            }
            _ => Err(self.invalid("cancel")),
        }
    }

    /// Persist and apply the answers.
    ///
    /// Order: config bootstrap, token file, document commit, rebuild (once),
    /// completion marker, then best-effort unit restarts.
    pub async fn submit<F>(&mut self, on_line: F) -> Result<ApplyReport, WizardError>
    where
        F: FnMut(OutputLine),
    {
        if self.phase != Phase::Review {
            return Err(self.invalid("submit"));
        }
        self.phase = Phase::Applying;
        self.attempts += 1;
        info!(
            "[PHASE: apply] [STEP: submit] apply attempt {} started",
            self.attempts
        );

        match self.apply_once(on_line).await {
            Ok(report) => {
                self.phase = Phase::Done;
                self.last_failure = None;
                for unit in &self.restart_units {
                    if let Err(e) = service::restart_unit(unit).await {
                        warn!("[PHASE: apply] [STEP: restart] {:#}", e);
                    }
                }
                info!("[PHASE: apply] [STEP: submit] configuration applied");
                Ok(report)
            }
            Err((e, hint)) => {
                if e.is_fatal() {
                    error!("[PHASE: apply] [STEP: submit] fatal: {}", e);
                    self.phase = Phase::Aborted;
                } else {
                    error!("[PHASE: apply] [STEP: submit] apply failed: {}", e);
                    self.phase = Phase::Failed;
                }
                if let WizardError::Apply {
                    exit_code,
                    diagnostics,
                } = &e
                {
                    self.last_failure = Some(ApplyFailure {
                        exit_code: *exit_code,
                        diagnostics: diagnostics.clone(),
                        manual_hint: hint,
                    });
                }
                Err(e)
            }
        }
    }

    async fn apply_once<F>(
        &mut self,
        on_line: F,
    ) -> Result<ApplyReport, (WizardError, Option<String>)>
    where
        F: FnMut(OutputLine),
    {
        self.applier.prepare().await.map_err(|e| (e, None))?;

        if let Some(token) = self.answers.take_runner_token() {
            write_secret_file(&self.token_file, &token, &self.token_owner)
                .map_err(|e| (e, None))?;
        }

        let mutation = self.writer.write(&self.answers).map_err(|e| (e, None))?;
        info!(
            "[PHASE: apply] [STEP: document] overwritten=[{}] inserted=[{}]",
            mutation.overwritten.join(", "),
            mutation.inserted.join(", ")
        );

        let plan = self.applier.plan().await;
        let hint = plan.manual_hint();
        let report = self
            .applier
            .run(plan, on_line)
            .await
            .map_err(|e| (e, Some(hint)))?;

        self.gate.mark().map_err(|e| (e, None))?;
        Ok(report)
    }
}
