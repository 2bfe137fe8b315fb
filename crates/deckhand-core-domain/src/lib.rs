pub mod render;
pub mod settings;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

pub use render::{
    render_nginx_redirect_site, render_nginx_site, render_nginx_tls_site, render_pm2_ecosystem,
};
pub use settings::{
    BuildSettings, CertificateSettings, DeploySettings, InstallSettings, ProcessSettings,
    ProxySettings, SettingsError, TimeoutSettings,
};

/// A remote command whose exit status answers a yes/no question about the
/// target: `0` satisfied, `1` not satisfied, anything else means the check
/// itself could not be evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    pub description: String,
    pub command: String,
}

impl Check {
    pub fn new(description: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            command: command.into(),
        }
    }
}

/// What an exhausted retry does to the rest of the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryFallback {
    Abort,
    #[default]
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum FailurePolicy {
    Abort,
    Continue,
    /// Re-attempt action and postcondition up to `retries` more times. Once
    /// every attempt failed, `then` decides whether the plan goes on.
    Retry {
        retries: u32,
        #[serde(default)]
        then: RetryFallback,
    },
}

impl FailurePolicy {
    pub fn retry(retries: u32) -> Self {
        FailurePolicy::Retry {
            retries,
            then: RetryFallback::Continue,
        }
    }

    pub fn retry_then_abort(retries: u32) -> Self {
        FailurePolicy::Retry {
            retries,
            then: RetryFallback::Abort,
        }
    }

    pub fn max_attempts(self) -> u32 {
        match self {
            FailurePolicy::Retry { retries, .. } => retries.saturating_add(1),
            FailurePolicy::Abort | FailurePolicy::Continue => 1,
        }
    }

    /// True when a final failure under this policy stops the plan.
    pub fn halts_plan(self) -> bool {
        match self {
            FailurePolicy::Abort => true,
            FailurePolicy::Continue => false,
            FailurePolicy::Retry { then, .. } => then == RetryFallback::Abort,
        }
    }
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::Abort => write!(f, "abort"),
            FailurePolicy::Continue => write!(f, "continue"),
            FailurePolicy::Retry {
                retries,
                then: RetryFallback::Continue,
            } => write!(f, "retry({retries})"),
            FailurePolicy::Retry {
                retries,
                then: RetryFallback::Abort,
            } => write!(f, "retry({retries})+abort"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub description: String,
    pub precondition: Check,
    pub action: Vec<String>,
    pub postcondition: Check,
    pub on_failure: FailurePolicy,
    pub timeout_secs: u64,
    pub check_timeout_secs: u64,
}

impl Step {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanValidationError {
    EmptyStepId,
    DuplicateStep { step_id: String },
    EmptyCheck { step_id: String },
    ZeroTimeout { step_id: String },
}

impl std::fmt::Display for PlanValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanValidationError::EmptyStepId => write!(f, "plan contains a step with an empty id"),
            PlanValidationError::DuplicateStep { step_id } => {
                write!(f, "step id {step_id} appears more than once")
            }
            PlanValidationError::EmptyCheck { step_id } => {
                write!(f, "step {step_id} has an empty pre- or postcondition")
            }
            PlanValidationError::ZeroTimeout { step_id } => {
                write!(f, "step {step_id} has a zero timeout")
            }
        }
    }
}

impl std::error::Error for PlanValidationError {}

impl Plan {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    /// Joins plans in order under a new name. Ids must stay unique; call
    /// [`Plan::validate`] on the result.
    pub fn concat(name: impl Into<String>, plans: Vec<Plan>) -> Self {
        Self {
            name: name.into(),
            steps: plans.into_iter().flat_map(|plan| plan.steps).collect(),
        }
    }

    pub fn validate(&self) -> Result<(), PlanValidationError> {
        let mut seen: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(PlanValidationError::EmptyStepId);
            }
            if !seen.insert(step.id.as_str()) {
                return Err(PlanValidationError::DuplicateStep {
                    step_id: step.id.clone(),
                });
            }
            if step.precondition.command.trim().is_empty()
                || step.postcondition.command.trim().is_empty()
            {
                return Err(PlanValidationError::EmptyCheck {
                    step_id: step.id.clone(),
                });
            }
            if step.timeout_secs == 0 || step.check_timeout_secs == 0 {
                return Err(PlanValidationError::ZeroTimeout {
                    step_id: step.id.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Skipped,
    Succeeded,
    Failed,
    /// Dry run only: the precondition was not satisfied.
    WouldRun,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Skipped => "skipped",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::WouldRun => "would_run",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Precondition,
    Action,
    Postcondition,
}

impl std::fmt::Display for StepPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepPhase::Precondition => write!(f, "precondition"),
            StepPhase::Action => write!(f, "action"),
            StepPhase::Postcondition => write!(f, "postcondition"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepFailure {
    CommandTimeout {
        phase: StepPhase,
        message: String,
    },
    PreconditionCheckError {
        exit_code: Option<i32>,
        message: String,
    },
    PostconditionCheckError {
        exit_code: Option<i32>,
        message: String,
    },
    ActionFailed {
        exit_code: i32,
        command_index: usize,
    },
    PostconditionNotMet,
    ConnectionLost {
        phase: StepPhase,
        message: String,
    },
}

impl StepFailure {
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, StepFailure::ConnectionLost { .. })
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepFailure::CommandTimeout { phase, message } => {
                write!(f, "{phase} timed out ({message}); remote state unknown")
            }
            StepFailure::PreconditionCheckError { message, .. } => {
                write!(f, "precondition check errored: {message}")
            }
            StepFailure::PostconditionCheckError { message, .. } => {
                write!(f, "postcondition check errored: {message}")
            }
            StepFailure::ActionFailed {
                exit_code,
                command_index,
            } => write!(
                f,
                "action command {} exited with status {exit_code}",
                command_index + 1
            ),
            StepFailure::PostconditionNotMet => {
                write!(f, "action finished but the postcondition is not satisfied")
            }
            StepFailure::ConnectionLost { phase, message } => {
                write!(f, "connection lost during {phase}: {message}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub id: String,
    pub status: StepStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StepFailure>,
    /// Dry run only: whether the postcondition already holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postcondition_met: Option<bool>,
}

impl StepResult {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Success,
    Partial,
    Failed,
}

impl PlanStatus {
    /// `aborted` is true when a failure stopped the plan early.
    pub fn evaluate(steps: &[StepResult], aborted: bool) -> Self {
        if aborted {
            return PlanStatus::Failed;
        }
        if steps.iter().any(|step| step.status == StepStatus::Failed) {
            return PlanStatus::Partial;
        }
        PlanStatus::Success
    }

    pub fn exit_code(self) -> i32 {
        match self {
            PlanStatus::Success => 0,
            PlanStatus::Partial => 1,
            PlanStatus::Failed => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlanStatus::Success => "success",
            PlanStatus::Partial => "partial",
            PlanStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanResult {
    pub plan: String,
    pub target: String,
    pub dry_run: bool,
    pub status: PlanStatus,
    pub steps: Vec<StepResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PlanResult {
    pub fn step(&self, id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|step| step.id == id)
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.steps
            .iter()
            .filter(|step| step.status == StepStatus::Failed)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|step| step.status == status).count()
    }
}
