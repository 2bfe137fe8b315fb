pub mod lock;
pub mod log_stream;

use chrono::Utc;
use deckhand_core_domain::{
    Check, Plan, PlanResult, PlanStatus, PlanValidationError, Step, StepFailure,
    StepPhase, StepResult, StepStatus,
};
use deckhand_ssh::{deadline_after, SshClient, SshCommandResult, SshError, SshOutputStream};
use lock::{LockError, RunLock};
use log_stream::LogStreamSender;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("invalid plan: {0}")]
    InvalidPlan(#[from] PlanValidationError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Where the run lock for one target lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLockConfig {
    pub key: String,
    pub locks_dir: PathBuf,
    pub remote_path: String,
}

/// Runs plans step by step against one session.
#[derive(Clone)]
pub struct Executor {
    retry_backoff: Duration,
    dry_run: bool,
    target: String,
    log_stream: Option<LogStreamSender>,
    run_lock: Option<RunLockConfig>,
    command_timeout_cap: Option<Duration>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
enum CheckKind {
    Pre,
    Post,
}

impl CheckKind {
    fn phase(self) -> StepPhase {
        match self {
            CheckKind::Pre => StepPhase::Precondition,
            CheckKind::Post => StepPhase::Postcondition,
        }
    }

    fn errored(self, exit_code: Option<i32>, message: String) -> StepFailure {
        match self {
            CheckKind::Pre => StepFailure::PreconditionCheckError { exit_code, message },
            CheckKind::Post => StepFailure::PostconditionCheckError { exit_code, message },
        }
    }
}

#[derive(Debug)]
enum CheckOutcome {
    Satisfied,
    NotSatisfied,
    Errored(StepFailure),
}

#[derive(Debug)]
struct CheckRun {
    outcome: CheckOutcome,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
}

#[derive(Debug, Default)]
struct Captured {
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
}

impl Captured {
    fn absorb(&mut self, stdout: &str, stderr: &str, exit_code: Option<i32>) {
        self.stdout.push_str(stdout);
        self.stderr.push_str(stderr);
        if exit_code.is_some() {
            self.exit_code = exit_code;
        }
    }
}

enum AttemptOutcome {
    Succeeded,
    Failed(StepFailure),
}

impl Executor {
    pub fn new() -> Self {
        Self {
            retry_backoff: Duration::from_secs(5),
            dry_run: false,
            target: "unknown".to_string(),
            log_stream: None,
            run_lock: None,
            command_timeout_cap: None,
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_target(mut self, label: impl Into<String>) -> Self {
        self.target = label.into();
        self
    }

    pub fn with_log_stream(mut self, sender: LogStreamSender) -> Self {
        self.log_stream = Some(sender);
        self
    }

    /// Serializes runs per target. Dry runs take only the local layers.
    pub fn with_run_lock(mut self, config: RunLockConfig) -> Self {
        self.run_lock = Some(config);
        self
    }

    /// Upper bound for every action and check timeout, whatever the step asks for.
    pub fn with_command_timeout_cap(mut self, cap: Duration) -> Self {
        self.command_timeout_cap = Some(cap);
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn run(&self, plan: &Plan, client: &dyn SshClient) -> Result<PlanResult, ExecutionError> {
        plan.validate()?;

        let _lock = match &self.run_lock {
            Some(config) => {
                let remote = if self.dry_run {
                    None
                } else {
                    Some((client, config.remote_path.as_str()))
                };
                Some(RunLock::acquire(&config.key, &config.locks_dir, remote)?)
            }
            None => None,
        };

        let started_at = Utc::now();
        tracing::info!(
            plan = %plan.name,
            host = %self.target,
            dry_run = self.dry_run,
            steps = plan.steps.len(),
            "plan started"
        );

        let mut results = Vec::with_capacity(plan.steps.len());
        let mut aborted = false;
        for step in &plan.steps {
            let (result, halt) = self.run_step(step, client);
            results.push(result);
            if halt {
                aborted = true;
                tracing::warn!(plan = %plan.name, step = %step.id, "plan stopped");
                break;
            }
        }

        let status = PlanStatus::evaluate(&results, aborted);
        tracing::info!(plan = %plan.name, status = status.as_str(), "plan finished");
        Ok(PlanResult {
            plan: plan.name.clone(),
            target: self.target.clone(),
            dry_run: self.dry_run,
            status,
            steps: results,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Runs one step. The flag is true when the plan must stop after it.
    pub fn run_step(&self, step: &Step, client: &dyn SshClient) -> (StepResult, bool) {
        let started = Instant::now();
        let mut captured = Captured::default();
        self.status(step, "checking precondition");

        let pre = self.evaluate(client, step, CheckKind::Pre, &step.precondition);
        match pre.outcome {
            CheckOutcome::Satisfied => {
                self.status(step, "precondition satisfied; skipped");
                return (
                    finish(step, StepStatus::Skipped, captured, started, 0, None, None),
                    false,
                );
            }
            CheckOutcome::NotSatisfied => {}
            CheckOutcome::Errored(failure) => {
                captured.absorb(&pre.stdout, &pre.stderr, pre.exit_code);
                return self.fail(step, captured, started, 0, failure);
            }
        }

        if self.dry_run {
            let post = self.evaluate(client, step, CheckKind::Post, &step.postcondition);
            let met = match post.outcome {
                CheckOutcome::Satisfied => true,
                CheckOutcome::NotSatisfied => false,
                CheckOutcome::Errored(failure) => {
                    captured.absorb(&post.stdout, &post.stderr, post.exit_code);
                    return self.fail(step, captured, started, 0, failure);
                }
            };
            self.status(step, "would run");
            return (
                finish(step, StepStatus::WouldRun, captured, started, 0, None, Some(met)),
                false,
            );
        }

        let max_attempts = step.on_failure.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            captured = Captured::default();
            let outcome = self.attempt(step, client, &mut captured);
            match outcome {
                AttemptOutcome::Succeeded => {
                    self.status(step, "succeeded");
                    return (
                        finish(
                            step,
                            StepStatus::Succeeded,
                            captured,
                            started,
                            attempt,
                            None,
                            None,
                        ),
                        false,
                    );
                }
                AttemptOutcome::Failed(failure) => {
                    if failure.is_connection_lost() || attempt >= max_attempts {
                        return self.fail(step, captured, started, attempt, failure);
                    }
                    tracing::warn!(
                        step = %step.id,
                        attempt,
                        max_attempts,
                        failure = %failure,
                        "attempt failed; retrying"
                    );
                    if let Some(sender) = &self.log_stream {
                        sender.warning(
                            &step.id,
                            &format!("attempt {attempt}/{max_attempts} failed: {failure}; retrying"),
                        );
                    }
                    std::thread::sleep(self.retry_backoff);
                }
            }
        }
    }

    /// Action then postcondition.
    fn attempt(&self, step: &Step, client: &dyn SshClient, captured: &mut Captured) -> AttemptOutcome {
        let budget = self.capped(step.timeout());
        let deadline = deadline_after(budget);
        for (index, command) in step.action.iter().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return AttemptOutcome::Failed(StepFailure::CommandTimeout {
                    phase: StepPhase::Action,
                    message: format!("step budget of {}s exhausted", budget.as_secs()),
                });
            }
            self.status(step, &format!("running action {}/{}", index + 1, step.action.len()));
            match self.run_action_command(step, client, command, remaining) {
                Ok(result) => {
                    captured.absorb(&result.stdout, &result.stderr, Some(result.exit_code));
                    if !result.success() {
                        return AttemptOutcome::Failed(StepFailure::ActionFailed {
                            exit_code: result.exit_code,
                            command_index: index,
                        });
                    }
                }
                Err(err) => return AttemptOutcome::Failed(transport_failure(StepPhase::Action, &err)),
            }
        }

        let post = self.evaluate(client, step, CheckKind::Post, &step.postcondition);
        match post.outcome {
            CheckOutcome::Satisfied => AttemptOutcome::Succeeded,
            CheckOutcome::NotSatisfied => {
                captured.absorb(&post.stdout, &post.stderr, None);
                AttemptOutcome::Failed(StepFailure::PostconditionNotMet)
            }
            CheckOutcome::Errored(failure) => {
                captured.absorb(&post.stdout, &post.stderr, post.exit_code);
                AttemptOutcome::Failed(failure)
            }
        }
    }

    fn run_action_command(
        &self,
        step: &Step,
        client: &dyn SshClient,
        command: &str,
        timeout: Duration,
    ) -> Result<SshCommandResult, SshError> {
        tracing::debug!(step = %step.id, command, "running action command");
        let stream = self.log_stream.as_ref();
        let mut on_output = |kind: SshOutputStream, line: &str| {
            let Some(sender) = stream else {
                return;
            };
            match kind {
                SshOutputStream::Stdout => sender.stdout(&step.id, line),
                SshOutputStream::Stderr => sender.stderr(&step.id, line),
            }
        };
        client.run_streaming(command, timeout, &mut on_output)
    }

    fn capped(&self, timeout: Duration) -> Duration {
        match self.command_timeout_cap {
            Some(cap) => timeout.min(cap),
            None => timeout,
        }
    }

    fn evaluate(
        &self,
        client: &dyn SshClient,
        step: &Step,
        kind: CheckKind,
        check: &Check,
    ) -> CheckRun {
        let phase = kind.phase();
        tracing::debug!(step = %step.id, %phase, check = %check.description, "evaluating check");
        match client.run(&check.command, self.capped(step.check_timeout())) {
            Ok(result) => {
                let outcome = match result.exit_code {
                    0 => CheckOutcome::Satisfied,
                    1 => CheckOutcome::NotSatisfied,
                    code => {
                        let message = check_error_message(&result);
                        CheckOutcome::Errored(kind.errored(Some(code), message))
                    }
                };
                CheckRun {
                    outcome,
                    exit_code: Some(result.exit_code),
                    stdout: result.stdout,
                    stderr: result.stderr,
                }
            }
            // Timeouts and transport errors alike are not answers from the check.
            Err(err) => CheckRun {
                outcome: CheckOutcome::Errored(transport_failure(phase, &err)),
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
            },
        }
    }

    fn fail(
        &self,
        step: &Step,
        captured: Captured,
        started: Instant,
        attempts: u32,
        failure: StepFailure,
    ) -> (StepResult, bool) {
        let halt = failure.is_connection_lost() || step.on_failure.halts_plan();
        tracing::warn!(
            step = %step.id,
            policy = %step.on_failure,
            failure = %failure,
            halt,
            "step failed"
        );
        if let Some(sender) = &self.log_stream {
            sender.error(&step.id, &failure.to_string());
        }
        (
            finish(
                step,
                StepStatus::Failed,
                captured,
                started,
                attempts,
                Some(failure),
                None,
            ),
            halt,
        )
    }

    fn status(&self, step: &Step, message: &str) {
        tracing::debug!(step = %step.id, "{message}");
        if let Some(sender) = &self.log_stream {
            sender.info(&step.id, message);
        }
    }
}

fn finish(
    step: &Step,
    status: StepStatus,
    captured: Captured,
    started: Instant,
    attempts: u32,
    failure: Option<StepFailure>,
    postcondition_met: Option<bool>,
) -> StepResult {
    StepResult {
        id: step.id.clone(),
        status,
        stdout: captured.stdout,
        stderr: captured.stderr,
        exit_code: captured.exit_code,
        duration_ms: started.elapsed().as_millis() as u64,
        attempts,
        failure,
        postcondition_met,
    }
}

fn check_error_message(result: &SshCommandResult) -> String {
    let stderr = result.stderr.trim();
    if stderr.is_empty() {
        format!("check exited with status {}", result.exit_code)
    } else {
        stderr.to_string()
    }
}


fn transport_failure(phase: StepPhase, err: &SshError) -> StepFailure {
    match err {
        SshError::Timeout { message } => StepFailure::CommandTimeout {
            phase,
            message: message.clone(),
        },
        SshError::Connection { message } | SshError::HostKey { message } => {
            StepFailure::ConnectionLost {
                phase,
                message: message.clone(),
            }
        }
    }
}
