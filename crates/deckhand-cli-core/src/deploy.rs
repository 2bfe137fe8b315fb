use std::path::Path;
use std::time::Duration;

use deckhand_core_domain::{DeploySettings, Plan, PlanResult};
use deckhand_executor::log_stream::LogStreamSender;
use deckhand_executor::{Executor, RunLockConfig};
use deckhand_planner::{build_plan, PlanKind};
use deckhand_ssh::{ProcessSshClient, SshClient};

use crate::target::{resolve_target, ResolvedTarget};
use crate::{audit, config, CliError};

#[derive(Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub log_stream: Option<LogStreamSender>,
    /// Ceiling for every step and check budget, usually the target's
    /// `COMMAND_TIMEOUT_SECS`.
    pub command_timeout: Option<Duration>,
}

pub fn load_plan(kind: PlanKind, config_path: Option<&Path>) -> Result<(DeploySettings, Plan), CliError> {
    let settings = config::load_settings(config_path)?;
    let plan = build_plan(kind, &settings)?;
    Ok((settings, plan))
}

/// Runs `plan` over an already open session: takes the run lock, executes,
/// and appends the outcome to the audit log.
pub fn execute_with_client(
    plan: &Plan,
    settings: &DeploySettings,
    client: &dyn SshClient,
    target_label: &str,
    options: &RunOptions,
) -> Result<PlanResult, CliError> {
    let lock = RunLockConfig {
        key: target_label.to_string(),
        locks_dir: config::locks_dir()?,
        remote_path: settings.lock_path.clone(),
    };
    let mut executor = Executor::new()
        .with_retry_backoff(Duration::from_secs(settings.retry_backoff_secs))
        .dry_run(options.dry_run)
        .with_target(target_label)
        .with_run_lock(lock);
    if let Some(sender) = &options.log_stream {
        executor = executor.with_log_stream(sender.clone());
    }
    if let Some(cap) = options.command_timeout {
        executor = executor.with_command_timeout_cap(cap);
    }

    let result = executor.run(plan, client)?;
    if let Err(err) = audit::record_run(&result) {
        tracing::warn!(error = %err, "failed to write run audit log");
    }
    Ok(result)
}

pub fn run_plan(
    kind: PlanKind,
    target_name: &str,
    config_path: Option<&Path>,
    options: &RunOptions,
) -> Result<PlanResult, CliError> {
    let (settings, plan) = load_plan(kind, config_path)?;
    let resolved = resolve_target(target_name)?;
    let label = resolved.target.label();
    tracing::info!(plan = %plan.name, host = %label, dry_run = options.dry_run, "connecting");

    let options = RunOptions {
        command_timeout: Some(resolved.command_timeout),
        ..options.clone()
    };
    let session = open_session(&resolved)?;
    let result = execute_with_client(&plan, &settings, &session, &label, &options);
    session.close();
    result
}

fn open_session(resolved: &ResolvedTarget) -> Result<deckhand_ssh::SshSession, CliError> {
    let client = ProcessSshClient::with_config(resolved.ssh_config());
    Ok(client.open(&resolved.target)?)
}

/// Opens a session to `target_name`, runs `uname -srm`, and closes it.
pub fn check_target(target_name: &str) -> Result<String, CliError> {
    let resolved = resolve_target(target_name)?;
    let session = open_session(&resolved)?;
    let uname = session.run(
        "uname -srm",
        resolved.command_timeout.min(Duration::from_secs(30)),
    );
    session.close();
    let result = uname?;
    if !result.success() {
        return Err(CliError::InvalidInput(format!(
            "`uname -srm` on {} exited with status {}: {}",
            resolved.target.label(),
            result.exit_code,
            result.stderr.trim()
        )));
    }
    Ok(format!(
        "{} reachable: {}",
        resolved.target.label(),
        result.stdout.trim()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use deckhand_core_domain::{PlanStatus, StepStatus};
    use deckhand_executor::lock::LockError;
    use deckhand_executor::ExecutionError;
    use deckhand_ssh::{SshCommandResult, SshError};
    use std::env;
    use std::sync::Mutex;

    /// Every command succeeds; checks report "not satisfied" until the
    /// matching action ran.
    struct ConvergingHost {
        lock_held: bool,
        acted: Mutex<bool>,
        commands: Mutex<Vec<String>>,
        timeouts: Mutex<Vec<Duration>>,
    }

    impl ConvergingHost {
        fn new(lock_held: bool) -> Self {
            Self {
                lock_held,
                acted: Mutex::new(false),
                commands: Mutex::new(Vec::new()),
                timeouts: Mutex::new(Vec::new()),
            }
        }
    }

    impl SshClient for ConvergingHost {
        fn run(&self, command: &str, timeout: Duration) -> Result<SshCommandResult, SshError> {
            self.commands.lock().expect("commands").push(command.to_string());
            self.timeouts.lock().expect("timeouts").push(timeout);
            let reply = |exit_code| {
                Ok(SshCommandResult {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code,
                })
            };
            if command.starts_with("if mkdir") {
                return reply(if self.lock_held { 3 } else { 0 });
            }
            if command.contains("exit 0") {
                let acted = *self.acted.lock().expect("acted");
                return reply(if acted { 0 } else { 1 });
            }
            if command.contains("git rev-parse HEAD > .deckhand/build.rev") {
                *self.acted.lock().expect("acted") = true;
            }
            reply(0)
        }
    }

    fn settings() -> DeploySettings {
        DeploySettings::from_json(
            r#"{
                "app_name": "shop",
                "app_dir": "/var/www/shop",
                "repo_url": "https://git.example.com/acme/shop.git",
                "service_user": "shop",
                "retry_backoff_secs": 0
            }"#,
        )
        .expect("settings")
    }

    #[test]
    fn runs_plan_and_records_audit_line() {
        let _guard = crate::test_support::env_lock();
        let temp_dir = tempfile::tempdir().expect("temp dir");
        env::set_var("DECKHAND_HOME", temp_dir.path());

        let settings = settings();
        let plan = build_plan(PlanKind::Build, &settings).expect("plan");
        let host = ConvergingHost::new(false);
        let options = RunOptions::default();
        let result = execute_with_client(&plan, &settings, &host, "deploy@app:22", &options)
            .expect("run");
        assert_eq!(result.status, PlanStatus::Success);
        assert_eq!(
            result.step("build-app").map(|step| step.status),
            Some(StepStatus::Succeeded)
        );

        let again = execute_with_client(&plan, &settings, &host, "deploy@app:22", &options)
            .expect("second run");
        assert_eq!(again.count(StepStatus::Skipped), 1);

        let runs = temp_dir.path().join("logs").join("runs");
        let logs: Vec<_> = std::fs::read_dir(&runs).expect("runs dir").flatten().collect();
        assert_eq!(logs.len(), 1);
        let content = std::fs::read_to_string(logs[0].path()).expect("read");
        assert_eq!(content.lines().count(), 2);
        assert!(temp_dir.path().join("locks").join("deploy_app_22.lock").exists());
        env::remove_var("DECKHAND_HOME");
    }

    #[test]
    fn held_target_lock_is_fatal() {
        let _guard = crate::test_support::env_lock();
        let temp_dir = tempfile::tempdir().expect("temp dir");
        env::set_var("DECKHAND_HOME", temp_dir.path());

        let settings = settings();
        let plan = build_plan(PlanKind::Build, &settings).expect("plan");
        let host = ConvergingHost::new(true);
        let options = RunOptions::default();
        let err = execute_with_client(&plan, &settings, &host, "deploy@app:22", &options)
            .expect_err("lock held");
        assert!(matches!(
            err,
            CliError::Execution(ExecutionError::Lock(LockError::RemoteHeld { .. }))
        ));
        assert_eq!(host.commands.lock().expect("commands").len(), 1);
        env::remove_var("DECKHAND_HOME");
    }

    #[test]
    fn target_ceiling_caps_step_budgets() {
        let _guard = crate::test_support::env_lock();
        let temp_dir = tempfile::tempdir().expect("temp dir");
        env::set_var("DECKHAND_HOME", temp_dir.path());

        let settings = settings();
        assert!(settings.timeouts.build_secs > 60);
        let plan = build_plan(PlanKind::Build, &settings).expect("plan");
        let host = ConvergingHost::new(false);
        let options = RunOptions {
            command_timeout: Some(Duration::from_secs(60)),
            ..RunOptions::default()
        };
        let result = execute_with_client(&plan, &settings, &host, "deploy@app:22", &options)
            .expect("run");
        assert_eq!(result.status, PlanStatus::Success);
        let timeouts = host.timeouts.lock().expect("timeouts");
        assert!(timeouts.len() > 1);
        assert!(timeouts.iter().all(|timeout| *timeout <= Duration::from_secs(60)));
        env::remove_var("DECKHAND_HOME");
    }

    #[test]
    fn load_plan_reads_settings_file() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("deploy.json");
        std::fs::write(
            &path,
            r#"{"app_name":"shop","app_dir":"/srv/shop","repo_url":"git@example.com:shop.git"}"#,
        )
        .expect("write");
        let (settings, plan) =
            load_plan(PlanKind::SyncAndInstall, Some(&path)).expect("load plan");
        assert_eq!(settings.app_dir, "/srv/shop");
        assert_eq!(plan.name, "sync-and-install");
    }
}
