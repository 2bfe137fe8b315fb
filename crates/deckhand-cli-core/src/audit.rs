use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{Datelike, Local};
use deckhand_core_domain::{PlanResult, StepStatus};

use crate::{config, CliError};

const LOG_ROTATE_BYTES: u64 = 20 * 1024 * 1024;

/// Appends one line to `$DECKHAND_HOME/logs/<category>/YYYY-MM-DD.log`.
pub fn write_audit_log(category: &str, message: &str) -> Result<PathBuf, CliError> {
    let base_path = config::ensure_home_dir()?;
    let log_dir = base_path.join("logs").join(category);
    fs::create_dir_all(&log_dir)?;

    let now = Local::now();
    let filename = format!("{}-{:02}-{:02}.log", now.year(), now.month(), now.day());
    let log_path = log_dir.join(filename);

    rotate_if_needed(&log_path, now.timestamp())?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let timestamp = now.format("%Y-%m-%d %H:%M:%S").to_string();
    writeln!(file, "[{}] {}", timestamp, message)?;
    Ok(log_path)
}

pub fn run_summary_line(result: &PlanResult) -> String {
    let failed: Vec<&str> = result.failed_steps().map(|step| step.id.as_str()).collect();
    let mut line = format!(
        "plan={} target={} dry_run={} status={} succeeded={} skipped={} failed={}",
        result.plan,
        result.target,
        result.dry_run,
        result.status.as_str(),
        result.count(StepStatus::Succeeded),
        result.count(StepStatus::Skipped),
        result.count(StepStatus::Failed),
    );
    if !failed.is_empty() {
        line.push_str(&format!(" failed_steps={}", failed.join(",")));
    }
    let elapsed = result.finished_at - result.started_at;
    line.push_str(&format!(" elapsed_ms={}", elapsed.num_milliseconds()));
    line
}

pub fn record_run(result: &PlanResult) -> Result<PathBuf, CliError> {
    write_audit_log("runs", &run_summary_line(result))
}

fn rotate_if_needed(path: &Path, ts: i64) -> Result<(), CliError> {
    if let Ok(metadata) = fs::metadata(path) {
        if metadata.is_file() && metadata.len() > LOG_ROTATE_BYTES {
            let rotated_name = format!("{}.{}.old", path.to_string_lossy(), ts);
            let _ = fs::rename(path, rotated_name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use deckhand_core_domain::{PlanStatus, StepResult};
    use std::env;

    fn result() -> PlanResult {
        let step = |id: &str, status| StepResult {
            id: id.to_string(),
            status,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            duration_ms: 5,
            attempts: 1,
            failure: None,
            postcondition_met: None,
        };
        PlanResult {
            plan: "build".to_string(),
            target: "deploy@app:22".to_string(),
            dry_run: false,
            status: PlanStatus::Partial,
            steps: vec![
                step("build-app", StepStatus::Succeeded),
                step("enable-renewal-timer", StepStatus::Failed),
            ],
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn summarizes_runs() {
        let line = run_summary_line(&result());
        assert!(line.starts_with(
            "plan=build target=deploy@app:22 dry_run=false status=partial succeeded=1 skipped=0 failed=1"
        ));
        assert!(line.contains("failed_steps=enable-renewal-timer"));
    }

    #[test]
    fn writes_run_log_to_temp_dir() {
        let _guard = crate::test_support::env_lock();
        let temp_dir = tempfile::tempdir().expect("temp dir");
        env::set_var("DECKHAND_HOME", temp_dir.path());
        let path = record_run(&result()).expect("write log");
        assert!(path.starts_with(temp_dir.path().join("logs").join("runs")));
        let content = fs::read_to_string(&path).expect("read log");
        assert!(content.contains("plan=build"));
        env::remove_var("DECKHAND_HOME");
    }

    #[test]
    fn rotates_large_logs() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("2026-01-01.log");
        let file = fs::File::create(&path).expect("create");
        file.set_len(LOG_ROTATE_BYTES + 1).expect("grow");
        rotate_if_needed(&path, 42).expect("rotate");
        assert!(!path.exists());
        assert!(temp_dir.path().join("2026-01-01.log.42.old").exists());
    }
}
