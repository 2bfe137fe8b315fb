use std::fs;
use std::path::Path;
use std::str::FromStr;

use deckhand_core_domain::{PlanResult, StepResult, StepStatus};
use serde::Serialize;

use crate::CliError;

/// Lines of captured output shown per failed step on the terminal.
const DISPLAY_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("unknown format '{other}' (expected text or json)")),
        }
    }
}

#[derive(Serialize)]
struct StepRecord<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    step: &'a StepResult,
}

#[derive(Serialize)]
struct Counts {
    succeeded: usize,
    skipped: usize,
    failed: usize,
    would_run: usize,
}

#[derive(Serialize)]
struct SummaryRecord<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    plan: &'a str,
    target: &'a str,
    dry_run: bool,
    status: &'static str,
    exit_code: i32,
    started_at: String,
    finished_at: String,
    counts: Counts,
}

fn counts(result: &PlanResult) -> Counts {
    Counts {
        succeeded: result.count(StepStatus::Succeeded),
        skipped: result.count(StepStatus::Skipped),
        failed: result.count(StepStatus::Failed),
        would_run: result.count(StepStatus::WouldRun),
    }
}

fn summary_record(result: &PlanResult) -> SummaryRecord<'_> {
    SummaryRecord {
        kind: "summary",
        plan: &result.plan,
        target: &result.target,
        dry_run: result.dry_run,
        status: result.status.as_str(),
        exit_code: result.status.exit_code(),
        started_at: result.started_at.to_rfc3339(),
        finished_at: result.finished_at.to_rfc3339(),
        counts: counts(result),
    }
}

/// One JSON object per step followed by a summary object, newline separated.
pub fn render_json_lines(result: &PlanResult) -> Result<String, CliError> {
    let mut output = String::new();
    for step in &result.steps {
        output.push_str(&serde_json::to_string(&StepRecord { kind: "step", step })?);
        output.push('\n');
    }
    output.push_str(&serde_json::to_string(&summary_record(result))?);
    output.push('\n');
    Ok(output)
}

fn tail(text: &str, lines: usize) -> (Vec<&str>, usize) {
    let all: Vec<&str> = text.lines().collect();
    let skipped = all.len().saturating_sub(lines);
    (all[skipped..].to_vec(), skipped)
}

fn push_tail(output: &mut String, label: &str, text: &str) {
    if text.trim().is_empty() {
        return;
    }
    let (lines, hidden) = tail(text, DISPLAY_TAIL_LINES);
    output.push_str(&format!("      {label}:\n"));
    if hidden > 0 {
        output.push_str(&format!("      | ... {hidden} earlier lines in the full report\n"));
    }
    for line in lines {
        output.push_str(&format!("      | {line}\n"));
    }
}

pub fn render_text(result: &PlanResult) -> String {
    let mut output = format!(
        "plan {} on {}{}\n",
        result.plan,
        result.target,
        if result.dry_run { " (dry run)" } else { "" }
    );
    for step in &result.steps {
        let mut line = format!(
            "  {:<10} {:<28} {:>7.1}s",
            step.status.as_str(),
            step.id,
            step.duration_ms as f64 / 1000.0
        );
        if step.attempts > 1 {
            line.push_str(&format!("  attempts={}", step.attempts));
        }
        if step.postcondition_met == Some(true) {
            line.push_str("  (postcondition already holds)");
        }
        if step.status == StepStatus::Failed {
            if let Some(code) = step.exit_code {
                line.push_str(&format!("  exit={code}"));
            }
            if let Some(failure) = &step.failure {
                line.push_str(&format!("  {failure}"));
            }
        }
        output.push_str(&line);
        output.push('\n');
        if step.status == StepStatus::Failed {
            push_tail(&mut output, "stderr", &step.stderr);
            push_tail(&mut output, "stdout", &step.stdout);
        }
    }
    let counts = counts(result);
    output.push_str(&format!(
        "status: {} (exit {}): {} succeeded, {} skipped, {} failed",
        result.status.as_str(),
        result.status.exit_code(),
        counts.succeeded,
        counts.skipped,
        counts.failed
    ));
    if result.dry_run {
        output.push_str(&format!(", {} would run", counts.would_run));
    }
    output.push('\n');
    output
}

/// Full result, untruncated, as pretty JSON.
pub fn write_report(path: &Path, result: &PlanResult) -> Result<(), CliError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let content = serde_json::to_string_pretty(result)?;
    fs::write(path, content)?;
    Ok(())
}
