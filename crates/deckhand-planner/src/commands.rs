//! Shell fragments shared by the plan builders.
//!
//! A *condition* is a shell fragment whose status answers a yes/no question.
//! [`check_script`] folds conditions into a script that exits `0` or `1` only,
//! so a missing file or a stopped unit never reads as a check error.

pub fn shell_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '/' | ':' | '='))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Runs `script` as the unprivileged service account.
pub fn as_user(user: &str, script: &str) -> String {
    format!(
        "sudo -n -u {} -H -- sh -c {}",
        shell_quote(user),
        shell_quote(script)
    )
}

/// Runs `script` with root privileges, through `sudo -n` when the login user
/// is not root.
pub fn privileged(use_sudo: bool, script: &str) -> String {
    if use_sudo {
        format!("sudo -n -- sh -c {}", shell_quote(script))
    } else {
        format!("sh -c {}", shell_quote(script))
    }
}

pub fn check_script(conditions: &[String]) -> String {
    let mut script = String::new();
    for condition in conditions {
        script.push_str("if ! { ");
        script.push_str(condition);
        script.push_str("\n}; then exit 1; fi\n");
    }
    script.push_str("exit 0");
    script
}

pub fn dir_owned_by(path: &str, user: &str) -> String {
    let path = shell_quote(path);
    format!(
        "test -d {path} && [ \"$(stat -c %U {path})\" = {} ]",
        shell_quote(user)
    )
}

fn heredoc_delimiter(content: &str) -> String {
    let mut delimiter = "DECKHAND_EOF".to_string();
    let mut counter = 0;
    while content.lines().any(|line| line == delimiter) {
        counter += 1;
        delimiter = format!("DECKHAND_EOF_{counter}");
    }
    delimiter
}

/// Heredoc body for `content`. The heredoc supplies one trailing newline, so
/// one is stripped here.
fn heredoc(content: &str) -> (String, String) {
    let body = content.strip_suffix('\n').unwrap_or(content).to_string();
    (heredoc_delimiter(content), body)
}

/// Condition: the file at `path` holds exactly `content`.
pub fn content_matches(path: &str, content: &str) -> String {
    let (delimiter, body) = heredoc(content);
    format!(
        "cmp -s {} - <<'{delimiter}'\n{body}\n{delimiter}",
        shell_quote(path)
    )
}

/// Script that replaces `path` with `content` through a temp file and rename.
pub fn write_file_atomically(path: &str, content: &str, mode: &str) -> String {
    let (delimiter, body) = heredoc(content);
    let quoted = shell_quote(path);
    format!(
        "set -e\n\
         tmp=$(mktemp {template})\n\
         trap 'rm -f \"$tmp\"' EXIT\n\
         cat > \"$tmp\" <<'{delimiter}'\n{body}\n{delimiter}\n\
         chmod {mode} \"$tmp\"\n\
         mv -f \"$tmp\" {quoted}",
        template = shell_quote(&format!("{path}.XXXXXX")),
    )
}

/// Condition: `url` answers with a 2xx/3xx status within `attempts` tries.
pub fn http_health(url: &str, attempts: u32, interval_secs: u64) -> String {
    let attempts = attempts.max(1);
    format!(
        "healthy=1; i=0; while [ $i -lt {attempts} ]; do \
         if curl -fsS -o /dev/null --max-time 5 {url}; then healthy=0; break; fi; \
         i=$((i + 1)); if [ $i -lt {attempts} ]; then sleep {interval_secs}; fi; \
         done; [ $healthy -eq 0 ]",
        url = shell_quote(url),
    )
}

/// Worst-case duration of [`http_health`], used to size check timeouts.
pub fn http_health_budget_secs(attempts: u32, interval_secs: u64) -> u64 {
    let attempts = u64::from(attempts.max(1));
    attempts
        .saturating_mul(5)
        .saturating_add((attempts - 1).saturating_mul(interval_secs))
}

/// Condition: the recorded sha256 of `file` in `stamp` is current.
pub fn digest_matches(file: &str, stamp: &str) -> String {
    format!(
        "sha256sum {} 2>/dev/null | cmp -s - {}",
        shell_quote(file),
        shell_quote(stamp)
    )
}

pub fn record_digest(file: &str, stamp: &str) -> String {
    format!("sha256sum {} > {}", shell_quote(file), shell_quote(stamp))
}

pub fn unit_active(unit: &str) -> String {
    format!("systemctl is-active --quiet {}", shell_quote(unit))
}
