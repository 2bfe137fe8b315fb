use std::path::PathBuf;
use std::time::Duration;

use deckhand_ssh::{Credential, HostKeyPolicy, SshConfig, SshTarget};

use crate::CliError;

/// Connection details for one named target, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub name: String,
    pub target: SshTarget,
    pub connect_timeout: Duration,
    /// Ceiling applied to every step and check budget on this target.
    pub command_timeout: Duration,
}

impl ResolvedTarget {
    pub fn ssh_config(&self) -> SshConfig {
        SshConfig {
            connect_timeout: self.connect_timeout,
            command_timeout: self.command_timeout,
            control_dir: None,
        }
    }
}

pub fn env_prefix(name: &str) -> String {
    let normalized: String = name
        .trim()
        .chars()
        .map(|ch| match ch {
            '-' | '.' => '_',
            other => other.to_ascii_uppercase(),
        })
        .collect();
    format!("DECKHAND_{normalized}_")
}

pub fn resolve_target(name: &str) -> Result<ResolvedTarget, CliError> {
    resolve_target_with(name, |key| std::env::var(key).ok())
}

/// Resolves `name` through `lookup`, which maps variable names to values.
pub fn resolve_target_with<F>(name: &str, lookup: F) -> Result<ResolvedTarget, CliError>
where
    F: Fn(&str) -> Option<String>,
{
    if name.trim().is_empty()
        || !name
            .trim()
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
    {
        return Err(CliError::InvalidInput(format!(
            "target name {name:?} may only contain letters, digits, '-', '_' and '.'"
        )));
    }
    let prefix = env_prefix(name);
    let get = |suffix: &str| {
        lookup(&format!("{prefix}{suffix}"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    let host = get("HOST").ok_or_else(|| {
        CliError::Config(format!("target {name}: {prefix}HOST is not set"))
    })?;
    let port = match get("PORT") {
        Some(value) => value.parse::<u16>().map_err(|_| {
            CliError::Config(format!("target {name}: {prefix}PORT is not a valid port"))
        })?,
        None => 22,
    };
    let user = get("USER").unwrap_or_else(|| "deploy".to_string());

    let credential = match (get("IDENTITY_FILE"), get("PASSWORD_ENV")) {
        (Some(_), Some(_)) => {
            return Err(CliError::Config(format!(
                "target {name}: set only one of {prefix}IDENTITY_FILE and {prefix}PASSWORD_ENV"
            )))
        }
        (Some(path), None) => Credential::IdentityFile(PathBuf::from(path)),
        (None, Some(var)) => Credential::PasswordEnv(var),
        (None, None) => Credential::Agent,
    };

    let host_key_policy = match get("HOST_KEY_POLICY") {
        Some(value) => value
            .parse::<HostKeyPolicy>()
            .map_err(|err| CliError::Config(format!("target {name}: {err}")))?,
        None => HostKeyPolicy::Strict,
    };
    let known_hosts_file = get("KNOWN_HOSTS").map(PathBuf::from);

    let seconds = |suffix: &str, default: u64| -> Result<Duration, CliError> {
        match get(suffix) {
            Some(value) => value
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .ok_or_else(|| {
                    CliError::Config(format!(
                        "target {name}: {prefix}{suffix} must be a positive number of seconds"
                    ))
                }),
            None => Ok(Duration::from_secs(default)),
        }
    };
    let command_timeout = seconds("COMMAND_TIMEOUT_SECS", 3600)?;
    let connect_timeout = seconds("CONNECT_TIMEOUT_SECS", 10)?;

    Ok(ResolvedTarget {
        name: name.trim().to_string(),
        target: SshTarget {
            host,
            user,
            port,
            credential,
            host_key_policy,
            known_hosts_file,
        },
        connect_timeout,
        command_timeout,
    })
}
