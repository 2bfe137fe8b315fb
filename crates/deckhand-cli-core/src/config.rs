use std::path::{Path, PathBuf};
use std::{env, fs};

use deckhand_core_domain::DeploySettings;

use crate::CliError;

const SETTINGS_FILE: &str = "deploy.json";

fn resolve_home_dir() -> Result<PathBuf, CliError> {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .map_err(|_| CliError::Config("home directory not found".to_string()))
}

fn normalize_dir(value: &str, home: &Path) -> Result<PathBuf, CliError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CliError::Config("data directory is empty".to_string()));
    }
    let mut path = match trimmed.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None => PathBuf::from(trimmed),
    };
    if path.is_relative() {
        path = env::current_dir()?.join(path);
    }
    Ok(path)
}

/// `$DECKHAND_HOME`, else `~/.deckhand`.
pub fn deckhand_home() -> Result<PathBuf, CliError> {
    let home = resolve_home_dir()?;
    if let Ok(custom) = env::var("DECKHAND_HOME") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return normalize_dir(trimmed, &home);
        }
    }
    Ok(home.join(".deckhand"))
}

pub fn ensure_home_dir() -> Result<PathBuf, CliError> {
    let path = deckhand_home()?;
    fs::create_dir_all(&path)?;
    Ok(path)
}

pub fn locks_dir() -> Result<PathBuf, CliError> {
    Ok(deckhand_home()?.join("locks"))
}

/// The explicit `--config` path, else the settings file in the home dir.
pub fn settings_path(explicit: Option<&Path>) -> Result<PathBuf, CliError> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(deckhand_home()?.join(SETTINGS_FILE)),
    }
}

pub fn load_settings(explicit: Option<&Path>) -> Result<DeploySettings, CliError> {
    let path = settings_path(explicit)?;
    let content = fs::read_to_string(&path).map_err(|err| {
        CliError::Config(format!(
            "failed to read settings {}: {err}",
            path.display()
        ))
    })?;
    let settings = DeploySettings::from_json(&content)?;
    tracing::debug!(path = %path.display(), app = %settings.app_name, "loaded settings");
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS: &str = r#"{
        "app_name": "shop",
        "app_dir": "/var/www/shop",
        "repo_url": "https://git.example.com/acme/shop.git"
    }"#;

    #[test]
    fn home_follows_environment() {
        let _guard = crate::test_support::env_lock();
        let temp_dir = tempfile::tempdir().expect("temp dir");
        env::set_var("DECKHAND_HOME", temp_dir.path());
        assert_eq!(deckhand_home().expect("home"), temp_dir.path());
        assert_eq!(locks_dir().expect("locks"), temp_dir.path().join("locks"));
        assert_eq!(
            settings_path(None).expect("settings"),
            temp_dir.path().join("deploy.json")
        );
        env::remove_var("DECKHAND_HOME");
    }

    #[test]
    fn loads_settings_from_home_or_explicit_path() {
        let _guard = crate::test_support::env_lock();
        let temp_dir = tempfile::tempdir().expect("temp dir");
        env::set_var("DECKHAND_HOME", temp_dir.path());
        fs::write(temp_dir.path().join("deploy.json"), SETTINGS).expect("write");
        let settings = load_settings(None).expect("load");
        assert_eq!(settings.app_name, "shop");

        let explicit = temp_dir.path().join("other.json");
        fs::write(&explicit, SETTINGS.replace("shop", "cart")).expect("write");
        let settings = load_settings(Some(&explicit)).expect("load explicit");
        assert_eq!(settings.app_name, "cart");
        env::remove_var("DECKHAND_HOME");
    }

    #[test]
    fn missing_settings_is_a_config_error() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let missing = temp_dir.path().join("absent.json");
        let err = load_settings(Some(&missing)).expect_err("missing");
        assert!(matches!(err, CliError::Config(_)));
        assert!(err.to_string().contains("absent.json"));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("deploy.json");
        fs::write(&path, SETTINGS.replace("\"app_name\": \"shop\"", "\"app_name\": \"../x\""))
            .expect("write");
        assert!(matches!(
            load_settings(Some(&path)),
            Err(CliError::Settings(_))
        ));
    }
}
