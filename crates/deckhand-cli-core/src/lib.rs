pub mod audit;
pub mod config;
pub mod deploy;
pub mod report;
pub mod target;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("ssh error: {0}")]
    Ssh(#[from] deckhand_ssh::SshError),
    #[error(transparent)]
    Settings(#[from] deckhand_core_domain::SettingsError),
    #[error(transparent)]
    Plan(#[from] deckhand_planner::PlanBuildError),
    #[error(transparent)]
    Execution(#[from] deckhand_executor::ExecutionError),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("config error: {0}")]
    Config(String),
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard, OnceLock};

    pub fn env_lock() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
