//! Per-target run lock: a process-local registry entry, an exclusive file
//! lock on the operator machine, and a `mkdir` lock directory on the target.

use chrono::Utc;
use deckhand_planner::commands::shell_quote;
use deckhand_ssh::{SshClient, SshError};
use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use thiserror::Error;

const REMOTE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const REMOTE_HELD_EXIT: i32 = 3;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("a run against {key} is already in progress in this process")]
    AlreadyRunning { key: String },
    #[error("another deckhand run holds {}", path.display())]
    Held { path: PathBuf },
    #[error(
        "target lock {path} is held by {owner}; if no run is active, remove it on the target with `rm -rf {path}`"
    )]
    RemoteHeld { path: String, owner: String },
    #[error("failed to use lock file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to take target lock: {0}")]
    Remote(#[from] SshError),
    #[error("failed to take target lock {path}: exit {exit_code}: {stderr}")]
    RemoteFailed {
        path: String,
        exit_code: i32,
        stderr: String,
    },
}

fn registry() -> &'static Mutex<HashSet<String>> {
    static ACTIVE: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    ACTIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

fn lock_file_name(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    format!("{sanitized}.lock")
}

fn owner_label() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    format!(
        "deckhand pid={} host={} since={}",
        std::process::id(),
        host,
        Utc::now().to_rfc3339()
    )
}

#[derive(Debug)]
pub struct ProcessLockGuard {
    key: String,
}

impl ProcessLockGuard {
    pub fn acquire(key: &str) -> Result<Self, LockError> {
        let mut active = registry()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !active.insert(key.to_string()) {
            return Err(LockError::AlreadyRunning {
                key: key.to_string(),
            });
        }
        Ok(Self {
            key: key.to_string(),
        })
    }
}

impl Drop for ProcessLockGuard {
    fn drop(&mut self) {
        let mut active = registry()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        active.remove(&self.key);
    }
}

#[derive(Debug)]
pub struct FileLockGuard {
    file: File,
    path: PathBuf,
}

impl FileLockGuard {
    pub fn acquire(dir: &Path, key: &str) -> Result<Self, LockError> {
        let path = dir.join(lock_file_name(key));
        let io_error = |source| LockError::Io {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(dir).map_err(io_error)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(io_error)?;

        if let Err(err) = file.try_lock_exclusive() {
            if err.kind() == std::io::ErrorKind::WouldBlock
                || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
            {
                return Err(LockError::Held { path: path.clone() });
            }
            return Err(io_error(err));
        }

        file.set_len(0).map_err(io_error)?;
        writeln!(file, "{}", owner_label()).map_err(io_error)?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Lock directory on the target. Removed when dropped.
pub struct RemoteLockGuard<'a> {
    client: &'a dyn SshClient,
    path: String,
}

impl<'a> RemoteLockGuard<'a> {
    pub fn acquire(client: &'a dyn SshClient, path: &str) -> Result<Self, LockError> {
        let quoted = shell_quote(path);
        let owner_file = shell_quote(&format!("{path}/owner"));
        let command = format!(
            "if mkdir {quoted} 2>/dev/null; then echo {owner} > {owner_file}; \
             else cat {owner_file} 2>/dev/null; exit {REMOTE_HELD_EXIT}; fi",
            owner = shell_quote(&owner_label()),
        );
        let result = client.run(&command, REMOTE_LOCK_TIMEOUT)?;
        match result.exit_code {
            0 => {
                tracing::debug!(path, "target lock acquired");
                Ok(Self {
                    client,
                    path: path.to_string(),
                })
            }
            REMOTE_HELD_EXIT => {
                let owner = result.stdout.trim();
                Err(LockError::RemoteHeld {
                    path: path.to_string(),
                    owner: if owner.is_empty() {
                        "an unknown owner".to_string()
                    } else {
                        owner.to_string()
                    },
                })
            }
            exit_code => Err(LockError::RemoteFailed {
                path: path.to_string(),
                exit_code,
                stderr: result.stderr.trim().to_string(),
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for RemoteLockGuard<'_> {
    fn drop(&mut self) {
        let command = format!("rm -rf {}", shell_quote(&self.path));
        match self.client.run(&command, REMOTE_LOCK_TIMEOUT) {
            Ok(result) if result.success() => {
                tracing::debug!(path = %self.path, "target lock released")
            }
            Ok(result) => tracing::warn!(
                path = %self.path,
                exit_code = result.exit_code,
                "failed to release target lock"
            ),
            Err(err) => tracing::warn!(path = %self.path, error = %err, "failed to release target lock"),
        }
    }
}

/// All three layers for one target. Fields drop in order, so the remote
/// directory goes first.
pub struct RunLock<'a> {
    remote: Option<RemoteLockGuard<'a>>,
    file: FileLockGuard,
    _process: ProcessLockGuard,
}

impl<'a> RunLock<'a> {
    /// Takes the local locks for `key`, then the remote one at `remote_path`
    /// when a client is given.
    pub fn acquire(
        key: &str,
        locks_dir: &Path,
        remote: Option<(&'a dyn SshClient, &str)>,
    ) -> Result<Self, LockError> {
        let process = ProcessLockGuard::acquire(key)?;
        let file = FileLockGuard::acquire(locks_dir, key)?;
        let remote = match remote {
            Some((client, path)) => Some(RemoteLockGuard::acquire(client, path)?),
            None => None,
        };
        Ok(Self {
            remote,
            file,
            _process: process,
        })
    }

    pub fn file_path(&self) -> &Path {
        self.file.path()
    }

    pub fn remote_path(&self) -> Option<&str> {
        self.remote.as_ref().map(RemoteLockGuard::path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deckhand_ssh::SshCommandResult;
    use std::sync::Arc;

    struct LockHost {
        held: Mutex<bool>,
        commands: Arc<Mutex<Vec<String>>>,
    }

    impl LockHost {
        fn new(held: bool) -> Self {
            Self {
                held: Mutex::new(held),
                commands: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl SshClient for LockHost {
        fn run(&self, command: &str, _timeout: Duration) -> Result<SshCommandResult, SshError> {
            self.commands.lock().expect("commands").push(command.to_string());
            let mut held = self.held.lock().expect("held");
            if command.starts_with("if mkdir") {
                if *held {
                    return Ok(SshCommandResult {
                        stdout: "deckhand pid=1 host=ci\n".to_string(),
                        stderr: String::new(),
                        exit_code: REMOTE_HELD_EXIT,
                    });
                }
                *held = true;
            } else if command.starts_with("rm -rf") {
                *held = false;
            }
            Ok(SshCommandResult {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            })
        }
    }

    #[test]
    fn file_lock_is_exclusive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = FileLockGuard::acquire(dir.path(), "deploy@a:22").expect("first");
        assert!(first.path().ends_with("deploy_a_22.lock"));
        let second = FileLockGuard::acquire(dir.path(), "deploy@a:22");
        assert!(matches!(second, Err(LockError::Held { .. })));
        drop(first);
        FileLockGuard::acquire(dir.path(), "deploy@a:22").expect("after release");
    }

    #[test]
    fn process_registry_rejects_second_holder() {
        let first = ProcessLockGuard::acquire("lock-test-registry").expect("first");
        assert!(matches!(
            ProcessLockGuard::acquire("lock-test-registry"),
            Err(LockError::AlreadyRunning { .. })
        ));
        drop(first);
        ProcessLockGuard::acquire("lock-test-registry").expect("released");
    }

    #[test]
    fn remote_lock_reports_owner_and_releases_on_drop() {
        let host = LockHost::new(false);
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let lock = RunLock::acquire(
                "lock-test-remote",
                dir.path(),
                Some((&host as &dyn SshClient, "/var/lock/deckhand.lock")),
            )
            .expect("lock");
            assert_eq!(lock.remote_path(), Some("/var/lock/deckhand.lock"));

            let err = RemoteLockGuard::acquire(&host, "/var/lock/deckhand.lock")
                .err()
                .expect("held");
            let message = err.to_string();
            assert!(message.contains("target lock /var/lock/deckhand.lock is held by"));
            assert!(message.contains("deckhand pid=1 host=ci"));
            assert!(message.ends_with("remove it on the target with `rm -rf /var/lock/deckhand.lock`"));
        }
        let commands = host.commands.lock().expect("commands");
        assert_eq!(commands.last().map(String::as_str), Some("rm -rf /var/lock/deckhand.lock"));
        assert!(!*host.held.lock().expect("held"));
    }

    #[test]
    fn failed_remote_lock_releases_local_locks() {
        let host = LockHost::new(true);
        let dir = tempfile::tempdir().expect("tempdir");
        let result = RunLock::acquire(
            "lock-test-held",
            dir.path(),
            Some((&host as &dyn SshClient, "/var/lock/deckhand.lock")),
        );
        assert!(matches!(result, Err(LockError::RemoteHeld { .. })));
        ProcessLockGuard::acquire("lock-test-held").expect("local lock released");
        FileLockGuard::acquire(dir.path(), "lock-test-held").expect("file lock released");
    }
}
