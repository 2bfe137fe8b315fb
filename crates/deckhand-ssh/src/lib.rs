use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// How the session authenticates. Only references are held here; a password
/// is looked up from the named environment variable when the session opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Agent,
    IdentityFile(PathBuf),
    PasswordEnv(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// The host key must already be present in known_hosts.
    #[default]
    Strict,
    /// Unknown hosts are added on first contact; changed keys are still rejected.
    AcceptNew,
}

impl HostKeyPolicy {
    fn ssh_option(self) -> &'static str {
        match self {
            HostKeyPolicy::Strict => "StrictHostKeyChecking=yes",
            HostKeyPolicy::AcceptNew => "StrictHostKeyChecking=accept-new",
        }
    }
}

impl std::str::FromStr for HostKeyPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "strict" | "yes" => Ok(HostKeyPolicy::Strict),
            "accept-new" | "accept_new" => Ok(HostKeyPolicy::AcceptNew),
            other => Err(format!(
                "unknown host key policy '{other}' (expected strict or accept-new)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub credential: Credential,
    pub host_key_policy: HostKeyPolicy,
    pub known_hosts_file: Option<PathBuf>,
}

impl SshTarget {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Stable identifier used for lock names and log fields.
    pub fn label(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Longest wait any single command is given, whatever the caller asks for.
pub const MAX_COMMAND_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// `timeout` from now, clamped to [`MAX_COMMAND_TIMEOUT`] so the instant is
/// always representable.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout.min(MAX_COMMAND_TIMEOUT))
        .unwrap_or(now)
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub connect_timeout: Duration,
    /// Ceiling for every command run over a session.
    pub command_timeout: Duration,
    pub control_dir: Option<PathBuf>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(3600),
            control_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshCommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl SshCommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshOutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshError {
    Connection { message: String },
    HostKey { message: String },
    Timeout { message: String },
}

impl SshError {
    pub fn is_connection(&self) -> bool {
        matches!(self, SshError::Connection { .. } | SshError::HostKey { .. })
    }
}

impl std::fmt::Display for SshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SshError::Connection { message } => write!(f, "ssh connection error: {message}"),
            SshError::HostKey { message } => {
                write!(f, "ssh host key verification failed: {message}")
            }
            SshError::Timeout { message } => write!(f, "ssh command timeout: {message}"),
        }
    }
}

impl std::error::Error for SshError {}

/// Command execution over an established session. A non-zero remote exit
/// status is a normal result; errors are reserved for transport failures and
/// timeouts.
pub trait SshClient {
    fn run(&self, command: &str, timeout: Duration) -> Result<SshCommandResult, SshError>;

    fn run_streaming(
        &self,
        command: &str,
        timeout: Duration,
        on_output: &mut dyn FnMut(SshOutputStream, &str),
    ) -> Result<SshCommandResult, SshError> {
        let result = self.run(command, timeout)?;
        for line in result.stdout.lines() {
            on_output(SshOutputStream::Stdout, line);
        }
        for line in result.stderr.lines() {
            on_output(SshOutputStream::Stderr, line);
        }
        Ok(result)
    }
}

impl<T: SshClient + ?Sized> SshClient for &T {
    fn run(&self, command: &str, timeout: Duration) -> Result<SshCommandResult, SshError> {
        (**self).run(command, timeout)
    }

    fn run_streaming(
        &self,
        command: &str,
        timeout: Duration,
        on_output: &mut dyn FnMut(SshOutputStream, &str),
    ) -> Result<SshCommandResult, SshError> {
        (**self).run_streaming(command, timeout, on_output)
    }
}

fn control_base_dir(config: &SshConfig) -> PathBuf {
    if let Some(dir) = &config.control_dir {
        return dir.clone();
    }
    if let Ok(path) = std::env::var("DECKHAND_SSH_CONTROL_DIR") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    #[cfg(unix)]
    {
        PathBuf::from("/tmp/deckhand-ssh")
    }
    #[cfg(not(unix))]
    {
        std::env::temp_dir().join("deckhand-ssh")
    }
}

static SESSION_COUNTER: AtomicUsize = AtomicUsize::new(0);

// Socket paths are capped at ~104 bytes on most platforms, so the name is a hash.
fn control_path_for_target(base_dir: &Path, target: &SshTarget) -> PathBuf {
    let local_user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();
    let connection_id = format!(
        "{}:{}:{}:{}",
        local_user,
        target.label(),
        std::process::id(),
        SESSION_COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    connection_id.hash(&mut hasher);
    base_dir.join(format!("dh-{:x}", hasher.finish()))
}

fn prepare_control_dir(dir: &Path) -> Result<(), SshError> {
    std::fs::create_dir_all(dir).map_err(|err| SshError::Connection {
        message: format!("failed to create control dir {}: {err}", dir.display()),
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700));
    }
    Ok(())
}

fn is_host_key_failure(stderr: &str) -> bool {
    stderr.contains("Host key verification failed")
        || stderr.contains("REMOTE HOST IDENTIFICATION HAS CHANGED")
        || stderr.contains("No ED25519 host key is known")
        || stderr.contains("No RSA host key is known")
}

fn sshpass_path() -> Option<String> {
    if let Ok(path) = std::env::var("DECKHAND_SSHPASS") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    match Command::new("sshpass")
        .arg("-V")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => Some("sshpass".to_string()),
        _ => None,
    }
}

/// Opens sessions. Holds only configuration; each session owns its own
/// multiplexed master connection.
#[derive(Debug, Clone, Default)]
pub struct ProcessSshClient {
    config: SshConfig,
}

impl ProcessSshClient {
    pub fn new() -> Self {
        Self {
            config: SshConfig::default(),
        }
    }

    pub fn with_config(config: SshConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    pub fn open(&self, target: &SshTarget) -> Result<SshSession, SshError> {
        let password = match &target.credential {
            Credential::PasswordEnv(var) => {
                let value = std::env::var(var).map_err(|_| SshError::Connection {
                    message: format!("password variable {var} is not set"),
                })?;
                Some(value)
            }
            _ => None,
        };
        let base_dir = control_base_dir(&self.config);
        prepare_control_dir(&base_dir)?;
        let session = SshSession {
            target: target.clone(),
            config: self.config.clone(),
            control_path: control_path_for_target(&base_dir, target),
            password,
            master_stale: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };
        session.spawn_master()?;
        tracing::info!(host = %target.label(), "ssh session opened");
        Ok(session)
    }
}

/// One authenticated connection to one target. Closed on drop.
pub struct SshSession {
    target: SshTarget,
    config: SshConfig,
    control_path: PathBuf,
    password: Option<String>,
    master_stale: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("target", &self.target.label())
            .field("control_path", &self.control_path)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl SshSession {
    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    fn apply_ssh_options(&self, cmd: &mut Command, master: bool) {
        if self.password.is_none() {
            cmd.arg("-o").arg("BatchMode=yes");
        }
        cmd.arg("-o")
            .arg(self.target.host_key_policy.ssh_option())
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.config.connect_timeout.as_secs().max(1)
            ))
            .arg("-o")
            .arg("ServerAliveInterval=15")
            .arg("-p")
            .arg(self.target.port.to_string());
        if let Some(known_hosts) = &self.target.known_hosts_file {
            cmd.arg("-o")
                .arg(format!("UserKnownHostsFile={}", known_hosts.display()));
        }
        if let Credential::IdentityFile(identity) = &self.target.credential {
            cmd.arg("-i").arg(identity).arg("-o").arg("IdentitiesOnly=yes");
        }
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()));
        if master {
            cmd.arg("-o")
                .arg("ControlMaster=yes")
                .arg("-o")
                .arg("ControlPersist=yes");
        } else {
            cmd.arg("-o").arg("ControlMaster=no");
        }
    }

    fn base_command(&self) -> Result<Command, SshError> {
        match &self.password {
            Some(password) => {
                let sshpass = sshpass_path().ok_or_else(|| SshError::Connection {
                    message: "password authentication requires sshpass, which was not found"
                        .to_string(),
                })?;
                let mut cmd = Command::new(sshpass);
                // -e reads SSHPASS so the secret never appears in argv.
                cmd.arg("-e").arg("ssh").env("SSHPASS", password);
                Ok(cmd)
            }
            None => Ok(Command::new("ssh")),
        }
    }

    fn spawn_master(&self) -> Result<(), SshError> {
        let mut cmd = self.base_command()?;
        self.apply_ssh_options(&mut cmd, true);
        cmd.arg("-N").arg("-f").arg(self.target.destination());
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let child = cmd.spawn().map_err(|err| SshError::Connection {
            message: format!("failed to launch ssh: {err}"),
        })?;
        // Authentication plus a little slack; -f returns once the master is up.
        let budget = self.config.connect_timeout.saturating_add(Duration::from_secs(5));
        let (status, stderr) = match wait_with_deadline(child, budget) {
            Some(result) => result,
            None => {
                return Err(SshError::Connection {
                    message: format!(
                        "timed out establishing connection to {} after {}s",
                        self.target.label(),
                        budget.as_secs()
                    ),
                })
            }
        };

        if status == Some(0) {
            self.master_stale.store(false, Ordering::SeqCst);
            return Ok(());
        }
        let trimmed = stderr.trim().to_string();
        if is_host_key_failure(&trimmed) {
            return Err(SshError::HostKey { message: trimmed });
        }
        Err(SshError::Connection {
            message: if trimmed.is_empty() {
                format!("failed to connect to {}", self.target.label())
            } else {
                trimmed
            },
        })
    }

    fn master_active(&self) -> bool {
        if !self.control_path.exists() {
            return false;
        }
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-O")
            .arg("check")
            .arg(self.target.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd.status().map(|status| status.success()).unwrap_or(false)
    }

    fn ensure_master(&self) -> Result<(), SshError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SshError::Connection {
                message: "session is closed".to_string(),
            });
        }
        if !self.master_stale.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.master_active() {
            self.master_stale.store(false, Ordering::SeqCst);
            return Ok(());
        }
        tracing::debug!(host = %self.target.label(), "re-establishing ssh master connection");
        self.spawn_master()
    }

    fn stop_master(&self) {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-O")
            .arg("exit")
            .arg(self.target.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let _ = cmd.status();
        let _ = std::fs::remove_file(&self.control_path);
    }

    fn execute(
        &self,
        command: &str,
        timeout: Duration,
        on_output: &mut dyn FnMut(SshOutputStream, &str),
    ) -> Result<SshCommandResult, SshError> {
        self.ensure_master()?;
        let timeout = timeout.min(self.config.command_timeout);

        let mut cmd = Command::new("ssh");
        self.apply_ssh_options(&mut cmd, false);
        cmd.arg(self.target.destination()).arg("--").arg(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|err| SshError::Connection {
            message: format!("failed to launch ssh: {err}"),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| SshError::Connection {
            message: "failed to capture ssh stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| SshError::Connection {
            message: "failed to capture ssh stderr".to_string(),
        })?;

        let (tx, rx) = mpsc::channel::<(SshOutputStream, String)>();
        let stdout_handle = spawn_line_reader(stdout, SshOutputStream::Stdout, tx.clone());
        let stderr_handle = spawn_line_reader(stderr, SshOutputStream::Stderr, tx);

        let deadline = deadline_after(timeout);
        let mut stdout_buf = String::new();
        let mut stderr_buf = String::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((kind, line)) => {
                    on_output(kind, &line);
                    let buf = match kind {
                        SshOutputStream::Stdout => &mut stdout_buf,
                        SshOutputStream::Stderr => &mut stderr_buf,
                    };
                    buf.push_str(&line);
                    buf.push('\n');
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    // Cancel by tearing down the channel and the master connection.
                    let _ = child.kill();
                    let _ = child.wait();
                    self.stop_master();
                    self.master_stale.store(true, Ordering::SeqCst);
                    let _ = stdout_handle.join();
                    let _ = stderr_handle.join();
                    tracing::warn!(
                        host = %self.target.label(),
                        timeout_secs = timeout.as_secs(),
                        "remote command timed out; connection closed"
                    );
                    return Err(SshError::Timeout {
                        message: format!(
                            "command did not finish within {} seconds",
                            timeout.as_secs()
                        ),
                    });
                }
            }
        }

        let _ = stdout_handle.join();
        let _ = stderr_handle.join();
        let status = child.wait().map_err(|err| SshError::Connection {
            message: format!("failed to wait on ssh process: {err}"),
        })?;
        let exit_code = status.code().unwrap_or(-1);

        if exit_code == 255 {
            self.master_stale.store(true, Ordering::SeqCst);
            let message = if stderr_buf.trim().is_empty() {
                "ssh connection lost".to_string()
            } else {
                stderr_buf.trim().to_string()
            };
            return Err(SshError::Connection { message });
        }

        Ok(SshCommandResult {
            stdout: stdout_buf,
            stderr: stderr_buf,
            exit_code,
        })
    }

    /// Releases the master connection. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_master();
        tracing::info!(host = %self.target.label(), "ssh session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl SshClient for SshSession {
    fn run(&self, command: &str, timeout: Duration) -> Result<SshCommandResult, SshError> {
        self.execute(command, timeout, &mut |_, _| {})
    }

    fn run_streaming(
        &self,
        command: &str,
        timeout: Duration,
        on_output: &mut dyn FnMut(SshOutputStream, &str),
    ) -> Result<SshCommandResult, SshError> {
        self.execute(command, timeout, on_output)
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(
    reader: R,
    kind: SshOutputStream,
    tx: mpsc::Sender<(SshOutputStream, String)>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                    }
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                    let line = String::from_utf8_lossy(&buf).to_string();
                    if tx.send((kind, line)).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Waits for `child` up to `budget`, killing it on expiry. Returns the exit
/// code and captured stderr, or `None` on timeout.
///
/// A backgrounded master (`-f`) inherits the stderr pipe, so stderr is only
/// collected when the process failed.
fn wait_with_deadline(mut child: Child, budget: Duration) -> Option<(Option<i32>, String)> {
    let (tx, rx) = mpsc::channel::<String>();
    if let Some(mut stderr) = child.stderr.take() {
        thread::spawn(move || {
            let mut text = String::new();
            let _ = stderr.read_to_string(&mut text);
            let _ = tx.send(text);
        });
    }

    let deadline = deadline_after(budget);
    loop {
        match child.try_wait() {
            Ok(Some(status)) if status.success() => return Some((status.code(), String::new())),
            Ok(Some(status)) => {
                let text = rx.recv_timeout(Duration::from_secs(2)).unwrap_or_default();
                return Some((status.code(), text));
            }
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SshTarget {
        SshTarget {
            host: "app.internal".to_string(),
            user: "deploy".to_string(),
            port: 2222,
            credential: Credential::Agent,
            host_key_policy: HostKeyPolicy::Strict,
            known_hosts_file: None,
        }
    }

    #[test]
    fn parses_host_key_policy() {
        assert_eq!("strict".parse::<HostKeyPolicy>(), Ok(HostKeyPolicy::Strict));
        assert_eq!(
            "Accept-New".parse::<HostKeyPolicy>(),
            Ok(HostKeyPolicy::AcceptNew)
        );
        assert!("no".parse::<HostKeyPolicy>().is_err());
        assert_eq!(HostKeyPolicy::default(), HostKeyPolicy::Strict);
    }

    #[test]
    fn control_paths_are_unique_per_session() {
        let base = PathBuf::from("/tmp/deckhand-ssh");
        let first = control_path_for_target(&base, &target());
        let second = control_path_for_target(&base, &target());
        assert_ne!(first, second);
        assert!(first.starts_with(&base));
    }

    #[test]
    fn detects_host_key_mismatch() {
        assert!(is_host_key_failure(
            "@@@ WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED! @@@"
        ));
        assert!(is_host_key_failure("Host key verification failed."));
        assert!(!is_host_key_failure("Permission denied (publickey)."));
    }

    #[test]
    fn open_fails_without_password_variable() {
        let mut target = target();
        target.credential = Credential::PasswordEnv("DECKHAND_TEST_UNSET_PASSWORD".to_string());
        let client = ProcessSshClient::new();
        let err = client.open(&target).expect_err("missing password");
        assert!(err.is_connection());
        assert!(err.to_string().contains("DECKHAND_TEST_UNSET_PASSWORD"));
    }

    #[test]
    fn huge_timeouts_clamp_instead_of_overflowing() {
        let before = Instant::now();
        let deadline = deadline_after(Duration::from_secs(u64::MAX));
        assert!(deadline > before);
        assert!(deadline.duration_since(before) <= MAX_COMMAND_TIMEOUT + Duration::from_secs(1));
        let short = deadline_after(Duration::from_secs(2));
        assert!(short.duration_since(before) <= Duration::from_secs(3));
    }

    #[test]
    fn default_streaming_replays_captured_output() {
        struct Fixed;
        impl SshClient for Fixed {
            fn run(&self, _command: &str, _timeout: Duration) -> Result<SshCommandResult, SshError> {
                Ok(SshCommandResult {
                    stdout: "a\nb\n".to_string(),
                    stderr: "warn\n".to_string(),
                    exit_code: 0,
                })
            }
        }
        let mut lines = Vec::new();
        let result = Fixed
            .run_streaming("true", Duration::from_secs(1), &mut |kind, line| {
                lines.push((kind, line.to_string()))
            })
            .expect("run");
        assert!(result.success());
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2], (SshOutputStream::Stderr, "warn".to_string()));
    }
}
