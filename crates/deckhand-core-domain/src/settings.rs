use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid settings: {0}")]
pub struct SettingsError(pub String);

impl From<String> for SettingsError {
    fn from(message: String) -> Self {
        SettingsError(message)
    }
}

/// Everything a plan needs to know about the deployed application. Loaded
/// from a settings file; holds no credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploySettings {
    pub app_name: String,
    pub app_dir: String,
    pub repo_url: String,
    #[serde(default = "default_revision")]
    pub revision: String,
    #[serde(default = "default_service_user")]
    pub service_user: String,
    #[serde(default = "default_app_port")]
    pub port: u16,
    /// Prefix privileged commands with `sudo -n` (login user is not root).
    #[serde(default)]
    pub use_sudo: bool,
    #[serde(default = "default_lock_path")]
    pub lock_path: String,
    #[serde(default)]
    pub install: InstallSettings,
    #[serde(default)]
    pub build: BuildSettings,
    #[serde(default)]
    pub process: ProcessSettings,
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default)]
    pub certificate: Option<CertificateSettings>,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallSettings {
    pub command: String,
    pub manifest_file: String,
    pub lock_file: String,
    pub dependency_dir: String,
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            command: "npm ci".to_string(),
            manifest_file: "package.json".to_string(),
            lock_file: "package-lock.json".to_string(),
            dependency_dir: "node_modules".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    pub command: String,
    pub output_dir: String,
    pub marker: String,
    pub clean: bool,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            command: "npm run build".to_string(),
            output_dir: ".next".to_string(),
            marker: ".next/BUILD_ID".to_string(),
            clean: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSettings {
    pub name: Option<String>,
    pub script: String,
    pub args: String,
    pub node_env: String,
    pub log_dir: Option<String>,
    pub instances: u32,
    pub max_restarts: u32,
    pub min_uptime: String,
    /// Non-secret environment for the managed process.
    pub env: BTreeMap<String, String>,
    pub health_path: String,
    pub health_attempts: u32,
    pub health_interval_secs: u64,
    /// Start the development server when the production start stays unhealthy.
    pub dev_fallback: bool,
    pub dev_args: String,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            name: None,
            script: "npm".to_string(),
            args: "start".to_string(),
            node_env: "production".to_string(),
            log_dir: None,
            instances: 1,
            max_restarts: 10,
            min_uptime: "10s".to_string(),
            env: BTreeMap::new(),
            health_path: "/".to_string(),
            health_attempts: 10,
            health_interval_secs: 3,
            dev_fallback: false,
            dev_args: "run dev".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub server_names: Vec<String>,
    pub listen: u16,
    pub default_server: bool,
    pub sites_available_dir: String,
    pub sites_enabled_dir: String,
    pub client_max_body_size: String,
    pub read_timeout_secs: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            server_names: vec!["_".to_string()],
            listen: 80,
            default_server: false,
            sites_available_dir: "/etc/nginx/sites-available".to_string(),
            sites_enabled_dir: "/etc/nginx/sites-enabled".to_string(),
            client_max_body_size: "10m".to_string(),
            read_timeout_secs: 90,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateSettings {
    pub domains: Vec<String>,
    pub email: String,
    #[serde(default = "default_webroot")]
    pub webroot: String,
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u32,
    #[serde(default = "default_true")]
    pub enable_renewal_timer: bool,
}

impl CertificateSettings {
    pub fn primary_domain(&self) -> &str {
        self.domains.first().map(String::as_str).unwrap_or_default()
    }

    pub fn fullchain_path(&self) -> String {
        format!("/etc/letsencrypt/live/{}/fullchain.pem", self.primary_domain())
    }

    pub fn privkey_path(&self) -> String {
        format!("/etc/letsencrypt/live/{}/privkey.pem", self.primary_domain())
    }

    pub fn renew_threshold_secs(&self) -> u64 {
        u64::from(self.renew_before_days) * 86_400
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub default_secs: u64,
    pub check_secs: u64,
    pub install_secs: u64,
    pub build_secs: u64,
    pub certificate_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            default_secs: 120,
            check_secs: 30,
            install_secs: 900,
            build_secs: 1200,
            certificate_secs: 300,
        }
    }
}

/// Upper bound for a step budget: one day.
pub const MAX_STEP_TIMEOUT_SECS: u64 = 86_400;
/// Upper bound for check budgets, backoffs and polling intervals.
pub const MAX_INTERVAL_SECS: u64 = 3_600;
pub const MAX_HEALTH_ATTEMPTS: u64 = 1_000;

fn default_revision() -> String {
    "main".to_string()
}

fn default_service_user() -> String {
    "app".to_string()
}

fn default_app_port() -> u16 {
    3000
}

fn default_lock_path() -> String {
    "/var/lock/deckhand.lock".to_string()
}

fn default_retry_backoff_secs() -> u64 {
    5
}

fn default_webroot() -> String {
    "/var/www/letsencrypt".to_string()
}

fn default_renew_before_days() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

impl DeploySettings {
    pub fn from_json(content: &str) -> Result<Self, SettingsError> {
        let settings: DeploySettings = serde_json::from_str(content)
            .map_err(|err| SettingsError(format!("failed to parse settings: {err}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn process_name(&self) -> String {
        self.process
            .name
            .clone()
            .unwrap_or_else(|| self.app_name.clone())
    }

    pub fn log_dir(&self) -> String {
        self.process
            .log_dir
            .clone()
            .unwrap_or_else(|| format!("/var/log/{}", self.app_name))
    }

    pub fn app_path(&self, relative: &str) -> String {
        format!("{}/{}", self.app_dir.trim_end_matches('/'), relative)
    }

    /// Service-account-owned bookkeeping inside the app directory.
    pub fn state_dir(&self) -> String {
        self.app_path(".deckhand")
    }

    /// Root-owned bookkeeping for proxy and certificate state.
    pub fn system_state_dir(&self) -> String {
        format!("/var/lib/deckhand/{}", self.app_name)
    }

    pub fn descriptor_path(&self) -> String {
        self.app_path("ecosystem.config.js")
    }

    pub fn site_path(&self) -> String {
        format!(
            "{}/{}.conf",
            self.proxy.sites_available_dir.trim_end_matches('/'),
            self.app_name
        )
    }

    pub fn site_enabled_path(&self) -> String {
        format!(
            "{}/{}.conf",
            self.proxy.sites_enabled_dir.trim_end_matches('/'),
            self.app_name
        )
    }

    pub fn tls_site_path(&self) -> String {
        format!(
            "{}/{}-tls.conf",
            self.proxy.sites_available_dir.trim_end_matches('/'),
            self.app_name
        )
    }

    pub fn tls_site_enabled_path(&self) -> String {
        format!(
            "{}/{}-tls.conf",
            self.proxy.sites_enabled_dir.trim_end_matches('/'),
            self.app_name
        )
    }

    pub fn health_url(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.port, self.process.health_path)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        validate_name("app_name", &self.app_name)?;
        validate_absolute_path("app_dir", &self.app_dir)?;
        validate_repo_url(&self.repo_url)?;
        validate_revision(&self.revision)?;
        validate_service_user(&self.service_user)?;
        if self.port == 0 {
            return Err(SettingsError("port must be non-zero".to_string()));
        }
        validate_absolute_path("lock_path", &self.lock_path)?;

        for (label, value) in [
            ("install.manifest_file", &self.install.manifest_file),
            ("install.lock_file", &self.install.lock_file),
            ("install.dependency_dir", &self.install.dependency_dir),
            ("build.output_dir", &self.build.output_dir),
            ("build.marker", &self.build.marker),
        ] {
            validate_relative_path(label, value)?;
        }
        if !self
            .build
            .marker
            .starts_with(&format!("{}/", self.build.output_dir.trim_end_matches('/')))
            && self.build.clean
        {
            return Err(SettingsError(
                "build.marker must live inside build.output_dir when build.clean is set"
                    .to_string(),
            ));
        }
        if self.install.command.trim().is_empty() || self.build.command.trim().is_empty() {
            return Err(SettingsError(
                "install and build commands must not be empty".to_string(),
            ));
        }

        if let Some(name) = &self.process.name {
            validate_name("process.name", name)?;
        }
        if let Some(dir) = &self.process.log_dir {
            validate_absolute_path("process.log_dir", dir)?;
        }
        if !self.process.health_path.starts_with('/')
            || self
                .process
                .health_path
                .chars()
                .any(|ch| ch.is_whitespace() || matches!(ch, '\'' | '"' | '`' | '$' | ';'))
        {
            return Err(SettingsError(
                "process.health_path must be an absolute URL path".to_string(),
            ));
        }
        if self.process.health_attempts == 0 {
            return Err(SettingsError(
                "process.health_attempts must be at least 1".to_string(),
            ));
        }
        for key in self.process.env.keys() {
            if key.is_empty()
                || !key
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
            {
                return Err(SettingsError(format!(
                    "process.env key {key:?} is not a valid variable name"
                )));
            }
        }

        if self.proxy.server_names.is_empty() {
            return Err(SettingsError(
                "proxy.server_names must not be empty".to_string(),
            ));
        }
        for name in &self.proxy.server_names {
            validate_server_name(name)?;
        }
        validate_absolute_path("proxy.sites_available_dir", &self.proxy.sites_available_dir)?;
        validate_absolute_path("proxy.sites_enabled_dir", &self.proxy.sites_enabled_dir)?;

        if let Some(cert) = &self.certificate {
            if cert.domains.is_empty() {
                return Err(SettingsError(
                    "certificate.domains must not be empty".to_string(),
                ));
            }
            for domain in &cert.domains {
                validate_domain(domain)?;
            }
            validate_email(&cert.email)?;
            validate_webroot(&cert.webroot)?;
            if cert.renew_before_days == 0 {
                return Err(SettingsError(
                    "certificate.renew_before_days must be at least 1".to_string(),
                ));
            }
        }

        let t = &self.timeouts;
        if [
            t.default_secs,
            t.check_secs,
            t.install_secs,
            t.build_secs,
            t.certificate_secs,
        ]
        .contains(&0)
        {
            return Err(SettingsError("timeouts must be non-zero".to_string()));
        }
        for (label, value, max) in [
            ("timeouts.default_secs", t.default_secs, MAX_STEP_TIMEOUT_SECS),
            ("timeouts.install_secs", t.install_secs, MAX_STEP_TIMEOUT_SECS),
            ("timeouts.build_secs", t.build_secs, MAX_STEP_TIMEOUT_SECS),
            ("timeouts.certificate_secs", t.certificate_secs, MAX_STEP_TIMEOUT_SECS),
            ("timeouts.check_secs", t.check_secs, MAX_INTERVAL_SECS),
            ("retry_backoff_secs", self.retry_backoff_secs, MAX_INTERVAL_SECS),
            ("process.health_interval_secs", self.process.health_interval_secs, MAX_INTERVAL_SECS),
            ("proxy.read_timeout_secs", self.proxy.read_timeout_secs, MAX_INTERVAL_SECS),
            ("process.health_attempts", u64::from(self.process.health_attempts), MAX_HEALTH_ATTEMPTS),
        ] {
            if value > max {
                return Err(SettingsError(format!("{label} must be at most {max}")));
            }
        }
        Ok(())
    }
}

fn validate_name(label: &str, name: &str) -> Result<(), SettingsError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(SettingsError(format!("{label} is empty")));
    }
    if trimmed != name || trimmed.starts_with('.') || trimmed.starts_with('-') {
        return Err(SettingsError(format!("{label} contains invalid characters")));
    }
    if !trimmed
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_'))
    {
        return Err(SettingsError(format!("{label} contains invalid characters")));
    }
    Ok(())
}

fn has_shell_metacharacters(value: &str) -> bool {
    value.chars().any(|ch| {
        ch.is_whitespace()
            || ch.is_control()
            || matches!(
                ch,
                ';' | '&' | '|' | '`' | '$' | '>' | '<' | '"' | '\'' | '\\' | '*' | '?'
            )
    })
}

fn validate_absolute_path(label: &str, path: &str) -> Result<(), SettingsError> {
    if !path.starts_with('/') {
        return Err(SettingsError(format!("{label} must be an absolute path")));
    }
    if path.trim_end_matches('/').is_empty() {
        return Err(SettingsError(format!("{label} cannot be root")));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(SettingsError(format!("{label} cannot contain '..'")));
    }
    if has_shell_metacharacters(path) {
        return Err(SettingsError(format!("{label} contains invalid characters")));
    }
    Ok(())
}

fn validate_relative_path(label: &str, path: &str) -> Result<(), SettingsError> {
    if path.is_empty() || path.starts_with('/') {
        return Err(SettingsError(format!("{label} must be a relative path")));
    }
    if path.split('/').any(|segment| segment == ".." || segment.is_empty()) {
        return Err(SettingsError(format!("{label} is not a clean relative path")));
    }
    if has_shell_metacharacters(path) {
        return Err(SettingsError(format!("{label} contains invalid characters")));
    }
    Ok(())
}

fn validate_repo_url(url: &str) -> Result<(), SettingsError> {
    if url.trim().is_empty() {
        return Err(SettingsError("repo_url is empty".to_string()));
    }
    if has_shell_metacharacters(url) {
        return Err(SettingsError("repo_url contains invalid characters".to_string()));
    }
    if url.contains('@') && url.starts_with("http") {
        return Err(SettingsError(
            "repo_url must not embed credentials".to_string(),
        ));
    }
    Ok(())
}

fn validate_revision(revision: &str) -> Result<(), SettingsError> {
    if revision.is_empty() || revision.starts_with('-') {
        return Err(SettingsError("revision is invalid".to_string()));
    }
    if !revision
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '/'))
    {
        return Err(SettingsError("revision contains invalid characters".to_string()));
    }
    Ok(())
}

fn validate_service_user(user: &str) -> Result<(), SettingsError> {
    validate_name("service_user", user)?;
    if user == "root" {
        return Err(SettingsError(
            "service_user must be an unprivileged account, not root".to_string(),
        ));
    }
    Ok(())
}

fn validate_server_name(server_name: &str) -> Result<(), SettingsError> {
    let trimmed = server_name.trim();
    if trimmed.is_empty() {
        return Err(SettingsError("nginx server_name is empty".to_string()));
    }
    if trimmed
        .chars()
        .any(|ch| ch.is_whitespace() || matches!(ch, ';' | '{' | '}' | '\'' | '"'))
    {
        return Err(SettingsError(
            "nginx server_name contains invalid characters".to_string(),
        ));
    }
    Ok(())
}

fn validate_domain(domain: &str) -> Result<(), SettingsError> {
    let trimmed = domain.trim();
    if trimmed.is_empty() {
        return Err(SettingsError("certificate domain is empty".to_string()));
    }
    if trimmed != domain {
        return Err(SettingsError(
            "certificate domain contains whitespace".to_string(),
        ));
    }
    if trimmed.len() > 253 {
        return Err(SettingsError("certificate domain is too long".to_string()));
    }
    if trimmed.starts_with('.') || trimmed.ends_with('.') {
        return Err(SettingsError(
            "certificate domain cannot start or end with '.'".to_string(),
        ));
    }
    if trimmed.contains('*') {
        return Err(SettingsError(
            "certificate domain cannot contain '*'".to_string(),
        ));
    }
    if !trimmed.contains('.') {
        return Err(SettingsError(
            "certificate domain must contain at least one '.'".to_string(),
        ));
    }

    for label in trimmed.split('.') {
        if label.is_empty() {
            return Err(SettingsError(
                "certificate domain contains empty label".to_string(),
            ));
        }
        if label.len() > 63 {
            return Err(SettingsError(
                "certificate domain label is too long".to_string(),
            ));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(SettingsError(
                "certificate domain label cannot start or end with '-'".to_string(),
            ));
        }
        if !label.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-') {
            return Err(SettingsError(
                "certificate domain label contains invalid characters".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_email(email: &str) -> Result<(), SettingsError> {
    let trimmed = email.trim();
    if trimmed.is_empty() {
        return Err(SettingsError("certificate email is empty".to_string()));
    }
    if trimmed != email {
        return Err(SettingsError(
            "certificate email contains whitespace".to_string(),
        ));
    }

    let mut parts = trimmed.split('@');
    let local = parts.next().unwrap_or("");
    let domain = parts.next().unwrap_or("");
    if parts.next().is_some() {
        return Err(SettingsError(
            "certificate email must contain a single '@'".to_string(),
        ));
    }
    if local.is_empty() || domain.is_empty() {
        return Err(SettingsError(
            "certificate email must include local and domain".to_string(),
        ));
    }
    if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return Err(SettingsError(
            "certificate email local part is invalid".to_string(),
        ));
    }
    if !local
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '%' | '+' | '-'))
    {
        return Err(SettingsError(
            "certificate email local part contains invalid characters".to_string(),
        ));
    }

    validate_domain(domain)
}

fn validate_webroot(webroot: &str) -> Result<(), SettingsError> {
    validate_absolute_path("certificate.webroot", webroot)
}
