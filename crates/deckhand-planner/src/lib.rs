pub mod commands;
mod plans;

use deckhand_core_domain::{DeploySettings, Plan, PlanValidationError, SettingsError};
use serde::Serialize;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanKind {
    SyncAndInstall,
    Build,
    ConfigureProcessManager,
    ConfigureReverseProxy,
    IssueCertificate,
    All,
}

impl PlanKind {
    pub const ALL: [PlanKind; 6] = [
        PlanKind::SyncAndInstall,
        PlanKind::Build,
        PlanKind::ConfigureProcessManager,
        PlanKind::ConfigureReverseProxy,
        PlanKind::IssueCertificate,
        PlanKind::All,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PlanKind::SyncAndInstall => "sync-and-install",
            PlanKind::Build => "build",
            PlanKind::ConfigureProcessManager => "configure-process-manager",
            PlanKind::ConfigureReverseProxy => "configure-reverse-proxy",
            PlanKind::IssueCertificate => "issue-certificate",
            PlanKind::All => "all",
        }
    }
}

impl std::fmt::Display for PlanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanKind {
    type Err = PlanBuildError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        PlanKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value.trim())
            .ok_or_else(|| PlanBuildError::UnknownPlan(value.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum PlanBuildError {
    #[error("unknown plan {0:?} (expected one of sync-and-install, build, configure-process-manager, configure-reverse-proxy, issue-certificate, all)")]
    UnknownPlan(String),
    #[error("plan issue-certificate needs a certificate block in the settings")]
    MissingCertificate,
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("invalid plan: {0}")]
    InvalidPlan(#[from] PlanValidationError),
}

/// Builds the named plan from deployment settings. The result is validated.
pub fn build_plan(kind: PlanKind, settings: &DeploySettings) -> Result<Plan, PlanBuildError> {
    settings.validate()?;

    let plan = match kind {
        PlanKind::SyncAndInstall => plans::sync_and_install(settings),
        PlanKind::Build => plans::build(settings),
        PlanKind::ConfigureProcessManager => plans::configure_process_manager(settings),
        PlanKind::ConfigureReverseProxy => plans::configure_reverse_proxy(settings),
        PlanKind::IssueCertificate => {
            let cert = settings
                .certificate
                .as_ref()
                .ok_or(PlanBuildError::MissingCertificate)?;
            plans::issue_certificate(settings, cert)
        }
        PlanKind::All => {
            let mut parts = vec![
                plans::sync_and_install(settings),
                plans::build(settings),
                plans::configure_process_manager(settings),
                plans::configure_reverse_proxy(settings),
            ];
            if let Some(cert) = &settings.certificate {
                parts.push(plans::issue_certificate(settings, cert));
            }
            Plan::concat("all", parts)
        }
    };

    plan.validate()?;
    tracing::debug!(plan = %plan.name, steps = plan.steps.len(), "built plan");
    Ok(plan)
}
