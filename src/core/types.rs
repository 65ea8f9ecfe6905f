use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EnvironmentStatus {
    Created,
    PartiallyProvisioned,
    Running,
    Stopped,
    Failed,
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentStatus::Created => write!(f, "Created"),
            EnvironmentStatus::PartiallyProvisioned => write!(f, "Partially provisioned"),
            EnvironmentStatus::Running => write!(f, "Running"),
            EnvironmentStatus::Stopped => write!(f, "Stopped"),
            EnvironmentStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Which provisioning backend drives the lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    #[default]
    Docker,
    DryRun,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Docker => write!(f, "docker"),
            Backend::DryRun => write!(f, "dry-run"),
        }
    }
}
