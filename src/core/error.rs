use thiserror::Error;

use crate::config::validation::ValidationReport;
use crate::environments::lifecycle::LifecycleStep;

#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Descriptor parse error: {0}")]
    ParseError(String),

    #[error("Descriptor schema violation:\n{}", .0.join("\n"))]
    SchemaError(Vec<String>),

    #[error("Descriptor validation failed:\n{0}")]
    Validation(ValidationReport),

    #[error("No devcontainer descriptor found under {0}")]
    DescriptorNotFound(String),

    #[error("Provisioning failed during {step}: {message}")]
    Provisioning { step: LifecycleStep, message: String },

    #[error("postCreateCommand exited with status {exit_code}; environment left partially provisioned")]
    PostCreateFailed { exit_code: i64 },

    #[error("Feature registry error: {0}")]
    Registry(String),

    #[error("Port forwarding error: {0}")]
    PortForward(String),

    #[error("Environment error: {0}")]
    EnvironmentError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl ForgeError {
    pub fn provisioning(step: LifecycleStep, message: impl Into<String>) -> Self {
        ForgeError::Provisioning {
            step,
            message: message.into(),
        }
    }
}

pub type ForgeResult<T> = Result<T, ForgeError>;
