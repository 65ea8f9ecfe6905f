use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

use crate::config::devcontainer::{DevContainerConfig, LifecycleCommand};
use crate::config::mount::MountSpec;
use crate::config::ports::{ForwardPort, PortKey};
use crate::core::{ForgeError, ForgeResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Top-level descriptor key the issue belongs to, e.g. `portsAttributes.5001`.
    pub path: String,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validation result with detailed errors
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationIssue {
            path: path.into(),
            message: message.into(),
        });
    }

    pub fn add_warning(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ValidationIssue {
            path: path.into(),
            message: message.into(),
        });
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Fail when there are errors, or with `strict` when there are warnings too.
    pub fn into_result(self, strict: bool) -> ForgeResult<Self> {
        if !self.is_valid() || (strict && !self.warnings.is_empty()) {
            return Err(ForgeError::Validation(self));
        }
        Ok(self)
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for issue in &self.errors {
            writeln!(f, "  error: {}", issue)?;
        }
        for issue in &self.warnings {
            writeln!(f, "  warning: {}", issue)?;
        }
        Ok(())
    }
}

/// Check the descriptor invariants. Every problem is collected; nothing short-circuits.
pub fn validate_devcontainer_config(config: &DevContainerConfig) -> ValidationReport {
    let mut report = ValidationReport::new();

    validate_base_environment(config, &mut report);
    validate_workspace(config, &mut report);
    validate_ports(config, &mut report);
    validate_commands(config, &mut report);
    validate_features(config, &mut report);
    validate_extensions(config, &mut report);

    debug!(
        errors = report.errors.len(),
        warnings = report.warnings.len(),
        "Validated devcontainer descriptor"
    );
    report
}

fn validate_base_environment(config: &DevContainerConfig, report: &mut ValidationReport) {
    if config.name.as_deref().map_or(true, |n| n.trim().is_empty()) {
        report.add_warning("name", "no name set, using the default label");
    }

    if config.base_environment().is_none() {
        report.add_error(
            "image",
            "descriptor must specify either an image or a Dockerfile",
        );
    }

    if let Some(image) = &config.image {
        if image.trim().is_empty() {
            report.add_error("image", "image reference is empty");
        } else if image.chars().any(char::is_whitespace) {
            report.add_error("image", format!("image reference '{}' contains whitespace", image));
        }
    }
}

fn validate_workspace(config: &DevContainerConfig, report: &mut ValidationReport) {
    if let Some(folder) = &config.workspace_folder {
        // Substitution runs later, so a leading variable may still expand to an absolute path.
        if !folder.starts_with('/') && !folder.starts_with("${") {
            report.add_error(
                "workspaceFolder",
                format!("'{}' is not an absolute container path", folder),
            );
        }
    }

    let Some(raw) = &config.workspace_mount else {
        return;
    };

    match raw.parse::<MountSpec>() {
        Ok(mount) => match &config.workspace_folder {
            None => report.add_error(
                "workspaceMount",
                "workspaceFolder is required when workspaceMount is set",
            ),
            Some(folder) if *folder != mount.target => report.add_warning(
                "workspaceMount",
                format!(
                    "mount target '{}' differs from workspaceFolder '{}'",
                    mount.target, folder
                ),
            ),
            Some(_) => {}
        },
        Err(e) => report.add_error("workspaceMount", e),
    }
}

fn validate_ports(config: &DevContainerConfig, report: &mut ValidationReport) {
    let mut seen = HashSet::new();
    for port in &config.forward_ports {
        if port.port() == 0 {
            report.add_error("forwardPorts", format!("'{}' is not a valid port", port));
        }
        if let ForwardPort::Service { host, .. } = port {
            if host.is_empty() {
                report.add_error("forwardPorts", format!("'{}' has an empty host", port));
            }
        }
        if !seen.insert(port) {
            report.add_error("forwardPorts", format!("port {} is listed more than once", port));
        }
    }

    for raw_key in config.ports_attributes.keys() {
        let path = format!("portsAttributes.{}", raw_key);
        let key = match raw_key.parse::<PortKey>() {
            Ok(key) => key,
            Err(e) => {
                report.add_error(path, e);
                continue;
            }
        };

        if !config.forward_ports.iter().any(|port| key.matches(port)) {
            report.add_error(
                path,
                format!("'{}' does not match any entry in forwardPorts", raw_key),
            );
        }
    }
}

fn validate_commands(config: &DevContainerConfig, report: &mut ValidationReport) {
    let hooks = [
        ("postCreateCommand", &config.post_create_command),
        ("postStartCommand", &config.post_start_command),
    ];

    for (name, command) in hooks {
        if let Some(command) = command {
            if command.is_empty() {
                report.add_error(name, "command is present but empty");
            }
            if let LifecycleCommand::Parallel(map) = command {
                if map.values().any(|c| matches!(c, LifecycleCommand::Parallel(_))) {
                    report.add_error(name, "parallel commands cannot be nested");
                }
            }
        }
    }
}

fn validate_features(config: &DevContainerConfig, report: &mut ValidationReport) {
    for (id, options) in &config.features {
        if id.trim().is_empty() {
            report.add_error("features", "feature reference is empty");
            continue;
        }
        match options {
            Value::Object(_) | Value::String(_) => {}
            other => report.add_error(
                format!("features.{}", id),
                format!("configuration must be an object or a version string, got {}", other),
            ),
        }
    }
}

fn validate_extensions(config: &DevContainerConfig, report: &mut ValidationReport) {
    let mut seen = HashSet::new();
    for ext in config.extensions() {
        let id = ext.strip_prefix('-').unwrap_or(ext);
        let well_formed = id
            .split_once('.')
            .map_or(false, |(publisher, name)| !publisher.is_empty() && !name.is_empty());
        if !well_formed {
            report.add_warning(
                "customizations.vscode.extensions",
                format!("'{}' is not a publisher.name identifier", ext),
            );
        }
        if !seen.insert(ext.to_ascii_lowercase()) {
            report.add_warning(
                "customizations.vscode.extensions",
                format!("'{}' is listed more than once", ext),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::ConfigParserOptions;
    use serde_json::json;

    fn parse(content: &str) -> DevContainerConfig {
        DevContainerConfig::from_str_with(content, ConfigParserOptions::default()).unwrap()
    }

    fn error_paths(report: &ValidationReport) -> Vec<&str> {
        report.errors.iter().map(|e| e.path.as_str()).collect()
    }

    #[test]
    fn test_valid_flask_descriptor() {
        let config = parse(
            r#"{"name": "mockhouse", "image": "python:3.11",
                "forwardPorts": [5000],
                "portsAttributes": {"5000": {"label": "Flask App", "onAutoForward": "openBrowser"}},
                "postCreateCommand": "make install",
                "postStartCommand": "mockhouse_flask --host=0.0.0.0 --port=5000 --debug"}"#,
        );
        let report = validate_devcontainer_config(&config);
        assert!(report.is_valid(), "unexpected errors: {}", report);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_mismatched_port_attribute_key_is_rejected() {
        let config = parse(
            r#"{"name": "m", "image": "python:3.11", "forwardPorts": [5000],
                "portsAttributes": {"5001": {"label": "Flask App", "onAutoForward": "openBrowser"}}}"#,
        );
        let report = validate_devcontainer_config(&config);
        assert_eq!(error_paths(&report), vec!["portsAttributes.5001"]);
        assert!(matches!(
            report.into_result(false),
            Err(ForgeError::Validation(_))
        ));
    }

    #[test]
    fn test_missing_base_environment_is_rejected() {
        let report = validate_devcontainer_config(&parse(r#"{"name": "m", "forwardPorts": [5000]}"#));
        assert_eq!(error_paths(&report), vec!["image"]);
    }

    #[test]
    fn test_duplicate_and_zero_ports() {
        let report = validate_devcontainer_config(&parse(
            r#"{"name": "m", "image": "a", "forwardPorts": [5000, 5000, 0, ":80"]}"#,
        ));
        assert_eq!(
            error_paths(&report),
            vec!["forwardPorts", "forwardPorts", "forwardPorts"]
        );
    }

    #[test]
    fn test_empty_commands_are_rejected() {
        let report = validate_devcontainer_config(&parse(
            r#"{"name": "m", "image": "a", "postCreateCommand": "", "postStartCommand": []}"#,
        ));
        assert_eq!(error_paths(&report), vec!["postCreateCommand", "postStartCommand"]);
    }

    #[test]
    fn test_workspace_mount_rules() {
        let report = validate_devcontainer_config(&parse(
            r#"{"name": "m", "image": "a", "workspaceMount": "source=/h,target=/w,type=bind"}"#,
        ));
        assert_eq!(error_paths(&report), vec!["workspaceMount"]);

        let report = validate_devcontainer_config(&parse(
            r#"{"name": "m", "image": "a", "workspaceFolder": "/x",
                "workspaceMount": "source=/h,target=/w,type=bind"}"#,
        ));
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 1);
        assert!(report.clone().into_result(true).is_err());
        assert!(report.into_result(false).is_ok());

        let report = validate_devcontainer_config(&parse(
            r#"{"name": "m", "image": "a", "workspaceFolder": "relative"}"#,
        ));
        assert_eq!(error_paths(&report), vec!["workspaceFolder"]);
    }

    #[test]
    fn test_port_range_keys() {
        let ok = validate_devcontainer_config(&parse(
            r#"{"name": "m", "image": "a", "forwardPorts": [5003],
                "portsAttributes": {"5000-5010": {"onAutoForward": "silent"}}}"#,
        ));
        assert!(ok.is_valid());

        let bad = validate_devcontainer_config(&parse(
            r#"{"name": "m", "image": "a", "forwardPorts": [8080],
                "portsAttributes": {"5000-5010": {}, "web": {}}}"#,
        ));
        assert_eq!(
            error_paths(&bad),
            vec!["portsAttributes.5000-5010", "portsAttributes.web"]
        );
    }

    #[test]
    fn test_hyphenated_service_key() {
        let report = validate_devcontainer_config(&parse(
            r#"{"name": "m", "image": "a", "forwardPorts": ["my-db:5432"],
                "portsAttributes": {"my-db:5432": {"label": "Database"}}}"#,
        ));
        assert!(report.is_valid(), "{}", report);
    }

    #[test]
    fn test_extension_warnings() {
        let report = validate_devcontainer_config(&parse(
            r#"{"name": "m", "image": "a", "customizations": {"vscode": {"extensions":
                ["ms-python.python", "ms-python.python", "-ms-python.flake8", "pylance"]}}}"#,
        ));
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 2);
    }

    #[test]
    fn test_feature_configuration_types() {
        let mut config = parse(r#"{"name": "m", "image": "a"}"#);
        config
            .features
            .insert("ghcr.io/devcontainers/features/git:1".into(), json!(true));
        config.features.insert(" ".into(), json!({}));

        let report = validate_devcontainer_config(&config);
        assert_eq!(
            error_paths(&report),
            vec!["features.ghcr.io/devcontainers/features/git:1", "features"]
        );
    }
}
