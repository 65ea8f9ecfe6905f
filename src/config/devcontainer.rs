use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs;

use crate::config::mount::MountSpec;
use crate::config::parser::{ConfigFormat, ConfigParser, ConfigParserOptions};
use crate::config::ports::{ForwardPort, PortAttributes, PortKey};
use crate::core::{ForgeError, ForgeResult};

const DESCRIPTOR_SCHEMA: &str = include_str!("schema.json");

pub const DEFAULT_NAME: &str = "dev-container";

/// A `devcontainer.json` descriptor.
///
/// The descriptor is loaded once and never mutated. Keys outside this model land in
/// `extra` so that re-serializing keeps them.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct DevContainerConfig {
    #[serde(rename = "name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(rename = "image", skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(rename = "dockerFile", skip_serializing_if = "Option::is_none")]
    pub docker_file: Option<String>,

    #[serde(rename = "build", skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildConfig>,

    #[serde(rename = "workspaceFolder", skip_serializing_if = "Option::is_none")]
    pub workspace_folder: Option<String>,

    #[serde(rename = "workspaceMount", skip_serializing_if = "Option::is_none")]
    pub workspace_mount: Option<String>,

    #[serde(rename = "customizations", skip_serializing_if = "Option::is_none")]
    pub customizations: Option<CustomizationsConfig>,

    #[serde(rename = "postCreateCommand", skip_serializing_if = "Option::is_none")]
    pub post_create_command: Option<LifecycleCommand>,

    #[serde(rename = "postStartCommand", skip_serializing_if = "Option::is_none")]
    pub post_start_command: Option<LifecycleCommand>,

    #[serde(rename = "forwardPorts", default, skip_serializing_if = "Vec::is_empty")]
    pub forward_ports: Vec<ForwardPort>,

    #[serde(rename = "portsAttributes", default, skip_serializing_if = "IndexMap::is_empty")]
    pub ports_attributes: IndexMap<String, PortAttributes>,

    #[serde(rename = "features", default, skip_serializing_if = "IndexMap::is_empty")]
    pub features: IndexMap<String, Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct BuildConfig {
    #[serde(rename = "context", skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    #[serde(rename = "dockerfile", skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,

    #[serde(rename = "args", default, skip_serializing_if = "IndexMap::is_empty")]
    pub args: IndexMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct CustomizationsConfig {
    #[serde(rename = "vscode", skip_serializing_if = "Option::is_none")]
    pub vscode: Option<VSCodeConfig>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct VSCodeConfig {
    #[serde(rename = "extensions", default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,

    /// Duplicate keys in the source document collapse to the last value.
    #[serde(rename = "settings", default, skip_serializing_if = "Map::is_empty")]
    pub settings: Map<String, Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A lifecycle hook such as `postCreateCommand`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum LifecycleCommand {
    /// Run through `/bin/sh -c`.
    Shell(String),
    /// Program and arguments, no shell.
    Exec(Vec<String>),
    /// Named commands run concurrently.
    Parallel(IndexMap<String, LifecycleCommand>),
}

impl LifecycleCommand {
    pub fn is_empty(&self) -> bool {
        match self {
            LifecycleCommand::Shell(cmd) => cmd.trim().is_empty(),
            LifecycleCommand::Exec(args) => args.first().map_or(true, |p| p.trim().is_empty()),
            LifecycleCommand::Parallel(map) => {
                map.is_empty() || map.values().any(LifecycleCommand::is_empty)
            }
        }
    }

    /// The argv to hand to the container runtime. Parallel commands have none.
    pub fn argv(&self) -> Option<Vec<String>> {
        match self {
            LifecycleCommand::Shell(cmd) => Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                cmd.clone(),
            ]),
            LifecycleCommand::Exec(args) => Some(args.clone()),
            LifecycleCommand::Parallel(_) => None,
        }
    }

    pub fn map_strings(&self, f: &impl Fn(&str) -> String) -> Self {
        match self {
            LifecycleCommand::Shell(cmd) => LifecycleCommand::Shell(f(cmd)),
            LifecycleCommand::Exec(args) => {
                LifecycleCommand::Exec(args.iter().map(|a| f(a)).collect())
            }
            LifecycleCommand::Parallel(map) => LifecycleCommand::Parallel(
                map.iter()
                    .map(|(name, cmd)| (name.clone(), cmd.map_strings(f)))
                    .collect(),
            ),
        }
    }
}

impl std::fmt::Display for LifecycleCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleCommand::Shell(cmd) => write!(f, "{}", cmd),
            LifecycleCommand::Exec(args) => write!(f, "{}", args.join(" ")),
            LifecycleCommand::Parallel(map) => {
                let parts: Vec<String> = map
                    .iter()
                    .map(|(name, cmd)| format!("{}: {}", name, cmd))
                    .collect();
                write!(f, "[{}]", parts.join(" | "))
            }
        }
    }
}

/// Where the container's base environment comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    Image(String),
    Dockerfile {
        context: String,
        dockerfile: String,
        args: IndexMap<String, String>,
    },
}

impl DevContainerConfig {
    pub async fn from_file(path: &Path) -> ForgeResult<Self> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            ForgeError::ConfigError(format!(
                "failed to read devcontainer descriptor {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_str_with(&content, ConfigParserOptions::for_path(path))
    }

    pub fn from_str_with(content: &str, options: ConfigParserOptions) -> ForgeResult<Self> {
        let value: Value = ConfigParser::parse_str(content, options)?;
        Self::from_value(value)
    }

    /// The embedded descriptor JSON schema.
    pub fn schema() -> ForgeResult<Value> {
        Ok(serde_json::from_str(DESCRIPTOR_SCHEMA)?)
    }

    /// Structural check against the embedded schema, then typed deserialization.
    pub fn from_value(value: Value) -> ForgeResult<Self> {
        ConfigParser::validate_value(&value, &Self::schema()?)?;

        serde_json::from_value(value)
            .map_err(|e| ForgeError::ParseError(format!("invalid descriptor: {}", e)))
    }

    /// Apply a JSON merge patch on top of this descriptor and re-parse the result.
    pub fn with_overlay(&self, overlay: &Value) -> ForgeResult<Self> {
        let base = serde_json::to_value(self)?;
        Self::from_value(ConfigParser::merge_values(base, overlay))
    }

    /// Schema check for descriptors built in code rather than parsed.
    pub fn check_schema(&self) -> ForgeResult<()> {
        ConfigParser::validate_config(self, &Self::schema()?)
    }

    pub fn to_json_pretty(&self) -> ForgeResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_format(&self, format: ConfigFormat) -> ForgeResult<String> {
        ConfigParser::to_string(self, format)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_NAME)
    }

    pub fn base_environment(&self) -> Option<ImageSource> {
        if let Some(image) = &self.image {
            return Some(ImageSource::Image(image.clone()));
        }

        let build = self.build.clone().unwrap_or_default();
        let dockerfile = self.docker_file.clone().or(build.dockerfile)?;
        Some(ImageSource::Dockerfile {
            context: build.context.unwrap_or_else(|| ".".to_string()),
            dockerfile,
            args: build.args,
        })
    }

    pub fn detect_environment_type(&self) -> String {
        match self.base_environment() {
            Some(ImageSource::Image(image)) => format!("docker-image:{}", image),
            Some(ImageSource::Dockerfile { .. }) => "dockerfile".to_string(),
            None => "custom".to_string(),
        }
    }

    pub fn vscode(&self) -> Option<&VSCodeConfig> {
        self.customizations.as_ref().and_then(|c| c.vscode.as_ref())
    }

    pub fn extensions(&self) -> &[String] {
        self.vscode()
            .map(|v| v.extensions.as_slice())
            .unwrap_or(&[])
    }

    /// Extension identifiers without duplicates, first occurrence wins.
    pub fn unique_extensions(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.extensions()
            .iter()
            .filter(|ext| seen.insert(ext.to_ascii_lowercase()))
            .cloned()
            .collect()
    }

    pub fn effective_workspace_folder(&self, local_workspace: &Path) -> String {
        match &self.workspace_folder {
            Some(folder) => folder.clone(),
            None => format!("/workspaces/{}", basename(local_workspace)),
        }
    }

    pub fn effective_workspace_mount(&self, local_workspace: &Path) -> ForgeResult<MountSpec> {
        match &self.workspace_mount {
            Some(raw) => raw
                .parse()
                .map_err(|e| ForgeError::ConfigError(format!("workspaceMount: {}", e))),
            None => Ok(MountSpec::bind(
                local_workspace.display().to_string(),
                self.effective_workspace_folder(local_workspace),
            )),
        }
    }

    /// Attributes from the most specific `portsAttributes` key matching `port`.
    pub fn attributes_for(&self, port: &ForwardPort) -> Option<&PortAttributes> {
        self.ports_attributes
            .iter()
            .filter_map(|(key, attrs)| {
                let key: PortKey = key.parse().ok()?;
                key.matches(port).then(|| (key.specificity(), attrs))
            })
            .max_by_key(|(specificity, _)| *specificity)
            .map(|(_, attrs)| attrs)
    }

    /// SHA-256 over the canonical JSON form.
    pub fn fingerprint(&self) -> ForgeResult<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    }
}

pub(crate) fn basename(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("workspace")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ports::OnAutoForward;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;
    use tokio::io::AsyncWriteExt;

    const MOCKHOUSE: &str = r#"{
        // Development environment for mockhouse
        "name": "mockhouse",
        "image": "mcr.microsoft.com/devcontainers/python:1-3.11-bullseye",
        "workspaceFolder": "/workspaces/mockhouse",
        "workspaceMount": "source=${localWorkspaceFolder},target=/workspaces/mockhouse,type=bind,consistency=cached",
        "customizations": {
            "vscode": {
                "extensions": ["ms-python.python", "ms-python.black-formatter"],
                "settings": {"editor.formatOnSave": true}
            }
        },
        "postCreateCommand": "make install",
        "postStartCommand": "mockhouse_flask --host=0.0.0.0 --port=5000 --debug",
        "forwardPorts": [5000],
        "portsAttributes": {
            "5000": {"label": "Flask App", "onAutoForward": "openBrowser"}
        },
        "features": {
            "ghcr.io/devcontainers/features/common-utils:2": {"installZsh": true},
            "ghcr.io/devcontainers/features/git:1": {},
        },
    }"#;

    fn parse(content: &str) -> DevContainerConfig {
        DevContainerConfig::from_str_with(content, ConfigParserOptions::default()).unwrap()
    }

    #[tokio::test]
    async fn test_parse_devcontainer_config() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut temp_file_async = tokio::fs::File::create(temp_file.path()).await.unwrap();
        temp_file_async.write_all(MOCKHOUSE.as_bytes()).await.unwrap();
        temp_file_async.flush().await.unwrap();

        let config = DevContainerConfig::from_file(temp_file.path()).await.unwrap();

        assert_eq!(config.display_name(), "mockhouse");
        assert_eq!(
            config.image.as_deref(),
            Some("mcr.microsoft.com/devcontainers/python:1-3.11-bullseye")
        );
        assert_eq!(config.forward_ports, vec![ForwardPort::Local(5000)]);
        assert_eq!(
            config.post_create_command,
            Some(LifecycleCommand::Shell("make install".to_string()))
        );
        assert_eq!(config.features.len(), 2);
        assert_eq!(config.extensions().len(), 2);
    }

    #[test]
    fn test_round_trip_preserves_field_values() {
        let config = parse(MOCKHOUSE);
        let rendered = config.to_json_pretty().unwrap();
        let reparsed = parse(&rendered);

        assert_eq!(reparsed, config);
        assert_eq!(reparsed.fingerprint().unwrap(), config.fingerprint().unwrap());
    }

    #[test]
    fn test_unknown_keys_survive_round_trip() {
        let config = parse(r#"{"image": "alpine", "remoteUser": "vscode", "customizations": {"jetbrains": {"x": 1}}}"#);
        assert_eq!(config.extra.get("remoteUser"), Some(&json!("vscode")));

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["remoteUser"], json!("vscode"));
        assert_eq!(value["customizations"]["jetbrains"]["x"], json!(1));
    }

    #[test]
    fn test_schema_rejects_wrong_shapes() {
        let err = DevContainerConfig::from_str_with(
            r#"{"image": "alpine", "forwardPorts": "5000"}"#,
            ConfigParserOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ForgeError::SchemaError(_)));

        let err = DevContainerConfig::from_str_with(
            r#"{"image": "alpine", "features": {"git": 1}}"#,
            ConfigParserOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ForgeError::SchemaError(_)));
    }

    #[test]
    fn test_check_schema_on_built_config() {
        let mut config = parse(MOCKHOUSE);
        config.check_schema().unwrap();

        config.extra.insert("forwardPorts".into(), json!("5000"));
        config.forward_ports.clear();
        assert!(matches!(config.check_schema(), Err(ForgeError::SchemaError(_))));
    }

    #[test]
    fn test_lifecycle_command_forms() {
        let config = parse(
            r#"{"image": "alpine",
                "postCreateCommand": ["make", "install"],
                "postStartCommand": {"web": "flask run", "worker": ["celery", "worker"]}}"#,
        );

        let create = config.post_create_command.unwrap();
        assert_eq!(create.argv().unwrap(), vec!["make", "install"]);

        match config.post_start_command.unwrap() {
            LifecycleCommand::Parallel(map) => {
                assert_eq!(map.keys().collect::<Vec<_>>(), vec!["web", "worker"]);
                assert_eq!(
                    map["web"].argv().unwrap(),
                    vec!["/bin/sh", "-c", "flask run"]
                );
            }
            other => panic!("expected parallel command, got {:?}", other),
        }

        assert!(LifecycleCommand::Shell("  ".into()).is_empty());
        assert!(LifecycleCommand::Exec(vec![]).is_empty());
        assert!(LifecycleCommand::Parallel(IndexMap::new()).is_empty());
    }

    #[test]
    fn test_base_environment() {
        let image = parse(r#"{"image": "alpine:3"}"#);
        assert_eq!(
            image.base_environment(),
            Some(ImageSource::Image("alpine:3".to_string()))
        );
        assert_eq!(image.detect_environment_type(), "docker-image:alpine:3");

        let built = parse(r#"{"build": {"dockerfile": "Dockerfile", "context": ".."}}"#);
        assert_eq!(
            built.base_environment(),
            Some(ImageSource::Dockerfile {
                context: "..".to_string(),
                dockerfile: "Dockerfile".to_string(),
                args: IndexMap::new(),
            })
        );

        assert_eq!(parse("{}").base_environment(), None);
        assert_eq!(parse("{}").detect_environment_type(), "custom");
    }

    #[test]
    fn test_unique_extensions() {
        let config = parse(
            r#"{"image": "alpine", "customizations": {"vscode": {"extensions":
                ["ms-python.python", "charliermarsh.ruff", "MS-Python.python"]}}}"#,
        );
        assert_eq!(
            config.unique_extensions(),
            vec!["ms-python.python", "charliermarsh.ruff"]
        );
    }

    #[test]
    fn test_settings_last_write_wins() {
        let config = parse(
            r#"{"image": "alpine", "customizations": {"vscode": {"settings":
                {"editor.tabSize": 2, "editor.tabSize": 4}}}}"#,
        );
        assert_eq!(
            config.vscode().unwrap().settings.get("editor.tabSize"),
            Some(&json!(4))
        );
    }

    #[test]
    fn test_effective_workspace() {
        let local = PathBuf::from("/home/dev/mockhouse");
        let bare = parse(r#"{"image": "alpine"}"#);
        assert_eq!(bare.effective_workspace_folder(&local), "/workspaces/mockhouse");
        let mount = bare.effective_workspace_mount(&local).unwrap();
        assert_eq!(mount.source, "/home/dev/mockhouse");
        assert_eq!(mount.target, "/workspaces/mockhouse");

        let config = parse(MOCKHOUSE);
        let mount = config.effective_workspace_mount(&local).unwrap();
        assert_eq!(mount.consistency.as_deref(), Some("cached"));
    }

    #[test]
    fn test_attributes_for_prefers_exact_key() {
        let config = parse(
            r#"{"image": "alpine", "forwardPorts": [5000, 5001],
                "portsAttributes": {
                    "5000-5010": {"label": "range", "onAutoForward": "silent"},
                    "5000": {"label": "Flask App", "onAutoForward": "openBrowser"}
                }}"#,
        );

        let exact = config.attributes_for(&ForwardPort::Local(5000)).unwrap();
        assert_eq!(exact.label.as_deref(), Some("Flask App"));
        assert_eq!(exact.on_auto_forward, Some(OnAutoForward::OpenBrowser));

        let ranged = config.attributes_for(&ForwardPort::Local(5001)).unwrap();
        assert_eq!(ranged.label.as_deref(), Some("range"));
        assert!(config.attributes_for(&ForwardPort::Local(8080)).is_none());
    }

    #[test]
    fn test_overlay_merges_and_removes() {
        let config = parse(MOCKHOUSE);
        let merged = config
            .with_overlay(&json!({"postStartCommand": null, "forwardPorts": [5000, 8080]}))
            .unwrap();

        assert!(merged.post_start_command.is_none());
        assert_eq!(merged.forward_ports.len(), 2);
        assert_eq!(merged.image, config.image);
    }
}
