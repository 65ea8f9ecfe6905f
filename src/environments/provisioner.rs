use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::info;

use crate::config::{ImageSource, MountSpec};
use crate::core::{ForgeError, ForgeResult};
use crate::environments::lifecycle::LifecycleStep;

/// Label carrying the serialized editor customizations.
pub const CUSTOMIZATIONS_LABEL: &str = "devcontainer.metadata";
pub const WORKSPACE_LABEL: &str = "devcontainer.local_folder";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: u16,
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub workspace_mount: MountSpec,
    pub workspace_folder: String,
    pub ports: Vec<PortBinding>,
    pub labels: IndexMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureSource {
    /// A feature directory inside the mounted workspace, as seen from the container.
    Local(PathBuf),
    /// An OCI reference such as `ghcr.io/devcontainers/features/git:1`.
    Remote(String),
}

impl FeatureSource {
    /// Relative references (`./features/x`) are resolved against the descriptor's
    /// directory, mapped into the container workspace.
    pub fn classify(id: &str, descriptor_dir_in_container: &str) -> Self {
        if id.starts_with("./") || id.starts_with("../") {
            let path = Path::new(descriptor_dir_in_container).join(id);
            FeatureSource::Local(path)
        } else {
            FeatureSource::Remote(id.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeatureInstall {
    pub id: String,
    pub source: FeatureSource,
    pub options: Value,
}

impl FeatureInstall {
    /// Feature options as installer environment variables: `installZsh` becomes `INSTALLZSH`.
    /// A bare version string maps to `VERSION`.
    pub fn option_env(&self) -> Vec<(String, String)> {
        match &self.options {
            Value::Object(map) => map
                .iter()
                .map(|(key, value)| {
                    let name: String = key
                        .chars()
                        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
                        .collect();
                    let value = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (name, value)
                })
                .collect(),
            Value::String(version) => vec![("VERSION".to_string(), version.clone())],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EditorCustomizations {
    pub extensions: Vec<String>,
    pub settings: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    pub workdir: String,
    pub user: Option<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: i64,
    pub output: String,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Container runtime operations the lifecycle needs.
#[async_trait]
pub trait Provisioner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether OCI feature references can be installed by this backend.
    fn fetches_remote_features(&self) -> bool {
        false
    }

    /// Simulated backends keep their state apart from real container runtimes.
    fn is_simulated(&self) -> bool {
        false
    }

    async fn resolve_image(&self, source: &ImageSource, descriptor_dir: &Path) -> ForgeResult<String>;

    async fn create_container(&self, spec: &ContainerSpec) -> ForgeResult<String>;

    async fn start_container(&self, container_id: &str) -> ForgeResult<()>;

    async fn install_feature(&self, container_id: &str, feature: &FeatureInstall) -> ForgeResult<()>;

    async fn apply_customizations(
        &self,
        container_id: &str,
        customizations: &EditorCustomizations,
    ) -> ForgeResult<()>;

    async fn exec(&self, container_id: &str, request: &ExecRequest) -> ForgeResult<ExecOutcome>;

    /// Start a command without waiting for it and return a handle to poll.
    async fn exec_detached(&self, container_id: &str, request: &ExecRequest) -> ForgeResult<String>;

    /// Exit status of a detached command, `None` while it is still running.
    async fn exec_status(&self, handle: &str) -> ForgeResult<Option<i64>>;

    async fn stop(&self, container_id: &str) -> ForgeResult<()>;

    async fn remove(&self, container_id: &str) -> ForgeResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionEvent {
    ResolveImage(String),
    CreateContainer {
        name: String,
        image: String,
        mount_target: String,
        ports: Vec<u16>,
    },
    StartContainer(String),
    InstallFeature(String),
    ApplyCustomizations { extensions: usize },
    Exec { argv: Vec<String>, workdir: String },
    Stop(String),
    Remove(String),
}

/// Records every call and touches no container runtime.
#[derive(Debug, Default)]
pub struct DryRunProvisioner {
    events: Mutex<Vec<ProvisionEvent>>,
    next_id: AtomicUsize,
    next_exec: AtomicUsize,
    failing_steps: HashSet<String>,
    exit_codes: Vec<(String, i64)>,
    long_running: Vec<String>,
    detached: Mutex<HashMap<String, Option<i64>>>,
}

impl DryRunProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the given step fail with a provisioning error.
    pub fn failing(mut self, step: &LifecycleStep) -> Self {
        self.failing_steps.insert(step.to_string());
        self
    }

    /// Commands whose text contains `pattern` exit with `code`.
    pub fn with_exit_code(mut self, pattern: impl Into<String>, code: i64) -> Self {
        self.exit_codes.push((pattern.into(), code));
        self
    }

    /// Commands whose text contains `pattern` never exit, like a dev server.
    pub fn with_long_running(mut self, pattern: impl Into<String>) -> Self {
        self.long_running.push(pattern.into());
        self
    }

    pub fn events(&self) -> Vec<ProvisionEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn exec_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, ProvisionEvent::Exec { .. }))
            .count()
    }

    fn record(&self, event: ProvisionEvent) {
        info!(event = ?event, "dry-run");
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    fn scripted_exit(&self, text: &str) -> Option<i64> {
        if self.long_running.iter().any(|p| text.contains(p.as_str())) {
            return None;
        }
        Some(
            self.exit_codes
                .iter()
                .find(|(pattern, _)| text.contains(pattern.as_str()))
                .map_or(0, |(_, code)| *code),
        )
    }

    fn check(&self, step: LifecycleStep) -> ForgeResult<()> {
        if self.failing_steps.contains(&step.to_string()) {
            return Err(ForgeError::provisioning(step, "simulated failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl Provisioner for DryRunProvisioner {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    fn fetches_remote_features(&self) -> bool {
        true
    }

    fn is_simulated(&self) -> bool {
        true
    }

    async fn resolve_image(&self, source: &ImageSource, _descriptor_dir: &Path) -> ForgeResult<String> {
        self.check(LifecycleStep::ResolveImage)?;
        let image = match source {
            ImageSource::Image(image) => image.clone(),
            ImageSource::Dockerfile { dockerfile, .. } => format!("dry-run-build:{}", dockerfile),
        };
        self.record(ProvisionEvent::ResolveImage(image.clone()));
        Ok(image)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> ForgeResult<String> {
        self.check(LifecycleStep::MountWorkspace)?;
        self.record(ProvisionEvent::CreateContainer {
            name: spec.name.clone(),
            image: spec.image.clone(),
            mount_target: spec.workspace_mount.target.clone(),
            ports: spec.ports.iter().map(|p| p.container_port).collect(),
        });
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("dry-run-{}", n))
    }

    async fn start_container(&self, container_id: &str) -> ForgeResult<()> {
        self.record(ProvisionEvent::StartContainer(container_id.to_string()));
        Ok(())
    }

    async fn install_feature(&self, _container_id: &str, feature: &FeatureInstall) -> ForgeResult<()> {
        self.check(LifecycleStep::InstallFeature(feature.id.clone()))?;
        self.record(ProvisionEvent::InstallFeature(feature.id.clone()));
        Ok(())
    }

    async fn apply_customizations(
        &self,
        _container_id: &str,
        customizations: &EditorCustomizations,
    ) -> ForgeResult<()> {
        self.check(LifecycleStep::ApplyCustomizations)?;
        self.record(ProvisionEvent::ApplyCustomizations {
            extensions: customizations.extensions.len(),
        });
        Ok(())
    }

    async fn exec(&self, _container_id: &str, request: &ExecRequest) -> ForgeResult<ExecOutcome> {
        let text = request.argv.join(" ");
        self.record(ProvisionEvent::Exec {
            argv: request.argv.clone(),
            workdir: request.workdir.clone(),
        });
        let Some(exit_code) = self.scripted_exit(&text) else {
            return std::future::pending().await;
        };
        Ok(ExecOutcome {
            exit_code,
            output: format!("dry-run: {}", text),
        })
    }

    async fn exec_detached(&self, _container_id: &str, request: &ExecRequest) -> ForgeResult<String> {
        let text = request.argv.join(" ");
        self.record(ProvisionEvent::Exec {
            argv: request.argv.clone(),
            workdir: request.workdir.clone(),
        });
        let handle = format!("dry-run-exec-{}", self.next_exec.fetch_add(1, Ordering::SeqCst));
        if let Ok(mut detached) = self.detached.lock() {
            detached.insert(handle.clone(), self.scripted_exit(&text));
        }
        Ok(handle)
    }

    async fn exec_status(&self, handle: &str) -> ForgeResult<Option<i64>> {
        let detached = self
            .detached
            .lock()
            .map_err(|_| ForgeError::EnvironmentError("dry-run exec table poisoned".into()))?;
        detached
            .get(handle)
            .copied()
            .ok_or_else(|| ForgeError::EnvironmentError(format!("unknown exec {}", handle)))
    }

    async fn stop(&self, container_id: &str) -> ForgeResult<()> {
        self.record(ProvisionEvent::Stop(container_id.to_string()));
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> ForgeResult<()> {
        self.record(ProvisionEvent::Remove(container_id.to_string()));
        Ok(())
    }
}
