use chrono::Utc;
use futures::future::join_all;
use indexmap::IndexMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::devcontainer::basename;
use crate::config::{
    substitute_config, validate_devcontainer_config, DevContainerConfig, LifecycleCommand,
    Settings, SubstitutionContext, ValidationReport,
};
use crate::core::{EnvironmentStatus, ForgeError, ForgeResult};
use crate::track_performance;

pub mod lifecycle;
pub mod port_forward;
pub mod provisioner;
pub mod state;

pub use lifecycle::{FailurePolicy, LifecyclePlan, LifecycleStep, StepOutcome, StepRecord};
pub use port_forward::{open_in_browser, AutoForwardAction, PortForward, PortForwardManager};
pub use provisioner::{
    ContainerSpec, DryRunProvisioner, EditorCustomizations, ExecOutcome, ExecRequest,
    FeatureInstall, FeatureSource, PortBinding, ProvisionEvent, Provisioner,
    CUSTOMIZATIONS_LABEL, WORKSPACE_LABEL,
};
pub use state::{CommandStatus, EnvironmentState, StateStore};

/// `.devcontainer/<name>/devcontainer.json` is the deepest descriptor location.
const DESCRIPTOR_DEPTH: usize = 3;
/// Subdirectory of the state directory used by simulated backends.
const SIMULATED_STATE_DIR: &str = "dry-run";

/// A descriptor loaded for one workspace, validated and with variables expanded.
#[derive(Debug, Clone)]
pub struct ResolvedEnvironment {
    pub workspace: PathBuf,
    pub descriptor_path: PathBuf,
    pub descriptor_dir: PathBuf,
    /// The descriptor as written, overlay applied.
    pub config: DevContainerConfig,
    /// `config` with `${...}` references expanded.
    pub resolved: DevContainerConfig,
    pub report: ValidationReport,
    pub fingerprint: String,
}

impl ResolvedEnvironment {
    pub fn name(&self) -> &str {
        self.config.display_name()
    }

    pub fn container_workspace_folder(&self) -> String {
        self.resolved.effective_workspace_folder(&self.workspace)
    }

    /// The descriptor's directory as seen from inside the container.
    pub fn container_descriptor_dir(&self) -> String {
        let folder = self.container_workspace_folder();
        match self.descriptor_dir.strip_prefix(&self.workspace) {
            Ok(relative) => Path::new(&folder).join(relative).display().to_string(),
            Err(_) => folder,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForwardReport {
    pub forward: PortForward,
    /// `None` when activation was not awaited.
    pub active: Option<bool>,
    pub action: AutoForwardAction,
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub post_start: CommandStatus,
    pub forwards: Vec<ForwardReport>,
    pub steps: Vec<StepRecord>,
}

#[derive(Debug, Clone)]
pub struct UpReport {
    pub container_id: String,
    pub reused: bool,
    pub steps: Vec<StepRecord>,
    pub session: SessionReport,
}

pub struct EnvironmentManager {
    settings: Settings,
    provisioner: Arc<dyn Provisioner>,
    store: StateStore,
    port_forward: PortForwardManager,
}

impl EnvironmentManager {
    pub fn new(settings: Settings, provisioner: Arc<dyn Provisioner>) -> Self {
        let mut state_dir = settings.state_dir();
        if provisioner.is_simulated() {
            state_dir = state_dir.join(SIMULATED_STATE_DIR);
        }
        let store = StateStore::new(state_dir);
        let port_forward = PortForwardManager::new(settings.port_range.clone());
        Self {
            settings,
            provisioner,
            store,
            port_forward,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn backend_name(&self) -> &'static str {
        self.provisioner.name()
    }

    /// Descriptors under `root`: `.devcontainer/devcontainer.json`, then `.devcontainer.json`,
    /// then `.devcontainer/<name>/devcontainer.json`.
    pub fn discover(root: &Path) -> ForgeResult<Vec<PathBuf>> {
        let mut found: Vec<(u8, PathBuf)> = Vec::new();
        let walker = ignore::WalkBuilder::new(root)
            .hidden(false)
            .max_depth(Some(DESCRIPTOR_DEPTH))
            .build();

        for entry in walker {
            let entry = entry.map_err(|e| ForgeError::ConfigError(format!("walk failed: {}", e)))?;
            let path = entry.path();
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let parts: Vec<&str> = relative
                .components()
                .filter_map(|c| c.as_os_str().to_str())
                .collect();
            let rank = match parts.as_slice() {
                [".devcontainer", "devcontainer.json"] => 0,
                [".devcontainer.json"] => 1,
                [".devcontainer", _, "devcontainer.json"] => 2,
                _ => continue,
            };
            if entry.file_type().map_or(false, |t| t.is_file()) {
                found.push((rank, path.to_path_buf()));
            }
        }

        found.sort();
        debug!(root = %root.display(), count = found.len(), "Discovered descriptors");
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    /// The descriptor for `workspace`: `descriptor` when given, relative paths taken from the
    /// workspace, otherwise the first one [`discover`](Self::discover) finds.
    pub fn locate_descriptor(workspace: &Path, descriptor: Option<&Path>) -> ForgeResult<PathBuf> {
        match descriptor {
            Some(path) if path.is_absolute() => Ok(path.to_path_buf()),
            Some(path) => Ok(workspace.join(path)),
            None => Self::discover(workspace)?
                .into_iter()
                .next()
                .ok_or_else(|| ForgeError::DescriptorNotFound(workspace.display().to_string())),
        }
    }

    /// Find, parse, overlay, validate and expand the descriptor for `workspace`.
    pub async fn load(
        &self,
        workspace: &Path,
        descriptor: Option<&Path>,
        overlay: Option<&Value>,
    ) -> ForgeResult<ResolvedEnvironment> {
        track_performance!("environment.load");
        let workspace = fs::canonicalize(workspace).await.map_err(|e| {
            ForgeError::EnvironmentError(format!("workspace {}: {}", workspace.display(), e))
        })?;

        let descriptor_path = Self::locate_descriptor(&workspace, descriptor)?;
        info!(descriptor = %descriptor_path.display(), "Loading descriptor");

        let mut config = DevContainerConfig::from_file(&descriptor_path).await?;
        if let Some(overlay) = overlay {
            config = config.with_overlay(overlay)?;
        }

        let report = validate_devcontainer_config(&config).into_result(false)?;
        for warning in &report.warnings {
            warn!(path = %warning.path, "{}", warning.message);
        }

        let folder = config.effective_workspace_folder(&workspace);
        let ctx = SubstitutionContext::new(&workspace, folder);
        let resolved = substitute_config(&config, &ctx);
        let fingerprint = config.fingerprint()?;

        let descriptor_dir = descriptor_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| workspace.clone());

        Ok(ResolvedEnvironment {
            workspace,
            descriptor_path,
            descriptor_dir,
            config,
            resolved,
            report,
            fingerprint,
        })
    }

    pub fn plan(&self, env: &ResolvedEnvironment) -> LifecyclePlan {
        LifecyclePlan::from_config(&env.resolved)
    }

    /// Provision the environment if needed, then start a session in it.
    ///
    /// `postCreateCommand` runs once per container and is retried until it succeeds. An
    /// existing container built from the same descriptor is reused; a changed descriptor
    /// replaces it.
    pub async fn up(&self, env: &ResolvedEnvironment, wait_for_ports: bool) -> ForgeResult<UpReport> {
        track_performance!("environment.up");
        let plan = self.plan(env);
        let mut state = self.current_state(env).await?;
        let mut steps = Vec::new();

        let reused = state.container_id.is_some();
        let result = match state.status {
            EnvironmentStatus::Running
            | EnvironmentStatus::Stopped
            | EnvironmentStatus::PartiallyProvisioned
                if reused =>
            {
                self.resume(env, &plan, &mut state, &mut steps).await
            }
            _ => self.provision(env, &plan, &mut state, &mut steps).await,
        };

        if let Err(err) = result {
            state.status = match &err {
                ForgeError::PostCreateFailed { .. } => EnvironmentStatus::PartiallyProvisioned,
                _ => EnvironmentStatus::Failed,
            };
            if let Err(save_err) = self.store.save(&mut state).await {
                warn!(error = %save_err, "Failed to record environment state");
            }
            return Err(err);
        }

        state.status = EnvironmentStatus::Running;
        let container_id = self.container_of(&state)?;
        let session = self.run_session(env, &container_id, &mut state, wait_for_ports).await?;

        Ok(UpReport {
            container_id,
            reused,
            steps,
            session,
        })
    }

    /// Start a new session in an environment provisioned by [`up`](Self::up).
    pub async fn start_session(&self, env: &ResolvedEnvironment, wait_for_ports: bool) -> ForgeResult<SessionReport> {
        track_performance!("environment.start_session");
        let mut state = self.store.load(&env.workspace).await?.ok_or_else(|| {
            ForgeError::EnvironmentError("environment has not been provisioned; run `forge up`".into())
        })?;

        if state.descriptor_fingerprint != env.fingerprint {
            return Err(ForgeError::EnvironmentError(
                "descriptor changed since provisioning; run `forge up` to recreate".into(),
            ));
        }
        if post_create_pending(env, &state) {
            return Err(ForgeError::EnvironmentError(
                "postCreateCommand has not completed; run `forge up` to retry it".into(),
            ));
        }
        match state.status {
            EnvironmentStatus::Running => {}
            EnvironmentStatus::Stopped => {
                self.provisioner.start_container(&self.container_of(&state)?).await?;
                state.status = EnvironmentStatus::Running;
            }
            other => {
                return Err(ForgeError::EnvironmentError(format!(
                    "environment is {}; run `forge up`",
                    other
                )))
            }
        }

        let container_id = self.container_of(&state)?;
        self.run_session(env, &container_id, &mut state, wait_for_ports).await
    }

    /// Stop the container, and with `remove` delete it and forget the environment.
    pub async fn down(&self, workspace: &Path, remove: bool) -> ForgeResult<Option<EnvironmentState>> {
        track_performance!("environment.down");
        let workspace = fs::canonicalize(workspace).await?;
        let Some(mut state) = self.store.load(&workspace).await? else {
            return Ok(None);
        };

        if let Some(id) = &state.container_id {
            if state.status != EnvironmentStatus::Stopped {
                self.provisioner.stop(id).await?;
            }
            if remove {
                self.provisioner.remove(id).await?;
            }
        }
        self.port_forward.remove_forwards(&forward_key(&workspace)).await;

        if remove {
            self.store.clear(&workspace).await?;
            info!(workspace = %workspace.display(), "Environment removed");
            state.container_id = None;
        } else {
            state.status = EnvironmentStatus::Stopped;
            self.store.save(&mut state).await?;
            info!(workspace = %workspace.display(), "Environment stopped");
        }
        Ok(Some(state))
    }

    pub async fn status(&self, workspace: &Path) -> ForgeResult<Option<EnvironmentState>> {
        let workspace = fs::canonicalize(workspace).await?;
        self.store.load(&workspace).await
    }

    async fn current_state(&self, env: &ResolvedEnvironment) -> ForgeResult<EnvironmentState> {
        match self.store.load(&env.workspace).await? {
            Some(state)
                if state.descriptor_fingerprint == env.fingerprint
                    && !matches!(state.status, EnvironmentStatus::Failed | EnvironmentStatus::Created) =>
            {
                Ok(state)
            }
            Some(stale) => {
                if let Some(id) = &stale.container_id {
                    info!(container = %id, "Descriptor changed or setup did not finish, replacing container");
                    if let Err(e) = self.provisioner.remove(id).await {
                        warn!(container = %id, error = %e, "Failed to remove old container");
                    }
                }
                Ok(EnvironmentState::new(&env.workspace, env.fingerprint.clone()))
            }
            None => Ok(EnvironmentState::new(&env.workspace, env.fingerprint.clone())),
        }
    }

    fn container_of(&self, state: &EnvironmentState) -> ForgeResult<String> {
        state
            .container_id
            .clone()
            .ok_or_else(|| ForgeError::EnvironmentError("environment has no container".into()))
    }

    /// Restart an existing container and finish `postCreateCommand` if it never succeeded.
    async fn resume(
        &self,
        env: &ResolvedEnvironment,
        plan: &LifecyclePlan,
        state: &mut EnvironmentState,
        steps: &mut Vec<StepRecord>,
    ) -> ForgeResult<()> {
        let container_id = self.container_of(state)?;
        if state.status == EnvironmentStatus::Stopped {
            self.provisioner.start_container(&container_id).await?;
        }
        info!(container = %container_id, "Reusing provisioned container");

        let pending = post_create_pending(env, state);
        for step in plan.provisioning_steps() {
            if pending && *step == LifecycleStep::PostCreate {
                continue;
            }
            record(steps, step.clone(), StepOutcome::Skipped("already provisioned".into()), Instant::now());
        }
        if pending {
            info!(environment = env.name(), "Retrying postCreateCommand");
            self.finish_provisioning(env, plan, state, steps).await?;
        }
        Ok(())
    }

    async fn provision(
        &self,
        env: &ResolvedEnvironment,
        plan: &LifecyclePlan,
        state: &mut EnvironmentState,
        steps: &mut Vec<StepRecord>,
    ) -> ForgeResult<()> {
        let config = &env.resolved;

        let started = Instant::now();
        let source = config.base_environment().ok_or_else(|| {
            ForgeError::provisioning(LifecycleStep::ResolveImage, "no image or Dockerfile declared")
        })?;
        let image = self.provisioner.resolve_image(&source, &env.descriptor_dir).await?;
        record(steps, LifecycleStep::ResolveImage, StepOutcome::Completed, started);

        let started = Instant::now();
        let workspace_mount = config
            .effective_workspace_mount(&env.workspace)
            .map_err(|e| ForgeError::provisioning(LifecycleStep::MountWorkspace, e.to_string()))?;
        let forwards = self
            .port_forward
            .plan_forwards(&forward_key(&env.workspace), config, &state.port_bindings)
            .await?;
        state.port_bindings = forwards
            .iter()
            .map(|f| (f.port.to_string(), f.host_port))
            .collect();

        let spec = ContainerSpec {
            name: container_name(env),
            image,
            workspace_mount,
            workspace_folder: env.container_workspace_folder(),
            ports: forwards
                .iter()
                .filter(|f| f.is_local())
                .map(|f| PortBinding {
                    container_port: f.container_port(),
                    host_port: f.host_port,
                })
                .collect(),
            labels: container_labels(env)?,
        };
        let container_id = self.provisioner.create_container(&spec).await?;
        state.container_id = Some(container_id.clone());
        state.status = EnvironmentStatus::Created;
        self.store.save(state).await?;
        self.provisioner.start_container(&container_id).await?;
        record(steps, LifecycleStep::MountWorkspace, StepOutcome::Completed, started);

        let descriptor_dir = env.container_descriptor_dir();
        for (id, options) in &config.features {
            let started = Instant::now();
            let step = LifecycleStep::InstallFeature(id.clone());
            let feature = FeatureInstall {
                id: id.clone(),
                source: FeatureSource::classify(id, &descriptor_dir),
                options: options.clone(),
            };

            if matches!(feature.source, FeatureSource::Remote(_)) && !self.provisioner.fetches_remote_features() {
                if !self.settings.allow_unfetched_features {
                    return Err(ForgeError::provisioning(
                        step,
                        format!(
                            "the {} backend cannot fetch remote features; set allow_unfetched_features to skip them",
                            self.provisioner.name()
                        ),
                    ));
                }
                warn!(feature = %id, "Skipping remote feature");
                record(steps, step, StepOutcome::Skipped("remote feature not fetched".into()), started);
                continue;
            }

            self.provisioner.install_feature(&container_id, &feature).await?;
            record(steps, step, StepOutcome::Completed, started);
        }

        let started = Instant::now();
        let customizations = EditorCustomizations {
            extensions: config.unique_extensions(),
            settings: config.vscode().map(|v| v.settings.clone()).unwrap_or_default(),
        };
        self.provisioner
            .apply_customizations(&container_id, &customizations)
            .await?;
        record(steps, LifecycleStep::ApplyCustomizations, StepOutcome::Completed, started);

        self.finish_provisioning(env, plan, state, steps).await
    }

    /// Run `postCreateCommand` unless it already succeeded for this container.
    async fn finish_provisioning(
        &self,
        env: &ResolvedEnvironment,
        plan: &LifecyclePlan,
        state: &mut EnvironmentState,
        steps: &mut Vec<StepRecord>,
    ) -> ForgeResult<()> {
        if !plan.steps.contains(&LifecycleStep::PostCreate) || state.post_create_done() {
            return Ok(());
        }
        let Some(command) = &env.resolved.post_create_command else {
            return Ok(());
        };

        let started = Instant::now();
        let container_id = self.container_of(state)?;
        info!(command = %command, "Running postCreateCommand");
        let outcome = self
            .run_command(&container_id, command, &env.container_workspace_folder())
            .await?;

        if !outcome.success() {
            warn!(exit_code = outcome.exit_code, output = %outcome.output, "postCreateCommand failed");
            record(
                steps,
                LifecycleStep::PostCreate,
                StepOutcome::Failed(format!("exit status {}", outcome.exit_code)),
                started,
            );
            return Err(ForgeError::PostCreateFailed {
                exit_code: outcome.exit_code,
            });
        }

        state.post_create_completed_at = Some(Utc::now());
        record(steps, LifecycleStep::PostCreate, StepOutcome::Completed, started);
        Ok(())
    }

    /// `postStartCommand` and port forwarding. Failures here are reported, never fatal.
    ///
    /// The command runs detached so long-lived servers do not block the session. It is
    /// watched while the ports come up and counts as failed only if it exits non-zero.
    async fn run_session(
        &self,
        env: &ResolvedEnvironment,
        container_id: &str,
        state: &mut EnvironmentState,
        wait_for_ports: bool,
    ) -> ForgeResult<SessionReport> {
        let config = &env.resolved;
        let mut steps = Vec::new();

        let started = Instant::now();
        let handles = match &config.post_start_command {
            None => None,
            Some(command) => {
                info!(command = %command, "Starting postStartCommand");
                Some(
                    self.spawn_command(container_id, command, &env.container_workspace_folder())
                        .await,
                )
            }
        };

        let watch = async move {
            let status = match handles {
                None => CommandStatus::NotDeclared,
                Some(Ok(handles)) => self.watch_detached(&handles).await,
                Some(Err(e)) => {
                    warn!(error = %e, "postStartCommand could not start");
                    CommandStatus::Failed { exit_code: -1 }
                }
            };
            (status, started.elapsed())
        };
        let ((post_start, watched), (forwards, forward_step)) =
            tokio::join!(watch, self.forward_ports(env, state, wait_for_ports));

        if config.post_start_command.is_some() {
            let outcome = match &post_start {
                CommandStatus::Failed { exit_code } => {
                    warn!(exit_code = *exit_code, "postStartCommand failed");
                    StepOutcome::Failed(format!("exit status {}", exit_code))
                }
                _ => StepOutcome::Completed,
            };
            debug!(step = %LifecycleStep::PostStart, outcome = %outcome, "Lifecycle step");
            steps.push(StepRecord {
                step: LifecycleStep::PostStart,
                outcome,
                elapsed: watched,
            });
        }
        steps.extend(forward_step);

        let session_id = state.record_session(post_start.clone()).id;
        self.store.save(state).await?;

        Ok(SessionReport {
            session_id,
            post_start,
            forwards,
            steps,
        })
    }

    async fn forward_ports(
        &self,
        env: &ResolvedEnvironment,
        state: &mut EnvironmentState,
        wait_for_ports: bool,
    ) -> (Vec<ForwardReport>, Option<StepRecord>) {
        let config = &env.resolved;
        if config.forward_ports.is_empty() {
            return (Vec::new(), None);
        }

        let started = Instant::now();
        let mut forwards = Vec::new();
        let outcome = match self
            .port_forward
            .plan_forwards(&forward_key(&env.workspace), config, &state.port_bindings)
            .await
        {
            Ok(planned) => {
                for forward in planned {
                    forwards.push(self.activate(forward, state, wait_for_ports).await);
                }
                StepOutcome::Completed
            }
            Err(e) => {
                warn!(error = %e, "Port forwarding failed");
                StepOutcome::Failed(e.to_string())
            }
        };

        let mut recorded = Vec::new();
        record(&mut recorded, LifecycleStep::ForwardPorts, outcome, started);
        (forwards, recorded.pop())
    }

    /// Poll detached commands until they all exit or the grace period ends. The first
    /// non-zero exit wins; commands still running after the grace period are servers.
    async fn watch_detached(&self, handles: &[(String, String)]) -> CommandStatus {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(self.settings.post_start_grace_ms);
        let interval = Duration::from_millis(self.settings.activation_poll_ms);
        loop {
            let mut running = false;
            for (name, handle) in handles {
                match self.provisioner.exec_status(handle).await {
                    Ok(None) => running = true,
                    Ok(Some(0)) => {}
                    Ok(Some(exit_code)) => {
                        debug!(command = %name, exit_code, "Detached command exited");
                        return CommandStatus::Failed { exit_code };
                    }
                    Err(e) => {
                        warn!(command = %name, error = %e, "Lost track of detached command");
                        return CommandStatus::Failed { exit_code: -1 };
                    }
                }
            }
            if !running {
                return CommandStatus::Succeeded;
            }
            if tokio::time::Instant::now() + interval > deadline {
                return CommandStatus::Running;
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn activate(&self, forward: PortForward, state: &mut EnvironmentState, wait: bool) -> ForwardReport {
        let action = PortForwardManager::auto_forward_action(&forward, &state.opened_ports);
        if !forward.is_local() || !wait {
            return ForwardReport {
                forward,
                active: None,
                action,
            };
        }

        let active = PortForwardManager::await_activation(
            &forward,
            Duration::from_secs(self.settings.activation_timeout_secs),
            Duration::from_millis(self.settings.activation_poll_ms),
        )
        .await;

        if !active {
            warn!(port = %forward.port, "Forwarded port never became active");
        } else if let AutoForwardAction::OpenBrowser(url) = &action {
            if self.settings.open_browser {
                match open_in_browser(url) {
                    Ok(true) => {
                        state.opened_ports.insert(forward.container_port());
                    }
                    Ok(false) => {}
                    Err(e) => warn!(url = %url, error = %e, "Failed to open browser"),
                }
            }
        }

        ForwardReport {
            forward,
            active: Some(active),
            action,
        }
    }

    /// Start a lifecycle command without waiting for it. Returns `(entry name, handle)` pairs;
    /// a single command has an empty name.
    async fn spawn_command(
        &self,
        container_id: &str,
        command: &LifecycleCommand,
        workdir: &str,
    ) -> ForgeResult<Vec<(String, String)>> {
        let mut handles = Vec::new();
        for (name, argv) in command_argvs(command)? {
            let handle = self
                .provisioner
                .exec_detached(container_id, &exec_request(argv, workdir))
                .await?;
            handles.push((name, handle));
        }
        Ok(handles)
    }

    /// Run a lifecycle command in the container. Parallel entries run concurrently and the
    /// first non-zero exit status wins.
    async fn run_command(
        &self,
        container_id: &str,
        command: &LifecycleCommand,
        workdir: &str,
    ) -> ForgeResult<ExecOutcome> {
        let LifecycleCommand::Parallel(_) = command else {
            let argv = command
                .argv()
                .ok_or_else(|| ForgeError::EnvironmentError("command has no program".into()))?;
            return self.provisioner.exec(container_id, &exec_request(argv, workdir)).await;
        };

        let requests: IndexMap<String, ExecRequest> = command_argvs(command)?
            .into_iter()
            .map(|(name, argv)| (name, exec_request(argv, workdir)))
            .collect();
        let outcomes = join_all(
            requests
                .values()
                .map(|request| self.provisioner.exec(container_id, request)),
        )
        .await;

        let mut exit_code = 0;
        let mut output = String::new();
        for (name, outcome) in requests.keys().zip(outcomes) {
            let outcome = outcome?;
            if exit_code == 0 && !outcome.success() {
                exit_code = outcome.exit_code;
            }
            for line in outcome.output.lines() {
                output.push_str(&format!("[{}] {}\n", name, line));
            }
        }
        Ok(ExecOutcome { exit_code, output })
    }
}

fn record(steps: &mut Vec<StepRecord>, step: LifecycleStep, outcome: StepOutcome, started: Instant) {
    debug!(step = %step, outcome = %outcome, "Lifecycle step");
    steps.push(StepRecord {
        step,
        outcome,
        elapsed: started.elapsed(),
    });
}

fn post_create_pending(env: &ResolvedEnvironment, state: &EnvironmentState) -> bool {
    env.resolved.post_create_command.is_some() && !state.post_create_done()
}

fn exec_request(argv: Vec<String>, workdir: &str) -> ExecRequest {
    ExecRequest {
        argv,
        workdir: workdir.to_string(),
        user: None,
        env: Vec::new(),
    }
}

/// Every program a lifecycle command runs, keyed by its parallel entry name.
fn command_argvs(command: &LifecycleCommand) -> ForgeResult<Vec<(String, Vec<String>)>> {
    match command {
        LifecycleCommand::Parallel(entries) => entries
            .iter()
            .map(|(name, entry)| {
                entry
                    .argv()
                    .map(|argv| (name.clone(), argv))
                    .ok_or_else(|| ForgeError::EnvironmentError(format!("parallel command {} cannot nest", name)))
            })
            .collect(),
        single => single
            .argv()
            .map(|argv| vec![(String::new(), argv)])
            .ok_or_else(|| ForgeError::EnvironmentError("command has no program".into())),
    }
}

fn forward_key(workspace: &Path) -> String {
    workspace.display().to_string()
}

fn workspace_digest(workspace: &Path) -> String {
    let digest = Sha256::digest(workspace.to_string_lossy().as_bytes());
    format!("{:x}", digest)[..8].to_string()
}

/// `forge-<name>-<hash>`, restricted to the characters container runtimes accept.
fn container_name(env: &ResolvedEnvironment) -> String {
    let base = if env.config.name.is_some() {
        env.name().to_string()
    } else {
        basename(&env.workspace)
    };
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("forge-{}-{}", cleaned.trim_matches('-'), workspace_digest(&env.workspace))
}

fn container_labels(env: &ResolvedEnvironment) -> ForgeResult<IndexMap<String, String>> {
    let mut labels = IndexMap::new();
    labels.insert(WORKSPACE_LABEL.to_string(), env.workspace.display().to_string());
    if let Some(customizations) = &env.resolved.customizations {
        labels.insert(
            CUSTOMIZATIONS_LABEL.to_string(),
            serde_json::to_string(&serde_json::json!([{ "customizations": customizations }]))?,
        );
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_discover_orders_by_preference() {
        let root = TempDir::new().unwrap();
        write(root.path(), ".devcontainer/python/devcontainer.json", "{}");
        write(root.path(), ".devcontainer.json", "{}");
        write(root.path(), ".devcontainer/devcontainer.json", "{}");
        write(root.path(), "src/devcontainer.json", "{}");

        let found = EnvironmentManager::discover(root.path()).unwrap();
        let relative: Vec<PathBuf> = found
            .iter()
            .map(|p| p.strip_prefix(root.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            relative,
            vec![
                PathBuf::from(".devcontainer/devcontainer.json"),
                PathBuf::from(".devcontainer.json"),
                PathBuf::from(".devcontainer/python/devcontainer.json"),
            ]
        );
    }

    #[test]
    fn test_locate_descriptor_relative_to_workspace() {
        let root = TempDir::new().unwrap();
        write(root.path(), ".devcontainer/devcontainer.json", "{}");

        assert_eq!(
            EnvironmentManager::locate_descriptor(root.path(), Some(Path::new("alt/dev.json"))).unwrap(),
            root.path().join("alt/dev.json")
        );
        assert_eq!(
            EnvironmentManager::locate_descriptor(root.path(), Some(Path::new("/etc/dev.json"))).unwrap(),
            PathBuf::from("/etc/dev.json")
        );
        assert_eq!(
            EnvironmentManager::locate_descriptor(root.path(), None).unwrap(),
            root.path().join(".devcontainer/devcontainer.json")
        );

        let empty = TempDir::new().unwrap();
        assert!(matches!(
            EnvironmentManager::locate_descriptor(empty.path(), None),
            Err(ForgeError::DescriptorNotFound(_))
        ));
    }

    #[test]
    fn test_container_name_is_sanitized() {
        let env = ResolvedEnvironment {
            workspace: PathBuf::from("/home/dev/mockhouse"),
            descriptor_path: PathBuf::from("/home/dev/mockhouse/.devcontainer/devcontainer.json"),
            descriptor_dir: PathBuf::from("/home/dev/mockhouse/.devcontainer"),
            config: DevContainerConfig {
                name: Some("Mock House!".into()),
                ..Default::default()
            },
            resolved: DevContainerConfig::default(),
            report: ValidationReport::new(),
            fingerprint: String::new(),
        };

        let name = container_name(&env);
        assert!(name.starts_with("forge-mock-house-"), "{}", name);
        assert_eq!(name.len(), "forge-mock-house-".len() + 8);
        assert_eq!(env.container_descriptor_dir(), "/workspaces/mockhouse/.devcontainer");
    }
}
