use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
        StopContainerOptions, UploadToContainerOptions,
    },
    exec::{CreateExecOptions, StartExecOptions, StartExecResults},
    image::CreateImageOptions,
    service::{HostConfig, Mount, MountTypeEnum, PortBinding as DockerPortBinding},
    Docker,
};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

pub mod oci;

use oci::{FeatureFetcher, FeatureRef};

use crate::config::{ImageSource, MountKind, MountSpec};
use crate::core::{ForgeError, ForgeResult};
use crate::environments::lifecycle::LifecycleStep;
use crate::environments::provisioner::{
    ContainerSpec, EditorCustomizations, ExecOutcome, ExecRequest, FeatureInstall, FeatureSource,
    PortBinding, Provisioner,
};

/// Keeps the container alive without depending on the image's entrypoint.
const KEEP_ALIVE: &str = "trap 'exit 0' 15; while sleep 1000 & wait $!; do :; done";
const STOP_TIMEOUT_SECS: i64 = 10;
const CUSTOMIZATIONS_PATH: &str = "$HOME/.forge/customizations.json";
/// Where fetched features are unpacked inside the container.
const FEATURE_STAGING_DIR: &str = "/tmp/forge-features";

pub struct DockerProvisioner {
    client: Docker,
    features: FeatureFetcher,
}

impl DockerProvisioner {
    pub fn new() -> ForgeResult<Self> {
        let client = Docker::connect_with_local_defaults().map_err(|e| {
            ForgeError::EnvironmentError(format!("Failed to connect to Docker daemon: {}", e))
        })?;

        Ok(Self {
            client,
            features: FeatureFetcher::new(),
        })
    }

    pub async fn is_docker_available() -> bool {
        match Docker::connect_with_local_defaults() {
            Ok(client) => client.ping().await.is_ok(),
            Err(_) => false,
        }
    }

    async fn pull_image(&self, image: &str) -> ForgeResult<()> {
        if self.client.inspect_image(image).await.is_ok() {
            debug!(image, "Image already present");
            return Ok(());
        }

        info!(image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress.map_err(|e| step_error(LifecycleStep::ResolveImage, e))?;
            if let Some(status) = progress.status {
                debug!(image, status = %status, "Pull progress");
            }
        }
        Ok(())
    }

    /// Image builds go through the docker CLI, which packs the build context itself.
    async fn build_image(
        &self,
        context: &Path,
        dockerfile: &Path,
        args: &indexmap::IndexMap<String, String>,
    ) -> ForgeResult<String> {
        let docker = which::which("docker").map_err(|e| {
            ForgeError::provisioning(LifecycleStep::ResolveImage, format!("docker CLI not found: {}", e))
        })?;
        let digest = Sha256::digest(dockerfile.to_string_lossy().as_bytes());
        let tag = format!("forge-build-{}", &format!("{:x}", digest)[..12]);

        let mut cmd = Command::new(docker);
        cmd.arg("build").arg("-f").arg(dockerfile).arg("-t").arg(&tag);
        for (key, value) in args {
            cmd.arg("--build-arg").arg(format!("{}={}", key, value));
        }
        cmd.arg(context);

        info!(dockerfile = %dockerfile.display(), tag = %tag, "Building image");
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(ForgeError::provisioning(
                LifecycleStep::ResolveImage,
                format!("docker build failed: {}", String::from_utf8_lossy(&output.stderr).trim()),
            ));
        }
        Ok(tag)
    }

    /// Download a registry feature and unpack it into the container.
    async fn stage_remote_feature(&self, container_id: &str, reference: &str) -> ForgeResult<PathBuf> {
        let step = LifecycleStep::InstallFeature(reference.to_string());
        let feature: FeatureRef = reference
            .parse()
            .map_err(|e: String| ForgeError::provisioning(step.clone(), e))?;
        let archive = self
            .features
            .fetch(&feature)
            .await
            .map_err(|e| ForgeError::provisioning(step.clone(), e.to_string()))?;

        let dir = format!("{}/{}", FEATURE_STAGING_DIR, feature.staging_name());
        let mkdir = ExecRequest {
            argv: vec!["mkdir".to_string(), "-p".to_string(), dir.clone()],
            workdir: "/".to_string(),
            user: Some("root".to_string()),
            env: Vec::new(),
        };
        let outcome = self.exec(container_id, &mkdir).await?;
        if !outcome.success() {
            return Err(ForgeError::provisioning(step, outcome.output.trim().to_string()));
        }

        let options = UploadToContainerOptions {
            path: dir.clone(),
            ..Default::default()
        };
        self.client
            .upload_to_container(container_id, Some(options), archive.into())
            .await
            .map_err(|e| step_error(step, e))?;

        debug!(feature = %feature, dir = %dir, "Feature staged");
        Ok(PathBuf::from(dir))
    }

    fn exec_options(request: &ExecRequest, attach: bool) -> CreateExecOptions<String> {
        let env: Vec<String> = request
            .env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        CreateExecOptions {
            cmd: Some(request.argv.clone()),
            working_dir: Some(request.workdir.clone()),
            user: request.user.clone(),
            env: (!env.is_empty()).then_some(env),
            attach_stdout: Some(attach),
            attach_stderr: Some(attach),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Provisioner for DockerProvisioner {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn fetches_remote_features(&self) -> bool {
        true
    }

    async fn resolve_image(&self, source: &ImageSource, descriptor_dir: &Path) -> ForgeResult<String> {
        match source {
            ImageSource::Image(image) => {
                self.pull_image(image).await?;
                Ok(image.clone())
            }
            ImageSource::Dockerfile {
                context,
                dockerfile,
                args,
            } => {
                let context = descriptor_dir.join(context);
                let dockerfile = descriptor_dir.join(dockerfile);
                self.build_image(&context, &dockerfile, args).await
            }
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> ForgeResult<String> {
        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .ports
            .iter()
            .map(|p| (format!("{}/tcp", p.container_port), HashMap::new()))
            .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), KEEP_ALIVE.to_string()]),
            working_dir: Some(spec.workspace_folder.clone()),
            labels: Some(spec.labels.clone().into_iter().collect()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                mounts: Some(vec![docker_mount(&spec.workspace_mount)]),
                port_bindings: Some(port_bindings(&spec.ports)),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };
        let container = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| step_error(LifecycleStep::MountWorkspace, e))?;

        info!(container = %container.id, name = %spec.name, "Container created");
        Ok(container.id)
    }

    async fn start_container(&self, container_id: &str) -> ForgeResult<()> {
        self.client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ForgeError::EnvironmentError(format!("Failed to start container: {}", e)))
    }

    async fn install_feature(&self, container_id: &str, feature: &FeatureInstall) -> ForgeResult<()> {
        let step = LifecycleStep::InstallFeature(feature.id.clone());
        let dir = match &feature.source {
            FeatureSource::Local(dir) => dir.clone(),
            FeatureSource::Remote(reference) => self.stage_remote_feature(container_id, reference).await?,
        };

        let request = ExecRequest {
            argv: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "chmod +x ./install.sh && ./install.sh".to_string(),
            ],
            workdir: dir.display().to_string(),
            user: Some("root".to_string()),
            env: feature.option_env(),
        };
        let outcome = self.exec(container_id, &request).await?;
        if !outcome.success() {
            return Err(ForgeError::provisioning(
                step,
                format!("install.sh exited with {}: {}", outcome.exit_code, outcome.output.trim()),
            ));
        }
        Ok(())
    }

    async fn apply_customizations(
        &self,
        container_id: &str,
        customizations: &EditorCustomizations,
    ) -> ForgeResult<()> {
        let document = serde_json::json!({
            "extensions": customizations.extensions,
            "settings": customizations.settings,
        });
        let request = ExecRequest {
            argv: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                format!(
                    "mkdir -p \"$(dirname {path})\" && printf '%s' \"$FORGE_CUSTOMIZATIONS\" > {path}",
                    path = CUSTOMIZATIONS_PATH
                ),
            ],
            workdir: "/".to_string(),
            user: None,
            env: vec![("FORGE_CUSTOMIZATIONS".to_string(), document.to_string())],
        };

        let outcome = self.exec(container_id, &request).await?;
        if !outcome.success() {
            return Err(ForgeError::provisioning(
                LifecycleStep::ApplyCustomizations,
                outcome.output.trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn exec(&self, container_id: &str, request: &ExecRequest) -> ForgeResult<ExecOutcome> {
        let exec = self
            .client
            .create_exec(container_id, Self::exec_options(request, true))
            .await
            .map_err(exec_error)?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } =
            self.client.start_exec(&exec.id, None).await.map_err(exec_error)?
        {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(exec_error)?;
                output.push_str(&chunk.to_string());
            }
        }

        let inspect = self.client.inspect_exec(&exec.id).await.map_err(exec_error)?;
        let exit_code = inspect.exit_code.unwrap_or(-1);
        debug!(container = %container_id, exit_code, "Exec finished");

        Ok(ExecOutcome { exit_code, output })
    }

    async fn exec_detached(&self, container_id: &str, request: &ExecRequest) -> ForgeResult<String> {
        let exec = self
            .client
            .create_exec(container_id, Self::exec_options(request, false))
            .await
            .map_err(exec_error)?;
        let options = StartExecOptions {
            detach: true,
            ..Default::default()
        };
        self.client
            .start_exec(&exec.id, Some(options))
            .await
            .map_err(exec_error)?;

        debug!(container = %container_id, exec = %exec.id, "Detached exec started");
        Ok(exec.id)
    }

    async fn exec_status(&self, handle: &str) -> ForgeResult<Option<i64>> {
        let inspect = self.client.inspect_exec(handle).await.map_err(exec_error)?;
        if inspect.running.unwrap_or(false) {
            return Ok(None);
        }
        Ok(Some(inspect.exit_code.unwrap_or(-1)))
    }

    async fn stop(&self, container_id: &str) -> ForgeResult<()> {
        self.client
            .stop_container(container_id, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await
            .map_err(|e| ForgeError::EnvironmentError(format!("Failed to stop container: {}", e)))
    }

    async fn remove(&self, container_id: &str) -> ForgeResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.client
            .remove_container(container_id, Some(options))
            .await
            .map_err(|e| ForgeError::EnvironmentError(format!("Failed to remove container: {}", e)))
    }
}

fn step_error(step: LifecycleStep, e: bollard::errors::Error) -> ForgeError {
    ForgeError::provisioning(step, e.to_string())
}

fn exec_error(e: bollard::errors::Error) -> ForgeError {
    ForgeError::EnvironmentError(format!("exec failed: {}", e))
}

fn docker_mount(spec: &MountSpec) -> Mount {
    let typ = match spec.kind {
        MountKind::Bind => MountTypeEnum::BIND,
        MountKind::Volume => MountTypeEnum::VOLUME,
        MountKind::Tmpfs => MountTypeEnum::TMPFS,
    };
    Mount {
        target: Some(spec.target.clone()),
        source: (!spec.source.is_empty()).then(|| spec.source.clone()),
        typ: Some(typ),
        read_only: spec.read_only.then_some(true),
        consistency: spec.consistency.clone(),
        ..Default::default()
    }
}

fn port_bindings(ports: &[PortBinding]) -> HashMap<String, Option<Vec<DockerPortBinding>>> {
    ports
        .iter()
        .map(|p| {
            (
                format!("{}/tcp", p.container_port),
                Some(vec![DockerPortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(p.host_port.to_string()),
                }]),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_workspace_mount_translation() {
        let spec: MountSpec = "source=/home/dev/mockhouse,target=/workspaces/mockhouse,type=bind,consistency=cached"
            .parse()
            .unwrap();
        let mount = docker_mount(&spec);
        assert_eq!(mount.typ, Some(MountTypeEnum::BIND));
        assert_eq!(mount.source.as_deref(), Some("/home/dev/mockhouse"));
        assert_eq!(mount.target.as_deref(), Some("/workspaces/mockhouse"));
        assert_eq!(mount.consistency.as_deref(), Some("cached"));
        assert_eq!(mount.read_only, None);
    }

    #[test]
    fn test_detached_exec_options_do_not_attach() {
        let request = ExecRequest {
            argv: vec!["mockhouse_flask".into(), "--port=5000".into()],
            workdir: "/workspaces/mockhouse".into(),
            user: None,
            env: vec![("FLASK_ENV".into(), "development".into())],
        };
        let detached = DockerProvisioner::exec_options(&request, false);
        assert_eq!(detached.attach_stdout, Some(false));
        assert_eq!(detached.env, Some(vec!["FLASK_ENV=development".to_string()]));

        let attached = DockerProvisioner::exec_options(&request, true);
        assert_eq!(attached.attach_stderr, Some(true));
        assert_eq!(attached.working_dir.as_deref(), Some("/workspaces/mockhouse"));
    }

    #[test]
    fn test_port_bindings_publish_on_loopback() {
        let bindings = port_bindings(&[PortBinding {
            container_port: 5000,
            host_port: 8081,
        }]);
        let published = bindings["5000/tcp"].as_ref().unwrap();
        assert_eq!(published[0].host_port.as_deref(), Some("8081"));
        assert_eq!(published[0].host_ip.as_deref(), Some("127.0.0.1"));
    }

    #[tokio::test]
    async fn test_docker_client_initialization() {
        if !DockerProvisioner::is_docker_available().await {
            return;
        }
        let provisioner = DockerProvisioner::new().unwrap();
        assert_eq!(provisioner.name(), "docker");
        assert!(provisioner.fetches_remote_features());
        assert!(!provisioner.is_simulated());
    }
}
