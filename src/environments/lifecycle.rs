use std::fmt;
use std::time::Duration;

use crate::config::DevContainerConfig;

/// One step of bringing an environment up, in the order they run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleStep {
    ResolveImage,
    MountWorkspace,
    InstallFeature(String),
    ApplyCustomizations,
    PostCreate,
    PostStart,
    ForwardPorts,
}

impl fmt::Display for LifecycleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleStep::ResolveImage => write!(f, "resolve image"),
            LifecycleStep::MountWorkspace => write!(f, "mount workspace"),
            LifecycleStep::InstallFeature(id) => write!(f, "install feature {}", id),
            LifecycleStep::ApplyCustomizations => write!(f, "apply editor customizations"),
            LifecycleStep::PostCreate => write!(f, "postCreateCommand"),
            LifecycleStep::PostStart => write!(f, "postStartCommand"),
            LifecycleStep::ForwardPorts => write!(f, "forward ports"),
        }
    }
}

/// What a failing step does to the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abort setup.
    Fatal,
    /// Abort setup; the container is kept in a partially provisioned state.
    FatalLeavesPartial,
    /// Surface to the user; the container stays usable.
    ReportOnly,
}

impl LifecycleStep {
    pub fn failure_policy(&self) -> FailurePolicy {
        match self {
            LifecycleStep::PostCreate => FailurePolicy::FatalLeavesPartial,
            LifecycleStep::PostStart | LifecycleStep::ForwardPorts => FailurePolicy::ReportOnly,
            _ => FailurePolicy::Fatal,
        }
    }

    /// Steps that repeat on every session start.
    pub fn is_session_step(&self) -> bool {
        matches!(self, LifecycleStep::PostStart | LifecycleStep::ForwardPorts)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Skipped(String),
    Failed(String),
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Completed => write!(f, "done"),
            StepOutcome::Skipped(reason) => write!(f, "skipped ({})", reason),
            StepOutcome::Failed(message) => write!(f, "failed: {}", message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub step: LifecycleStep,
    pub outcome: StepOutcome,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecyclePlan {
    pub steps: Vec<LifecycleStep>,
}

impl LifecyclePlan {
    /// Features are listed in declaration order, but none of them depends on another,
    /// so that order carries no meaning.
    pub fn from_config(config: &DevContainerConfig) -> Self {
        let mut steps = vec![LifecycleStep::ResolveImage, LifecycleStep::MountWorkspace];
        steps.extend(
            config
                .features
                .keys()
                .map(|id| LifecycleStep::InstallFeature(id.clone())),
        );
        steps.push(LifecycleStep::ApplyCustomizations);
        if config.post_create_command.is_some() {
            steps.push(LifecycleStep::PostCreate);
        }
        if config.post_start_command.is_some() {
            steps.push(LifecycleStep::PostStart);
        }
        if !config.forward_ports.is_empty() {
            steps.push(LifecycleStep::ForwardPorts);
        }
        Self { steps }
    }

    /// Steps that run once, when the environment is created.
    pub fn provisioning_steps(&self) -> impl Iterator<Item = &LifecycleStep> {
        self.steps.iter().filter(|s| !s.is_session_step())
    }

    /// Steps that run on every session start, the first one included.
    pub fn session_steps(&self) -> impl Iterator<Item = &LifecycleStep> {
        self.steps.iter().filter(|s| s.is_session_step())
    }
}

impl fmt::Display for LifecyclePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            let when = if step.is_session_step() {
                "every session"
            } else {
                "once"
            };
            writeln!(f, "{:>2}. {} ({})", i + 1, step, when)?;
        }
        Ok(())
    }
}
