use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

use crate::config::devcontainer::{basename, DevContainerConfig};

lazy_static! {
    static ref VARIABLE: Regex = Regex::new(r"\$\{([^}]+)\}").expect("variable pattern is valid");
}

/// Values available to `${...}` references in a descriptor.
#[derive(Debug, Clone)]
pub struct SubstitutionContext {
    pub local_workspace_folder: String,
    pub container_workspace_folder: String,
    pub local_env: HashMap<String, String>,
}

impl SubstitutionContext {
    pub fn new(local_workspace: &Path, container_workspace_folder: impl Into<String>) -> Self {
        Self {
            local_workspace_folder: local_workspace.display().to_string(),
            container_workspace_folder: container_workspace_folder.into(),
            local_env: std::env::vars().collect(),
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.local_env = env;
        self
    }

    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "localWorkspaceFolder" => Some(self.local_workspace_folder.clone()),
            "localWorkspaceFolderBasename" => {
                Some(basename(Path::new(&self.local_workspace_folder)))
            }
            "containerWorkspaceFolder" => Some(self.container_workspace_folder.clone()),
            "containerWorkspaceFolderBasename" => {
                Some(basename(Path::new(&self.container_workspace_folder)))
            }
            _ => {
                let rest = name.strip_prefix("localEnv:").or_else(|| name.strip_prefix("env:"))?;
                let (var, default) = match rest.split_once(':') {
                    Some((var, default)) => (var, Some(default)),
                    None => (rest, None),
                };
                self.local_env
                    .get(var)
                    .cloned()
                    .or_else(|| default.map(str::to_string))
                    .or_else(|| Some(String::new()))
            }
        }
    }

    /// Expand every known `${...}` reference. Unknown ones are kept verbatim.
    pub fn substitute(&self, input: &str) -> String {
        VARIABLE
            .replace_all(input, |caps: &Captures| match self.lookup(&caps[1]) {
                Some(value) => value,
                None => {
                    warn!(variable = %&caps[1], "Unknown variable left unexpanded");
                    caps[0].to_string()
                }
            })
            .into_owned()
    }
}

/// A resolved copy of `config` with variables expanded in the workspace and command fields.
pub fn substitute_config(config: &DevContainerConfig, ctx: &SubstitutionContext) -> DevContainerConfig {
    let mut resolved = config.clone();
    let expand = |s: &str| ctx.substitute(s);

    resolved.workspace_folder = config.workspace_folder.as_deref().map(expand);
    resolved.workspace_mount = config.workspace_mount.as_deref().map(expand);
    resolved.post_create_command = config.post_create_command.as_ref().map(|c| c.map_strings(&expand));
    resolved.post_start_command = config.post_start_command.as_ref().map(|c| c.map_strings(&expand));
    resolved
}
