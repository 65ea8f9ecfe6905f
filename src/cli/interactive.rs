use anyhow::Result;
use dialoguer::{theme::ColorfulTheme, Confirm, Input, MultiSelect, Select};
use indexmap::IndexMap;
use serde_json::{json, Map, Value};

use crate::config::devcontainer::{CustomizationsConfig, VSCodeConfig};
use crate::config::{DevContainerConfig, ForwardPort, LifecycleCommand, OnAutoForward, PortAttributes};

const EXTENSIONS: &[&str] = &[
    "ms-python.python",
    "ms-python.vscode-pylance",
    "ms-python.black-formatter",
    "ms-python.flake8",
    "ms-python.isort",
];

const FEATURES: &[&str] = &[
    "ghcr.io/devcontainers/features/common-utils:2",
    "ghcr.io/devcontainers/features/git:1",
    "ghcr.io/devcontainers/features/docker-in-docker:2",
    "ghcr.io/devcontainers/features/node:1",
];

const AUTO_FORWARD: &[OnAutoForward] = &[
    OnAutoForward::OpenBrowser,
    OnAutoForward::OpenBrowserOnce,
    OnAutoForward::Notify,
    OnAutoForward::OpenPreview,
    OnAutoForward::Silent,
];

/// Everything `forge init` asks for. The defaults describe the mockhouse Flask layout.
#[derive(Debug, Clone, PartialEq)]
pub struct InitAnswers {
    pub name: String,
    pub image: String,
    pub post_create: String,
    pub post_start: String,
    pub port: u16,
    pub label: String,
    pub on_auto_forward: OnAutoForward,
    pub extensions: Vec<String>,
    pub features: Vec<String>,
}

impl Default for InitAnswers {
    fn default() -> Self {
        Self {
            name: "mockhouse".to_string(),
            image: "mcr.microsoft.com/devcontainers/python:1-3.11-bullseye".to_string(),
            post_create: "make install".to_string(),
            post_start: "mockhouse_flask --host=0.0.0.0 --port=5000 --debug".to_string(),
            port: 5000,
            label: "Flask App".to_string(),
            on_auto_forward: OnAutoForward::OpenBrowser,
            extensions: EXTENSIONS[..4].iter().map(|s| s.to_string()).collect(),
            features: FEATURES[..2].iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl InitAnswers {
    pub fn into_config(self) -> DevContainerConfig {
        let mut settings = Map::new();
        settings.insert(
            "python.defaultInterpreterPath".into(),
            json!("/usr/local/bin/python"),
        );
        settings.insert("editor.formatOnSave".into(), json!(true));
        settings.insert(
            "[python]".into(),
            json!({"editor.defaultFormatter": "ms-python.black-formatter"}),
        );
        settings.insert("flake8.args".into(), json!(["--max-line-length=88"]));

        let mut ports_attributes = IndexMap::new();
        ports_attributes.insert(
            self.port.to_string(),
            PortAttributes {
                label: Some(self.label),
                on_auto_forward: Some(self.on_auto_forward),
                ..Default::default()
            },
        );

        let non_empty = |command: String| {
            (!command.trim().is_empty()).then(|| LifecycleCommand::Shell(command))
        };

        DevContainerConfig {
            name: Some(self.name),
            image: Some(self.image),
            customizations: Some(CustomizationsConfig {
                vscode: Some(VSCodeConfig {
                    extensions: self.extensions,
                    settings,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            post_create_command: non_empty(self.post_create),
            post_start_command: non_empty(self.post_start),
            forward_ports: vec![ForwardPort::Local(self.port)],
            ports_attributes,
            features: self
                .features
                .into_iter()
                .map(|id| (id, Value::Object(Map::new())))
                .collect(),
            ..Default::default()
        }
    }
}

/// Interactive scaffolding for a new descriptor
pub struct InitWizard;

impl InitWizard {
    pub fn prompt() -> Result<InitAnswers> {
        let theme = ColorfulTheme::default();
        let defaults = InitAnswers::default();

        let name: String = Input::with_theme(&theme)
            .with_prompt("Environment name")
            .default(defaults.name)
            .interact_text()?;

        let image: String = Input::with_theme(&theme)
            .with_prompt("Base image")
            .default(defaults.image)
            .validate_with(|input: &String| {
                if input.trim().is_empty() {
                    Err("An image is required")
                } else {
                    Ok(())
                }
            })
            .interact_text()?;

        let post_create: String = Input::with_theme(&theme)
            .with_prompt("Command to run once after creation")
            .default(defaults.post_create)
            .allow_empty(true)
            .interact_text()?;

        let post_start: String = Input::with_theme(&theme)
            .with_prompt("Command to run on every start")
            .default(defaults.post_start)
            .allow_empty(true)
            .interact_text()?;

        let port: u16 = Input::with_theme(&theme)
            .with_prompt("Port to forward")
            .default(defaults.port)
            .validate_with(|port: &u16| if *port == 0 { Err("Port must be 1-65535") } else { Ok(()) })
            .interact_text()?;

        let label: String = Input::with_theme(&theme)
            .with_prompt("Port label")
            .default(defaults.label)
            .interact_text()?;

        let selection = Select::with_theme(&theme)
            .with_prompt("When the port starts listening")
            .items(AUTO_FORWARD)
            .default(0)
            .interact()?;

        let extensions = Self::pick(&theme, "Editor extensions", EXTENSIONS, &defaults.extensions)?;
        let features = Self::pick(&theme, "Container features", FEATURES, &defaults.features)?;

        Ok(InitAnswers {
            name,
            image,
            post_create,
            post_start,
            port,
            label,
            on_auto_forward: AUTO_FORWARD[selection],
            extensions,
            features,
        })
    }

    pub fn confirm_overwrite(path: &std::path::Path) -> Result<bool> {
        Ok(Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("{} exists. Overwrite?", path.display()))
            .default(false)
            .interact()?)
    }

    fn pick(theme: &ColorfulTheme, prompt: &str, items: &[&str], chosen: &[String]) -> Result<Vec<String>> {
        let checked: Vec<bool> = items
            .iter()
            .map(|item| chosen.iter().any(|c| c == item))
            .collect();
        let selected = MultiSelect::with_theme(theme)
            .with_prompt(prompt)
            .items(items)
            .defaults(&checked)
            .interact()?;
        Ok(selected.into_iter().map(|i| items[i].to_string()).collect())
    }
}
