//! Parse, validate and provision development environments described by
//! `devcontainer.json` descriptors.

pub mod cli;
pub mod config;
pub mod core;
#[cfg(feature = "docker")]
pub mod docker;
pub mod environments;
pub mod monitoring;

pub use crate::config::{DevContainerConfig, Settings};
pub use crate::core::{ForgeError, ForgeResult};
pub use crate::environments::EnvironmentManager;
