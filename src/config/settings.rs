use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::{Backend, ForgeError, ForgeResult};

pub const ENV_PREFIX: &str = "FORGE";
pub const SETTINGS_FILE: &str = "forge.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 8081,
            end: 65535,
        }
    }
}

/// Tool settings, layered: defaults, user config file, `./forge.toml`, then `FORGE_*` env vars.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    pub log_level: String,
    pub state_dir: Option<PathBuf>,
    pub backend: Backend,
    pub port_range: PortRange,
    pub activation_timeout_secs: u64,
    pub activation_poll_ms: u64,
    /// How long a detached `postStartCommand` is watched for an early exit.
    pub post_start_grace_ms: u64,
    /// Skip remote features that cannot be fetched instead of failing provisioning.
    pub allow_unfetched_features: bool,
    pub open_browser: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            state_dir: None,
            backend: Backend::Docker,
            port_range: PortRange::default(),
            activation_timeout_secs: 60,
            activation_poll_ms: 500,
            post_start_grace_ms: 2000,
            allow_unfetched_features: false,
            open_browser: true,
        }
    }
}

impl Settings {
    pub fn new() -> ForgeResult<Self> {
        let user_file = dirs::config_dir().map(|dir| dir.join("forge").join(SETTINGS_FILE));
        Self::load(user_file.as_deref(), Some(Path::new(SETTINGS_FILE)))
    }

    pub fn load(user_file: Option<&Path>, local_file: Option<&Path>) -> ForgeResult<Self> {
        let defaults = Settings::default();
        let mut builder = config::Config::builder()
            .set_default("log_level", defaults.log_level.clone())
            .and_then(|b| b.set_default("backend", defaults.backend.to_string()))
            .and_then(|b| b.set_default("port_range.start", i64::from(defaults.port_range.start)))
            .and_then(|b| b.set_default("port_range.end", i64::from(defaults.port_range.end)))
            .and_then(|b| {
                b.set_default("activation_timeout_secs", defaults.activation_timeout_secs as i64)
            })
            .and_then(|b| b.set_default("activation_poll_ms", defaults.activation_poll_ms as i64))
            .and_then(|b| b.set_default("post_start_grace_ms", defaults.post_start_grace_ms as i64))
            .and_then(|b| b.set_default("allow_unfetched_features", defaults.allow_unfetched_features))
            .and_then(|b| b.set_default("open_browser", defaults.open_browser))
            .map_err(settings_error)?;

        for file in [user_file, local_file].into_iter().flatten() {
            builder = builder.add_source(config::File::from(file).required(false));
        }

        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(settings_error)?;

        settings.check()?;
        Ok(settings)
    }

    fn check(&self) -> ForgeResult<()> {
        if self.port_range.start == 0 || self.port_range.start > self.port_range.end {
            return Err(ForgeError::ConfigError(format!(
                "port_range {}..{} is empty",
                self.port_range.start, self.port_range.end
            )));
        }
        if self.activation_poll_ms == 0 {
            return Err(ForgeError::ConfigError(
                "activation_poll_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("forge")
                .join("state")
        })
    }
}

fn settings_error(e: config::ConfigError) -> ForgeError {
    ForgeError::ConfigError(format!("failed to load settings: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults_without_files() {
        let settings = Settings::load(None, None).unwrap();
        assert_eq!(settings.log_level, Settings::default().log_level);
        assert_eq!(settings.port_range, PortRange::default());
        assert!(settings.state_dir().ends_with("forge/state"));
        assert_eq!(settings.post_start_grace_ms, 2000);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "backend = \"dry-run\"\nstate_dir = \"/tmp/forge-test\"\n[port_range]\nstart = 9000\nend = 9100"
        )
        .unwrap();

        let settings = Settings::load(Some(file.path()), None).unwrap();
        assert_eq!(settings.backend, Backend::DryRun);
        assert_eq!(settings.port_range, PortRange { start: 9000, end: 9100 });
        assert_eq!(settings.state_dir(), PathBuf::from("/tmp/forge-test"));
        assert!(settings.open_browser);
    }

    #[test]
    fn test_rejects_empty_port_range() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[port_range]\nstart = 9100\nend = 9000").unwrap();

        assert!(matches!(
            Settings::load(Some(file.path()), None),
            Err(ForgeError::ConfigError(_))
        ));
    }
}
