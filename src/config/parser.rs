use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::core::{ForgeError, ForgeResult};

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    JsonC, // JSON with comments
    Json5,
    Toml,
    Yaml,
}

impl ConfigFormat {
    /// Guess the format from a file extension. Unknown extensions are read as JSONC,
    /// which is what devcontainer tooling expects.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json5") => ConfigFormat::Json5,
            Some("toml") => ConfigFormat::Toml,
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::JsonC,
        }
    }
}

impl FromStr for ConfigFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ConfigFormat::Json),
            "jsonc" => Ok(ConfigFormat::JsonC),
            "json5" => Ok(ConfigFormat::Json5),
            "toml" => Ok(ConfigFormat::Toml),
            "yaml" | "yml" => Ok(ConfigFormat::Yaml),
            other => Err(format!("unknown format '{}'", other)),
        }
    }
}

impl fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfigFormat::Json => "json",
            ConfigFormat::JsonC => "jsonc",
            ConfigFormat::Json5 => "json5",
            ConfigFormat::Toml => "toml",
            ConfigFormat::Yaml => "yaml",
        };
        f.write_str(name)
    }
}

/// Configuration parsing options
#[derive(Debug, Clone)]
pub struct ConfigParserOptions {
    pub format: ConfigFormat,
    pub allow_comments: bool,
}

impl Default for ConfigParserOptions {
    fn default() -> Self {
        Self {
            format: ConfigFormat::Json,
            allow_comments: true,
        }
    }
}

impl ConfigParserOptions {
    pub fn for_path(path: &Path) -> Self {
        Self {
            format: ConfigFormat::from_path(path),
            ..Self::default()
        }
    }
}

pub struct ConfigParser;

impl ConfigParser {
    /// Parse configuration from a file
    pub fn parse_file<T>(path: &Path, options: Option<ConfigParserOptions>) -> ForgeResult<T>
    where
        T: DeserializeOwned,
    {
        let options = options.unwrap_or_else(|| ConfigParserOptions::for_path(path));
        let content = fs::read_to_string(path)?;

        Self::parse_str(&content, options)
    }

    /// Parse configuration from a string
    pub fn parse_str<T>(content: &str, options: ConfigParserOptions) -> ForgeResult<T>
    where
        T: DeserializeOwned,
    {
        match options.format {
            ConfigFormat::Json if !options.allow_comments => serde_json::from_str(content)
                .map_err(|e| ForgeError::ParseError(format!("invalid JSON: {}", e))),
            // json5 is a superset of JSONC: comments and trailing commas
            ConfigFormat::Json | ConfigFormat::JsonC | ConfigFormat::Json5 => {
                json5::from_str(content)
                    .map_err(|e| ForgeError::ParseError(format!("invalid JSON: {}", e)))
            }
            ConfigFormat::Toml => toml::from_str(content)
                .map_err(|e| ForgeError::ParseError(format!("invalid TOML: {}", e))),
            ConfigFormat::Yaml => serde_yaml::from_str(content)
                .map_err(|e| ForgeError::ParseError(format!("invalid YAML: {}", e))),
        }
    }

    /// Serialize a configuration back into the requested format
    pub fn to_string<T>(config: &T, format: ConfigFormat) -> ForgeResult<String>
    where
        T: Serialize,
    {
        match format {
            ConfigFormat::Json | ConfigFormat::JsonC | ConfigFormat::Json5 => {
                Ok(serde_json::to_string_pretty(config)?)
            }
            ConfigFormat::Toml => toml::to_string_pretty(config)
                .map_err(|e| ForgeError::ConfigError(format!("cannot render TOML: {}", e))),
            ConfigFormat::Yaml => serde_yaml::to_string(config)
                .map_err(|e| ForgeError::ConfigError(format!("cannot render YAML: {}", e))),
        }
    }

    /// Validate a JSON value against a JSON schema, collecting every violation
    pub fn validate_value(value: &Value, schema: &Value) -> ForgeResult<()> {
        let compiled = jsonschema::JSONSchema::compile(schema)
            .map_err(|e| ForgeError::ConfigError(format!("invalid JSON schema: {}", e)))?;

        let result = compiled.validate(value);
        if let Err(errors) = result {
            let messages: Vec<String> = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{}: {}", path, e)
                    }
                })
                .collect();
            return Err(ForgeError::SchemaError(messages));
        }

        Ok(())
    }

    /// Validate a serializable configuration against a JSON schema
    pub fn validate_config<T>(config: &T, schema: &Value) -> ForgeResult<()>
    where
        T: Serialize,
    {
        let value = serde_json::to_value(config)?;
        Self::validate_value(&value, schema)
    }

    /// Apply `overlay` to `base` as an RFC 7386 merge patch.
    /// `null` in the overlay removes the key from the base.
    pub fn merge_values(mut base: Value, overlay: &Value) -> Value {
        json_patch::merge(&mut base, overlay);
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use serde_json::json;
    use std::io::Write;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestConfig {
        name: String,
        version: u32,
        enabled: bool,
    }

    #[test]
    fn test_json_parsing() {
        let json_content = r#"{"name": "test", "version": 1, "enabled": true}"#;
        let config: TestConfig =
            ConfigParser::parse_str(json_content, ConfigParserOptions::default()).unwrap();

        assert_eq!(
            config,
            TestConfig {
                name: "test".to_string(),
                version: 1,
                enabled: true,
            }
        );
    }

    #[test]
    fn test_jsonc_comments_and_trailing_commas() {
        let content = r#"{
            // the display name
            "name": "test",
            "version": 2, /* inline */
            "enabled": false,
        }"#;
        let config: TestConfig = ConfigParser::parse_str(
            content,
            ConfigParserOptions {
                format: ConfigFormat::JsonC,
                allow_comments: true,
            },
        )
        .unwrap();
        assert_eq!(config.version, 2);

        let strict: ForgeResult<TestConfig> = ConfigParser::parse_str(
            content,
            ConfigParserOptions {
                format: ConfigFormat::Json,
                allow_comments: false,
            },
        );
        assert!(matches!(strict, Err(ForgeError::ParseError(_))));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(
            ConfigFormat::from_path(Path::new("devcontainer.json")),
            ConfigFormat::JsonC
        );
        assert_eq!(ConfigFormat::from_path(Path::new("a.yml")), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("a.toml")), ConfigFormat::Toml);
        assert_eq!("YAML".parse::<ConfigFormat>().unwrap(), ConfigFormat::Yaml);
        assert!("xml".parse::<ConfigFormat>().is_err());
    }

    #[test]
    fn test_parse_file_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "name: yaml\nversion: 3\nenabled: true").unwrap();

        let config: TestConfig = ConfigParser::parse_file(file.path(), None).unwrap();
        assert_eq!(config.name, "yaml");

        let missing: ForgeResult<TestConfig> =
            ConfigParser::parse_file(Path::new("/nonexistent/forge.json"), None);
        assert!(matches!(missing, Err(ForgeError::IoError(_))));
    }

    #[test]
    fn test_schema_validation_reports_paths() {
        let schema = json!({
            "type": "object",
            "properties": { "version": { "type": "integer" } }
        });

        assert!(ConfigParser::validate_value(&json!({"version": 1}), &schema).is_ok());

        match ConfigParser::validate_value(&json!({"version": "one"}), &schema) {
            Err(ForgeError::SchemaError(messages)) => {
                assert_eq!(messages.len(), 1);
                assert!(messages[0].starts_with("/version"));
            }
            other => panic!("expected schema error, got {:?}", other),
        }
    }

    #[test]
    fn test_merge_patch() {
        let base = json!({"name": "base", "version": 1, "extra": {"a": 1, "b": 2}});
        let overlay = json!({"name": "overlay", "extra": {"b": null, "c": 3}});

        let merged = ConfigParser::merge_values(base, &overlay);
        assert_eq!(
            merged,
            json!({"name": "overlay", "version": 1, "extra": {"a": 1, "c": 3}})
        );
    }

    #[test]
    fn test_render_formats() {
        let config = TestConfig {
            name: "render".to_string(),
            version: 4,
            enabled: true,
        };
        let yaml = ConfigParser::to_string(&config, ConfigFormat::Yaml).unwrap();
        let back: TestConfig = ConfigParser::parse_str(
            &yaml,
            ConfigParserOptions {
                format: ConfigFormat::Yaml,
                allow_comments: false,
            },
        )
        .unwrap();
        assert_eq!(back, config);

        let toml = ConfigParser::to_string(&config, ConfigFormat::Toml).unwrap();
        assert!(toml.contains("name = \"render\""));
    }
}
