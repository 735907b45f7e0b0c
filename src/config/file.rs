//! JSON and YAML configuration files.

use std::path::Path;

use super::{ConfigError, ConfigResult, TrackerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
}

impl Format {
    fn of(path: &Path) -> Option<Self> {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("json") => Some(Self::Json),
            Some("yaml" | "yml") => Some(Self::Yaml),
            _ => None,
        }
    }
}

fn from_yaml(content: &str) -> ConfigResult<TrackerConfig> {
    serde_yaml_bw::from_str(content).map_err(|e| ConfigError::Yaml(e.to_string()))
}

impl TrackerConfig {
    /// Loads a JSON or YAML file. The format follows the extension; files
    /// without a known extension are tried as JSON, then YAML.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match Format::of(path) {
            Some(Format::Json) => Ok(serde_json::from_str(&content)?),
            Some(Format::Yaml) => from_yaml(&content),
            None => serde_json::from_str(&content).or_else(|_| from_yaml(&content)),
        }
    }
}
