use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use k8s_openapi::api::core::v1::{Container, Volume};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value as JsonValue};
use serde_yaml::Value as YamlValue;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no sidecar configuration named '{0}'")]
    NotFound(String),
    #[error("sidecar configuration name '{0}' is not a plain relative path")]
    InvalidPath(String),
    #[error("failed to read sidecar configuration '{path}': {source}")]
    Read {
        path: String,
        source: io::Error,
    },
    #[error("failed to parse sidecar configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("unsupported value in sidecar configuration: {0}")]
    Normalize(String),
    #[error("failed to decode sidecar configuration: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SidecarConfig {
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

impl SidecarConfig {
    pub fn from_yaml(raw: &[u8]) -> Result<Self, ConfigError> {
        let mut document: YamlValue = serde_yaml::from_slice(raw)?;
        document.apply_merge()?;
        let normalized = normalize(document)?;
        Ok(serde_json::from_value(normalized)?)
    }
}

pub trait ConfigSource: Send + Sync {
    fn read(&self, name: &str) -> Result<Vec<u8>, ConfigError>;
}

#[derive(Debug, Clone)]
pub struct FsConfigSource {
    base_dir: PathBuf,
}

impl FsConfigSource {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, ConfigError> {
        if name.is_empty() {
            return Err(ConfigError::NotFound(name.to_string()));
        }

        let relative = Path::new(name);
        let plain = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !plain {
            return Err(ConfigError::InvalidPath(name.to_string()));
        }

        Ok(self.base_dir.join(relative))
    }
}

impl ConfigSource for FsConfigSource {
    fn read(&self, name: &str) -> Result<Vec<u8>, ConfigError> {
        let path = self.resolve(name)?;
        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ConfigError::NotFound(name.to_string()),
            _ => ConfigError::Read {
                path: path.display().to_string(),
                source: e,
            },
        })
    }
}

pub fn load(source: &dyn ConfigSource, name: &str) -> Result<SidecarConfig, ConfigError> {
    let raw = source.read(name)?;
    debug!(
        config = name,
        document = %String::from_utf8_lossy(&raw),
        "read sidecar configuration"
    );
    SidecarConfig::from_yaml(&raw)
}

fn normalize(value: YamlValue) -> Result<JsonValue, ConfigError> {
    Ok(match value {
        YamlValue::Null => JsonValue::Null,
        YamlValue::Bool(b) => JsonValue::Bool(b),
        YamlValue::Number(n) => JsonValue::Number(convert_number(&n)?),
        YamlValue::String(s) => JsonValue::String(s),
        YamlValue::Sequence(items) => JsonValue::Array(
            items
                .into_iter()
                .map(normalize)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        YamlValue::Mapping(mapping) => {
            let mut object = Map::with_capacity(mapping.len());
            for (key, value) in mapping {
                object.insert(mapping_key(key)?, normalize(value)?);
            }
            JsonValue::Object(object)
        }
        YamlValue::Tagged(tagged) => normalize(tagged.value)?,
    })
}

fn mapping_key(key: YamlValue) -> Result<String, ConfigError> {
    match key {
        YamlValue::String(s) => Ok(s),
        YamlValue::Number(n) => Ok(n.to_string()),
        YamlValue::Bool(b) => Ok(b.to_string()),
        YamlValue::Null => Ok("null".to_string()),
        YamlValue::Tagged(tagged) => mapping_key(tagged.value),
        other => Err(ConfigError::Normalize(format!(
            "mapping key {other:?} is not a scalar"
        ))),
    }
}

fn convert_number(n: &serde_yaml::Number) -> Result<Number, ConfigError> {
    if let Some(i) = n.as_i64() {
        Ok(Number::from(i))
    } else if let Some(u) = n.as_u64() {
        Ok(Number::from(u))
    } else {
        n.as_f64()
            .and_then(Number::from_f64)
            .ok_or_else(|| ConfigError::Normalize(format!("number {n} is not finite")))
    }
}
