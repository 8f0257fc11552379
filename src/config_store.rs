//! Configuration artifact shared with the program under test.
//!
//! The server and client read a flat JSON object (`config.json`) at startup.
//! The harness changes exactly one field per experiment axis and writes the
//! whole object back, so fields it knows nothing about survive unchanged:
//! key order and numeric text are kept as they were read.

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors reading, changing or writing the configuration artifact
#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error("failed to read config artifact '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config artifact '{}': {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("config artifact '{}' is not a JSON object", .path.display())]
    NotAnObject { path: PathBuf },
    #[error("field '{0}' is not present in the config artifact")]
    UnknownField(String),
    #[error("field '{0}' does not hold a scalar value")]
    NotScalar(String),
    #[error("failed to serialize config artifact: {0}")]
    Serialize(serde_json::Error),
    #[error("failed to write config artifact '{}': {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// In-memory copy of the configuration artifact
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    fields: Map<String, Value>,
}

impl Configuration {
    /// Look up a field
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Return a copy with `field` set to `value`.
    ///
    /// The field must already exist and hold a scalar, and the new value must
    /// be a scalar too. Every other field is carried over untouched.
    pub fn update(
        &self,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<Configuration, ConfigStoreError> {
        let current = self
            .fields
            .get(field)
            .ok_or_else(|| ConfigStoreError::UnknownField(field.to_string()))?;
        let value = value.into();
        if !is_scalar(current) || !is_scalar(&value) {
            return Err(ConfigStoreError::NotScalar(field.to_string()));
        }

        let mut fields = self.fields.clone();
        fields.insert(field.to_string(), value);
        Ok(Configuration { fields })
    }

    /// Render the artifact text: 4-space indented JSON with a trailing newline
    fn to_pretty(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = Vec::with_capacity(256);
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        serde::Serialize::serialize(&self.fields, &mut ser)?;
        out.push(b'\n');
        Ok(out)
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Object(_) | Value::Array(_))
}

/// Reads and writes the configuration artifact at a fixed path
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the artifact from disk
    pub fn load(&self) -> Result<Configuration, ConfigStoreError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|source| {
            ConfigStoreError::Read {
                path: self.path.clone(),
                source,
            }
        })?;

        let value: Value =
            serde_json::from_str(&contents).map_err(|source| ConfigStoreError::Parse {
                path: self.path.clone(),
                source,
            })?;

        match value {
            Value::Object(fields) => {
                debug!(path = %self.path.display(), fields = fields.len(), "Loaded config artifact");
                Ok(Configuration { fields })
            }
            _ => Err(ConfigStoreError::NotAnObject {
                path: self.path.clone(),
            }),
        }
    }

    /// Overwrite the artifact with the complete configuration.
    ///
    /// Callers pass the merged result of [`Configuration::update`]; anything
    /// missing from `config` is gone from the file afterwards.
    pub fn save(&self, config: &Configuration) -> Result<(), ConfigStoreError> {
        let bytes = config.to_pretty().map_err(ConfigStoreError::Serialize)?;
        std::fs::write(&self.path, bytes).map_err(|source| ConfigStoreError::Write {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), "Saved config artifact");
        Ok(())
    }

    /// Load, set one field, save. Returns the configuration now on disk.
    pub fn set_field(
        &self,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<Configuration, ConfigStoreError> {
        let updated = self.load()?.update(field, value)?;
        self.save(&updated)?;
        Ok(updated)
    }
}
