use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const DEFAULT_PERMISSION_MODE: &str = "bypassPermissions";

/// How to launch and identify one kind of agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub capabilities: ProviderCapabilities,
    #[serde(default = "default_permission_mode")]
    pub permission_mode: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCapabilities {
    #[serde(default)]
    pub read_text_file: bool,
    #[serde(default)]
    pub write_text_file: bool,
    #[serde(default = "default_true")]
    pub terminal: bool,
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            read_text_file: false,
            write_text_file: false,
            terminal: true,
        }
    }
}

impl Provider {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

fn default_permission_mode() -> String {
    DEFAULT_PERMISSION_MODE.to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid provider json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("failed to read provider file {path}: {error}")]
    Read {
        path: String,
        #[source]
        error: std::io::Error,
    },
    #[error("unable to resolve providers from blob")]
    UnsupportedBlob,
    #[error("provider '{0}' is declared more than once")]
    DuplicateProvider(String),
    #[error("provider '{0}' has an empty command")]
    MissingCommand(String),
}

/// Immutable set of configured providers, looked up by id.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Provider>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Provider>) -> Result<Self, RegistryError> {
        let mut seen = std::collections::HashSet::new();
        for provider in &providers {
            if !seen.insert(provider.id.as_str()) {
                return Err(RegistryError::DuplicateProvider(provider.id.clone()));
            }
            if provider.command.trim().is_empty() {
                return Err(RegistryError::MissingCommand(provider.id.clone()));
            }
        }
        Ok(Self { providers })
    }

    pub fn from_blob(blob: &str) -> Result<Self, RegistryError> {
        let value: Value = serde_json::from_str(blob)?;
        Self::from_value(value)
    }

    pub fn from_file(path: &Path) -> Result<Self, RegistryError> {
        let blob = std::fs::read_to_string(path).map_err(|error| RegistryError::Read {
            path: path.display().to_string(),
            error,
        })?;
        Self::from_blob(&blob)
    }

    pub fn from_value(value: Value) -> Result<Self, RegistryError> {
        if value.is_array() {
            let providers: Vec<Provider> = serde_json::from_value(value)?;
            return Self::new(providers);
        }

        if value.get("providers").is_some() {
            let doc: ProviderDocument = serde_json::from_value(value)?;
            return Self::new(doc.providers);
        }

        if value.get("id").is_some() && value.get("command").is_some() {
            let provider: Provider = serde_json::from_value(value)?;
            return Self::new(vec![provider]);
        }

        Err(RegistryError::UnsupportedBlob)
    }

    pub fn get(&self, id: &str) -> Option<&Provider> {
        self.providers.iter().find(|provider| provider.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Provider> {
        self.providers.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct ProviderDocument {
    providers: Vec<Provider>,
}

/// `provider` as sent by the editor: either a registry id or inline config.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProviderRef {
    Id(String),
    Inline(Box<Provider>),
}

impl ProviderRef {
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Inline(provider) => &provider.id,
        }
    }
}
