//! Environment registry.
//!
//! Declares the named execution environments the workers run in. The
//! default registry is embedded at compile time from
//! `contrib/environments.toml`; a file with the same layout can replace it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

use crate::normalize::AliasTable;

const BUILTIN_ENVIRONMENTS: &str = include_str!("../../../contrib/environments.toml");

static BUILTIN: OnceLock<Registry> = OnceLock::new();

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid registry TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("environment declared twice: {0}")]
    Duplicate(String),
    #[error("environment name must be non-empty")]
    EmptyName,
    #[error("environment {name}: python version must be non-empty")]
    MissingPython { name: String },
}

/// One named execution environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSpec {
    pub name: String,
    /// Interpreter version passed to `python=<version>` at creation.
    pub python: String,
    #[serde(default, alias = "manager_packages")]
    pub manager_packages: Vec<String>,
    #[serde(default, alias = "dependency_packages")]
    pub dependency_packages: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    aliases: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    environments: Vec<EnvironmentSpec>,
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    environments: Vec<EnvironmentSpec>,
    aliases: AliasTable,
}

impl Registry {
    /// The embedded registry. A broken embedded document yields an empty
    /// registry and an error log.
    pub fn builtin() -> &'static Registry {
        BUILTIN.get_or_init(|| {
            Registry::from_toml(BUILTIN_ENVIRONMENTS).unwrap_or_else(|e| {
                tracing::error!(error = %e, "embedded environment registry is invalid");
                Registry::default()
            })
        })
    }

    pub fn from_toml(src: &str) -> Result<Self, RegistryError> {
        let file: RegistryFile = toml::from_str(src)?;

        let mut seen = BTreeSet::new();
        for env in &file.environments {
            if env.name.trim().is_empty() {
                return Err(RegistryError::EmptyName);
            }
            if env.python.trim().is_empty() {
                return Err(RegistryError::MissingPython {
                    name: env.name.clone(),
                });
            }
            if !seen.insert(env.name.as_str()) {
                return Err(RegistryError::Duplicate(env.name.clone()));
            }
        }

        Ok(Self {
            aliases: AliasTable::new(&file.aliases),
            environments: file.environments,
        })
    }

    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let src = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let registry = Self::from_toml(&src)?;
        tracing::info!(
            path = %path.display(),
            environments = registry.environments.len(),
            aliases = registry.aliases().len(),
            "environment registry loaded"
        );
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&EnvironmentSpec> {
        self.environments.iter().find(|e| e.name == name)
    }

    /// Environments in declaration order.
    pub fn environments(&self) -> &[EnvironmentSpec] {
        &self.environments
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.environments.iter().map(|e| e.name.as_str())
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }
}
