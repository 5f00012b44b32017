//! Host environment managers.

use serde::Deserialize;
use thiserror::Error;

use crate::process::{display_command, run_command};

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("`{command}` exited with code {code}: {detail}")]
    Failed {
        command: String,
        code: i32,
        detail: String,
    },
    #[error("unexpected output from `{command}`: {source}")]
    Parse {
        command: String,
        source: serde_json::Error,
    },
}

/// Queries and mutations against one host environment manager.
///
/// Calls block until the host command finishes.
pub trait EnvironmentBackend: Send + Sync {
    /// Manager name for diagnostics, e.g. `conda`.
    fn name(&self) -> &str;

    /// Version string; an error means the manager is unavailable.
    fn manager_version(&self) -> Result<String, BackendError>;

    fn list_environments(&self) -> Result<Vec<String>, BackendError>;

    /// Packages known to the environment manager inside `env`.
    fn list_manager_packages(&self, env: &str) -> Result<Vec<String>, BackendError>;

    /// Packages known to the dependency manager (pip) inside `env`.
    fn list_dependency_packages(&self, env: &str) -> Result<Vec<String>, BackendError>;

    fn create_environment(&self, env: &str, python: &str) -> Result<(), BackendError>;

    fn install_manager_package(&self, env: &str, spec: &str) -> Result<(), BackendError>;

    fn install_dependency_package(&self, env: &str, spec: &str) -> Result<(), BackendError>;
}

/// Conda (or a drop-in such as mamba) driven through its CLI.
#[derive(Debug, Clone)]
pub struct CondaBackend {
    program: String,
}

impl Default for CondaBackend {
    fn default() -> Self {
        Self::new("conda")
    }
}

impl CondaBackend {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String, BackendError> {
        let command = display_command(&self.program, args);
        tracing::debug!(command = %command, "running host command");

        let output = run_command(&self.program, args).map_err(|source| BackendError::Spawn {
            command: command.clone(),
            source,
        })?;
        if !output.success() {
            let detail = last_line(&output.stderr)
                .or_else(|| last_line(&output.stdout))
                .unwrap_or("no output")
                .to_string();
            return Err(BackendError::Failed {
                command,
                code: output.code,
                detail,
            });
        }
        Ok(output.stdout)
    }

    fn run_json<T: for<'de> Deserialize<'de>>(&self, args: &[&str]) -> Result<T, BackendError> {
        let stdout = self.run(args)?;
        serde_json::from_str(&stdout).map_err(|source| BackendError::Parse {
            command: display_command(&self.program, args),
            source,
        })
    }
}

impl EnvironmentBackend for CondaBackend {
    fn name(&self) -> &str {
        &self.program
    }

    fn manager_version(&self) -> Result<String, BackendError> {
        Ok(self.run(&["--version"])?.trim().to_string())
    }

    fn list_environments(&self) -> Result<Vec<String>, BackendError> {
        let listing: EnvList = self.run_json(&["env", "list", "--json"])?;
        Ok(environment_names(&listing))
    }

    fn list_manager_packages(&self, env: &str) -> Result<Vec<String>, BackendError> {
        let packages: Vec<PackageEntry> = self.run_json(&["list", "-n", env, "--json"])?;
        Ok(packages.into_iter().map(|p| p.name).collect())
    }

    fn list_dependency_packages(&self, env: &str) -> Result<Vec<String>, BackendError> {
        let packages: Vec<PackageEntry> = self.run_json(&[
            "run", "-n", env, "python", "-m", "pip", "list", "--format", "json",
        ])?;
        Ok(packages.into_iter().map(|p| p.name).collect())
    }

    fn create_environment(&self, env: &str, python: &str) -> Result<(), BackendError> {
        let python = format!("python={python}");
        self.run(&["create", "-n", env, &python, "-y"]).map(drop)
    }

    fn install_manager_package(&self, env: &str, spec: &str) -> Result<(), BackendError> {
        self.run(&["install", "-n", env, "-y", spec]).map(drop)
    }

    fn install_dependency_package(&self, env: &str, spec: &str) -> Result<(), BackendError> {
        self.run(&["run", "-n", env, "python", "-m", "pip", "install", spec])
            .map(drop)
    }
}

#[derive(Debug, Deserialize)]
struct EnvList {
    #[serde(default)]
    envs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PackageEntry {
    name: String,
}

/// Environment names are the final component of each listed prefix.
fn environment_names(listing: &EnvList) -> Vec<String> {
    listing
        .envs
        .iter()
        .filter_map(|prefix| {
            let trimmed = prefix.trim_end_matches(['/', '\\']);
            // Windows prefixes may reach us on any host.
            let last = trimmed.rsplit(['/', '\\']).next()?;
            (!last.is_empty()).then(|| last.to_string())
        })
        .collect()
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().rev().map(str::trim).find(|l| !l.is_empty())
}
