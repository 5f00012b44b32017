//! Diff-based environment provisioning.
//!
//! State is never cached: every query goes back to the host manager. Query
//! failures degrade to "absent" or "nothing installed" and mutation failures
//! become report diagnostics, so callers always get an answer.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

use crate::backend::EnvironmentBackend;
use crate::normalize::canonicalize_package_name;
use crate::registry::{EnvironmentSpec, Registry};

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),
}

/// Declared specs not satisfied by what is installed, pins preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingPackages {
    pub manager: Vec<String>,
    pub dependency: Vec<String>,
}

impl MissingPackages {
    pub fn is_empty(&self) -> bool {
        self.manager.is_empty() && self.dependency.is_empty()
    }

    fn all_of(spec: &EnvironmentSpec) -> Self {
        Self {
            manager: spec.manager_packages.clone(),
            dependency: spec.dependency_packages.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentState {
    pub exists: bool,
    #[serde(rename = "packagesInstalled")]
    pub packages_complete: bool,
    pub ready: bool,
    pub missing: MissingPackages,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionReport {
    pub name: String,
    pub created: bool,
    pub installed: Vec<String>,
    pub failed: Vec<String>,
    pub ready: bool,
    pub missing: MissingPackages,
    pub diagnostics: Vec<String>,
}

impl ProvisionReport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            created: false,
            installed: Vec::new(),
            failed: Vec::new(),
            ready: false,
            missing: MissingPackages::default(),
            diagnostics: Vec::new(),
        }
    }

    fn fail(&mut self, message: String) {
        tracing::warn!(environment = %self.name, "{message}");
        self.diagnostics.push(message);
    }
}

pub struct Provisioner {
    registry: Registry,
    backend: Arc<dyn EnvironmentBackend>,
    // Serializes mutations; queries do not take it.
    provisioning: Mutex<()>,
}

impl Provisioner {
    pub fn new(registry: Registry, backend: Arc<dyn EnvironmentBackend>) -> Self {
        Self {
            registry,
            backend,
            provisioning: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn spec(&self, name: &str) -> Result<&EnvironmentSpec, ProvisionError> {
        self.registry
            .get(name)
            .ok_or_else(|| ProvisionError::UnknownEnvironment(name.to_string()))
    }

    pub fn environment_exists(&self, name: &str) -> bool {
        match self.backend.list_environments() {
            Ok(envs) => envs.iter().any(|e| e == name),
            Err(e) => {
                tracing::warn!(environment = name, error = %e, "environment listing failed");
                false
            }
        }
    }

    /// Canonical names of everything installed in `name`, from both managers.
    pub fn installed_packages(&self, name: &str) -> BTreeSet<String> {
        let listings = self
            .backend
            .list_manager_packages(name)
            .and_then(|mut all| {
                all.extend(self.backend.list_dependency_packages(name)?);
                Ok(all)
            });
        match listings {
            Ok(all) => all.iter().map(|p| canonicalize_package_name(p)).collect(),
            Err(e) => {
                tracing::warn!(environment = name, error = %e, "package listing failed");
                BTreeSet::new()
            }
        }
    }

    pub fn missing_packages(&self, name: &str) -> Result<MissingPackages, ProvisionError> {
        let spec = self.spec(name)?;
        Ok(self.missing_against(spec, &self.installed_packages(name)))
    }

    fn missing_against(&self, spec: &EnvironmentSpec, installed: &BTreeSet<String>) -> MissingPackages {
        let aliases = self.registry.aliases();
        let unsatisfied = |specs: &[String]| -> Vec<String> {
            specs
                .iter()
                .filter(|s| !aliases.is_satisfied(s, installed))
                .cloned()
                .collect()
        };
        MissingPackages {
            manager: unsatisfied(&spec.manager_packages),
            dependency: unsatisfied(&spec.dependency_packages),
        }
    }

    pub fn status(&self, name: &str) -> Result<EnvironmentState, ProvisionError> {
        let spec = self.spec(name)?;
        let exists = self.environment_exists(name);
        let missing = if exists {
            self.missing_against(spec, &self.installed_packages(name))
        } else {
            MissingPackages::all_of(spec)
        };
        let packages_complete = exists && missing.is_empty();
        Ok(EnvironmentState {
            exists,
            packages_complete,
            ready: packages_complete,
            missing,
        })
    }

    /// True when the environment exists and nothing declared is missing.
    pub fn is_ready(&self, name: &str) -> Result<bool, ProvisionError> {
        Ok(self.status(name)?.ready)
    }

    /// Create `name` if absent and install exactly what is missing.
    ///
    /// Manager-level packages go first, one host invocation per package.
    /// Individual failures are collected and the remaining packages are still
    /// attempted. `ready` reflects a fresh query after the installs.
    pub fn ensure_environment(&self, name: &str) -> Result<ProvisionReport, ProvisionError> {
        let spec = self.spec(name)?;
        let _guard = self
            .provisioning
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut report = ProvisionReport::new(name);

        match self.backend.manager_version() {
            Ok(version) => tracing::debug!(manager = %version, "environment manager available"),
            Err(e) => {
                report.fail(format!("{} is not available: {e}", self.backend.name()));
                report.missing = MissingPackages::all_of(spec);
                return Ok(report);
            }
        }

        if !self.environment_exists(name) {
            tracing::info!(environment = name, python = %spec.python, "creating environment");
            if let Err(e) = self.backend.create_environment(name, &spec.python) {
                report.fail(format!("failed to create environment: {e}"));
                report.missing = MissingPackages::all_of(spec);
                return Ok(report);
            }
            report.created = true;
        }

        let missing = self.missing_against(spec, &self.installed_packages(name));
        for package in &missing.manager {
            tracing::info!(environment = name, package = %package, "installing manager package");
            match self.backend.install_manager_package(name, package) {
                Ok(()) => report.installed.push(package.clone()),
                Err(e) => {
                    report.failed.push(package.clone());
                    report.fail(format!("failed to install {package}: {e}"));
                }
            }
        }
        for package in &missing.dependency {
            tracing::info!(environment = name, package = %package, "installing dependency package");
            match self.backend.install_dependency_package(name, package) {
                Ok(()) => report.installed.push(package.clone()),
                Err(e) => {
                    report.failed.push(package.clone());
                    report.fail(format!("failed to install {package}: {e}"));
                }
            }
        }

        let state = self.status(name)?;
        report.ready = state.ready;
        report.missing = state.missing;
        if !state.exists {
            report.fail("environment is not listed after provisioning".to_string());
        }
        tracing::info!(
            environment = name,
            ready = report.ready,
            installed = report.installed.len(),
            failed = report.failed.len(),
            "provisioning finished"
        );
        Ok(report)
    }

    /// Provision every registered environment in declaration order.
    pub fn ensure_all(&self) -> Vec<ProvisionReport> {
        self.registry
            .names()
            .filter_map(|name| self.ensure_environment(name).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::normalize::dependency_name;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct FakeState {
        available: bool,
        envs: BTreeMap<String, (Vec<String>, Vec<String>)>,
        failing: BTreeSet<String>,
        listing_broken: bool,
        /// Spec name → name the fake host reports once installed.
        installs_as: BTreeMap<String, String>,
        mutations: Vec<String>,
    }

    /// In-memory host manager recording every mutation.
    pub(crate) struct FakeBackend {
        state: Mutex<FakeState>,
    }

    impl FakeBackend {
        pub(crate) fn new() -> Self {
            Self {
                state: Mutex::new(FakeState {
                    available: true,
                    ..Default::default()
                }),
            }
        }

        fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
            f(&mut self.state.lock().unwrap())
        }

        fn mutations(&self) -> Vec<String> {
            self.with(|s| s.mutations.clone())
        }

        fn fail_on(&self, spec: &str) {
            self.with(|s| s.failing.insert(spec.to_string()));
        }

        fn clear_failures(&self) {
            self.with(|s| s.failing.clear());
        }

        fn seed(&self, env: &str, manager: &[&str], dependency: &[&str]) {
            self.with(|s| {
                s.envs.insert(
                    env.to_string(),
                    (
                        manager.iter().map(|p| p.to_string()).collect(),
                        dependency.iter().map(|p| p.to_string()).collect(),
                    ),
                )
            });
        }

        fn failure(command: &str) -> BackendError {
            BackendError::Failed {
                command: command.to_string(),
                code: 1,
                detail: "simulated failure".to_string(),
            }
        }

        fn install(&self, env: &str, spec: &str, manager_level: bool) -> Result<(), BackendError> {
            self.with(|s| {
                s.mutations.push(format!("install {env} {spec}"));
                if s.failing.contains(spec) {
                    return Err(Self::failure(spec));
                }
                let bare = dependency_name(spec);
                let reported = s.installs_as.get(&bare).cloned().unwrap_or(bare);
                let entry = s.envs.get_mut(env).ok_or_else(|| Self::failure(env))?;
                if manager_level {
                    entry.0.push(reported);
                } else {
                    entry.1.push(reported);
                }
                Ok(())
            })
        }
    }

    impl EnvironmentBackend for FakeBackend {
        fn name(&self) -> &str {
            "fake"
        }

        fn manager_version(&self) -> Result<String, BackendError> {
            self.with(|s| {
                s.available
                    .then(|| "fake 1.0".to_string())
                    .ok_or_else(|| Self::failure("--version"))
            })
        }

        fn list_environments(&self) -> Result<Vec<String>, BackendError> {
            self.with(|s| {
                if s.listing_broken {
                    return Err(Self::failure("env list"));
                }
                Ok(s.envs.keys().cloned().collect())
            })
        }

        fn list_manager_packages(&self, env: &str) -> Result<Vec<String>, BackendError> {
            self.with(|s| {
                if s.listing_broken {
                    return Err(Self::failure("list"));
                }
                s.envs
                    .get(env)
                    .map(|e| e.0.clone())
                    .ok_or_else(|| Self::failure(env))
            })
        }

        fn list_dependency_packages(&self, env: &str) -> Result<Vec<String>, BackendError> {
            self.with(|s| {
                s.envs
                    .get(env)
                    .map(|e| e.1.clone())
                    .ok_or_else(|| Self::failure(env))
            })
        }

        fn create_environment(&self, env: &str, python: &str) -> Result<(), BackendError> {
            self.with(|s| {
                s.mutations.push(format!("create {env} python={python}"));
                s.envs
                    .insert(env.to_string(), (vec!["python".to_string()], vec!["pip".to_string()]));
            });
            Ok(())
        }

        fn install_manager_package(&self, env: &str, spec: &str) -> Result<(), BackendError> {
            self.install(env, spec, true)
        }

        fn install_dependency_package(&self, env: &str, spec: &str) -> Result<(), BackendError> {
            self.install(env, spec, false)
        }
    }

    fn registry() -> Registry {
        Registry::from_toml(
            r#"
            [aliases]
            opencv-python = ["opencv-python-headless"]

            [[environments]]
            name = "face_recognition"
            python = "3.9"
            manager_packages = ["dlib"]
            dependency_packages = ["face_recognition", "numpy", "opencv-python"]

            [[environments]]
            name = "deepface_recognition"
            python = "3.9"
            dependency_packages = ["deepface==0.0.96", "opencv-python==4.12.0.88", "tf-keras"]
            "#,
        )
        .unwrap()
    }

    fn provisioner(backend: &Arc<FakeBackend>) -> Provisioner {
        Provisioner::new(registry(), backend.clone())
    }

    #[test]
    fn test_fresh_environment_is_created_and_filled() {
        let backend = Arc::new(FakeBackend::new());
        let p = provisioner(&backend);

        assert!(!p.is_ready("face_recognition").unwrap());
        let report = p.ensure_environment("face_recognition").unwrap();

        assert!(report.created);
        assert!(report.ready);
        assert!(report.missing.is_empty());
        assert_eq!(
            backend.mutations(),
            vec![
                "create face_recognition python=3.9",
                "install face_recognition dlib",
                "install face_recognition face_recognition",
                "install face_recognition numpy",
                "install face_recognition opencv-python",
            ]
        );
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let backend = Arc::new(FakeBackend::new());
        let p = provisioner(&backend);
        p.ensure_environment("deepface_recognition").unwrap();
        let before = backend.mutations().len();

        assert!(p.is_ready("deepface_recognition").unwrap());
        let again = p.ensure_environment("deepface_recognition").unwrap();
        assert!(again.ready);
        assert!(!again.created);
        assert!(again.installed.is_empty());
        assert_eq!(backend.mutations().len(), before);
    }

    #[test]
    fn test_partial_failure_is_recoverable() {
        let backend = Arc::new(FakeBackend::new());
        let p = provisioner(&backend);
        backend.fail_on("tf-keras");

        let report = p.ensure_environment("deepface_recognition").unwrap();
        assert!(!report.ready);
        assert_eq!(report.failed, vec!["tf-keras"]);
        assert_eq!(report.missing.dependency, vec!["tf-keras"]);
        assert_eq!(report.installed.len(), 2, "later packages still attempted");
        assert!(report.diagnostics.iter().any(|d| d.contains("tf-keras")));

        backend.clear_failures();
        let retry = p.ensure_environment("deepface_recognition").unwrap();
        assert!(retry.ready);
        assert_eq!(retry.installed, vec!["tf-keras"]);
    }

    #[test]
    fn test_pins_and_case_do_not_affect_missing() {
        let backend = Arc::new(FakeBackend::new());
        backend.seed(
            "deepface_recognition",
            &["python"],
            &["DeepFace", "opencv_python", "tf_keras"],
        );
        let p = provisioner(&backend);
        assert!(p.missing_packages("deepface_recognition").unwrap().is_empty());
        assert!(p.is_ready("deepface_recognition").unwrap());
    }

    #[test]
    fn test_alias_satisfies_declared_package() {
        let backend = Arc::new(FakeBackend::new());
        backend.seed(
            "face_recognition",
            &["dlib"],
            &["face-recognition", "numpy", "opencv-python-headless"],
        );
        let p = provisioner(&backend);
        assert!(p.missing_packages("face_recognition").unwrap().is_empty());
    }

    #[test]
    fn test_alias_installed_package_makes_environment_ready() {
        let backend = Arc::new(FakeBackend::new());
        backend.with(|s| {
            s.installs_as
                .insert("opencv-python".to_string(), "opencv-python-headless".to_string())
        });
        let p = provisioner(&backend);
        assert!(p.ensure_environment("face_recognition").unwrap().ready);
    }

    #[test]
    fn test_missing_lists_only_the_gap() {
        let backend = Arc::new(FakeBackend::new());
        backend.seed("face_recognition", &["python"], &["numpy"]);
        let p = provisioner(&backend);

        let missing = p.missing_packages("face_recognition").unwrap();
        assert_eq!(missing.manager, vec!["dlib"]);
        assert_eq!(missing.dependency, vec!["face_recognition", "opencv-python"]);
    }

    #[test]
    fn test_query_failures_degrade() {
        let backend = Arc::new(FakeBackend::new());
        backend.seed("face_recognition", &["dlib"], &["numpy"]);
        backend.with(|s| s.listing_broken = true);
        let p = provisioner(&backend);

        assert!(!p.environment_exists("face_recognition"));
        assert!(p.installed_packages("face_recognition").is_empty());
        assert!(!p.is_ready("face_recognition").unwrap());
    }

    #[test]
    fn test_unavailable_manager_reports_without_mutating() {
        let backend = Arc::new(FakeBackend::new());
        backend.with(|s| s.available = false);
        let p = provisioner(&backend);

        let report = p.ensure_environment("face_recognition").unwrap();
        assert!(!report.ready);
        assert!(report.diagnostics[0].contains("fake is not available"));
        assert_eq!(report.missing.manager, vec!["dlib"]);
        assert!(backend.mutations().is_empty());
    }

    #[test]
    fn test_unknown_environment() {
        let backend = Arc::new(FakeBackend::new());
        let p = provisioner(&backend);
        assert!(matches!(
            p.ensure_environment("nope"),
            Err(ProvisionError::UnknownEnvironment(name)) if name == "nope"
        ));
        assert!(p.is_ready("nope").is_err());
    }

    #[test]
    fn test_ensure_all_reports_every_environment() {
        let backend = Arc::new(FakeBackend::new());
        let p = provisioner(&backend);
        let reports = p.ensure_all();
        let names: Vec<_> = reports.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["face_recognition", "deepface_recognition"]);
        assert!(reports.iter().all(|r| r.ready));
    }

    #[test]
    fn test_status_of_absent_environment_lists_everything() {
        let backend = Arc::new(FakeBackend::new());
        let p = provisioner(&backend);
        let state = p.status("deepface_recognition").unwrap();
        assert!(!state.exists);
        assert!(!state.packages_complete);
        assert_eq!(state.missing.dependency.len(), 3);

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["packagesInstalled"], false);
        assert_eq!(json["missing"]["dependency"][0], "deepface==0.0.96");
    }
}
