pub mod backend;
pub mod normalize;
pub mod process;
pub mod provisioner;
pub mod registry;

pub use backend::{BackendError, CondaBackend, EnvironmentBackend};
pub use provisioner::{EnvironmentState, MissingPackages, ProvisionError, ProvisionReport, Provisioner};
pub use registry::{EnvironmentSpec, Registry, RegistryError};
