//! The contract cloud drivers implement, and the error taxonomy the
//! reconciler uses to decide between retry and giving up.
//!
//! The engine never names a concrete driver. It parses the provider name out
//! of the machine's provider config and looks the driver up in a
//! [`ProviderRegistry`]; new drivers are registrations, not engine changes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::machine::{Machine, MachineSpec, MachineStatusError};

/// Lifecycle phase of a cloud instance as reported by its driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceStatus {
    Creating,
    Running,
    Deleting,
    Deleted,
    Unknown,
}

/// A driver's view of one concrete VM. Purely observational; all mutation
/// goes through [`CloudProvider`].
pub trait Instance: Send + Sync + std::fmt::Debug {
    /// Provider-opaque identifier, stable for the life of the VM.
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    /// All addresses the provider knows for the VM, used for Node matching
    /// when no ProviderID link exists yet.
    fn addresses(&self) -> Vec<String>;
    fn status(&self) -> InstanceStatus;
}

/// Classified driver failure.
///
/// `Terminal` must only be used when retrying without user intervention
/// cannot succeed; it is the only variant ever written to machine status.
#[derive(Debug, Error)]
pub enum CloudProviderError {
    #[error("no instance found for machine {machine}")]
    InstanceNotFound { machine: String },

    #[error("{message}")]
    Terminal {
        reason: MachineStatusError,
        message: String,
    },

    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

impl CloudProviderError {
    pub fn instance_not_found(machine: &Machine) -> Self {
        CloudProviderError::InstanceNotFound {
            machine: machine.metadata.name.clone().unwrap_or_default(),
        }
    }

    pub fn terminal(reason: MachineStatusError, message: impl Into<String>) -> Self {
        CloudProviderError::Terminal {
            reason,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudProviderError::InstanceNotFound { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CloudProviderError::Terminal { .. })
    }
}

/// Provider-specific portion of the kubelet cloud config, rendered into the
/// boot blob by the userdata layer.
#[derive(Clone, Debug, Default)]
pub struct CloudConfig {
    pub config: String,
    pub provider_name: String,
}

/// A cloud driver.
///
/// `create` must be idempotent by machine name: a second call for the same
/// machine either observes the first instance or fails terminally, it never
/// produces a sibling VM. Immediately after a successful `create`, `get` may
/// still report [`CloudProviderError::InstanceNotFound`] for a bounded
/// interval; the engine treats that window as transient.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Name used in provider configs and as the ProviderID scheme.
    fn name(&self) -> &'static str;

    /// Check credentials, required fields and referenced resources without
    /// side effects. Failures are terminal by definition.
    async fn validate(&self, spec: &MachineSpec) -> Result<(), CloudProviderError>;

    /// Fill provider-specific defaults. `true` in the result asks the engine
    /// to persist the returned spec before continuing.
    async fn add_defaults(
        &self,
        spec: MachineSpec,
    ) -> Result<(MachineSpec, bool), CloudProviderError>;

    /// Locate the existing instance for this machine, without side effects.
    async fn get(&self, machine: &Machine) -> Result<Box<dyn Instance>, CloudProviderError>;

    /// Materialize the instance, booting it with the given userdata blob.
    async fn create(
        &self,
        machine: &Machine,
        userdata: &str,
    ) -> Result<Box<dyn Instance>, CloudProviderError>;

    /// Initiate teardown. May return before the instance disappears; the
    /// engine polls `get` afterwards and only trusts `InstanceNotFound`.
    async fn delete(
        &self,
        machine: &Machine,
        instance: &dyn Instance,
    ) -> Result<(), CloudProviderError>;

    /// Cloud config handed to the userdata layer.
    async fn cloud_config(&self, spec: &MachineSpec) -> Result<CloudConfig, CloudProviderError>;
}

/// Name-keyed driver lookup.
#[derive(Default)]
pub struct ProviderRegistry {
    drivers: HashMap<String, Arc<dyn CloudProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn register(&mut self, driver: Arc<dyn CloudProvider>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CloudProvider>> {
        self.drivers.get(name).cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn terminal_errors_are_classified() {
        let err = CloudProviderError::terminal(
            MachineStatusError::InvalidConfiguration,
            "bad zone",
        );
        assert!(err.is_terminal());
        assert!(!err.is_not_found());
        assert_eq!(err.to_string(), "bad zone");
    }

    #[test]
    fn transient_errors_are_neither_terminal_nor_not_found() {
        let err = CloudProviderError::from(anyhow::anyhow!("rate limited"));
        assert!(!err.is_terminal());
        assert!(!err.is_not_found());
    }
}
