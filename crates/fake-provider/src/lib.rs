//! An in-memory cloud driver: instances live in a process-local map. Used by
//! demos and smoke tests, and as the reference for what the driver contract
//! demands — create idempotency by machine name, the create→get visibility
//! lag, and clean terminal-error reporting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use machine::machine::{Machine, MachineSpec, MachineStatusError, ProviderConfig};
use machine::provider::{
    CloudConfig, CloudProvider, CloudProviderError, Instance, InstanceStatus,
};

#[derive(Clone, Debug)]
struct FakeInstance {
    id: String,
    name: String,
    addresses: Vec<String>,
    status: InstanceStatus,
    /// How many `get` calls still miss this instance, modelling the window
    /// in which a real cloud has accepted a create but does not list the
    /// instance yet.
    hidden_gets: u64,
}

impl Instance for FakeInstance {
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn addresses(&self) -> Vec<String> {
        self.addresses.clone()
    }
    fn status(&self) -> InstanceStatus {
        self.status
    }
}

/// The driver. Construct with [`FakeCloudProvider::new`], then chain the
/// `with_*` knobs to shape its behavior for a demo or test.
#[derive(Default)]
pub struct FakeCloudProvider {
    instances: Mutex<HashMap<String, FakeInstance>>,
    next_id: AtomicU64,
    visibility_lag: u64,
    validate_error: Option<String>,
}

impl FakeCloudProvider {
    pub fn new() -> Self {
        Default::default()
    }

    /// Make each freshly created instance invisible to `get` for the given
    /// number of calls.
    pub fn with_visibility_lag(mut self, gets: u64) -> Self {
        self.visibility_lag = gets;
        self
    }

    /// Make `validate` fail terminally with the given message.
    pub fn with_validate_error(mut self, message: &str) -> Self {
        self.validate_error = Some(message.to_string());
        self
    }

    fn machine_name(machine: &Machine) -> String {
        machine.metadata.name.clone().unwrap_or_default()
    }
}

#[async_trait]
impl CloudProvider for FakeCloudProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn validate(&self, spec: &MachineSpec) -> Result<(), CloudProviderError> {
        if let Some(message) = &self.validate_error {
            return Err(CloudProviderError::terminal(
                MachineStatusError::InvalidConfiguration,
                message.clone(),
            ));
        }
        let config = ProviderConfig::parse(spec).map_err(|e| {
            CloudProviderError::terminal(MachineStatusError::InvalidConfiguration, e.to_string())
        })?;
        if config.cloud_provider != self.name() {
            return Err(CloudProviderError::terminal(
                MachineStatusError::InvalidConfiguration,
                format!("machine requests provider {:?}", config.cloud_provider),
            ));
        }
        Ok(())
    }

    async fn add_defaults(
        &self,
        spec: MachineSpec,
    ) -> Result<(MachineSpec, bool), CloudProviderError> {
        let mut spec = spec;
        let cloud_spec = spec
            .provider_config
            .get_mut("cloudProviderSpec")
            .and_then(|value| value.as_object_mut());
        if let Some(cloud_spec) = cloud_spec {
            if !cloud_spec.contains_key("zone") {
                cloud_spec.insert("zone".to_string(), serde_json::json!("fake-zone-a"));
                return Ok((spec, true));
            }
        }
        Ok((spec, false))
    }

    async fn get(&self, machine: &Machine) -> Result<Box<dyn Instance>, CloudProviderError> {
        let name = Self::machine_name(machine);
        let mut instances = self.instances.lock().unwrap();
        match instances.get_mut(&name) {
            Some(instance) if instance.hidden_gets > 0 => {
                instance.hidden_gets -= 1;
                Err(CloudProviderError::instance_not_found(machine))
            }
            Some(instance) => Ok(Box::new(instance.clone())),
            None => Err(CloudProviderError::instance_not_found(machine)),
        }
    }

    async fn create(
        &self,
        machine: &Machine,
        userdata: &str,
    ) -> Result<Box<dyn Instance>, CloudProviderError> {
        if userdata.is_empty() {
            return Err(CloudProviderError::terminal(
                MachineStatusError::CreateMachineError,
                "refusing to create an instance without boot configuration",
            ));
        }
        let name = Self::machine_name(machine);
        let mut instances = self.instances.lock().unwrap();
        if let Some(existing) = instances.get(&name) {
            // Create is idempotent by machine name: the second call observes
            // the first instance instead of producing a sibling.
            debug!(machine = %name, instance = %existing.id, "instance already exists");
            return Ok(Box::new(existing.clone()));
        }
        let serial = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let instance = FakeInstance {
            id: format!("fake-{}", serial),
            name: name.clone(),
            addresses: vec![format!("192.0.2.{}", serial)],
            status: InstanceStatus::Running,
            hidden_gets: self.visibility_lag,
        };
        debug!(machine = %name, instance = %instance.id, "instance created");
        instances.insert(name, instance.clone());
        Ok(Box::new(instance))
    }

    async fn delete(
        &self,
        machine: &Machine,
        _instance: &dyn Instance,
    ) -> Result<(), CloudProviderError> {
        let name = Self::machine_name(machine);
        let removed = self.instances.lock().unwrap().remove(&name);
        debug!(machine = %name, removed = removed.is_some(), "instance deletion requested");
        Ok(())
    }

    async fn cloud_config(&self, spec: &MachineSpec) -> Result<CloudConfig, CloudProviderError> {
        let zone = spec
            .provider_config
            .get("cloudProviderSpec")
            .and_then(|cloud_spec| cloud_spec.get("zone"))
            .and_then(|zone| zone.as_str())
            .unwrap_or("fake-zone-a");
        Ok(CloudConfig {
            config: format!("[Global]\nzone = {}", zone),
            provider_name: self.name().to_string(),
        })
    }
}
