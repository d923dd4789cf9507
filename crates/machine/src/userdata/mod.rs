//! Boot-configuration rendering: the per-OS plugin contract and the
//! container-runtime version negotiation that happens before an instance is
//! created.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use kube::config::Kubeconfig;

use crate::machine::{ContainerRuntimeInfo, MachineSpec};
use crate::provider::CloudProvider;

pub mod cloudinit;

/// Container runtimes the cluster is willing to run, by exact version.
/// A userdata plugin may support more; only the intersection is eligible.
pub const OFFICIALLY_SUPPORTED_RUNTIMES: &[(&str, &str)] = &[
    ("docker", "1.13.1"),
    ("docker", "18.6.3"),
    ("docker", "18.9.9"),
    ("docker", "19.3.15"),
    ("cri-o", "1.11.6"),
    ("cri-o", "1.12.5"),
    ("cri-o", "1.13.1"),
];

/// Renders the opaque boot blob for one operating system family.
#[async_trait]
pub trait UserdataPlugin: Send + Sync {
    /// Operating-system name this plugin is registered under, as it appears
    /// in the machine's provider config.
    fn operating_system(&self) -> &'static str;

    /// Container runtimes this plugin can install for the given kubelet
    /// version.
    fn supported_container_runtimes(&self, kubelet_version: &str) -> Vec<ContainerRuntimeInfo>;

    /// Render the boot configuration. The plugin asks the cloud driver for
    /// its kubelet cloud config itself, since the format is driver-specific.
    async fn user_data(
        &self,
        spec: &MachineSpec,
        kubeconfig: &Kubeconfig,
        cloud: &dyn CloudProvider,
        cluster_dns_ips: &[IpAddr],
    ) -> anyhow::Result<String>;
}

/// OS-keyed plugin lookup, mirroring [`crate::provider::ProviderRegistry`].
#[derive(Default)]
pub struct UserdataRegistry {
    plugins: HashMap<String, Arc<dyn UserdataPlugin>>,
}

impl UserdataRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn UserdataPlugin>) {
        self.plugins
            .insert(plugin.operating_system().to_string(), plugin);
    }

    pub fn get(&self, operating_system: &str) -> Option<Arc<dyn UserdataPlugin>> {
        self.plugins.get(operating_system).cloned()
    }
}

/// Pick the runtime version to default a machine to: the highest version the
/// plugin supports for this kubelet that is also officially supported.
/// Versions that do not parse are skipped rather than treated as highest.
pub fn choose_container_runtime(
    supported: &[ContainerRuntimeInfo],
    runtime_name: &str,
) -> Option<ContainerRuntimeInfo> {
    supported
        .iter()
        .filter(|runtime| runtime.name == runtime_name)
        .filter(|runtime| {
            OFFICIALLY_SUPPORTED_RUNTIMES
                .contains(&(runtime.name.as_str(), runtime.version.as_str()))
        })
        .filter_map(|runtime| {
            let version = semver::Version::parse(&runtime.version).ok()?;
            Some((version, runtime))
        })
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, runtime)| runtime.clone())
}
