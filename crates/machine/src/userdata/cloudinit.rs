//! A small cloud-init generator for generic Linux images. Container-optimized
//! OSes with their own config formats get their own plugins; this one covers
//! everything that boots a stock cloud-init.

use std::net::IpAddr;

use async_trait::async_trait;
use kube::config::Kubeconfig;

use crate::machine::{ContainerRuntimeInfo, MachineSpec};
use crate::provider::CloudProvider;
use crate::userdata::UserdataPlugin;

const BOOTSTRAP_KUBECONFIG_PATH: &str = "/etc/kubernetes/bootstrap.kubeconfig";
const CLOUD_CONFIG_PATH: &str = "/etc/kubernetes/cloud-config";

pub struct CloudInitPlugin;

#[async_trait]
impl UserdataPlugin for CloudInitPlugin {
    fn operating_system(&self) -> &'static str {
        "linux"
    }

    fn supported_container_runtimes(&self, _kubelet_version: &str) -> Vec<ContainerRuntimeInfo> {
        ["18.6.3", "18.9.9", "19.3.15"]
            .iter()
            .map(|version| ContainerRuntimeInfo {
                name: "docker".to_string(),
                version: version.to_string(),
            })
            .chain(std::iter::once(ContainerRuntimeInfo {
                name: "cri-o".to_string(),
                version: "1.13.1".to_string(),
            }))
            .collect()
    }

    async fn user_data(
        &self,
        spec: &MachineSpec,
        kubeconfig: &Kubeconfig,
        cloud: &dyn CloudProvider,
        cluster_dns_ips: &[IpAddr],
    ) -> anyhow::Result<String> {
        let cloud_config = cloud.cloud_config(spec).await?;
        let kubeconfig_text = serde_yaml::to_string(kubeconfig)?;
        let dns_servers = cluster_dns_ips
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let document = serde_json::json!({
            "write_files": [
                {
                    "path": BOOTSTRAP_KUBECONFIG_PATH,
                    "permissions": "0600",
                    "content": kubeconfig_text,
                },
                {
                    "path": CLOUD_CONFIG_PATH,
                    "permissions": "0600",
                    "content": cloud_config.config,
                },
            ],
            "runcmd": [
                format!(
                    "install-container-runtime {} {}",
                    spec.versions.container_runtime.name,
                    spec.versions.container_runtime.version
                ),
                format!(
                    "install-kubelet {} --bootstrap-kubeconfig={} --cloud-provider={} --cluster-dns={}",
                    spec.versions.kubelet,
                    BOOTSTRAP_KUBECONFIG_PATH,
                    cloud_config.provider_name,
                    dns_servers
                ),
            ],
        });

        Ok(format!("#cloud-config\n{}", serde_yaml::to_string(&document)?))
    }
}
