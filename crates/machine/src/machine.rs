//! The Machine API type and the provider-config payload embedded in it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    ConfigMapNodeConfigSource, NodeConfigSource, Taint as KubeTaint,
};
use kube::CustomResource;
use lazy_static::lazy_static;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Finalizer that holds a Machine visible until its cloud instance is gone.
pub const MACHINE_FINALIZER: &str = "machine-delete-finalizer";

/// Annotation selecting which controller instance reconciles a Machine.
pub const CONTROLLER_ANNOTATION: &str = "machine.k8s.io/controller";

/// Machine is the declarative description of a cluster node and the cloud
/// instance backing it. The controller owns the full lifecycle: provision,
/// adopt the joined Node, and tear the instance down on deletion.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "Machine",
    status = "MachineStatus",
    derive = "Default",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Opaque provider payload. Only [`ProviderConfig::parse`] and the chosen
    /// cloud driver look inside.
    #[serde(default)]
    pub provider_config: Value,

    #[serde(default)]
    pub versions: MachineVersionInfo,

    /// Labels to project onto the backing Node. Keys already on the Node are
    /// never removed.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,

    /// Dynamic kubelet config source copied to the Node on adoption when the
    /// Node has none of its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_source: Option<ConfigSource>,
}

/// Versions of the node components this Machine should run.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineVersionInfo {
    #[serde(default)]
    pub kubelet: String,
    #[serde(default)]
    pub container_runtime: ContainerRuntimeInfo,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRuntimeInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Taint mirrors the core/v1 taint shape so machine specs need no
/// k8s-openapi types of their own.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub effect: String,
}

impl Taint {
    /// Taint identity on a Node is (key, effect); the value does not
    /// distinguish two taints.
    pub fn matches(&self, other: &KubeTaint) -> bool {
        self.key == other.key && self.effect == other.effect
    }

    pub fn to_kube(&self) -> KubeTaint {
        KubeTaint {
            key: self.key.clone(),
            value: Some(self.value.clone()),
            effect: self.effect.clone(),
            time_added: None,
        }
    }
}

/// Reference to a ConfigMap holding a kubelet configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapRef>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapRef {
    pub name: String,
    pub namespace: String,
    pub kubelet_config_key: String,
}

impl ConfigSource {
    pub fn to_kube(&self) -> NodeConfigSource {
        NodeConfigSource {
            config_map: self.config_map.as_ref().map(|c| ConfigMapNodeConfigSource {
                name: c.name.clone(),
                namespace: c.namespace.clone(),
                kubelet_config_key: c.kubelet_config_key.clone(),
                ..Default::default()
            }),
        }
    }
}

/// Status written by the controller only. Terminal errors land here;
/// transient ones never do.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<NodeRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<MachineStatusError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versions: Option<MachineVersionInfo>,
}

/// Name of the Node a Machine has adopted.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeRef {
    pub name: String,
}

/// Reasons a Machine can be terminally failed. Retrying without a user
/// mutation cannot succeed for any of these.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum MachineStatusError {
    InvalidConfiguration,
    CreateMachineError,
    DeleteMachineError,
    UpdateMachineError,
}

impl std::fmt::Display for MachineStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MachineStatusError::InvalidConfiguration => "InvalidConfiguration",
            MachineStatusError::CreateMachineError => "CreateMachineError",
            MachineStatusError::DeleteMachineError => "DeleteMachineError",
            MachineStatusError::UpdateMachineError => "UpdateMachineError",
        };
        f.write_str(s)
    }
}

impl Machine {
    /// Whether the delete branch of the reconciler applies: the object is
    /// marked for deletion *and* still carries our finalizer.
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some() && self.has_finalizer()
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .map(|f| f.iter().any(|s| s == MACHINE_FINALIZER))
            .unwrap_or(false)
    }

    /// Value of the controller-ownership annotation, if set.
    pub fn controller_annotation(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(CONTROLLER_ANNOTATION))
            .map(|s| s.as_str())
    }
}

/// The envelope every Machine's `providerConfig` must deserialize to. The
/// `cloudProviderSpec` and `operatingSystemSpec` payloads stay opaque here
/// and are interpreted by the selected driver and userdata plugin.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub cloud_provider: String,
    #[serde(default)]
    pub cloud_provider_spec: Value,
    pub operating_system: String,
    #[serde(default)]
    pub operating_system_spec: Value,
}

#[derive(Debug, Error)]
pub enum ProviderConfigError {
    #[error("unable to parse provider config: {0}")]
    Invalid(#[from] serde_json::Error),
}

impl ProviderConfig {
    pub fn parse(spec: &MachineSpec) -> Result<Self, ProviderConfigError> {
        Ok(serde_json::from_value(spec.provider_config.clone())?)
    }
}

lazy_static! {
    static ref CONTAINER_RUNTIME_VERSION: Regex =
        Regex::new(r"^(docker|cri-o)://(.*)$").expect("container runtime regex must compile");
}

/// Splits a Node's `containerRuntimeVersion` (`<runtime>://<version>`) into
/// its parts. Anything the grammar does not recognize is reported as
/// `unknown`/`unknown` rather than an error so that status updates never
/// fail on exotic runtimes.
pub fn parse_container_runtime_version(reported: &str) -> ContainerRuntimeInfo {
    match CONTAINER_RUNTIME_VERSION.captures(reported) {
        Some(caps) => ContainerRuntimeInfo {
            name: caps[1].to_string(),
            version: caps[2].to_string(),
        },
        None => ContainerRuntimeInfo {
            name: "unknown".to_string(),
            version: "unknown".to_string(),
        },
    }
}
