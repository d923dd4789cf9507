//! One-shot conversion of legacy cluster-scoped machines
//! (`machine.k8s.io/v1alpha1`) into the canonical namespaced group. Runs to
//! completion before the controller is started against the migrated store.

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::error::ErrorResponse;
use kube::{Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::machine::{Machine as CanonicalMachine, MachineSpec, MachineStatus};
use crate::node::controller_owner;

/// The legacy object. Same spec and status shape, old group, cluster scope.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "machine.k8s.io",
    version = "v1alpha1",
    kind = "Machine",
    status = "MachineStatus",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct LegacyMachineSpec {
    #[serde(flatten)]
    pub spec: MachineSpec,
}

use self::Machine as LegacyMachine;

/// Builds the canonical replacement for a legacy machine. Metadata that
/// identifies the object to users (labels, annotations, finalizers) moves
/// over; server-populated fields do not.
pub fn convert_machine(legacy: &LegacyMachine, namespace: &str) -> CanonicalMachine {
    let name = legacy.metadata.name.clone().unwrap_or_default();
    let mut machine = CanonicalMachine::new(&name, legacy.spec.spec.clone());
    machine.metadata.namespace = Some(namespace.to_string());
    machine.metadata.labels = legacy.metadata.labels.clone();
    machine.metadata.annotations = legacy.metadata.annotations.clone();
    machine.metadata.finalizers = legacy.metadata.finalizers.clone();
    machine
}

/// Migrate every legacy machine: create the canonical replacement, re-point
/// the owned node's controller ownerRef at the new UID, then delete the
/// legacy object (stripping its finalizers first so the delete completes).
///
/// Returns the number of machines migrated. A store without the legacy CRD
/// registered is already migrated and yields zero.
pub async fn migrate_legacy_machines(client: Client, namespace: &str) -> anyhow::Result<usize> {
    let legacy_api: Api<LegacyMachine> = Api::all(client.clone());
    let canonical_api: Api<CanonicalMachine> = Api::namespaced(client.clone(), namespace);
    let node_api: Api<Node> = Api::all(client.clone());

    let legacy_machines = match legacy_api.list(&ListParams::default()).await {
        Ok(list) => list.items,
        Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => {
            info!("no legacy machine resources registered, nothing to migrate");
            return Ok(0);
        }
        Err(error) => return Err(error.into()),
    };

    let mut migrated = 0usize;
    for legacy in legacy_machines {
        let name = legacy.metadata.name.clone().unwrap_or_default();
        info!(machine = %name, "migrating legacy machine");

        let replacement = convert_machine(&legacy, namespace);
        let created = match canonical_api
            .create(&PostParams::default(), &replacement)
            .await
        {
            Ok(created) => created,
            Err(kube::Error::Api(ErrorResponse { code: 409, .. })) => {
                // A previous, interrupted run already created it.
                canonical_api.get(&name).await?
            }
            Err(error) => return Err(error.into()),
        };

        transplant_node_owner_refs(&node_api, &legacy, &created).await?;

        let mut doomed = legacy.clone();
        if doomed
            .metadata
            .finalizers
            .as_ref()
            .map(|finalizers| !finalizers.is_empty())
            .unwrap_or(false)
        {
            doomed.metadata.finalizers = Some(Vec::new());
            legacy_api
                .replace(&name, &PostParams::default(), &doomed)
                .await?;
        }
        match legacy_api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => {}
            Err(error) => return Err(error.into()),
        }
        migrated += 1;
    }

    info!(migrated, "legacy machine migration finished");
    Ok(migrated)
}

/// Nodes owned by the legacy object must follow their machine to the new
/// UID, otherwise the controller would refuse to touch them.
async fn transplant_node_owner_refs(
    node_api: &Api<Node>,
    legacy: &LegacyMachine,
    replacement: &CanonicalMachine,
) -> anyhow::Result<()> {
    let legacy_uid = match legacy.metadata.uid.as_deref() {
        Some(uid) => uid,
        None => return Ok(()),
    };
    for node in node_api.list(&ListParams::default()).await?.items {
        let owned_by_legacy = controller_owner(&node)
            .map(|owner| owner.kind == "Machine" && owner.uid == legacy_uid)
            .unwrap_or(false);
        if !owned_by_legacy {
            continue;
        }
        let node_name = node.metadata.name.clone().unwrap_or_default();
        let mut node = node;
        if let Some(references) = node.metadata.owner_references.as_mut() {
            for reference in references.iter_mut() {
                if reference.uid == legacy_uid {
                    *reference = crate::node::controller_owner_ref(replacement);
                }
            }
        }
        match node_api
            .replace(&node_name, &PostParams::default(), &node)
            .await
        {
            Ok(_) => info!(node = %node_name, "node ownership transplanted"),
            Err(error) => warn!(node = %node_name, %error, "unable to transplant node ownership"),
        }
    }
    Ok(())
}
