//! Matching cloud instances to Nodes and claiming matched Nodes for their
//! Machine: ownerRef, config source, and the label/annotation/taint merge.
//!
//! All mutation helpers work on a `Node` in memory and report whether they
//! changed anything, so the reconciler can skip no-op writes and stays
//! idempotent.

use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;

use crate::machine::Machine;
use crate::provider::Instance;

/// ProviderID a joined kubelet reports for an instance of the given driver.
pub fn provider_id(provider_name: &str, instance_id: &str) -> String {
    format!("{}:///{}", provider_name, instance_id)
}

/// Result of a node lookup. `ambiguous` flags an address-intersection tie,
/// which should not happen and is surfaced as a warning by the caller.
pub struct NodeMatch<'a> {
    pub node: &'a Node,
    pub ambiguous: bool,
}

/// Find the Node backing `instance`. A ProviderID link always wins; address
/// intersection is the fallback for kubelets that joined without one. Ties
/// within address matching resolve to the first Node in list order.
pub fn find_node_for_instance<'a>(
    nodes: &'a [Node],
    instance: &dyn Instance,
    provider_name: &str,
) -> Option<NodeMatch<'a>> {
    let wanted_id = provider_id(provider_name, instance.id());
    if let Some(node) = nodes.iter().find(|node| {
        node.spec
            .as_ref()
            .and_then(|spec| spec.provider_id.as_ref())
            .map(|id| id == &wanted_id)
            .unwrap_or(false)
    }) {
        return Some(NodeMatch {
            node,
            ambiguous: false,
        });
    }

    let instance_addresses: HashSet<String> = instance.addresses().into_iter().collect();
    let mut matches = nodes.iter().filter(|node| {
        node_addresses(node)
            .iter()
            .any(|address| instance_addresses.contains(address))
    });
    let first = matches.next()?;
    Some(NodeMatch {
        node: first,
        ambiguous: matches.next().is_some(),
    })
}

pub fn node_addresses(node: &Node) -> Vec<String> {
    node.status
        .as_ref()
        .and_then(|status| status.addresses.as_ref())
        .map(|addresses| {
            addresses
                .iter()
                .map(|address| address.address.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// Whether the Node has a `Ready=True` condition.
pub fn is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// The ownerRef this controller stamps onto adopted Nodes.
pub fn controller_owner_ref(machine: &Machine) -> OwnerReference {
    OwnerReference {
        api_version: Machine::api_version(&()).to_string(),
        kind: Machine::kind(&()).to_string(),
        name: machine.metadata.name.clone().unwrap_or_default(),
        uid: machine.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

pub fn controller_owner(node: &Node) -> Option<&OwnerReference> {
    node.metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|reference| reference.controller == Some(true))
}

pub fn is_owned_by(node: &Node, machine: &Machine) -> bool {
    match (controller_owner(node), machine.metadata.uid.as_ref()) {
        (Some(reference), Some(uid)) => &reference.uid == uid,
        _ => false,
    }
}

/// Claim an unowned Node. Returns false when the Node already carries a
/// controller ownerRef (ours or anyone's); adoption never steals.
pub fn set_controller_owner_ref(node: &mut Node, machine: &Machine) -> bool {
    if controller_owner(node).is_some() {
        return false;
    }
    node.metadata
        .owner_references
        .get_or_insert_with(Vec::new)
        .push(controller_owner_ref(machine));
    true
}

/// Copy the machine's kubelet config source onto the Node, only when the
/// Node has none of its own.
pub fn copy_config_source(node: &mut Node, machine: &Machine) -> bool {
    let source = match machine.spec.config_source.as_ref() {
        Some(source) => source,
        None => return false,
    };
    let spec = node.spec.get_or_insert_with(Default::default);
    if spec.config_source.is_some() {
        return false;
    }
    spec.config_source = Some(source.to_kube());
    true
}

/// Project the machine's labels, annotations and taints onto the Node.
/// Strictly additive: keys and taints already on the Node are left alone,
/// whatever their value.
pub fn merge_labels_annotations_taints(node: &mut Node, machine: &Machine) -> bool {
    let mut changed = false;

    let labels = node.metadata.labels.get_or_insert_with(BTreeMap::new);
    for (key, value) in &machine.spec.labels {
        if !labels.contains_key(key) {
            labels.insert(key.clone(), value.clone());
            changed = true;
        }
    }

    let annotations = node.metadata.annotations.get_or_insert_with(BTreeMap::new);
    for (key, value) in &machine.spec.annotations {
        if !annotations.contains_key(key) {
            annotations.insert(key.clone(), value.clone());
            changed = true;
        }
    }

    if !machine.spec.taints.is_empty() {
        let spec = node.spec.get_or_insert_with(Default::default);
        let taints = spec.taints.get_or_insert_with(Vec::new);
        for taint in &machine.spec.taints {
            if !taints.iter().any(|existing| taint.matches(existing)) {
                taints.push(taint.to_kube());
                changed = true;
            }
        }
    }

    changed
}
