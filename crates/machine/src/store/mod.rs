//! Control-plane access behind one mockable seam.
//!
//! Everything the reconciler reads or writes in the cluster goes through
//! [`KubeInterface`], so the whole state machine can be exercised in tests
//! against `MockKubeInterface` without an apiserver. Updates rely on the
//! ResourceVersion carried inside the passed object; the apiserver rejects
//! stale writes and those surface as [`StoreError::Conflict`].

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, ObjectReference, Secret};
use kube::api::{Api, ListParams, PostParams};
use kube::error::ErrorResponse;
use kube::{Client, Resource};
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

use crate::machine::Machine;

/// Namespace bootstrap-token secrets must live in.
pub const SECRET_NAMESPACE: &str = "kube-system";

const HTTP_NOT_FOUND: u16 = 404;
const HTTP_CONFLICT: u16 = 409;

/// Store failure, pre-classified into the kinds the engine reacts to
/// differently. `Conflict` and `Other` are both retried; `NotFound` drives
/// state transitions.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("conflicting write to {0}")]
    Conflict(String),

    #[error("unable to serialize {0}: {1}")]
    Serialization(String, #[source] serde_json::Error),

    #[error(transparent)]
    Kube(kube::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    fn classify(object: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ErrorResponse { code, .. }) if code == HTTP_NOT_FOUND => {
                StoreError::NotFound(object.to_string())
            }
            kube::Error::Api(ErrorResponse { code, .. }) if code == HTTP_CONFLICT => {
                StoreError::Conflict(object.to_string())
            }
            other => StoreError::Kube(other),
        }
    }
}

/// The store operations the reconciler needs. Node reads are cluster-wide;
/// machines are scoped to the controller's namespace; secrets to
/// [`SECRET_NAMESPACE`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeInterface: Send + Sync {
    async fn find_machine(&self, name: &str) -> Result<Machine, StoreError>;
    async fn get_machines(&self) -> Result<Vec<Machine>, StoreError>;
    async fn update_machine(&self, machine: &Machine) -> Result<Machine, StoreError>;
    async fn update_machine_status(&self, machine: &Machine) -> Result<Machine, StoreError>;

    async fn find_node(&self, name: &str) -> Result<Node, StoreError>;
    async fn get_nodes(&self) -> Result<Vec<Node>, StoreError>;
    async fn update_node(&self, node: &Node) -> Result<Node, StoreError>;

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, StoreError>;
    async fn update_secret(&self, secret: &Secret) -> Result<Secret, StoreError>;
    async fn find_secrets_with_label(&self, selector: &str) -> Result<Vec<Secret>, StoreError>;

    /// Fire-and-forget UX side channel. Callers must never let a failure
    /// here change a state transition.
    async fn record_event(
        &self,
        machine: &Machine,
        event_type: EventType,
        reason: &str,
        note: &str,
    ) -> Result<(), StoreError>;
}

/// Production implementation backed by one shared [`kube::Client`].
#[derive(Clone)]
pub struct KubeImpl {
    client: Client,
    namespace: String,
    reporter: Reporter,
}

impl KubeImpl {
    pub fn new(client: Client, namespace: &str) -> Self {
        KubeImpl {
            client,
            namespace: namespace.to_string(),
            reporter: Reporter {
                controller: "machine-controller".to_string(),
                instance: None,
            },
        }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn machines(&self) -> Api<Machine> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), SECRET_NAMESPACE)
    }

    fn machine_reference(&self, machine: &Machine) -> ObjectReference {
        ObjectReference {
            api_version: Some(Machine::api_version(&()).to_string()),
            kind: Some(Machine::kind(&()).to_string()),
            name: machine.metadata.name.clone(),
            namespace: machine.metadata.namespace.clone(),
            uid: machine.metadata.uid.clone(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl KubeInterface for KubeImpl {
    async fn find_machine(&self, name: &str) -> Result<Machine, StoreError> {
        self.machines()
            .get(name)
            .await
            .map_err(|e| StoreError::classify(&format!("machine {}", name), e))
    }

    async fn get_machines(&self) -> Result<Vec<Machine>, StoreError> {
        let list = self
            .machines()
            .list(&ListParams::default())
            .await
            .map_err(|e| StoreError::classify("machines", e))?;
        Ok(list.items)
    }

    async fn update_machine(&self, machine: &Machine) -> Result<Machine, StoreError> {
        let name = machine.metadata.name.clone().unwrap_or_default();
        self.machines()
            .replace(&name, &PostParams::default(), machine)
            .await
            .map_err(|e| StoreError::classify(&format!("machine {}", name), e))
    }

    async fn update_machine_status(&self, machine: &Machine) -> Result<Machine, StoreError> {
        let name = machine.metadata.name.clone().unwrap_or_default();
        let data = serde_json::to_vec(machine)
            .map_err(|e| StoreError::Serialization(format!("machine {}", name), e))?;
        self.machines()
            .replace_status(&name, &PostParams::default(), data)
            .await
            .map_err(|e| StoreError::classify(&format!("machine {} status", name), e))
    }

    async fn find_node(&self, name: &str) -> Result<Node, StoreError> {
        self.nodes()
            .get(name)
            .await
            .map_err(|e| StoreError::classify(&format!("node {}", name), e))
    }

    async fn get_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let list = self
            .nodes()
            .list(&ListParams::default())
            .await
            .map_err(|e| StoreError::classify("nodes", e))?;
        Ok(list.items)
    }

    async fn update_node(&self, node: &Node) -> Result<Node, StoreError> {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.nodes()
            .replace(&name, &PostParams::default(), node)
            .await
            .map_err(|e| StoreError::classify(&format!("node {}", name), e))
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, StoreError> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.secrets()
            .create(&PostParams::default(), secret)
            .await
            .map_err(|e| StoreError::classify(&format!("secret {}", name), e))
    }

    async fn update_secret(&self, secret: &Secret) -> Result<Secret, StoreError> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.secrets()
            .replace(&name, &PostParams::default(), secret)
            .await
            .map_err(|e| StoreError::classify(&format!("secret {}", name), e))
    }

    async fn find_secrets_with_label(&self, selector: &str) -> Result<Vec<Secret>, StoreError> {
        let params = ListParams::default().labels(selector);
        let list = self
            .secrets()
            .list(&params)
            .await
            .map_err(|e| StoreError::classify("secrets", e))?;
        Ok(list.items)
    }

    async fn record_event(
        &self,
        machine: &Machine,
        event_type: EventType,
        reason: &str,
        note: &str,
    ) -> Result<(), StoreError> {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            self.machine_reference(machine),
        );
        recorder
            .publish(Event {
                type_: event_type,
                reason: reason.to_string(),
                note: Some(note.to_string()),
                action: reason.to_string(),
                secondary: None,
            })
            .await
            .map_err(|e| StoreError::classify("event", e))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "".to_string(),
            reason: "".to_string(),
            code,
        })
    }

    #[test]
    fn not_found_is_classified() {
        let err = StoreError::classify("machine m1", api_error(404));
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
    }

    #[test]
    fn conflict_is_classified() {
        let err = StoreError::classify("machine m1", api_error(409));
        assert!(err.is_conflict());
    }

    #[test]
    fn anything_else_is_transient() {
        let err = StoreError::classify("machine m1", api_error(500));
        assert!(!err.is_not_found());
        assert!(!err.is_conflict());
    }
}
