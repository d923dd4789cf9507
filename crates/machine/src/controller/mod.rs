//! The reconciliation engine: one level-triggered state machine per machine,
//! drained from the work queue by a pool of workers.
//!
//! No state is persisted between cycles. Every decision is derived from what
//! the machine, its node and its cloud instance look like right now, so a
//! crash or an out-of-band edit at any point is repaired by simply running
//! the handler again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::Client;
use kube_runtime::events::EventType;
use kube_runtime::watcher::{watcher, Event};
use tracing::{debug, info, instrument, trace, warn};

use crate::bootstrap::{BootstrapTokenIssuer, KubeconfigProvider};
use crate::config::Config;
use crate::machine::{
    Machine, MachineStatusError, MachineVersionInfo, NodeRef, ProviderConfig,
    parse_container_runtime_version, MACHINE_FINALIZER,
};
use crate::metrics;
use crate::node;
use crate::provider::{
    CloudProvider, CloudProviderError, Instance, InstanceStatus, ProviderRegistry,
};
use crate::queue::WorkQueue;
use crate::store::KubeInterface;
use crate::userdata::{choose_container_runtime, UserdataRegistry};

const REASON_DEFAULTED: &str = "Defaulted";
const REASON_VALIDATION_SUCCEEDED: &str = "ValidationSucceeded";
const REASON_VALIDATION_FAILED: &str = "ValidationFailed";
const REASON_BOOTSTRAP_FAILED: &str = "CreateBootstrapKubeconfigFailed";
const REASON_USERDATA_FAILED: &str = "UserdataRenderingFailed";
const REASON_CREATE_FAILED: &str = "CreateInstanceFailed";
const REASON_CREATED: &str = "Created";
const REASON_INSTANCE_FOUND: &str = "InstanceFound";
const REASON_NODE_MATCHED: &str = "NodeMatched";
const REASON_AMBIGUOUS_MATCH: &str = "AmbiguousNodeMatch";
const REASON_METADATA_UPDATED: &str = "LabelsAnnotationsTaintsUpdated";
const REASON_DELETION_FAILED: &str = "DeletionFailed";

/// How long to wait before checking on an instance we just created or are
/// still waiting to see a node for.
const INSTANCE_RECHECK_PERIOD: Duration = Duration::from_secs(10);

/// The hint users need when deletion fails terminally and the finalizer
/// keeps the machine pinned.
const DELETION_ESCAPE_HATCH: &str = "manually delete finalizers from the machine object";

/// Remembers the outcome of `validate` per (machine UID, ResourceVersion).
///
/// Purely a latency shortcut: entries die with the process, any machine
/// update changes the ResourceVersion and thereby misses the cache, and any
/// provider error drops the entry outright.
#[derive(Default)]
pub struct ValidationCache {
    inner: std::sync::RwLock<HashMap<String, (String, bool)>>,
}

impl ValidationCache {
    fn keys(machine: &Machine) -> Option<(&str, &str)> {
        let uid = machine.metadata.uid.as_deref()?;
        let resource_version = machine.metadata.resource_version.as_deref()?;
        Some((uid, resource_version))
    }

    /// `Some(true)` when this exact revision already passed validation,
    /// `Some(false)` when it already failed terminally, `None` otherwise.
    pub fn lookup(&self, machine: &Machine) -> Option<bool> {
        let (uid, resource_version) = Self::keys(machine)?;
        self.inner
            .read()
            .expect("validation cache lock poisoned")
            .get(uid)
            .filter(|(cached, _)| cached == resource_version)
            .map(|(_, passed)| *passed)
    }

    pub fn record(&self, machine: &Machine, passed: bool) {
        if let Some((uid, resource_version)) = Self::keys(machine) {
            self.inner
                .write()
                .expect("validation cache lock poisoned")
                .insert(uid.to_string(), (resource_version.to_string(), passed));
        }
    }

    pub fn invalidate(&self, machine: &Machine) {
        if let Some(uid) = machine.metadata.uid.as_deref() {
            self.inner
                .write()
                .expect("validation cache lock poisoned")
                .remove(uid);
        }
    }
}

/// What a finished cycle asks of the worker: nothing, or a timed re-check.
type Requeue = Option<Duration>;

/// The controller: owns the queue, the registries and the reconcile logic.
pub struct MachineController {
    kube: Arc<dyn KubeInterface>,
    providers: ProviderRegistry,
    userdata: UserdataRegistry,
    bootstrap: BootstrapTokenIssuer,
    config: Config,
    queue: Arc<WorkQueue>,
    validation_cache: ValidationCache,
}

impl MachineController {
    pub fn new(
        kube: Arc<dyn KubeInterface>,
        providers: ProviderRegistry,
        userdata: UserdataRegistry,
        kubeconfig_provider: Arc<dyn KubeconfigProvider>,
        config: Config,
    ) -> Arc<Self> {
        let bootstrap = BootstrapTokenIssuer::new(Arc::clone(&kube), kubeconfig_provider);
        Arc::new(MachineController {
            kube,
            providers,
            userdata,
            bootstrap,
            config,
            queue: Arc::new(WorkQueue::default()),
            validation_cache: ValidationCache::default(),
        })
    }

    /// Start informers, workers and the metrics task, then block until a
    /// shutdown signal arrives and the workers have drained.
    pub async fn run(self: Arc<Self>, client: Client) -> anyhow::Result<()> {
        for machine in self.kube.get_machines().await? {
            if let Some(name) = machine.metadata.name.as_deref() {
                self.queue.add(name).await;
            }
        }

        let machines: Api<Machine> = Api::namespaced(client.clone(), &self.config.namespace);
        let machine_watch = tokio::spawn(Self::watch_machines(Arc::clone(&self), machines));
        let nodes: Api<Node> = Api::all(client);
        let node_watch = tokio::spawn(Self::watch_nodes(Arc::clone(&self), nodes));
        let metrics_task = tokio::spawn(Self::update_metrics(Arc::clone(&self)));

        let mut workers = Vec::with_capacity(self.config.worker_count);
        for _ in 0..self.config.worker_count {
            workers.push(tokio::spawn(Self::worker(Arc::clone(&self))));
        }
        info!(workers = self.config.worker_count, "machine controller started");

        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received, draining workers");
        self.queue.shut_down();
        for worker in workers {
            let _ = worker.await;
        }
        machine_watch.abort();
        node_watch.abort();
        metrics_task.abort();
        Ok(())
    }

    async fn watch_machines(controller: Arc<Self>, api: Api<Machine>) {
        let mut stream = watcher(api, ListParams::default()).boxed();
        loop {
            match stream.try_next().await {
                Ok(Some(Event::Applied(machine))) | Ok(Some(Event::Deleted(machine))) => {
                    if let Some(name) = machine.metadata.name.as_deref() {
                        controller.queue.add(name).await;
                    }
                }
                Ok(Some(Event::Restarted(machines))) => {
                    for machine in machines {
                        if let Some(name) = machine.metadata.name.as_deref() {
                            controller.queue.add(name).await;
                        }
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(%error, "machine watch error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn watch_nodes(controller: Arc<Self>, api: Api<Node>) {
        let mut stream = watcher(api, ListParams::default()).boxed();
        loop {
            match stream.try_next().await {
                Ok(Some(Event::Applied(node))) | Ok(Some(Event::Deleted(node))) => {
                    controller.kick_machines_for_node(&node).await;
                }
                Ok(Some(Event::Restarted(_))) => {}
                Ok(None) => break,
                Err(error) => {
                    warn!(%error, "node watch error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// An owned node maps straight back to its machine. An unowned one may
    /// be the join a pending machine is waiting for, so nudge every machine
    /// that has no node yet.
    async fn kick_machines_for_node(&self, node: &Node) {
        if let Some(owner) = node::controller_owner(node) {
            if owner.kind == "Machine" {
                self.queue.add(&owner.name).await;
            }
            return;
        }
        match self.kube.get_machines().await {
            Ok(machines) => {
                for machine in machines {
                    let unbound = machine
                        .status
                        .as_ref()
                        .and_then(|status| status.node_ref.as_ref())
                        .is_none();
                    if unbound {
                        if let Some(name) = machine.metadata.name.as_deref() {
                            self.queue.add(name).await;
                        }
                    }
                }
            }
            Err(error) => warn!(%error, "unable to list machines for node event"),
        }
    }

    async fn update_metrics(controller: Arc<Self>) {
        loop {
            match controller.kube.get_machines().await {
                Ok(machines) => metrics::MACHINES.set(machines.len() as i64),
                Err(error) => warn!(%error, "unable to update machine metrics"),
            }
            tokio::time::sleep(controller.config.metrics_update_period).await;
        }
    }

    async fn worker(controller: Arc<Self>) {
        while let Some(key) = controller.queue.get().await {
            match controller.sync(&key).await {
                Ok(None) => controller.queue.forget(&key).await,
                Ok(Some(delay)) => {
                    controller.queue.forget(&key).await;
                    controller.queue.add_after(&key, delay);
                }
                Err(error) => {
                    metrics::ERRORS.inc();
                    warn!(machine = %key, %error, "reconcile failed, backing off");
                    controller.queue.add_rate_limited(&key).await;
                }
            }
            controller.queue.done(&key).await;
        }
    }

    /// Whether the ownership annotation selects this controller instance.
    fn claimed(&self, machine: &Machine) -> bool {
        match (
            self.config.controller_name.as_deref(),
            machine.controller_annotation(),
        ) {
            (None, None) => true,
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => false,
        }
    }

    /// One reconcile cycle. `Ok(None)` means settled (forget the key),
    /// `Ok(Some(d))` asks for a re-check after `d`, `Err` is transient and
    /// comes back through the rate limiter.
    #[instrument(level = "debug", skip(self), fields(machine = %key))]
    async fn sync(&self, key: &str) -> anyhow::Result<Requeue> {
        let machine = match self.kube.find_machine(key).await {
            Ok(machine) => machine,
            Err(error) if error.is_not_found() => {
                debug!("machine is gone, dropping key");
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        };

        if !self.claimed(&machine) {
            trace!("machine belongs to another controller, skipping");
            return Ok(None);
        }

        let provider_config = match ProviderConfig::parse(&machine.spec) {
            Ok(config) => config,
            Err(error) => {
                self.record_terminal_error(
                    &machine,
                    MachineStatusError::InvalidConfiguration,
                    &error.to_string(),
                    REASON_VALIDATION_FAILED,
                )
                .await?;
                return Ok(None);
            }
        };
        let provider = match self.providers.get(&provider_config.cloud_provider) {
            Some(provider) => provider,
            None => {
                self.record_terminal_error(
                    &machine,
                    MachineStatusError::InvalidConfiguration,
                    &format!(
                        "unknown cloud provider {:?}",
                        provider_config.cloud_provider
                    ),
                    REASON_VALIDATION_FAILED,
                )
                .await?;
                return Ok(None);
            }
        };

        if machine.is_deleting() {
            return self.reconcile_delete(machine, provider.as_ref()).await;
        }
        if machine.metadata.deletion_timestamp.is_some() {
            // Deletion is pending but we never started provisioning, so
            // there is nothing cloud-side to wait for.
            trace!("machine deleted before provisioning began");
            return Ok(None);
        }
        self.reconcile(machine, provider.as_ref(), &provider_config)
            .await
    }

    /// Delete branch. The finalizer only ever comes off after the provider
    /// has confirmed the instance is gone; that ordering is what makes
    /// orphaned instances impossible.
    async fn reconcile_delete(
        &self,
        machine: Machine,
        provider: &dyn CloudProvider,
    ) -> anyhow::Result<Requeue> {
        let timer = metrics::CLOUD_OPERATIONS
            .with_label_values(&[metrics::OP_GET_INSTANCE])
            .start_timer();
        let lookup = provider.get(&machine).await;
        timer.observe_duration();

        let instance = match lookup {
            Err(error) if error.is_not_found() => {
                self.finish_deletion(machine).await?;
                return Ok(None);
            }
            Err(CloudProviderError::Terminal { reason, message }) => {
                self.record_terminal_error(
                    &machine,
                    reason,
                    &message,
                    REASON_DELETION_FAILED,
                )
                .await?;
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
            Ok(instance) => instance,
        };

        match instance.status() {
            InstanceStatus::Deleting => {
                debug!("instance is already being deleted, waiting");
                return Ok(Some(self.config.deletion_retry_wait_period));
            }
            InstanceStatus::Deleted => {
                self.finish_deletion(machine).await?;
                return Ok(None);
            }
            _ => {}
        }

        let timer = metrics::CLOUD_OPERATIONS
            .with_label_values(&[metrics::OP_DELETE_INSTANCE])
            .start_timer();
        let deleted = provider.delete(&machine, instance.as_ref()).await;
        timer.observe_duration();

        match deleted {
            Ok(()) => {
                info!("instance deletion requested");
                self.clear_machine_error(machine).await?;
                Ok(Some(self.config.initial_delete_wait_period))
            }
            Err(CloudProviderError::Terminal { reason, message }) => {
                let note = format!("{}; {}", message, DELETION_ESCAPE_HATCH);
                self.record_terminal_error(&machine, reason, &note, REASON_DELETION_FAILED)
                    .await?;
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// The instance is confirmed gone: release the finalizer so the store
    /// can finish deleting the machine.
    async fn finish_deletion(&self, machine: Machine) -> anyhow::Result<()> {
        let mut machine = self.clear_machine_error(machine).await?;
        if let Some(finalizers) = machine.metadata.finalizers.as_mut() {
            finalizers.retain(|finalizer| finalizer != MACHINE_FINALIZER);
        }
        self.kube.update_machine(&machine).await?;
        info!("instance confirmed gone, finalizer released");
        Ok(())
    }

    /// Create/adopt branch.
    async fn reconcile(
        &self,
        machine: Machine,
        provider: &dyn CloudProvider,
        provider_config: &ProviderConfig,
    ) -> anyhow::Result<Requeue> {
        // The finalizer must be persisted before any instance can exist,
        // otherwise a delete racing a slow create could orphan the instance.
        if !machine.has_finalizer() {
            let mut machine = machine;
            machine
                .metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(MACHINE_FINALIZER.to_string());
            self.kube.update_machine(&machine).await?;
            debug!("deletion finalizer added");
            return Ok(None);
        }

        let machine = match self.default_versions(machine, provider_config).await? {
            Some(machine) => machine,
            None => return Ok(None),
        };

        match self.ready_node(&machine).await? {
            Some(ready) => {
                let machine = self.clear_machine_error(machine).await?;
                self.sync_node_metadata(&machine, ready).await?;
                Ok(None)
            }
            None => {
                self.ensure_instance_exists(machine, provider, provider_config)
                    .await
            }
        }
    }

    /// Fill in the version fields users may leave empty. A change is
    /// persisted before continuing so the derived state stays observable.
    /// Returns `None` when a terminal error was recorded.
    async fn default_versions(
        &self,
        machine: Machine,
        provider_config: &ProviderConfig,
    ) -> anyhow::Result<Option<Machine>> {
        let mut machine = machine;
        let mut changed = false;

        if machine.spec.versions.kubelet.is_empty() {
            machine.spec.versions.kubelet = self.config.latest_kubernetes_version.clone();
            changed = true;
        }
        if machine.spec.versions.container_runtime.name.is_empty() {
            machine.spec.versions.container_runtime.name = "docker".to_string();
            changed = true;
        }
        if machine.spec.versions.container_runtime.version.is_empty() {
            let plugin = match self.userdata.get(&provider_config.operating_system) {
                Some(plugin) => plugin,
                None => {
                    self.record_terminal_error(
                        &machine,
                        MachineStatusError::InvalidConfiguration,
                        &format!(
                            "unsupported operating system {:?}",
                            provider_config.operating_system
                        ),
                        REASON_VALIDATION_FAILED,
                    )
                    .await?;
                    return Ok(None);
                }
            };
            let supported = plugin.supported_container_runtimes(&machine.spec.versions.kubelet);
            match choose_container_runtime(
                &supported,
                &machine.spec.versions.container_runtime.name,
            ) {
                Some(runtime) => {
                    machine.spec.versions.container_runtime.version = runtime.version;
                    changed = true;
                }
                None => {
                    self.record_terminal_error(
                        &machine,
                        MachineStatusError::InvalidConfiguration,
                        &format!(
                            "no supported {} version for kubelet {}",
                            machine.spec.versions.container_runtime.name,
                            machine.spec.versions.kubelet
                        ),
                        REASON_VALIDATION_FAILED,
                    )
                    .await?;
                    return Ok(None);
                }
            }
        }

        if changed {
            let updated = self.kube.update_machine(&machine).await?;
            self.emit(
                &updated,
                EventType::Normal,
                REASON_DEFAULTED,
                &format!(
                    "kubelet {} with {} {}",
                    updated.spec.versions.kubelet,
                    updated.spec.versions.container_runtime.name,
                    updated.spec.versions.container_runtime.version
                ),
            )
            .await;
            machine = updated;
        }
        Ok(Some(machine))
    }

    /// The node referenced by the machine's status, if it still exists, is
    /// still ours, and reports Ready.
    async fn ready_node(&self, machine: &Machine) -> anyhow::Result<Option<Node>> {
        let node_ref = match machine.status.as_ref().and_then(|s| s.node_ref.as_ref()) {
            Some(node_ref) => node_ref,
            None => return Ok(None),
        };
        match self.kube.find_node(&node_ref.name).await {
            Ok(found) if node::is_owned_by(&found, machine) && node::is_ready(&found) => {
                Ok(Some(found))
            }
            Ok(_) => Ok(None),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Provider defaults, cached validation, then either adopt the existing
    /// instance or mint credentials and create one.
    async fn ensure_instance_exists(
        &self,
        machine: Machine,
        provider: &dyn CloudProvider,
        provider_config: &ProviderConfig,
    ) -> anyhow::Result<Requeue> {
        let mut machine = machine;

        match provider.add_defaults(machine.spec.clone()).await {
            Ok((spec, changed)) => {
                if changed {
                    machine.spec = spec;
                    machine = self.kube.update_machine(&machine).await?;
                    self.emit(
                        &machine,
                        EventType::Normal,
                        REASON_DEFAULTED,
                        "provider defaults applied",
                    )
                    .await;
                }
            }
            Err(CloudProviderError::Terminal { reason, message }) => {
                self.record_terminal_error(&machine, reason, &message, REASON_VALIDATION_FAILED)
                    .await?;
                return Ok(None);
            }
            Err(error) => {
                self.validation_cache.invalidate(&machine);
                return Err(error.into());
            }
        }

        match self.validation_cache.lookup(&machine) {
            Some(true) => trace!("validation cached for this revision, skipping"),
            Some(false) => {
                trace!("validation already failed for this revision, waiting for a spec change");
                return Ok(None);
            }
            None => {
                let timer = metrics::CLOUD_OPERATIONS
                    .with_label_values(&[metrics::OP_VALIDATE_MACHINE])
                    .start_timer();
                let validated = provider.validate(&machine.spec).await;
                timer.observe_duration();
                match validated {
                    Ok(()) => {
                        self.validation_cache.record(&machine, true);
                        self.emit(
                            &machine,
                            EventType::Normal,
                            REASON_VALIDATION_SUCCEEDED,
                            "machine spec validated",
                        )
                        .await;
                    }
                    Err(CloudProviderError::Terminal { reason, message }) => {
                        self.validation_cache.record(&machine, false);
                        self.record_terminal_error(
                            &machine,
                            reason,
                            &message,
                            REASON_VALIDATION_FAILED,
                        )
                        .await?;
                        return Ok(None);
                    }
                    Err(error) => {
                        self.validation_cache.invalidate(&machine);
                        return Err(error.into());
                    }
                }
            }
        }

        let timer = metrics::CLOUD_OPERATIONS
            .with_label_values(&[metrics::OP_GET_INSTANCE])
            .start_timer();
        let lookup = provider.get(&machine).await;
        timer.observe_duration();

        match lookup {
            Err(error) if error.is_not_found() => {
                self.create_instance(machine, provider, provider_config).await
            }
            Err(CloudProviderError::Terminal { reason, message }) => {
                self.record_terminal_error(&machine, reason, &message, REASON_CREATE_FAILED)
                    .await?;
                Ok(None)
            }
            Err(error) => {
                self.validation_cache.invalidate(&machine);
                Err(error.into())
            }
            Ok(instance) => {
                debug!(instance = %instance.id(), "instance found");
                self.emit(
                    &machine,
                    EventType::Normal,
                    REASON_INSTANCE_FOUND,
                    &format!("instance {} exists", instance.id()),
                )
                .await;
                self.adopt_node(machine, instance, provider).await
            }
        }
    }

    /// Mint credentials, render userdata and ask the provider for a new
    /// instance. The finalizer is already persisted at this point.
    async fn create_instance(
        &self,
        machine: Machine,
        provider: &dyn CloudProvider,
        provider_config: &ProviderConfig,
    ) -> anyhow::Result<Requeue> {
        let machine_name = machine.metadata.name.clone().unwrap_or_default();

        let kubeconfig = match self.bootstrap.create_bootstrap_kubeconfig(&machine_name).await {
            Ok(kubeconfig) => kubeconfig,
            Err(error) => {
                self.emit(
                    &machine,
                    EventType::Warning,
                    REASON_BOOTSTRAP_FAILED,
                    &error.to_string(),
                )
                .await;
                return Err(error);
            }
        };

        let plugin = match self.userdata.get(&provider_config.operating_system) {
            Some(plugin) => plugin,
            None => {
                self.record_terminal_error(
                    &machine,
                    MachineStatusError::InvalidConfiguration,
                    &format!(
                        "unsupported operating system {:?}",
                        provider_config.operating_system
                    ),
                    REASON_USERDATA_FAILED,
                )
                .await?;
                return Ok(None);
            }
        };
        let userdata = match plugin
            .user_data(
                &machine.spec,
                &kubeconfig,
                provider,
                &self.config.cluster_dns_ips,
            )
            .await
        {
            Ok(userdata) => userdata,
            Err(error) => {
                self.emit(
                    &machine,
                    EventType::Warning,
                    REASON_USERDATA_FAILED,
                    &error.to_string(),
                )
                .await;
                return Err(error);
            }
        };

        let timer = metrics::CLOUD_OPERATIONS
            .with_label_values(&[metrics::OP_CREATE_INSTANCE])
            .start_timer();
        let created = provider.create(&machine, &userdata).await;
        timer.observe_duration();

        match created {
            Ok(instance) => {
                info!(instance = %instance.id(), "instance created");
                let machine = self.clear_machine_error(machine).await?;
                self.emit(
                    &machine,
                    EventType::Normal,
                    REASON_CREATED,
                    &format!("instance {} created", instance.id()),
                )
                .await;
                Ok(Some(INSTANCE_RECHECK_PERIOD))
            }
            Err(CloudProviderError::Terminal { reason, message }) => {
                self.record_terminal_error(&machine, reason, &message, REASON_CREATE_FAILED)
                    .await?;
                Ok(None)
            }
            Err(error) => {
                self.validation_cache.invalidate(&machine);
                Err(error.into())
            }
        }
    }

    /// Adoption: find the node backing the instance, claim it, project the
    /// machine's metadata onto it and record the link in machine status.
    async fn adopt_node(
        &self,
        machine: Machine,
        instance: Box<dyn Instance>,
        provider: &dyn CloudProvider,
    ) -> anyhow::Result<Requeue> {
        let nodes = self.kube.get_nodes().await?;
        let matched = match node::find_node_for_instance(&nodes, instance.as_ref(), provider.name())
        {
            Some(matched) => matched,
            None => {
                debug!("no node for instance yet, waiting for it to join");
                return Ok(Some(INSTANCE_RECHECK_PERIOD));
            }
        };
        if matched.ambiguous {
            warn!(
                node = %matched.node.metadata.name.as_deref().unwrap_or_default(),
                "multiple nodes share an address with this instance"
            );
            self.emit(
                &machine,
                EventType::Warning,
                REASON_AMBIGUOUS_MATCH,
                "multiple nodes matched this machine's instance by address",
            )
            .await;
        }

        let mut node_obj = matched.node.clone();
        if let Some(owner) = node::controller_owner(&node_obj) {
            if machine.metadata.uid.as_deref() != Some(owner.uid.as_str()) {
                warn!(
                    node = %node_obj.metadata.name.as_deref().unwrap_or_default(),
                    owner = %owner.name,
                    "matched node is owned by another machine"
                );
                return Ok(Some(INSTANCE_RECHECK_PERIOD));
            }
        }

        let adopted = node::set_controller_owner_ref(&mut node_obj, &machine);
        let config_source_copied = node::copy_config_source(&mut node_obj, &machine);
        let metadata_merged = node::merge_labels_annotations_taints(&mut node_obj, &machine);

        if adopted || config_source_copied || metadata_merged {
            self.kube.update_node(&node_obj).await?;
        }
        if adopted {
            self.emit(
                &machine,
                EventType::Normal,
                REASON_NODE_MATCHED,
                &format!(
                    "node {} adopted",
                    node_obj.metadata.name.as_deref().unwrap_or_default()
                ),
            )
            .await;
            self.observe_join_duration(&machine, &node_obj);
        }
        if metadata_merged {
            self.emit(
                &machine,
                EventType::Normal,
                REASON_METADATA_UPDATED,
                "labels, annotations and taints synced to node",
            )
            .await;
        }

        self.update_machine_status_from_node(machine, &node_obj)
            .await?;
        Ok(None)
    }

    /// Ready-node path: the only remaining work is keeping the node's
    /// metadata a superset of the machine's.
    async fn sync_node_metadata(&self, machine: &Machine, node_obj: Node) -> anyhow::Result<()> {
        let mut node_obj = node_obj;
        if node::merge_labels_annotations_taints(&mut node_obj, machine) {
            self.kube.update_node(&node_obj).await?;
            self.emit(
                machine,
                EventType::Normal,
                REASON_METADATA_UPDATED,
                "labels, annotations and taints synced to node",
            )
            .await;
        }
        Ok(())
    }

    /// Record the node link and the versions the kubelet actually reports.
    /// Skips the write when nothing changed so repeated cycles stay silent.
    async fn update_machine_status_from_node(
        &self,
        machine: Machine,
        node_obj: &Node,
    ) -> anyhow::Result<()> {
        let node_name = node_obj.metadata.name.clone().unwrap_or_default();
        let node_info = node_obj
            .status
            .as_ref()
            .and_then(|status| status.node_info.as_ref());
        let versions = MachineVersionInfo {
            kubelet: node_info
                .map(|info| info.kubelet_version.clone())
                .unwrap_or_default(),
            container_runtime: parse_container_runtime_version(
                node_info
                    .map(|info| info.container_runtime_version.as_str())
                    .unwrap_or(""),
            ),
        };

        let desired_ref = Some(NodeRef { name: node_name });
        let current = machine.status.clone().unwrap_or_default();
        if current.node_ref == desired_ref && current.versions.as_ref() == Some(&versions) {
            return Ok(());
        }

        let mut machine = machine;
        let status = machine.status.get_or_insert_with(Default::default);
        status.node_ref = desired_ref;
        status.versions = Some(versions);
        status.last_updated = Some(Utc::now());
        self.kube.update_machine_status(&machine).await?;
        Ok(())
    }

    fn observe_join_duration(&self, machine: &Machine, node_obj: &Node) {
        if let (Some(machine_created), Some(node_created)) = (
            machine.metadata.creation_timestamp.as_ref(),
            node_obj.metadata.creation_timestamp.as_ref(),
        ) {
            let elapsed = (node_created.0 - machine_created.0).num_milliseconds() as f64 / 1000.0;
            if elapsed >= 0.0 {
                metrics::NODE_JOIN_DURATION.observe(elapsed);
            }
        }
    }

    /// Terminal failure: write reason and message into status, count it and
    /// tell the user via a warning event. The key is then forgotten; only a
    /// user mutation will bring the machine back through here.
    async fn record_terminal_error(
        &self,
        machine: &Machine,
        reason: MachineStatusError,
        message: &str,
        event_reason: &str,
    ) -> anyhow::Result<()> {
        metrics::ERRORS.inc();
        warn!(%reason, %message, "terminal reconcile error");

        let mut updated = machine.clone();
        let status = updated.status.get_or_insert_with(Default::default);
        status.error_reason = Some(reason);
        status.error_message = Some(message.to_string());
        status.last_updated = Some(Utc::now());
        self.kube.update_machine_status(&updated).await?;

        self.emit(machine, EventType::Warning, event_reason, message)
            .await;
        Ok(())
    }

    /// Remove a previously recorded error, if any. Returns the machine to
    /// keep working with (with a fresh ResourceVersion after a write).
    async fn clear_machine_error(&self, machine: Machine) -> anyhow::Result<Machine> {
        let has_error = machine
            .status
            .as_ref()
            .map(|status| status.error_reason.is_some() || status.error_message.is_some())
            .unwrap_or(false);
        if !has_error {
            return Ok(machine);
        }
        let mut machine = machine;
        let status = machine.status.get_or_insert_with(Default::default);
        status.error_reason = None;
        status.error_message = None;
        status.last_updated = Some(Utc::now());
        Ok(self.kube.update_machine_status(&machine).await?)
    }

    /// Events are UX, not bookkeeping: failures to record them must never
    /// change what the reconciler does next.
    async fn emit(&self, machine: &Machine, event_type: EventType, reason: &str, note: &str) {
        if let Err(error) = self
            .kube
            .record_event(machine, event_type, reason, note)
            .await
        {
            warn!(%reason, %error, "unable to record event");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::machine::CONTROLLER_ANNOTATION;
    use crate::machine::{ContainerRuntimeInfo, MachineSpec, MachineVersionInfo, Taint};
    use crate::provider::CloudConfig;
    use crate::store::MockKubeInterface;
    use crate::userdata::UserdataPlugin;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeCondition, NodeSpec, NodeStatus, NodeSystemInfo};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::config::Kubeconfig;
    use std::collections::VecDeque;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    const CLUSTER_INFO: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: test-cluster
  cluster:
    certificate-authority-data: dGVzdC1jYQ==
    server: https://cluster.example:6443
"#;

    struct StaticKubeconfigProvider;

    impl KubeconfigProvider for StaticKubeconfigProvider {
        fn get_kubeconfig(&self) -> anyhow::Result<Kubeconfig> {
            Ok(serde_yaml::from_str(CLUSTER_INFO)?)
        }
    }

    #[derive(Clone, Debug)]
    struct ScriptedInstance {
        id: String,
        addresses: Vec<String>,
        status: InstanceStatus,
    }

    impl ScriptedInstance {
        fn running(id: &str, address: &str) -> Self {
            ScriptedInstance {
                id: id.to_string(),
                addresses: vec![address.to_string()],
                status: InstanceStatus::Running,
            }
        }

        fn with_status(mut self, status: InstanceStatus) -> Self {
            self.status = status;
            self
        }
    }

    impl Instance for ScriptedInstance {
        fn id(&self) -> &str {
            &self.id
        }
        fn name(&self) -> &str {
            &self.id
        }
        fn addresses(&self) -> Vec<String> {
            self.addresses.clone()
        }
        fn status(&self) -> InstanceStatus {
            self.status
        }
    }

    /// One scripted provider response; the scripts default to the happy path
    /// when empty.
    enum Call {
        Ok,
        Instance(ScriptedInstance),
        NotFound,
        Terminal(MachineStatusError, &'static str),
        Transient(&'static str),
    }

    #[derive(Default)]
    struct TestProvider {
        get_script: Mutex<VecDeque<Call>>,
        validate_script: Mutex<VecDeque<Call>>,
        create_script: Mutex<VecDeque<Call>>,
        delete_script: Mutex<VecDeque<Call>>,
        validate_calls: AtomicUsize,
        create_calls: AtomicUsize,
        delete_calls: AtomicUsize,
        last_userdata: Mutex<Option<String>>,
    }

    impl TestProvider {
        fn push_get(&self, call: Call) {
            self.get_script.lock().unwrap().push_back(call);
        }
        fn push_validate(&self, call: Call) {
            self.validate_script.lock().unwrap().push_back(call);
        }
        fn push_delete(&self, call: Call) {
            self.delete_script.lock().unwrap().push_back(call);
        }
    }

    #[async_trait]
    impl CloudProvider for TestProvider {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn validate(&self, _spec: &MachineSpec) -> Result<(), CloudProviderError> {
            self.validate_calls.fetch_add(1, Ordering::SeqCst);
            match self.validate_script.lock().unwrap().pop_front() {
                None | Some(Call::Ok) => Ok(()),
                Some(Call::Terminal(reason, message)) => {
                    Err(CloudProviderError::terminal(reason, message))
                }
                Some(Call::Transient(message)) => Err(anyhow::anyhow!(message).into()),
                Some(_) => Ok(()),
            }
        }

        async fn add_defaults(
            &self,
            spec: MachineSpec,
        ) -> Result<(MachineSpec, bool), CloudProviderError> {
            Ok((spec, false))
        }

        async fn get(&self, machine: &Machine) -> Result<Box<dyn Instance>, CloudProviderError> {
            match self.get_script.lock().unwrap().pop_front() {
                None | Some(Call::NotFound) => {
                    Err(CloudProviderError::instance_not_found(machine))
                }
                Some(Call::Instance(instance)) => Ok(Box::new(instance)),
                Some(Call::Terminal(reason, message)) => {
                    Err(CloudProviderError::terminal(reason, message))
                }
                Some(Call::Transient(message)) => Err(anyhow::anyhow!(message).into()),
                Some(Call::Ok) => Err(CloudProviderError::instance_not_found(machine)),
            }
        }

        async fn create(
            &self,
            _machine: &Machine,
            userdata: &str,
        ) -> Result<Box<dyn Instance>, CloudProviderError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_userdata.lock().unwrap() = Some(userdata.to_string());
            match self.create_script.lock().unwrap().pop_front() {
                None | Some(Call::Ok) => {
                    Ok(Box::new(ScriptedInstance::running("i-1", "10.0.0.1")))
                }
                Some(Call::Instance(instance)) => Ok(Box::new(instance)),
                Some(Call::Terminal(reason, message)) => {
                    Err(CloudProviderError::terminal(reason, message))
                }
                Some(Call::Transient(message)) => Err(anyhow::anyhow!(message).into()),
                Some(Call::NotFound) => unreachable!("create never reports not-found"),
            }
        }

        async fn delete(
            &self,
            _machine: &Machine,
            _instance: &dyn Instance,
        ) -> Result<(), CloudProviderError> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            match self.delete_script.lock().unwrap().pop_front() {
                None | Some(Call::Ok) => Ok(()),
                Some(Call::Terminal(reason, message)) => {
                    Err(CloudProviderError::terminal(reason, message))
                }
                Some(Call::Transient(message)) => Err(anyhow::anyhow!(message).into()),
                Some(_) => Ok(()),
            }
        }

        async fn cloud_config(
            &self,
            _spec: &MachineSpec,
        ) -> Result<CloudConfig, CloudProviderError> {
            Ok(CloudConfig {
                config: String::new(),
                provider_name: "fake".to_string(),
            })
        }
    }

    struct TestPlugin;

    #[async_trait]
    impl UserdataPlugin for TestPlugin {
        fn operating_system(&self) -> &'static str {
            "linux"
        }

        fn supported_container_runtimes(&self, _kubelet_version: &str) -> Vec<ContainerRuntimeInfo> {
            vec![
                ContainerRuntimeInfo {
                    name: "docker".to_string(),
                    version: "18.6.3".to_string(),
                },
                ContainerRuntimeInfo {
                    name: "docker".to_string(),
                    version: "18.9.9".to_string(),
                },
                ContainerRuntimeInfo {
                    name: "cri-o".to_string(),
                    version: "1.13.1".to_string(),
                },
            ]
        }

        async fn user_data(
            &self,
            _spec: &MachineSpec,
            kubeconfig: &Kubeconfig,
            _cloud: &dyn CloudProvider,
            _cluster_dns_ips: &[IpAddr],
        ) -> anyhow::Result<String> {
            let token = kubeconfig
                .auth_infos
                .first()
                .and_then(|auth| auth.auth_info.token.clone())
                .unwrap_or_default();
            Ok(format!("#cloud-config\ntoken: {}", token))
        }
    }

    fn controller_with(
        mock: MockKubeInterface,
        provider: Arc<TestProvider>,
        config: Config,
    ) -> Arc<MachineController> {
        let mut providers = ProviderRegistry::new();
        providers.register(provider);
        let mut userdata = UserdataRegistry::new();
        userdata.register(Arc::new(TestPlugin));
        MachineController::new(
            Arc::new(mock),
            providers,
            userdata,
            Arc::new(StaticKubeconfigProvider),
            config,
        )
    }

    fn machine(name: &str) -> Machine {
        let mut machine = Machine::new(
            name,
            MachineSpec {
                provider_config: serde_json::json!({
                    "cloudProvider": "fake",
                    "operatingSystem": "linux",
                }),
                versions: MachineVersionInfo {
                    kubelet: "1.9.2".to_string(),
                    container_runtime: ContainerRuntimeInfo {
                        name: "docker".to_string(),
                        version: "18.6.3".to_string(),
                    },
                },
                ..Default::default()
            },
        );
        machine.metadata.namespace = Some("kube-system".to_string());
        machine.metadata.uid = Some("uid-1".to_string());
        machine.metadata.resource_version = Some("1".to_string());
        machine.metadata.finalizers = Some(vec![MACHINE_FINALIZER.to_string()]);
        machine
    }

    fn node(name: &str, address: &str, ready: bool) -> Node {
        Node {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec::default()),
            status: Some(NodeStatus {
                addresses: Some(vec![NodeAddress {
                    address: address.to_string(),
                    type_: "InternalIP".to_string(),
                }]),
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                node_info: Some(NodeSystemInfo {
                    kubelet_version: "v1.9.2".to_string(),
                    container_runtime_version: "docker://18.6.3".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        }
    }

    fn expect_machine(mock: &mut MockKubeInterface, machine: &Machine) {
        let machine = machine.clone();
        mock.expect_find_machine()
            .returning(move |_| Ok(machine.clone()));
    }

    fn allow_events(mock: &mut MockKubeInterface) {
        mock.expect_record_event().returning(|_, _, _, _| Ok(()));
    }

    #[tokio::test]
    async fn finalizer_is_written_before_any_create() {
        let mut m1 = machine("m1");
        m1.metadata.finalizers = None;

        let mut mock = MockKubeInterface::new();
        expect_machine(&mut mock, &m1);
        allow_events(&mut mock);
        mock.expect_update_machine()
            .times(1)
            .withf(|machine| machine.has_finalizer())
            .returning(|machine| Ok(machine.clone()));

        let provider = Arc::new(TestProvider::default());
        let controller = controller_with(mock, Arc::clone(&provider), Config::default());

        assert!(controller.sync("m1").await.unwrap().is_none());
        assert_eq!(provider.create_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cold_creation_mints_token_and_creates_instance() {
        let m1 = machine("m1");

        let mut mock = MockKubeInterface::new();
        expect_machine(&mut mock, &m1);
        allow_events(&mut mock);
        mock.expect_find_secrets_with_label()
            .times(1)
            .returning(|_| Ok(Vec::new()));
        mock.expect_create_secret()
            .times(1)
            .returning(|secret| Ok(secret.clone()));

        let provider = Arc::new(TestProvider::default());
        let controller = controller_with(mock, Arc::clone(&provider), Config::default());

        let requeue = controller.sync("m1").await.unwrap();
        assert!(requeue.is_some(), "new instance needs a re-check");
        assert_eq!(provider.create_calls.load(Ordering::SeqCst), 1);

        let userdata = provider.last_userdata.lock().unwrap().clone().unwrap();
        assert!(userdata.contains("token: "), "userdata carries the bootstrap token");
    }

    #[tokio::test]
    async fn empty_versions_are_defaulted_and_persisted() {
        let mut m1 = machine("m1");
        m1.spec.versions = MachineVersionInfo::default();

        let mut mock = MockKubeInterface::new();
        expect_machine(&mut mock, &m1);
        allow_events(&mut mock);
        mock.expect_update_machine()
            .times(1)
            .withf(|machine| {
                machine.spec.versions.kubelet == "1.9.2"
                    && machine.spec.versions.container_runtime.name == "docker"
                    && machine.spec.versions.container_runtime.version == "18.9.9"
            })
            .returning(|machine| Ok(machine.clone()));

        let provider = Arc::new(TestProvider::default());
        // Cut the cycle short after defaulting; the creation path has its
        // own test.
        provider.push_validate(Call::Transient("cloud is busy"));
        let controller = controller_with(mock, Arc::clone(&provider), Config::default());

        assert!(controller.sync("m1").await.is_err());
        assert_eq!(provider.validate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn existing_instance_is_adopted_without_a_second_create() {
        let m1 = machine("m1");

        let mut mock = MockKubeInterface::new();
        expect_machine(&mut mock, &m1);
        allow_events(&mut mock);
        mock.expect_get_nodes()
            .times(1)
            .returning(|| Ok(vec![node("n1", "10.0.0.1", true)]));
        mock.expect_update_node()
            .times(1)
            .withf(|node| {
                let owner = node
                    .metadata
                    .owner_references
                    .as_ref()
                    .and_then(|refs| refs.first())
                    .expect("owner ref must be set");
                owner.kind == "Machine" && owner.uid == "uid-1" && owner.controller == Some(true)
            })
            .returning(|node| Ok(node.clone()));
        mock.expect_update_machine_status()
            .times(1)
            .withf(|machine| {
                let status = machine.status.as_ref().unwrap();
                status.node_ref == Some(NodeRef { name: "n1".to_string() })
                    && status.versions.as_ref().map(|v| v.kubelet.as_str()) == Some("v1.9.2")
                    && status
                        .versions
                        .as_ref()
                        .map(|v| v.container_runtime.name.as_str())
                        == Some("docker")
            })
            .returning(|machine| Ok(machine.clone()));

        let provider = Arc::new(TestProvider::default());
        provider.push_get(Call::Instance(ScriptedInstance::running("i-1", "10.0.0.1")));
        let controller = controller_with(mock, Arc::clone(&provider), Config::default());

        assert!(controller.sync("m1").await.unwrap().is_none());
        assert_eq!(provider.create_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ready_node_with_synced_metadata_causes_no_writes() {
        let mut m1 = machine("m1");
        m1.spec.labels.insert("a".to_string(), "1".to_string());
        m1.spec.taints.push(Taint {
            key: "k".to_string(),
            value: "v".to_string(),
            effect: "NoSchedule".to_string(),
        });
        m1.status = Some(crate::machine::MachineStatus {
            node_ref: Some(NodeRef { name: "n1".to_string() }),
            ..Default::default()
        });

        let mut owned = node("n1", "10.0.0.1", true);
        owned.metadata.owner_references = Some(vec![node::controller_owner_ref(&m1)]);
        owned.metadata.labels = Some(
            [
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ]
            .into_iter()
            .collect(),
        );
        owned.spec.as_mut().unwrap().taints = Some(vec![m1.spec.taints[0].to_kube()]);

        let mut mock = MockKubeInterface::new();
        expect_machine(&mut mock, &m1);
        allow_events(&mut mock);
        mock.expect_find_node()
            .times(1)
            .returning(move |_| Ok(owned.clone()));
        // No update expectations: any write here would fail the test.

        let provider = Arc::new(TestProvider::default());
        let controller = controller_with(mock, Arc::clone(&provider), Config::default());
        assert!(controller.sync("m1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ready_node_gets_missing_labels_and_taints() {
        let mut m1 = machine("m1");
        m1.spec.labels.insert("a".to_string(), "1".to_string());
        m1.spec.taints.push(Taint {
            key: "k".to_string(),
            value: "v".to_string(),
            effect: "NoSchedule".to_string(),
        });
        m1.status = Some(crate::machine::MachineStatus {
            node_ref: Some(NodeRef { name: "n1".to_string() }),
            ..Default::default()
        });

        let mut owned = node("n1", "10.0.0.1", true);
        owned.metadata.owner_references = Some(vec![node::controller_owner_ref(&m1)]);
        owned.metadata.labels = Some([("b".to_string(), "2".to_string())].into_iter().collect());

        let mut mock = MockKubeInterface::new();
        expect_machine(&mut mock, &m1);
        allow_events(&mut mock);
        mock.expect_find_node()
            .times(1)
            .returning(move |_| Ok(owned.clone()));
        mock.expect_update_node()
            .times(1)
            .withf(|node| {
                let labels = node.metadata.labels.as_ref().unwrap();
                let taints = node.spec.as_ref().unwrap().taints.as_ref().unwrap();
                labels.get("a") == Some(&"1".to_string())
                    && labels.get("b") == Some(&"2".to_string())
                    && taints.iter().any(|t| {
                        t.key == "k" && t.effect == "NoSchedule" && t.value.as_deref() == Some("v")
                    })
            })
            .returning(|node| Ok(node.clone()));

        let provider = Arc::new(TestProvider::default());
        let controller = controller_with(mock, Arc::clone(&provider), Config::default());
        assert!(controller.sync("m1").await.unwrap().is_none());
    }

    fn deleting_machine() -> Machine {
        let mut m1 = machine("m1");
        m1.metadata.deletion_timestamp = Some(Time(Utc::now()));
        m1
    }

    #[tokio::test]
    async fn deletion_requests_teardown_then_waits() {
        let m1 = deleting_machine();

        let mut mock = MockKubeInterface::new();
        expect_machine(&mut mock, &m1);
        allow_events(&mut mock);

        let provider = Arc::new(TestProvider::default());
        provider.push_get(Call::Instance(ScriptedInstance::running("i-1", "10.0.0.1")));
        provider.push_delete(Call::Ok);
        let config = Config::default();
        let initial_wait = config.initial_delete_wait_period;
        let controller = controller_with(mock, Arc::clone(&provider), config);

        let requeue = controller.sync("m1").await.unwrap();
        assert_eq!(requeue, Some(initial_wait));
        assert_eq!(provider.delete_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deletion_finishes_once_instance_is_gone() {
        let m1 = deleting_machine();

        let mut mock = MockKubeInterface::new();
        expect_machine(&mut mock, &m1);
        allow_events(&mut mock);
        mock.expect_update_machine()
            .times(1)
            .withf(|machine| !machine.has_finalizer())
            .returning(|machine| Ok(machine.clone()));

        let provider = Arc::new(TestProvider::default());
        // Empty get script defaults to InstanceNotFound.
        let controller = controller_with(mock, Arc::clone(&provider), Config::default());

        assert!(controller.sync("m1").await.unwrap().is_none());
        assert_eq!(provider.delete_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn already_deleting_instance_is_polled_not_redeleted() {
        let m1 = deleting_machine();

        let mut mock = MockKubeInterface::new();
        expect_machine(&mut mock, &m1);
        allow_events(&mut mock);

        let provider = Arc::new(TestProvider::default());
        provider.push_get(Call::Instance(
            ScriptedInstance::running("i-1", "10.0.0.1").with_status(InstanceStatus::Deleting),
        ));
        let config = Config::default();
        let retry_wait = config.deletion_retry_wait_period;
        let controller = controller_with(mock, Arc::clone(&provider), config);

        let requeue = controller.sync("m1").await.unwrap();
        assert_eq!(requeue, Some(retry_wait));
        assert_eq!(provider.delete_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn instance_reported_deleted_releases_the_finalizer() {
        let m1 = deleting_machine();

        let mut mock = MockKubeInterface::new();
        expect_machine(&mut mock, &m1);
        allow_events(&mut mock);
        mock.expect_update_machine()
            .times(1)
            .withf(|machine| !machine.has_finalizer())
            .returning(|machine| Ok(machine.clone()));

        let provider = Arc::new(TestProvider::default());
        provider.push_get(Call::Instance(
            ScriptedInstance::running("i-1", "10.0.0.1").with_status(InstanceStatus::Deleted),
        ));
        let controller = controller_with(mock, Arc::clone(&provider), Config::default());

        assert!(controller.sync("m1").await.unwrap().is_none());
        assert_eq!(provider.delete_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn terminal_deletion_failure_keeps_finalizer_and_hints_at_escape() {
        let m1 = deleting_machine();
        let saw_hint = Arc::new(AtomicBool::new(false));

        let mut mock = MockKubeInterface::new();
        expect_machine(&mut mock, &m1);
        let hint = Arc::clone(&saw_hint);
        mock.expect_record_event()
            .returning(move |_, _, _, note| {
                if note.contains("manually delete finalizers") {
                    hint.store(true, Ordering::SeqCst);
                }
                Ok(())
            });
        mock.expect_update_machine_status()
            .times(1)
            .withf(|machine| {
                let status = machine.status.as_ref().unwrap();
                status.error_reason == Some(MachineStatusError::DeleteMachineError)
                    && status
                        .error_message
                        .as_deref()
                        .map(|message| message.starts_with("quota exceeded"))
                        .unwrap_or(false)
            })
            .returning(|machine| Ok(machine.clone()));

        let provider = Arc::new(TestProvider::default());
        provider.push_get(Call::Instance(ScriptedInstance::running("i-1", "10.0.0.1")));
        provider.push_delete(Call::Terminal(
            MachineStatusError::DeleteMachineError,
            "quota exceeded",
        ));
        let controller = controller_with(mock, Arc::clone(&provider), Config::default());

        assert!(controller.sync("m1").await.unwrap().is_none());
        assert!(saw_hint.load(Ordering::SeqCst), "user must be told the escape hatch");
    }

    #[tokio::test]
    async fn terminal_validation_is_recorded_and_cached() {
        let m1 = machine("m1");

        let mut mock = MockKubeInterface::new();
        expect_machine(&mut mock, &m1);
        allow_events(&mut mock);
        mock.expect_update_machine_status()
            .times(1)
            .withf(|machine| {
                let status = machine.status.as_ref().unwrap();
                status.error_reason == Some(MachineStatusError::InvalidConfiguration)
                    && status.error_message.as_deref() == Some("bad zone")
            })
            .returning(|machine| Ok(machine.clone()));

        let provider = Arc::new(TestProvider::default());
        provider.push_validate(Call::Terminal(
            MachineStatusError::InvalidConfiguration,
            "bad zone",
        ));
        let controller = controller_with(mock, Arc::clone(&provider), Config::default());

        assert!(controller.sync("m1").await.unwrap().is_none());
        assert_eq!(provider.validate_calls.load(Ordering::SeqCst), 1);

        // Same ResourceVersion: the cached verdict short-circuits the cycle
        // without another validate call or status write.
        assert!(controller.sync("m1").await.unwrap().is_none());
        assert_eq!(provider.validate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn spec_change_invalidates_the_validation_verdict() {
        let mut m1 = machine("m1");

        let mut mock = MockKubeInterface::new();
        allow_events(&mut mock);
        mock.expect_update_machine_status()
            .returning(|machine| Ok(machine.clone()));
        // First cycle sees revision 1, second cycle revision 2.
        let mut revisions = vec![m1.clone()];
        m1.metadata.resource_version = Some("2".to_string());
        revisions.push(m1);
        let served = Mutex::new(VecDeque::from(revisions));
        mock.expect_find_machine().returning(move |_| {
            let mut served = served.lock().unwrap();
            let machine = served.pop_front().unwrap_or_else(|| {
                panic!("unexpected extra reconcile")
            });
            Ok(machine)
        });

        let provider = Arc::new(TestProvider::default());
        provider.push_validate(Call::Terminal(
            MachineStatusError::InvalidConfiguration,
            "bad zone",
        ));
        provider.push_validate(Call::Terminal(
            MachineStatusError::InvalidConfiguration,
            "bad zone",
        ));
        let controller = controller_with(mock, Arc::clone(&provider), Config::default());

        assert!(controller.sync("m1").await.unwrap().is_none());
        assert!(controller.sync("m1").await.unwrap().is_none());
        assert_eq!(
            provider.validate_calls.load(Ordering::SeqCst),
            2,
            "a new revision must be validated again"
        );
    }

    #[tokio::test]
    async fn machines_claimed_by_another_controller_are_skipped() {
        let mut m1 = machine("m1");
        m1.metadata.annotations = Some(
            [(CONTROLLER_ANNOTATION.to_string(), "other".to_string())]
                .into_iter()
                .collect(),
        );

        let mut mock = MockKubeInterface::new();
        expect_machine(&mut mock, &m1);
        // Any provider or store interaction would panic the mock.

        let provider = Arc::new(TestProvider::default());
        let controller = controller_with(mock, Arc::clone(&provider), Config::default());
        assert!(controller.sync("m1").await.unwrap().is_none());

        // And the inverse: a named controller ignores annotationless machines.
        let m2 = machine("m2");
        let mut mock = MockKubeInterface::new();
        expect_machine(&mut mock, &m2);
        let named = Config {
            controller_name: Some("named".to_string()),
            ..Config::default()
        };
        let controller = controller_with(mock, Arc::new(TestProvider::default()), named);
        assert!(controller.sync("m2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_provider_is_a_terminal_misconfiguration() {
        let mut m1 = machine("m1");
        m1.spec.provider_config = serde_json::json!({
            "cloudProvider": "gce",
            "operatingSystem": "linux",
        });

        let mut mock = MockKubeInterface::new();
        expect_machine(&mut mock, &m1);
        allow_events(&mut mock);
        mock.expect_update_machine_status()
            .times(1)
            .withf(|machine| {
                machine.status.as_ref().unwrap().error_reason
                    == Some(MachineStatusError::InvalidConfiguration)
            })
            .returning(|machine| Ok(machine.clone()));

        let controller = controller_with(mock, Arc::new(TestProvider::default()), Config::default());
        assert!(controller.sync("m1").await.unwrap().is_none());
    }
}
