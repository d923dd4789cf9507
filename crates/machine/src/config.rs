//! The configuration needed for the controller to run. This can be filled in
//! manually in your code or, with the `cli` feature enabled, parsed from
//! flags and environment variables via [`Config::new_from_flags`].

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Namespace machines and bootstrap secrets are managed in.
pub const DEFAULT_NAMESPACE: &str = "kube-system";

const DEFAULT_WORKER_COUNT: usize = 5;
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8085";
const DEFAULT_KUBERNETES_VERSION: &str = "1.9.2";

#[derive(Clone, Debug)]
pub struct Config {
    /// Value required in the `machine.k8s.io/controller` annotation for a
    /// machine to be reconciled. `None` means only machines *without* the
    /// annotation are ours.
    pub controller_name: Option<String>,
    /// Namespace the machine objects live in.
    pub namespace: String,
    /// Number of parallel reconcile workers.
    pub worker_count: usize,
    /// DNS server IPs handed to the userdata layer.
    pub cluster_dns_ips: Vec<IpAddr>,
    /// Path to the cluster-info kubeconfig (public CA + apiserver address)
    /// that bootstrap kubeconfigs are derived from.
    pub cluster_info_kubeconfig: PathBuf,
    /// Kubelet version machines default to when their spec leaves it empty.
    pub latest_kubernetes_version: String,
    /// How long to wait between polls of an instance that is already being
    /// torn down by the provider.
    pub deletion_retry_wait_period: Duration,
    /// How long to wait after issuing a delete before checking on it.
    pub initial_delete_wait_period: Duration,
    /// Interval of the machine-count metrics task.
    pub metrics_update_period: Duration,
    /// Bind address for the metrics and health server.
    pub listen_addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            controller_name: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            worker_count: DEFAULT_WORKER_COUNT,
            cluster_dns_ips: vec!["10.10.10.10".parse().expect("hardcoded IP must parse")],
            cluster_info_kubeconfig: PathBuf::from("/etc/kubernetes/cluster-info.kubeconfig"),
            latest_kubernetes_version: DEFAULT_KUBERNETES_VERSION.to_string(),
            deletion_retry_wait_period: Duration::from_secs(10),
            initial_delete_wait_period: Duration::from_secs(5),
            metrics_update_period: Duration::from_secs(10),
            listen_addr: DEFAULT_LISTEN_ADDR
                .parse()
                .expect("hardcoded address must parse"),
        }
    }
}

#[cfg(feature = "cli")]
impl Config {
    /// Parses all command line flags and environment variables, applying the
    /// defaults above for anything left unset. Pass your application version
    /// so `--version` reports the right thing.
    pub fn new_from_flags(version: &str) -> Self {
        use structopt::StructOpt;

        let app = Opts::clap().version(version);
        let opts = Opts::from_clap(&app.get_matches());
        let defaults = Config::default();
        Config {
            controller_name: opts.controller_name,
            namespace: opts.namespace,
            worker_count: opts.worker_count,
            cluster_dns_ips: if opts.cluster_dns.is_empty() {
                defaults.cluster_dns_ips
            } else {
                opts.cluster_dns
            },
            cluster_info_kubeconfig: opts.cluster_info_kubeconfig,
            latest_kubernetes_version: opts.latest_kubernetes_version,
            deletion_retry_wait_period: Duration::from_secs(opts.deletion_retry_wait_seconds),
            initial_delete_wait_period: Duration::from_secs(opts.initial_delete_wait_seconds),
            metrics_update_period: Duration::from_secs(opts.metrics_update_seconds),
            listen_addr: opts.listen_addr,
        }
    }
}

/// The flags the controller binary accepts.
#[cfg(feature = "cli")]
#[derive(structopt::StructOpt, Clone, Debug)]
#[structopt(
    name = "machine-controller",
    about = "Reconciles machine objects against a cloud provider"
)]
pub struct Opts {
    #[structopt(
        long = "controller-name",
        env = "CONTROLLER_NAME",
        help = "Only reconcile machines whose controller annotation carries this value; unset means machines without the annotation"
    )]
    controller_name: Option<String>,

    #[structopt(
        long = "namespace",
        env = "MACHINE_NAMESPACE",
        default_value = "kube-system",
        help = "Namespace the machine objects live in"
    )]
    namespace: String,

    #[structopt(
        long = "worker-count",
        env = "WORKER_COUNT",
        default_value = "5",
        help = "Number of machines reconciled in parallel"
    )]
    worker_count: usize,

    #[structopt(
        long = "cluster-dns",
        env = "CLUSTER_DNS",
        use_delimiter = true,
        help = "Comma-separated DNS server IPs for the kubelets on new instances"
    )]
    cluster_dns: Vec<IpAddr>,

    #[structopt(
        long = "cluster-info-kubeconfig",
        env = "CLUSTER_INFO_KUBECONFIG",
        default_value = "/etc/kubernetes/cluster-info.kubeconfig",
        help = "Path to the kubeconfig holding the cluster CA and apiserver address"
    )]
    cluster_info_kubeconfig: PathBuf,

    #[structopt(
        long = "latest-kubernetes-version",
        env = "LATEST_KUBERNETES_VERSION",
        default_value = "1.9.2",
        help = "Kubelet version used when a machine spec does not pin one"
    )]
    latest_kubernetes_version: String,

    #[structopt(
        long = "deletion-retry-wait-seconds",
        default_value = "10",
        help = "Seconds between polls of an instance the provider is still deleting"
    )]
    deletion_retry_wait_seconds: u64,

    #[structopt(
        long = "initial-delete-wait-seconds",
        default_value = "5",
        help = "Seconds to wait after issuing an instance delete before checking on it"
    )]
    initial_delete_wait_seconds: u64,

    #[structopt(
        long = "metrics-update-seconds",
        default_value = "10",
        help = "Interval of the machine-count metrics task"
    )]
    metrics_update_seconds: u64,

    #[structopt(
        long = "listen-address",
        env = "LISTEN_ADDRESS",
        default_value = "0.0.0.0:8085",
        help = "Bind address for the metrics and health endpoints"
    )]
    listen_addr: SocketAddr,
}
