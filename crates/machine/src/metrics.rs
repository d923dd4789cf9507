//! Prometheus metrics and the controller's health endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramVec, IntCounter, IntGauge};
use tracing::info;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::bootstrap::{verify_cluster_info, KubeconfigProvider};

/// Operation labels for [`CLOUD_OPERATIONS`].
pub const OP_GET_INSTANCE: &str = "get-cloud-instance";
pub const OP_CREATE_INSTANCE: &str = "create-cloud-instance";
pub const OP_DELETE_INSTANCE: &str = "delete-cloud-instance";
pub const OP_VALIDATE_MACHINE: &str = "validate-machine";

lazy_static! {
    /// Reconcile failures of any kind, terminal or transient.
    pub static ref ERRORS: IntCounter = prometheus::register_int_counter!(
        "machine_controller_errors_total",
        "Number of errors the machine controller encountered"
    )
    .unwrap();

    /// Latency of the individual cloud-provider operations.
    pub static ref CLOUD_OPERATIONS: HistogramVec = prometheus::register_histogram_vec!(
        "machine_controller_cloud_operation_duration_seconds",
        "Duration of cloud provider operations",
        &["operation"]
    )
    .unwrap();

    /// Wall time between a machine being created and its node joining,
    /// observed once per machine at the moment of adoption.
    pub static ref NODE_JOIN_DURATION: Histogram = prometheus::register_histogram!(
        "machine_controller_node_join_duration_seconds",
        "Time between machine creation and node adoption",
        prometheus::exponential_buckets(15.0, 2.0, 10).unwrap()
    )
    .unwrap();

    /// Machines currently known to the controller.
    pub static ref MACHINES: IntGauge = prometheus::register_int_gauge!(
        "machine_controller_machines",
        "Number of machines the controller manages"
    )
    .unwrap();
}

async fn metrics_handler() -> Result<impl Reply, Rejection> {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .expect("couldn't encode prometheus metrics");
    let body =
        String::from_utf8(buffer).expect("prometheus metrics could not be converted to String");
    Ok(body)
}

/// Serves `/metrics`, `/healthz` and `/readyz`.
///
/// Readiness mirrors the bootstrap issuer's invariant: the cluster-info
/// kubeconfig must contain exactly one cluster with server and CA set,
/// otherwise no machine this controller creates could ever join.
pub async fn run_webserver(
    addr: SocketAddr,
    kubeconfig_provider: Arc<dyn KubeconfigProvider>,
) -> anyhow::Result<()> {
    let metrics_route = warp::path!("metrics").and_then(metrics_handler);
    let healthz = warp::path!("healthz").map(|| "ok");
    let readyz = warp::path!("readyz").and_then(move || {
        let provider = Arc::clone(&kubeconfig_provider);
        async move {
            let checked = provider
                .get_kubeconfig()
                .and_then(|kubeconfig| verify_cluster_info(&kubeconfig));
            match checked {
                Ok(()) => Ok::<_, Rejection>(warp::reply::with_status(
                    "ok".to_string(),
                    StatusCode::OK,
                )),
                Err(error) => Ok(warp::reply::with_status(
                    format!("not ready: {}", error),
                    StatusCode::SERVICE_UNAVAILABLE,
                )),
            }
        }
    });

    info!(%addr, "starting metrics and health server");
    warp::serve(metrics_route.or(healthz).or(readyz))
        .run(addr)
        .await;
    Ok(())
}
