use std::sync::Arc;

use kube::Client;
use tracing::info;

use fake_provider::FakeCloudProvider;
use machine::bootstrap::{FileKubeconfigProvider, KubeconfigProvider};
use machine::provider::ProviderRegistry;
use machine::store::KubeImpl;
use machine::userdata::cloudinit::CloudInitPlugin;
use machine::userdata::UserdataRegistry;
use machine::{Config, MachineController};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::new_from_flags(env!("CARGO_PKG_VERSION"));

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Tries a local kubeconfig first, then falls back to the in-cluster
    // service account.
    let client = Client::try_default().await?;
    let kube = Arc::new(KubeImpl::new(client.clone(), &config.namespace));

    // The drivers and userdata generators this build ships with. Real cloud
    // drivers register here exactly like the reference one.
    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(FakeCloudProvider::new()));
    let mut userdata = UserdataRegistry::new();
    userdata.register(Arc::new(CloudInitPlugin));

    let kubeconfig_provider: Arc<dyn KubeconfigProvider> =
        Arc::new(FileKubeconfigProvider::new(&config.cluster_info_kubeconfig));

    let webserver = tokio::spawn(machine::metrics::run_webserver(
        config.listen_addr,
        Arc::clone(&kubeconfig_provider),
    ));

    info!(version = env!("CARGO_PKG_VERSION"), "machine controller starting");
    let controller = MachineController::new(kube, providers, userdata, kubeconfig_provider, config);
    controller.run(client).await?;

    webserver.abort();
    info!("machine controller stopped");
    Ok(())
}
