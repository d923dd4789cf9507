use kube::Client;
use tracing::info;

/// One-shot migration of legacy machine objects into the canonical group.
/// Must run to completion before the controller is pointed at the store.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let namespace =
        std::env::var("MACHINE_NAMESPACE").unwrap_or_else(|_| "kube-system".to_string());
    let client = Client::try_default().await?;

    let migrated = machine::migrations::migrate_legacy_machines(client, &namespace).await?;
    info!(migrated, "migration finished");
    Ok(())
}
