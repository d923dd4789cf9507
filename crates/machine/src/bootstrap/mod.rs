//! Bootstrap-token issuance: the short-lived credential baked into a new
//! instance's boot configuration so the kubelet on it can introduce itself
//! to the apiserver and request real certificates.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::config::{Kubeconfig, NamedAuthInfo, NamedContext};
use rand::Rng;
use tracing::{debug, instrument};

use crate::store::{KubeInterface, SECRET_NAMESPACE};

/// Label tying a bootstrap secret to the machine it was minted for.
pub const MACHINE_NAME_LABEL: &str = "machine.k8s.io/machine.name";

/// Well-known secret type the apiserver's bootstrap authenticator consumes.
pub const BOOTSTRAP_TOKEN_SECRET_TYPE: &str = "bootstrap.kubernetes.io/token";

const AUTH_EXTRA_GROUPS: &str = "system:bootstrappers:machine-controller:default-node-token";
const TOKEN_ID_LENGTH: usize = 6;
const TOKEN_SECRET_LENGTH: usize = 16;
// Token grammar per the bootstrap-token spec: lowercase alphanumerics only.
const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TOKEN_TTL_HOURS: i64 = 24;

/// Source of the cluster-info kubeconfig (public CA and server URL) that
/// bootstrap kubeconfigs are derived from. Injected so the readiness check
/// and the issuer agree on what "usable" means.
pub trait KubeconfigProvider: Send + Sync {
    fn get_kubeconfig(&self) -> anyhow::Result<Kubeconfig>;
}

/// Reads the cluster-info kubeconfig from a file on every call, so rotations
/// on disk are picked up without a restart.
pub struct FileKubeconfigProvider {
    path: PathBuf,
}

impl FileKubeconfigProvider {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileKubeconfigProvider {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl KubeconfigProvider for FileKubeconfigProvider {
    fn get_kubeconfig(&self) -> anyhow::Result<Kubeconfig> {
        let raw = std::fs::read(&self.path)
            .map_err(|e| anyhow::anyhow!("error loading cluster-info file: {}", e))?;
        let config = serde_yaml::from_slice(&raw)
            .map_err(|e| anyhow::anyhow!("error parsing cluster-info file: {}", e))?;
        Ok(config)
    }
}

/// A bootstrap kubeconfig is only usable when it names exactly one cluster
/// and that cluster carries both a server URL and CA data. The readiness
/// probe runs the same check against the raw cluster-info config.
pub fn verify_cluster_info(kubeconfig: &Kubeconfig) -> anyhow::Result<()> {
    if kubeconfig.clusters.len() != 1 {
        anyhow::bail!(
            "cluster-info kubeconfig must contain exactly one cluster, found {}",
            kubeconfig.clusters.len()
        );
    }
    let cluster = &kubeconfig.clusters[0].cluster;
    if cluster.server.is_empty() {
        anyhow::bail!("cluster-info kubeconfig has no server address");
    }
    let has_ca = cluster
        .certificate_authority_data
        .as_ref()
        .map(|data| !data.is_empty())
        .unwrap_or(false)
        || cluster.certificate_authority.is_some();
    if !has_ca {
        anyhow::bail!("cluster-info kubeconfig has no certificate authority");
    }
    Ok(())
}

/// Mints and refreshes bootstrap tokens and assembles the kubeconfig that
/// embeds them.
pub struct BootstrapTokenIssuer {
    kube: Arc<dyn KubeInterface>,
    kubeconfig_provider: Arc<dyn KubeconfigProvider>,
}

impl BootstrapTokenIssuer {
    pub fn new(
        kube: Arc<dyn KubeInterface>,
        kubeconfig_provider: Arc<dyn KubeconfigProvider>,
    ) -> Self {
        BootstrapTokenIssuer {
            kube,
            kubeconfig_provider,
        }
    }

    /// Returns a kubeconfig whose auth section is `<token-id>.<token-secret>`
    /// for this machine, creating the backing secret or extending the
    /// lifetime of the existing one.
    ///
    /// Exactly zero or one bootstrap secrets may exist per machine name;
    /// finding more is a hard error since we cannot tell which token the
    /// instance on the cloud side was booted with.
    #[instrument(level = "debug", skip(self))]
    pub async fn create_bootstrap_kubeconfig(
        &self,
        machine_name: &str,
    ) -> anyhow::Result<Kubeconfig> {
        let selector = format!("{}={}", MACHINE_NAME_LABEL, machine_name);
        let mut secrets = self.kube.find_secrets_with_label(&selector).await?;

        let token = match secrets.len() {
            0 => {
                let token_id = generate_token(TOKEN_ID_LENGTH);
                let token_secret = generate_token(TOKEN_SECRET_LENGTH);
                let secret = bootstrap_secret(machine_name, &token_id, &token_secret);
                debug!(
                    secret = %secret.metadata.name.as_deref().unwrap_or_default(),
                    "creating bootstrap token secret"
                );
                self.kube.create_secret(&secret).await?;
                format!("{}.{}", token_id, token_secret)
            }
            1 => {
                let mut secret = secrets.remove(0);
                let token_id = secret_field(&secret, "token-id").ok_or_else(|| {
                    anyhow::anyhow!("bootstrap secret for {} has no token-id", machine_name)
                })?;
                let token_secret = secret_field(&secret, "token-secret").ok_or_else(|| {
                    anyhow::anyhow!("bootstrap secret for {} has no token-secret", machine_name)
                })?;
                extend_expiration(&mut secret);
                debug!(
                    secret = %secret.metadata.name.as_deref().unwrap_or_default(),
                    "extending bootstrap token expiration"
                );
                self.kube.update_secret(&secret).await?;
                format!("{}.{}", token_id, token_secret)
            }
            found => anyhow::bail!(
                "expected at most one bootstrap secret for machine {}, found {}",
                machine_name,
                found
            ),
        };

        let mut kubeconfig = self.kubeconfig_provider.get_kubeconfig()?;
        verify_cluster_info(&kubeconfig)?;

        let cluster_name = kubeconfig.clusters[0].name.clone();
        let auth_info: NamedAuthInfo = serde_json::from_value(serde_json::json!({
            "name": machine_name,
            "user": { "token": token },
        }))?;
        let context: NamedContext = serde_json::from_value(serde_json::json!({
            "name": machine_name,
            "context": { "cluster": cluster_name, "user": machine_name },
        }))?;
        kubeconfig.auth_infos = vec![auth_info];
        kubeconfig.contexts = vec![context];
        kubeconfig.current_context = Some(machine_name.to_string());
        Ok(kubeconfig)
    }
}

fn generate_token(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

fn expiration_from_now() -> String {
    (Utc::now() + Duration::hours(TOKEN_TTL_HOURS)).to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn bootstrap_secret(machine_name: &str, token_id: &str, token_secret: &str) -> Secret {
    let mut labels = BTreeMap::new();
    labels.insert(MACHINE_NAME_LABEL.to_string(), machine_name.to_string());

    let mut fields = BTreeMap::new();
    fields.insert(
        "description".to_string(),
        format!("bootstrap token for {}", machine_name),
    );
    fields.insert("token-id".to_string(), token_id.to_string());
    fields.insert("token-secret".to_string(), token_secret.to_string());
    fields.insert("expiration".to_string(), expiration_from_now());
    fields.insert("usage-bootstrap-authentication".to_string(), "true".to_string());
    fields.insert("usage-bootstrap-signing".to_string(), "true".to_string());
    fields.insert("auth-extra-groups".to_string(), AUTH_EXTRA_GROUPS.to_string());

    Secret {
        metadata: ObjectMeta {
            name: Some(format!("bootstrap-token-{}", token_id)),
            namespace: Some(SECRET_NAMESPACE.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        type_: Some(BOOTSTRAP_TOKEN_SECRET_TYPE.to_string()),
        string_data: Some(fields),
        ..Default::default()
    }
}

/// Reads a token field regardless of whether the secret came back from the
/// apiserver (base64 `data`) or was just built locally (`string_data`).
fn secret_field(secret: &Secret, key: &str) -> Option<String> {
    if let Some(data) = secret.data.as_ref() {
        if let Some(value) = data.get(key) {
            return String::from_utf8(value.0.clone()).ok();
        }
    }
    secret
        .string_data
        .as_ref()
        .and_then(|fields| fields.get(key).cloned())
}

fn extend_expiration(secret: &mut Secret) {
    secret
        .string_data
        .get_or_insert_with(BTreeMap::new)
        .insert("expiration".to_string(), expiration_from_now());
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::MockKubeInterface;
    use kube::config::Kubeconfig;

    const CLUSTER_INFO: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: test-cluster
  cluster:
    certificate-authority-data: dGVzdC1jYQ==
    server: https://cluster.example:6443
"#;

    struct StaticKubeconfigProvider(&'static str);

    impl KubeconfigProvider for StaticKubeconfigProvider {
        fn get_kubeconfig(&self) -> anyhow::Result<Kubeconfig> {
            Ok(serde_yaml::from_str(self.0)?)
        }
    }

    fn issuer(mock: MockKubeInterface) -> BootstrapTokenIssuer {
        BootstrapTokenIssuer::new(
            Arc::new(mock),
            Arc::new(StaticKubeconfigProvider(CLUSTER_INFO)),
        )
    }

    #[test]
    fn generated_tokens_match_the_grammar() {
        let token_id = generate_token(6);
        let token_secret = generate_token(16);
        assert_eq!(token_id.len(), 6);
        assert_eq!(token_secret.len(), 16);
        for c in token_id.chars().chain(token_secret.chars()) {
            assert!(c.is_ascii_lowercase() || c.is_ascii_digit(), "bad char {}", c);
        }
    }

    #[test]
    fn new_secret_carries_the_required_fields() {
        let secret = bootstrap_secret("m1", "abc123", "0123456789abcdef");
        assert_eq!(secret.metadata.name.as_deref(), Some("bootstrap-token-abc123"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some(SECRET_NAMESPACE));
        assert_eq!(secret.type_.as_deref(), Some(BOOTSTRAP_TOKEN_SECRET_TYPE));
        assert_eq!(
            secret.metadata.labels.as_ref().unwrap().get(MACHINE_NAME_LABEL),
            Some(&"m1".to_string())
        );
        let fields = secret.string_data.as_ref().unwrap();
        assert_eq!(fields.get("token-id").unwrap(), "abc123");
        assert_eq!(fields.get("token-secret").unwrap(), "0123456789abcdef");
        assert_eq!(fields.get("usage-bootstrap-authentication").unwrap(), "true");
        assert_eq!(fields.get("usage-bootstrap-signing").unwrap(), "true");
        assert_eq!(
            fields.get("description").unwrap(),
            "bootstrap token for m1"
        );
        assert!(fields.contains_key("expiration"));
    }

    #[tokio::test]
    async fn mints_a_fresh_token_when_none_exists() {
        let mut mock = MockKubeInterface::new();
        mock.expect_find_secrets_with_label()
            .withf(|selector| selector == "machine.k8s.io/machine.name=m1")
            .times(1)
            .returning(|_| Ok(Vec::new()));
        mock.expect_create_secret()
            .times(1)
            .withf(|secret| {
                secret.type_.as_deref() == Some(BOOTSTRAP_TOKEN_SECRET_TYPE)
                    && secret
                        .metadata
                        .name
                        .as_deref()
                        .unwrap()
                        .starts_with("bootstrap-token-")
            })
            .returning(|secret| Ok(secret.clone()));

        let kubeconfig = issuer(mock)
            .create_bootstrap_kubeconfig("m1")
            .await
            .unwrap();

        assert_eq!(kubeconfig.clusters.len(), 1);
        assert_eq!(kubeconfig.auth_infos.len(), 1);
        let token = kubeconfig.auth_infos[0].auth_info.token.as_ref().unwrap();
        let (id, secret) = token.split_once('.').unwrap();
        assert_eq!(id.len(), 6);
        assert_eq!(secret.len(), 16);
        assert_eq!(kubeconfig.current_context.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn reuses_and_extends_an_existing_token() {
        let existing = bootstrap_secret("m1", "abc123", "0123456789abcdef");
        let mut mock = MockKubeInterface::new();
        mock.expect_find_secrets_with_label()
            .times(1)
            .returning(move |_| Ok(vec![existing.clone()]));
        mock.expect_update_secret()
            .times(1)
            .withf(|secret| {
                secret
                    .string_data
                    .as_ref()
                    .map(|fields| fields.contains_key("expiration"))
                    .unwrap_or(false)
            })
            .returning(|secret| Ok(secret.clone()));

        let kubeconfig = issuer(mock)
            .create_bootstrap_kubeconfig("m1")
            .await
            .unwrap();
        assert_eq!(
            kubeconfig.auth_infos[0].auth_info.token.as_deref(),
            Some("abc123.0123456789abcdef")
        );
    }

    #[tokio::test]
    async fn more_than_one_secret_is_a_hard_error() {
        let mut mock = MockKubeInterface::new();
        mock.expect_find_secrets_with_label().times(1).returning(|_| {
            Ok(vec![
                bootstrap_secret("m1", "aaaaaa", "0123456789abcdef"),
                bootstrap_secret("m1", "bbbbbb", "fedcba9876543210"),
            ])
        });

        let err = issuer(mock)
            .create_bootstrap_kubeconfig("m1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("at most one"));
    }

    #[test]
    fn cluster_info_must_have_exactly_one_complete_cluster() {
        let good: Kubeconfig = serde_yaml::from_str(CLUSTER_INFO).unwrap();
        assert!(verify_cluster_info(&good).is_ok());

        let empty = Kubeconfig::default();
        assert!(verify_cluster_info(&empty).is_err());

        let no_ca: Kubeconfig = serde_yaml::from_str(
            r#"
clusters:
- name: test-cluster
  cluster:
    server: https://cluster.example:6443
"#,
        )
        .unwrap();
        assert!(verify_cluster_info(&no_ca).is_err());
    }
}
