//! Clients for workload clusters
//!
//! The management cluster stores an admin kubeconfig for every workload
//! cluster in the Secret `<cluster>-kubeconfig`, under the key `value`.

use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use tracing::debug;

use super::cluster_watch::ClusterKey;
use crate::error::{Error, Result};

/// Key of the kubeconfig inside the cluster's secret
pub const KUBECONFIG_SECRET_KEY: &str = "value";

/// Name of the Secret holding the kubeconfig of `cluster`
pub fn kubeconfig_secret_name(cluster: &str) -> String {
    format!("{}-kubeconfig", cluster)
}

/// Parse the kubeconfig stored in a cluster's secret
pub fn kubeconfig_from_secret(cluster: &ClusterKey, secret: &Secret) -> Result<Kubeconfig> {
    let data = secret
        .data
        .as_ref()
        .and_then(|data| data.get(KUBECONFIG_SECRET_KEY))
        .ok_or_else(|| Error::RemoteClusterError {
            cluster: cluster.to_string(),
            message: format!(
                "secret {} has no key {:?}",
                kubeconfig_secret_name(&cluster.name),
                KUBECONFIG_SECRET_KEY
            ),
        })?;

    let yaml = std::str::from_utf8(&data.0).map_err(|e| Error::RemoteClusterError {
        cluster: cluster.to_string(),
        message: format!("kubeconfig is not valid UTF-8: {}", e),
    })?;

    Ok(Kubeconfig::from_yaml(yaml)?)
}

/// Build a client for the workload cluster `cluster` using the kubeconfig
/// secret in the cluster's namespace
pub async fn remote_client(client: &Client, cluster: &ClusterKey) -> Result<Client> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &cluster.namespace);
    let secret_name = kubeconfig_secret_name(&cluster.name);

    let secret = secrets
        .get_opt(&secret_name)
        .await?
        .ok_or_else(|| Error::NotFound {
            kind: "Secret".to_string(),
            name: secret_name.clone(),
            namespace: cluster.namespace.clone(),
        })?;

    let kubeconfig = kubeconfig_from_secret(cluster, &secret)?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    debug!("Connecting to cluster {} at {}", cluster, config.cluster_url);

    Client::try_from(config).map_err(|e| Error::RemoteClusterError {
        cluster: cluster.to_string(),
        message: e.to_string(),
    })
}
