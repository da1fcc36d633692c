//! Resolves how to reach the apiserver.

use std::path::{Path, PathBuf};

use kube_client::{
    config::{InClusterError, KubeConfigOptions, Kubeconfig, KubeconfigError},
    Client, Config as ClientConfig,
};

/// Set inside every pod; its presence selects in-cluster credentials.
pub const IN_CLUSTER_ENV: &str = "KUBERNETES_SERVICE_HOST";

/// Fatal at startup: no watch is started without a client.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load in-cluster configuration: {0}")]
    InCluster(#[source] InClusterError),
    #[error("failed to load kubeconfig {}: {source}", path.display())]
    Kubeconfig {
        path: PathBuf,
        #[source]
        source: KubeconfigError,
    },
    #[error("no kubeconfig given and no home directory to look in")]
    NoHome,
    #[error("failed to create Kubernetes client: {0}")]
    Client(#[source] kube_client::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    InCluster,
    Kubeconfig(PathBuf),
}

impl Credentials {
    /// Probes the environment for in-cluster credentials and falls back to a kubeconfig.
    pub fn resolve(kubeconfig: Option<&Path>) -> Result<Self, ConfigError> {
        Self::probe(
            std::env::var_os(IN_CLUSTER_ENV).is_some(),
            kubeconfig,
            home::home_dir(),
        )
    }

    fn probe(
        in_cluster: bool,
        kubeconfig: Option<&Path>,
        home: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        if in_cluster {
            return Ok(Self::InCluster);
        }
        match kubeconfig {
            Some(path) => Ok(Self::Kubeconfig(path.to_owned())),
            None => home
                .map(|home| Self::Kubeconfig(home.join(".kube").join("config")))
                .ok_or(ConfigError::NoHome),
        }
    }

    pub async fn client(&self) -> Result<Client, ConfigError> {
        let config = match self {
            Self::InCluster => ClientConfig::incluster().map_err(ConfigError::InCluster)?,
            Self::Kubeconfig(path) => {
                let to_error = |source| ConfigError::Kubeconfig {
                    path: path.clone(),
                    source,
                };
                let kubeconfig = Kubeconfig::read_from(path).map_err(to_error)?;
                ClientConfig::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(to_error)?
            }
        };
        Client::try_from(config).map_err(ConfigError::Client)
    }
}
