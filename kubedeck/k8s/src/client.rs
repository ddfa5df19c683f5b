use crate::{
    kubeconfig::{self, Credentials},
    materialize::Materializer,
    pool::{BuildClient, PooledClient},
};
use chrono::{DateTime, Utc};
use kube::discovery::{ApiResource, Discovery};
use kubedeck_core::{AuthMode, ClusterDescriptor, ClusterId, Error, Result, SecretStore, UserId};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// A live client for one cluster, with its discovery cache.
pub struct ClusterClient {
    cluster: ClusterId,
    name: String,
    client: kube::Client,
    built_at: DateTime<Utc>,
    discovery: RwLock<Option<Arc<Discovery>>>,
}

/// Builds kube clients from cluster descriptors.
#[derive(Clone, Debug)]
pub struct KubeClientBuilder {
    materializer: Arc<Materializer>,
    secrets: SecretStore,
}

// === impl ClusterClient ===

impl ClusterClient {
    pub fn new(desc: &ClusterDescriptor, client: kube::Client) -> Self {
        Self {
            cluster: desc.id,
            name: desc.name.clone(),
            client,
            built_at: Utc::now(),
            discovery: RwLock::default(),
        }
    }

    pub fn cluster(&self) -> ClusterId {
        self.cluster
    }

    pub fn client(&self) -> kube::Client {
        self.client.clone()
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Returns the cached discovery, running it on first use.
    pub async fn discovery(&self) -> Result<Arc<Discovery>> {
        if let Some(discovery) = self.discovery.read().await.as_ref() {
            return Ok(discovery.clone());
        }
        let mut cache = self.discovery.write().await;
        if let Some(discovery) = cache.as_ref() {
            return Ok(discovery.clone());
        }
        let discovery = self.run_discovery().await?;
        *cache = Some(discovery.clone());
        Ok(discovery)
    }

    /// Resolves the preferred resource for a kind, or `None` if the cluster
    /// doesn't serve it.
    pub async fn resolve(&self, group: &str, kind: &str) -> Result<Option<ApiResource>> {
        let discovery = self.discovery().await?;
        let found = discovery
            .groups()
            .filter(|g| g.name() == group)
            .flat_map(|g| g.resources_by_stability())
            .find(|(ar, _)| ar.kind == kind)
            .map(|(ar, _)| ar);
        Ok(found)
    }

    /// Requests the server version once.
    pub async fn version(&self) -> Result<String> {
        let info = self
            .client
            .apiserver_version()
            .await
            .map_err(|e| Error::unreachable(&self.name, e))?;
        Ok(info.git_version)
    }

    async fn run_discovery(&self) -> Result<Arc<Discovery>> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| Error::unreachable(&self.name, e))?;
        debug!(cluster = %self.name, groups = discovery.groups().count(), "Discovered API groups");
        Ok(Arc::new(discovery))
    }
}

#[async_trait::async_trait]
impl PooledClient for ClusterClient {
    async fn refresh_discovery(&self) -> Result<()> {
        let mut cache = self.discovery.write().await;
        *cache = Some(self.run_discovery().await?);
        Ok(())
    }
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("cluster", &self.cluster)
            .field("name", &self.name)
            .field("built_at", &self.built_at)
            .finish_non_exhaustive()
    }
}

// === impl KubeClientBuilder ===

impl KubeClientBuilder {
    pub fn new(materializer: Arc<Materializer>, secrets: SecretStore) -> Self {
        Self {
            materializer,
            secrets,
        }
    }

    async fn config(&self, desc: &ClusterDescriptor, user: &UserId) -> Result<kube::Config> {
        match &desc.auth {
            AuthMode::InProcess => kube::Config::infer()
                .await
                .map_err(|e| Error::InvalidDescriptor(format!("no in-process configuration: {e}"))),
            AuthMode::Token { token } => {
                let token = self.secrets.open(token)?;
                let token = token.as_str().ok_or_else(|| {
                    Error::InvalidDescriptor(format!("cluster {} has a non-UTF-8 token", desc.name))
                })?;
                kubeconfig::client_config(desc, Credentials::Token(token.trim())).await
            }
            AuthMode::ExecAws { .. } | AuthMode::ExecGitHelper { .. } => {
                let env = self.materializer.validate(user, desc).await?;
                kubeconfig::client_config(desc, Credentials::Exec(&env)).await
            }
        }
    }
}

#[async_trait::async_trait]
impl BuildClient for KubeClientBuilder {
    type Client = ClusterClient;

    async fn build(&self, desc: &ClusterDescriptor, user: &UserId) -> Result<ClusterClient> {
        let mut config = self.config(desc, user).await?;
        // Log follows and terminals may be silent for long periods.
        config.read_timeout = None;
        let client = kube::Client::try_from(config)
            .map_err(|e| Error::InvalidDescriptor(format!("failed to build client: {e}")))?;
        Ok(ClusterClient::new(desc, client))
    }
}
