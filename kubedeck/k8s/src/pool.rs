//! Lazily-built, cached cluster clients.
//!
//! Entries are built on first use and shared by every caller with the same
//! [`ClientKey`]. Concurrent callers for an uncached key wait on a single
//! build. A failed build leaves the entry empty, so the next caller retries.

use ahash::AHashMap as HashMap;
use kubedeck_core::{ClusterDescriptor, ClusterId, Result, UserId};
use parking_lot::RwLock;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Identifies a cached client.
///
/// Exec-authenticated clients carry per-user credentials and so are keyed
/// by user as well as cluster. The descriptor revision keeps a client built
/// from an edited descriptor from being served for the new one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub cluster: ClusterId,
    pub revision: u64,
    pub user: Option<UserId>,
}

/// Builds a client for a cluster.
#[async_trait::async_trait]
pub trait BuildClient: Send + Sync + 'static {
    type Client: PooledClient;

    async fn build(&self, desc: &ClusterDescriptor, user: &UserId) -> Result<Self::Client>;
}

#[async_trait::async_trait]
pub trait PooledClient: Send + Sync + 'static {
    /// Re-runs API discovery without rebuilding the client.
    async fn refresh_discovery(&self) -> Result<()>;
}

/// Drops cached clients when a cluster changes.
pub trait InvalidateClients: Send + Sync + 'static {
    fn invalidate_cluster(&self, cluster: ClusterId) -> usize;
}

pub struct ClientPool<B: BuildClient> {
    builder: B,
    entries: RwLock<HashMap<ClientKey, Entry<B::Client>>>,
    metrics: PoolMetrics,
}

type Entry<C> = Arc<OnceCell<Arc<C>>>;

#[derive(Clone, Debug, Default)]
pub struct PoolMetrics {
    builds: Family<BuildLabels, Counter>,
    invalidations: Counter,
    cached: Gauge,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct BuildLabels {
    outcome: &'static str,
}

// === impl ClientKey ===

impl ClientKey {
    pub fn new(desc: &ClusterDescriptor, user: &UserId) -> Self {
        Self {
            cluster: desc.id,
            revision: desc.revision,
            user: desc.auth.is_per_user().then(|| user.clone()),
        }
    }
}

// === impl ClientPool ===

impl<B: BuildClient> ClientPool<B> {
    pub fn new(builder: B, metrics: PoolMetrics) -> Self {
        Self {
            builder,
            entries: RwLock::default(),
            metrics,
        }
    }

    /// Returns the cached client for `desc`, building it if needed.
    pub async fn get(&self, desc: &ClusterDescriptor, user: &UserId) -> Result<Arc<B::Client>> {
        let key = ClientKey::new(desc, user);
        let cell = self.entry(&key);
        let client = cell
            .get_or_try_init(|| async {
                debug!(cluster = %desc.name, user = ?key.user, "Building client");
                match self.builder.build(desc, user).await {
                    Ok(client) => {
                        self.metrics.built("ok");
                        info!(cluster = %desc.name, user = ?key.user, "Built client");
                        Ok(Arc::new(client))
                    }
                    Err(error) => {
                        self.metrics.built("error");
                        warn!(cluster = %desc.name, user = ?key.user, %error, "Failed to build client");
                        Err(error)
                    }
                }
            })
            .await?
            .clone();
        self.update_cached();
        Ok(client)
    }

    /// Re-runs discovery on the client for `desc`, building it first if it
    /// isn't cached.
    pub async fn refresh_discovery(&self, desc: &ClusterDescriptor, user: &UserId) -> Result<()> {
        let client = self.get(desc, user).await?;
        client.refresh_discovery().await?;
        info!(cluster = %desc.name, "Refreshed discovery");
        Ok(())
    }

    /// Drops every cached client for `cluster`. The next `get` rebuilds.
    pub fn invalidate(&self, cluster: ClusterId) -> usize {
        let removed = {
            let mut entries = self.entries.write();
            let before = entries.len();
            entries.retain(|key, _| key.cluster != cluster);
            before - entries.len()
        };
        self.metrics.invalidations.inc();
        self.update_cached();
        debug!(%cluster, removed, "Invalidated clients");
        removed
    }

    pub fn invalidate_key(&self, key: &ClientKey) -> bool {
        let removed = self.entries.write().remove(key).is_some();
        if removed {
            self.metrics.invalidations.inc();
            self.update_cached();
        }
        removed
    }

    /// Keys with a built client.
    pub fn cached(&self) -> Vec<ClientKey> {
        self.entries
            .read()
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn entry(&self, key: &ClientKey) -> Entry<B::Client> {
        if let Some(cell) = self.entries.read().get(key) {
            return cell.clone();
        }
        let mut entries = self.entries.write();
        // A newer revision supersedes the cluster's older clients.
        entries.retain(|k, _| k.cluster != key.cluster || k.revision >= key.revision);
        entries.entry(key.clone()).or_default().clone()
    }

    fn update_cached(&self) {
        let n = self
            .entries
            .read()
            .values()
            .filter(|cell| cell.initialized())
            .count();
        self.metrics.cached.set(n as i64);
    }
}

impl<B: BuildClient> InvalidateClients for ClientPool<B> {
    fn invalidate_cluster(&self, cluster: ClusterId) -> usize {
        self.invalidate(cluster)
    }
}

impl<B: BuildClient> std::fmt::Debug for ClientPool<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("entries", &self.entries.read().len())
            .finish_non_exhaustive()
    }
}

// === impl PoolMetrics ===

impl PoolMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let builds = Family::<BuildLabels, Counter>::default();
        reg.register(
            "client_builds",
            "Total number of cluster client builds by outcome",
            builds.clone(),
        );

        let invalidations = Counter::default();
        reg.register(
            "client_invalidations",
            "Total number of client cache invalidations",
            invalidations.clone(),
        );

        let cached = Gauge::default();
        reg.register("clients_cached", "Number of cached cluster clients", cached.clone());

        Self {
            builds,
            invalidations,
            cached,
        }
    }

    fn built(&self, outcome: &'static str) {
        self.builds.get_or_create(&BuildLabels { outcome }).inc();
    }
}
