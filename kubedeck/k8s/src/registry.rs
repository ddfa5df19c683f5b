//! The cluster registry.
//!
//! Descriptors are persisted through a [`ClusterStore`] and indexed in
//! memory. Reads are served from the index; writes are serialized and go to
//! the store before the index is updated.

use crate::{bundle, pool::InvalidateClients};
use ahash::AHashMap as HashMap;
use chrono::Utc;
use kubedeck_core::{
    cluster::Reachability,
    store::{ClusterStore, CredentialStore},
    ClusterDescriptor, ClusterId, ClusterPatch, Error, Result, SecretStore,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ClusterRegistry {
    store: Arc<dyn ClusterStore>,
    credentials: Arc<dyn CredentialStore>,
    secrets: SecretStore,
    clients: Arc<dyn InvalidateClients>,
    index: RwLock<HashMap<ClusterId, ClusterDescriptor>>,
    write: tokio::sync::Mutex<()>,
}

// === impl ClusterRegistry ===

impl ClusterRegistry {
    /// Loads every stored descriptor.
    pub async fn load(
        store: Arc<dyn ClusterStore>,
        credentials: Arc<dyn CredentialStore>,
        secrets: SecretStore,
        clients: Arc<dyn InvalidateClients>,
    ) -> Result<Self> {
        let index = store
            .load_clusters()
            .await?
            .into_iter()
            .map(|desc| (desc.id, desc))
            .collect::<HashMap<_, _>>();
        info!(clusters = index.len(), "Loaded cluster registry");
        Ok(Self {
            store,
            credentials,
            secrets,
            clients,
            index: RwLock::new(index),
            write: tokio::sync::Mutex::new(()),
        })
    }

    /// Adds a descriptor, returning its id.
    ///
    /// The first cluster becomes the default.
    pub async fn add(&self, mut desc: ClusterDescriptor) -> Result<ClusterId> {
        desc.validate()?;
        let _write = self.write.lock().await;
        self.check_unique(&desc.name, None)?;

        let previous_default = self.default_cluster();
        if previous_default.is_none() {
            desc.default = true;
        }
        let demoted = match previous_default {
            Some(prev) if desc.default => Some(prev),
            _ => None,
        };

        self.store.put_cluster(&desc).await?;
        if let Some(mut prev) = demoted {
            prev.default = false;
            self.store.put_cluster(&prev).await?;
            self.index.write().insert(prev.id, prev);
        }

        let id = desc.id;
        info!(cluster = %desc.name, %id, auth = desc.auth.name(), "Added cluster");
        self.index.write().insert(id, desc);
        Ok(id)
    }

    /// Applies `patch` to a descriptor. Cached clients for the cluster are
    /// dropped.
    pub async fn update(&self, id: ClusterId, patch: ClusterPatch) -> Result<ClusterDescriptor> {
        let _write = self.write.lock().await;
        let mut desc = self.get(id).ok_or_else(|| Error::UnknownCluster(id.to_string()))?;
        if let Some(name) = patch.name.as_deref() {
            self.check_unique(name, Some(id))?;
        }
        let make_default = patch.default == Some(true) && !desc.default;
        let unset_default = patch.default == Some(false);
        patch.apply(&mut desc);
        desc.revision += 1;
        desc.validate()?;
        if unset_default {
            // There is always a default while any cluster exists.
            desc.default = self.default_cluster().map(|d| d.id) == Some(id);
        }

        self.store.put_cluster(&desc).await?;
        if make_default {
            self.clear_default_except(id).await?;
        }
        info!(cluster = %desc.name, %id, revision = desc.revision, "Updated cluster");
        self.index.write().insert(id, desc.clone());
        // Callers that resolved the previous revision may still build a
        // client for it, but under a key no later caller looks up.
        self.clients.invalidate_cluster(id);
        Ok(desc)
    }

    /// Removes a descriptor along with every user's credential for it.
    pub async fn remove(&self, id: ClusterId) -> Result<ClusterDescriptor> {
        let _write = self.write.lock().await;
        let desc = self.get(id).ok_or_else(|| Error::UnknownCluster(id.to_string()))?;

        self.store.delete_cluster(id).await?;
        self.index.write().remove(&id);
        let clients = self.clients.invalidate_cluster(id);
        let credentials = self.credentials.delete_cluster_credentials(id).await?;
        info!(cluster = %desc.name, %id, clients, credentials, "Removed cluster");

        if desc.default {
            let next = self.list().into_iter().next();
            if let Some(mut next) = next {
                next.default = true;
                self.store.put_cluster(&next).await?;
                info!(cluster = %next.name, "Promoted default cluster");
                self.index.write().insert(next.id, next);
            }
        }
        Ok(desc)
    }

    pub fn get(&self, id: ClusterId) -> Option<ClusterDescriptor> {
        self.index.read().get(&id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<ClusterDescriptor> {
        self.index.read().values().find(|d| d.name == name).cloned()
    }

    /// Looks a cluster up by id or by name.
    pub fn resolve(&self, name_or_id: &str) -> Result<ClusterDescriptor> {
        name_or_id
            .parse::<ClusterId>()
            .ok()
            .and_then(|id| self.get(id))
            .or_else(|| self.get_by_name(name_or_id))
            .ok_or_else(|| Error::UnknownCluster(name_or_id.to_string()))
    }

    /// Every descriptor, ordered by name.
    pub fn list(&self) -> Vec<ClusterDescriptor> {
        let mut clusters = self.index.read().values().cloned().collect::<Vec<_>>();
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        clusters
    }

    pub fn default_cluster(&self) -> Option<ClusterDescriptor> {
        self.index.read().values().find(|d| d.default).cloned()
    }

    /// Makes `id` the only default cluster.
    pub async fn set_default(&self, id: ClusterId) -> Result<()> {
        let _write = self.write.lock().await;
        let mut desc = self.get(id).ok_or_else(|| Error::UnknownCluster(id.to_string()))?;
        if !desc.default {
            desc.default = true;
            self.store.put_cluster(&desc).await?;
            self.index.write().insert(id, desc);
        }
        self.clear_default_except(id).await
    }

    /// Records the outcome of a reachability probe.
    pub async fn set_reachability(&self, id: ClusterId, version: Result<String>) -> Result<Reachability> {
        let _write = self.write.lock().await;
        let mut desc = self.get(id).ok_or_else(|| Error::UnknownCluster(id.to_string()))?;
        let checked_at = Utc::now();
        desc.reachability = match version {
            Ok(version) => Reachability::Reachable {
                version,
                checked_at,
            },
            Err(error) => {
                warn!(cluster = %desc.name, %error, "Cluster is unreachable");
                Reachability::Unreachable {
                    reason: error.to_string(),
                    checked_at,
                }
            }
        };
        self.store.put_cluster(&desc).await?;
        let reachability = desc.reachability.clone();
        self.index.write().insert(id, desc);
        Ok(reachability)
    }

    /// Creates a descriptor for each context of a kubeconfig bundle.
    ///
    /// Contexts matching an existing cluster by name and server are skipped.
    /// If any context's name is taken by a cluster with a different server,
    /// nothing is imported.
    pub async fn import_bundle(&self, bytes: &[u8]) -> Result<Vec<ClusterId>> {
        let parsed = bundle::parse(bytes, &self.secrets)?;
        let _write = self.write.lock().await;

        let mut accepted: Vec<ClusterDescriptor> = Vec::with_capacity(parsed.len());
        for desc in parsed {
            let existing = self
                .get_by_name(&desc.name)
                .or_else(|| accepted.iter().find(|d| d.name == desc.name).cloned());
            match existing {
                Some(existing) if existing.endpoint.server == desc.endpoint.server => {
                    info!(cluster = %desc.name, "Skipping cluster that is already registered");
                }
                Some(_) => return Err(Error::DuplicateCluster(desc.name)),
                None => accepted.push(desc),
            }
        }

        let has_default = self.default_cluster().is_some();
        let bundle_default = accepted.iter().position(|d| d.default);
        for (i, desc) in accepted.iter_mut().enumerate() {
            desc.default = !has_default && bundle_default.unwrap_or(0) == i;
        }

        let mut ids = Vec::with_capacity(accepted.len());
        for desc in accepted {
            self.store.put_cluster(&desc).await?;
            info!(cluster = %desc.name, id = %desc.id, auth = desc.auth.name(), "Imported cluster");
            ids.push(desc.id);
            self.index.write().insert(desc.id, desc);
        }
        Ok(ids)
    }

    fn check_unique(&self, name: &str, except: Option<ClusterId>) -> Result<()> {
        let taken = self
            .index
            .read()
            .values()
            .any(|d| d.name == name && Some(d.id) != except);
        if taken {
            return Err(Error::DuplicateCluster(name.to_string()));
        }
        Ok(())
    }

    async fn clear_default_except(&self, id: ClusterId) -> Result<()> {
        let others = self
            .index
            .read()
            .values()
            .filter(|d| d.default && d.id != id)
            .cloned()
            .collect::<Vec<_>>();
        for mut other in others {
            other.default = false;
            self.store.put_cluster(&other).await?;
            self.index.write().insert(other.id, other);
        }
        Ok(())
    }
}

impl std::fmt::Debug for ClusterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRegistry")
            .field("clusters", &self.index.read().len())
            .finish_non_exhaustive()
    }
}
