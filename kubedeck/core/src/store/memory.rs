use super::{AuditEvent, AuditSink, ClusterStore, CredentialStore, RoleStore};
use crate::{
    access::RoleTable,
    cluster::{ClusterDescriptor, ClusterId},
    credential::{StorageNamespace, UserClusterCredential, UserId, Validation},
    Error, Result,
};
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;

/// An in-process store. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    clusters: HashMap<ClusterId, ClusterDescriptor>,
    credentials: HashMap<(UserId, ClusterId), UserClusterCredential>,
    namespaces: HashMap<UserId, StorageNamespace>,
    roles: RoleTable,
    audit: Vec<AuditEvent>,
}

// === impl MemoryStore ===

impl MemoryStore {
    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.inner.read().audit.clone()
    }
}

#[async_trait::async_trait]
impl ClusterStore for MemoryStore {
    async fn load_clusters(&self) -> Result<Vec<ClusterDescriptor>> {
        let mut clusters = self
            .inner
            .read()
            .clusters
            .values()
            .cloned()
            .collect::<Vec<_>>();
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(clusters)
    }

    async fn put_cluster(&self, desc: &ClusterDescriptor) -> Result<()> {
        self.inner.write().clusters.insert(desc.id, desc.clone());
        Ok(())
    }

    async fn delete_cluster(&self, id: ClusterId) -> Result<()> {
        self.inner.write().clusters.remove(&id);
        Ok(())
    }
}

#[async_trait::async_trait]
impl CredentialStore for MemoryStore {
    async fn get_credential(
        &self,
        user: &UserId,
        cluster: ClusterId,
    ) -> Result<Option<UserClusterCredential>> {
        Ok(self
            .inner
            .read()
            .credentials
            .get(&(user.clone(), cluster))
            .cloned())
    }

    async fn put_credential(&self, credential: &UserClusterCredential) -> Result<()> {
        self.inner.write().credentials.insert(
            (credential.user.clone(), credential.cluster),
            credential.clone(),
        );
        Ok(())
    }

    async fn set_validation(
        &self,
        user: &UserId,
        cluster: ClusterId,
        validation: Validation,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let credential = inner
            .credentials
            .get_mut(&(user.clone(), cluster))
            .ok_or_else(|| Error::CredentialMissing {
                cluster: cluster.to_string(),
            })?;
        credential.validation = validation;
        Ok(())
    }

    async fn delete_cluster_credentials(&self, cluster: ClusterId) -> Result<usize> {
        let mut inner = self.inner.write();
        let before = inner.credentials.len();
        inner.credentials.retain(|(_, c), _| *c != cluster);
        Ok(before - inner.credentials.len())
    }

    async fn list_credentials(&self) -> Result<Vec<UserClusterCredential>> {
        Ok(self.inner.read().credentials.values().cloned().collect())
    }

    async fn storage_namespace(&self, user: &UserId) -> Result<StorageNamespace> {
        Ok(*self
            .inner
            .write()
            .namespaces
            .entry(user.clone())
            .or_insert_with(StorageNamespace::generate))
    }
}

#[async_trait::async_trait]
impl RoleStore for MemoryStore {
    async fn load_roles(&self) -> Result<RoleTable> {
        Ok(self.inner.read().roles.clone())
    }

    async fn save_roles(&self, table: &RoleTable) -> Result<()> {
        self.inner.write().roles = table.clone();
        Ok(())
    }
}

#[async_trait::async_trait]
impl AuditSink for MemoryStore {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        self.inner.write().audit.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::SealedSecret;

    #[tokio::test]
    async fn storage_namespaces_are_stable_and_distinct() {
        let store = MemoryStore::default();
        let alice = store.storage_namespace(&"alice".into()).await.unwrap();
        let bob = store.storage_namespace(&"bob".into()).await.unwrap();
        assert_ne!(alice, bob);
        assert_eq!(store.storage_namespace(&"alice".into()).await.unwrap(), alice);
    }

    #[tokio::test]
    async fn deleting_a_cluster_drops_only_its_credentials() {
        let store = MemoryStore::default();
        let prod = ClusterId::generate();
        let staging = ClusterId::generate();
        let secret = SealedSecret::from_bytes(vec![0; 40]);
        for (user, cluster) in [("alice", prod), ("bob", prod), ("alice", staging)] {
            store
                .put_credential(&UserClusterCredential::new(
                    user.into(),
                    cluster,
                    secret.clone(),
                ))
                .await
                .unwrap();
        }

        assert_eq!(store.delete_cluster_credentials(prod).await.unwrap(), 2);
        assert!(store
            .get_credential(&"alice".into(), prod)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get_credential(&"alice".into(), staging)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn validating_a_missing_credential_fails() {
        let store = MemoryStore::default();
        let err = store
            .set_validation(&"alice".into(), ClusterId::generate(), Validation::Valid)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CredentialMissing { .. }));
    }
}
