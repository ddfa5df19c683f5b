//! Persistence seams.
//!
//! The durable store is an external collaborator. The core only needs keyed
//! reads and writes, expressed by these traits. [`MemoryStore`] implements
//! all of them for tests and single-process deployments.

use crate::{
    access::RoleTable,
    cluster::{AuthMode, ClusterDescriptor, ClusterId},
    credential::{StorageNamespace, UserClusterCredential, UserId, Validation},
    secret::SecretStore,
    Result,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

mod memory;

pub use self::memory::MemoryStore;

#[async_trait::async_trait]
pub trait ClusterStore: Send + Sync + 'static {
    async fn load_clusters(&self) -> Result<Vec<ClusterDescriptor>>;

    async fn put_cluster(&self, desc: &ClusterDescriptor) -> Result<()>;

    async fn delete_cluster(&self, id: ClusterId) -> Result<()>;
}

#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    async fn get_credential(
        &self,
        user: &UserId,
        cluster: ClusterId,
    ) -> Result<Option<UserClusterCredential>>;

    async fn put_credential(&self, credential: &UserClusterCredential) -> Result<()>;

    async fn set_validation(
        &self,
        user: &UserId,
        cluster: ClusterId,
        validation: Validation,
    ) -> Result<()>;

    /// Removes every user's credential for `cluster`, returning how many were
    /// removed.
    async fn delete_cluster_credentials(&self, cluster: ClusterId) -> Result<usize>;

    async fn list_credentials(&self) -> Result<Vec<UserClusterCredential>>;

    /// Returns the user's storage namespace, assigning one on first use.
    async fn storage_namespace(&self, user: &UserId) -> Result<StorageNamespace>;
}

#[async_trait::async_trait]
pub trait RoleStore: Send + Sync + 'static {
    async fn load_roles(&self) -> Result<RoleTable>;

    async fn save_roles(&self, table: &RoleTable) -> Result<()>;
}

#[async_trait::async_trait]
pub trait AuditSink: Send + Sync + 'static {
    async fn record(&self, event: AuditEvent) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub subject: Option<UserId>,
    pub action: String,
    pub target: String,
    pub outcome: String,
}

/// The stores a deployment is built from.
#[derive(Clone)]
pub struct Stores {
    pub clusters: Arc<dyn ClusterStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub roles: Arc<dyn RoleStore>,
    pub audit: Arc<dyn AuditSink>,
}

// === impl AuditEvent ===

impl AuditEvent {
    pub fn new(
        subject: Option<&UserId>,
        action: impl Into<String>,
        target: impl ToString,
        outcome: impl Into<String>,
    ) -> Self {
        Self {
            at: Utc::now(),
            subject: subject.cloned(),
            action: action.into(),
            target: target.to_string(),
            outcome: outcome.into(),
        }
    }
}

// === impl Stores ===

impl Stores {
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::default());
        Self {
            clusters: store.clone(),
            credentials: store.clone(),
            roles: store.clone(),
            audit: store,
        }
    }

    /// Records an audit event. Failing to record is logged, not propagated.
    pub async fn audit(&self, event: AuditEvent) {
        tracing::info!(
            target: "kubedeck::audit",
            subject = ?event.subject.as_ref().map(UserId::as_str),
            action = %event.action,
            object = %event.target,
            outcome = %event.outcome,
            "Audit"
        );
        if let Err(error) = self.audit.record(event).await {
            tracing::warn!(%error, "Failed to record audit event");
        }
    }
}

/// Reseals every stored secret that was sealed by a previous key. Returns
/// the number of secrets rewritten.
///
/// Intended to run once after a key rotation, with the old key configured as
/// a previous key.
pub async fn reseal_all(stores: &Stores, secrets: &SecretStore) -> Result<usize> {
    let mut resealed = 0;

    for mut credential in stores.credentials.list_credentials().await? {
        if secrets.needs_reseal(&credential.secret) {
            credential.secret = secrets.reseal(&credential.secret)?;
            stores.credentials.put_credential(&credential).await?;
            resealed += 1;
        }
    }

    for mut desc in stores.clusters.load_clusters().await? {
        if let AuthMode::Token { token } = &mut desc.auth {
            if secrets.needs_reseal(token) {
                *token = secrets.reseal(token)?;
                stores.clusters.put_cluster(&desc).await?;
                resealed += 1;
            }
        }
    }

    Ok(resealed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cluster::Endpoint, secret::SecretKey};

    #[tokio::test]
    async fn reseal_rewrites_only_old_secrets() {
        let old = SecretStore::new(SecretKey::from_passphrase("old"));
        let new = SecretStore::new(SecretKey::from_passphrase("new"))
            .with_previous([SecretKey::from_passphrase("old")]);
        let stores = Stores::memory();

        let token = ClusterDescriptor::new(
            "prod",
            Endpoint {
                server: "https://prod.example.com".into(),
                ..Endpoint::default()
            },
            AuthMode::Token {
                token: old.seal(b"bearer").unwrap(),
            },
        );
        stores.clusters.put_cluster(&token).await.unwrap();

        let cluster = token.id;
        let stale = UserClusterCredential::new("alice".into(), cluster, old.seal(b"a").unwrap());
        let fresh = UserClusterCredential::new("bob".into(), cluster, new.seal(b"b").unwrap());
        stores.credentials.put_credential(&stale).await.unwrap();
        stores.credentials.put_credential(&fresh).await.unwrap();

        assert_eq!(reseal_all(&stores, &new).await.unwrap(), 2);
        assert_eq!(reseal_all(&stores, &new).await.unwrap(), 0);

        let current = SecretStore::new(SecretKey::from_passphrase("new"));
        let alice = stores
            .credentials
            .get_credential(&"alice".into(), cluster)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.open(&alice.secret).unwrap().as_bytes(), b"a");

        let clusters = stores.clusters.load_clusters().await.unwrap();
        let AuthMode::Token { token } = &clusters[0].auth else {
            panic!("expected a token cluster");
        };
        assert_eq!(current.open(token).unwrap().as_bytes(), b"bearer");
    }
}
