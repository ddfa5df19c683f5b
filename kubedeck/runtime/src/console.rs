//! The console's operations. Each one is authorized for its subject before
//! it touches the registry or a cluster, and security-relevant outcomes are
//! audited.

use futures::{Sink, Stream};
use kubedeck_core::{
    cluster::Reachability,
    frame::{ClientFrame, ServerFrame},
    pipe::PipeWriter,
    session::{CloseReason, SessionId, SessionInfo, Target},
    store::{AuditEvent, Stores},
    upstream::{Connect, ConnectFuture, Upstream},
    AccessRequest, AuthMode, Authorizer, ClusterDescriptor, ClusterId, ClusterPatch, Decision,
    Endpoint, ExecSpec, Result, SecretStore, UserId, Validation,
};
use kubedeck_k8s::{
    BuildClient, ClientKey, ClientPool, ClusterRegistry, KubeClientBuilder, Materializer,
    NodeShell, StreamClient,
};
use kubedeck_stream::SessionRegistry;
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

pub struct Console<B: BuildClient = KubeClientBuilder> {
    pub(crate) stores: Stores,
    pub(crate) secrets: SecretStore,
    pub(crate) authorizer: Authorizer,
    pub(crate) materializer: Arc<Materializer>,
    pub(crate) registry: Arc<ClusterRegistry>,
    pub(crate) clients: Arc<ClientPool<B>>,
    pub(crate) node_shell: NodeShell,
    pub(crate) sessions: SessionRegistry,
}

/// How a new or updated cluster authenticates, as submitted. Tokens arrive
/// in plaintext and are sealed before they are stored.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum AuthInput {
    Token { token: String },
    ExecAws { exec: ExecSpec },
    ExecGitHelper { exec: ExecSpec },
    InProcess,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCluster {
    pub name: String,
    #[serde(default)]
    pub endpoint: Endpoint,
    pub auth: AuthInput,
    #[serde(default)]
    pub default: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
    #[serde(default)]
    pub auth: Option<AuthInput>,
    #[serde(default)]
    pub default: Option<bool>,
}

// === impl AuthInput ===

impl AuthInput {
    fn seal(self, secrets: &SecretStore) -> Result<AuthMode> {
        Ok(match self {
            Self::Token { token } => AuthMode::Token {
                token: secrets.seal(token.trim().as_bytes())?,
            },
            Self::ExecAws { exec } => AuthMode::ExecAws { exec },
            Self::ExecGitHelper { exec } => AuthMode::ExecGitHelper { exec },
            Self::InProcess => AuthMode::InProcess,
        })
    }
}

// === impl Console ===

impl<B: BuildClient> Clone for Console<B> {
    fn clone(&self) -> Self {
        Self {
            stores: self.stores.clone(),
            secrets: self.secrets.clone(),
            authorizer: self.authorizer.clone(),
            materializer: self.materializer.clone(),
            registry: self.registry.clone(),
            clients: self.clients.clone(),
            node_shell: self.node_shell.clone(),
            sessions: self.sessions.clone(),
        }
    }
}

impl<B> Console<B>
where
    B: BuildClient,
    B::Client: StreamClient,
{
    /// Evaluates `req` without acting on it.
    pub fn decide(&self, req: &AccessRequest) -> Decision {
        self.authorizer.authorize(req)
    }

    /// Clusters the subject may see.
    pub fn list_clusters(&self, subject: &UserId) -> Vec<ClusterDescriptor> {
        self.registry
            .list()
            .into_iter()
            .filter(|desc| {
                self.authorizer
                    .authorize(&AccessRequest::cluster(subject.clone(), "get", &desc.name))
                    .is_allowed()
            })
            .collect()
    }

    pub async fn add_cluster(&self, subject: &UserId, new: NewCluster) -> Result<ClusterDescriptor> {
        self.check(AccessRequest::cluster(subject.clone(), "create", &new.name))
            .await?;
        let name = new.name.clone();
        let mut desc = ClusterDescriptor::new(new.name, new.endpoint, new.auth.seal(&self.secrets)?);
        desc.default = new.default;
        let res = self.registry.add(desc).await;
        self.audit(subject, "cluster.add", &name, outcome(&res)).await;
        let id = res?;
        self.registry
            .get(id)
            .ok_or_else(|| kubedeck_core::Error::UnknownCluster(id.to_string()))
    }

    pub async fn update_cluster(
        &self,
        subject: &UserId,
        cluster: &str,
        update: ClusterUpdate,
    ) -> Result<ClusterDescriptor> {
        let desc = self.registry.resolve(cluster)?;
        self.check(AccessRequest::cluster(subject.clone(), "update", &desc.name))
            .await?;
        let patch = ClusterPatch {
            name: update.name,
            endpoint: update.endpoint,
            auth: update
                .auth
                .map(|auth| auth.seal(&self.secrets))
                .transpose()?,
            default: update.default,
        };
        let res = self.registry.update(desc.id, patch).await;
        self.audit(subject, "cluster.update", &desc.name, outcome(&res))
            .await;
        res
    }

    pub async fn remove_cluster(&self, subject: &UserId, cluster: &str) -> Result<ClusterDescriptor> {
        let desc = self.registry.resolve(cluster)?;
        self.check(AccessRequest::cluster(subject.clone(), "delete", &desc.name))
            .await?;
        let res = self.registry.remove(desc.id).await;
        self.audit(subject, "cluster.remove", &desc.name, outcome(&res))
            .await;
        res
    }

    /// Imports every context of a kubeconfig bundle. Requires a grant on
    /// every cluster name.
    pub async fn import_bundle(&self, subject: &UserId, bundle: &[u8]) -> Result<Vec<ClusterId>> {
        self.check(AccessRequest::cluster(subject.clone(), "import", "*"))
            .await?;
        let res = self.registry.import_bundle(bundle).await;
        let outcome = match &res {
            Ok(ids) => format!("imported {}", ids.len()),
            Err(error) => error.code().to_string(),
        };
        self.audit(subject, "cluster.import", "bundle", outcome).await;
        res
    }

    pub async fn set_default(&self, subject: &UserId, cluster: &str) -> Result<ClusterDescriptor> {
        let desc = self.registry.resolve(cluster)?;
        self.check(AccessRequest::cluster(subject.clone(), "update", &desc.name))
            .await?;
        self.registry.set_default(desc.id).await?;
        self.audit(subject, "cluster.default", &desc.name, "ok").await;
        self.registry.resolve(cluster)
    }

    /// Drops every cached client for the cluster.
    pub async fn refresh_clients(&self, subject: &UserId, cluster: &str) -> Result<usize> {
        let desc = self.registry.resolve(cluster)?;
        self.check(AccessRequest::cluster(subject.clone(), "update", &desc.name))
            .await?;
        Ok(self.clients.invalidate(desc.id))
    }

    /// Re-runs API discovery for the subject's client of the cluster.
    pub async fn refresh_discovery(&self, subject: &UserId, cluster: &str) -> Result<()> {
        let desc = self.registry.resolve(cluster)?;
        self.check(AccessRequest::cluster(subject.clone(), "update", &desc.name))
            .await?;
        self.clients.refresh_discovery(&desc, subject).await
    }

    /// Requests the cluster's version once and records whether it answered.
    pub async fn probe(&self, subject: &UserId, cluster: &str) -> Result<Reachability> {
        let desc = self.registry.resolve(cluster)?;
        self.check(AccessRequest::cluster(subject.clone(), "update", &desc.name))
            .await?;
        let version = match self.clients.get(&desc, subject).await {
            Ok(client) => client.server_version().await,
            Err(error) => Err(error),
        };
        self.registry.set_reachability(desc.id, version).await
    }

    /// Stores the subject's credential for the cluster. It is unvalidated
    /// until [`Console::validate_credential`] succeeds.
    pub async fn put_credential(&self, subject: &UserId, cluster: &str, secret: &[u8]) -> Result<()> {
        let desc = self.registry.resolve(cluster)?;
        self.check(AccessRequest::credentials(subject.clone(), &desc.name))
            .await?;
        let res = self.materializer.store(subject, desc.id, secret).await;
        if res.is_ok() {
            // A client built from the previous credential must not outlive it.
            self.clients.invalidate_key(&ClientKey::new(&desc, subject));
        }
        self.audit(subject, "credential.write", &desc.name, outcome(&res))
            .await;
        res
    }

    /// Runs the cluster's credential helper once with the stored credential.
    pub async fn validate_credential(&self, subject: &UserId, cluster: &str) -> Result<Validation> {
        let desc = self.registry.resolve(cluster)?;
        self.check(AccessRequest::credentials(subject.clone(), &desc.name))
            .await?;
        let res = self.materializer.validate(subject, &desc).await;
        self.audit(subject, "credential.validate", &desc.name, outcome(&res))
            .await;
        // A helper failure carries its redacted output back to the caller.
        res.map(|_| Validation::Valid)
    }

    pub async fn list_sessions(&self, subject: &UserId) -> Result<Vec<SessionInfo>> {
        self.check(sessions_request(subject, "list")).await?;
        Ok(self.sessions.list())
    }

    /// Returns false if the session isn't live.
    pub async fn terminate_session(&self, subject: &UserId, id: SessionId) -> Result<bool> {
        self.check(sessions_request(subject, "delete")).await?;
        let terminated = self.sessions.terminate(id);
        if terminated {
            self.audit(subject, "session.terminate", id, "ok").await;
        }
        Ok(terminated)
    }

    /// Checks a session's target before its socket is upgraded.
    pub async fn authorize_session(&self, subject: &UserId, target: &Target) -> Result<()> {
        self.authorize_target(subject, target).await.map(|_| ())
    }

    /// Runs a proxy session over an upgraded socket until it closes.
    pub async fn run_session<I, O>(&self, subject: UserId, target: Target, rx: I, tx: O) -> CloseReason
    where
        I: Stream<Item = ClientFrame> + Send + Unpin + 'static,
        O: Sink<ServerFrame> + Send + Unpin + 'static,
    {
        let id = SessionId::generate();
        self.audit(&subject, "session.open", &target, id.to_string())
            .await;
        let connect = self.connect(id, subject.clone(), target.clone());
        let handle = self.sessions.spawn(id, subject.clone(), target.clone(), rx, tx, connect);
        let reason = handle.closed().await.unwrap_or(CloseReason::Shutdown);
        self.audit(&subject, "session.close", &target, reason.as_str())
            .await;
        reason
    }

    fn connect(&self, id: SessionId, subject: UserId, target: Target) -> Connect {
        let console = self.clone();
        Box::new(move |output: PipeWriter| -> ConnectFuture {
            Box::pin(async move { console.open_upstream(id, subject, target, output).await })
        })
    }

    /// Authorizes, obtains the cluster client, and opens the stream, in that
    /// order.
    async fn open_upstream(
        &self,
        id: SessionId,
        subject: UserId,
        target: Target,
        output: PipeWriter,
    ) -> Result<Box<dyn Upstream>> {
        let desc = self.authorize_target(&subject, &target).await?;
        let client = self.clients.get(&desc, &subject).await?;
        client
            .open_upstream(&self.node_shell, id, target, output)
            .await
    }

    /// Rules name clusters, while targets may address one by id or by name,
    /// so the request carries the registered name.
    async fn authorize_target(&self, subject: &UserId, target: &Target) -> Result<ClusterDescriptor> {
        let desc = self.registry.resolve(target.cluster())?;
        let mut req = target.access_request(subject.clone());
        req.cluster = desc.name.clone();
        self.check(req).await?;
        Ok(desc)
    }

    async fn check(&self, req: AccessRequest) -> Result<()> {
        let res = self.authorizer.check(&req);
        if res.is_err() {
            let action = format!("{} {}", req.verb, req.kind);
            let object = if req.namespace.is_empty() {
                format!("{}/{}", req.cluster, req.name)
            } else {
                format!("{}/{}/{}", req.cluster, req.namespace, req.name)
            };
            let event = AuditEvent::new(Some(&req.subject), action, object, "denied");
            if let Err(error) = self.stores.audit.record(event).await {
                warn!(%error, "Failed to record audit event");
            }
        }
        res
    }

    async fn audit(
        &self,
        subject: &UserId,
        action: &str,
        object: impl ToString,
        outcome: impl Into<String>,
    ) {
        self.stores
            .audit(AuditEvent::new(Some(subject), action, object, outcome))
            .await
    }
}

fn sessions_request(subject: &UserId, verb: &str) -> AccessRequest {
    AccessRequest::new(subject.clone(), "*", verb, "sessions", "", "*")
}

fn outcome<T>(res: &Result<T>) -> String {
    match res {
        Ok(_) => "ok".to_string(),
        Err(error) => error.code().to_string(),
    }
}
