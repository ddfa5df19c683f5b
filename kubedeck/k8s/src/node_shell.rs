//! Helper pods for node-level shells.
//!
//! A node shell runs in a short-lived privileged pod scheduled directly onto
//! the target node. The pod is owned by an [`EphemeralPod`] guard: it is
//! deleted when the guard is released and, failing that, when the guard is
//! dropped on any other path (error, cancellation, panic).

use chrono::{DateTime, Utc};
use k8s_openapi::{
    api::core::v1::{Container, Pod, PodSpec, SecurityContext, Toleration},
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kubedeck_core::{
    session::{EphemeralPodHandle, SessionId},
    Error, Result, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::time;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub const NAME_PREFIX: &str = "kubedeck-node-shell-";
pub const ROLE_LABEL: &str = "kubedeck.io/role";
pub const ROLE_NODE_SHELL: &str = "node-shell";
pub const SESSION_ANNOTATION: &str = "kubedeck.io/session";
pub const CREATED_AT_ANNOTATION: &str = "kubedeck.io/created-at";
pub const CONTAINER: &str = "shell";

/// Enters every namespace of the node's init process.
pub const SHELL: &[&str] = &["nsenter", "-t", "1", "-m", "-u", "-i", "-n", "-p", "--", "sh"];

const DELETE_ATTEMPTS: u32 = 3;

/// Manages helper pods in one cluster.
#[async_trait::async_trait]
pub trait HelperPods: Send + Sync + 'static {
    /// Creates the pod under the name it already carries.
    async fn create(&self, pod: Pod) -> Result<()>;

    /// Completes once the pod is running. Fails if the pod can't start.
    async fn wait_running(&self, handle: &EphemeralPodHandle) -> Result<()>;

    /// Deletes the pod. Deleting a pod that is already gone succeeds.
    async fn delete(&self, handle: &EphemeralPodHandle) -> Result<()>;

    /// Lists the node-shell pods kubedeck created in `namespace`.
    async fn list_managed(&self, namespace: &str) -> Result<Vec<EphemeralPodHandle>>;
}

#[derive(Clone)]
pub struct KubeHelperPods {
    client: kube::Client,
}

#[derive(Clone, Debug)]
pub struct NodeShellConfig {
    pub image: String,
    pub namespace: String,
    pub ready_timeout: Duration,
    pub max_lifetime: Duration,
    pub cancel_grace: Duration,
}

/// Opens node shells. Deletions that can't complete inline are tracked so
/// that shutdown can wait for them.
#[derive(Clone, Debug)]
pub struct NodeShell {
    config: NodeShellConfig,
    cleanup: TaskTracker,
}

/// Owns a helper pod for the lifetime of a session.
#[must_use = "dropping the guard deletes the pod"]
pub struct EphemeralPod {
    handle: EphemeralPodHandle,
    pods: Arc<dyn HelperPods>,
    cleanup: TaskTracker,
    grace: Duration,
    released: bool,
}

/// Builds the helper pod for a shell on `node`.
pub fn helper_pod(
    config: &NodeShellConfig,
    session: SessionId,
    node: &str,
    now: DateTime<Utc>,
) -> Pod {
    let lifetime = config.max_lifetime.as_secs().max(1);
    Pod {
        metadata: ObjectMeta {
            name: Some(format!("{NAME_PREFIX}{session}")),
            namespace: Some(config.namespace.clone()),
            labels: Some(BTreeMap::from([
                (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
                (ROLE_LABEL.to_string(), ROLE_NODE_SHELL.to_string()),
            ])),
            annotations: Some(BTreeMap::from([
                (SESSION_ANNOTATION.to_string(), session.to_string()),
                (CREATED_AT_ANNOTATION.to_string(), now.to_rfc3339()),
            ])),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            host_pid: Some(true),
            host_network: Some(true),
            restart_policy: Some("Never".to_string()),
            // Backstop for pods whose session never deletes them.
            active_deadline_seconds: Some(lifetime as i64),
            termination_grace_period_seconds: Some(0),
            automount_service_account_token: Some(false),
            tolerations: Some(vec![Toleration {
                operator: Some("Exists".to_string()),
                ..Toleration::default()
            }]),
            containers: vec![Container {
                name: CONTAINER.to_string(),
                image: Some(config.image.clone()),
                command: Some(vec!["sleep".to_string(), lifetime.to_string()]),
                stdin: Some(true),
                tty: Some(true),
                security_context: Some(SecurityContext {
                    privileged: Some(true),
                    ..SecurityContext::default()
                }),
                ..Container::default()
            }],
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}

fn handle_of(pod: &Pod) -> Option<EphemeralPodHandle> {
    let meta = &pod.metadata;
    let created_at = meta
        .annotations
        .as_ref()?
        .get(CREATED_AT_ANNOTATION)
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())?
        .with_timezone(&Utc);
    Some(EphemeralPodHandle {
        namespace: meta.namespace.clone()?,
        pod_name: meta.name.clone()?,
        node_name: pod.spec.as_ref()?.node_name.clone().unwrap_or_default(),
        created_at,
    })
}

// === impl KubeHelperPods ===

impl KubeHelperPods {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl HelperPods for KubeHelperPods {
    async fn create(&self, pod: Pod) -> Result<()> {
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        self.api(&namespace)
            .create(&PostParams::default(), &pod)
            .await
            .map_err(Error::upstream)?;
        Ok(())
    }

    async fn wait_running(&self, handle: &EphemeralPodHandle) -> Result<()> {
        fn phase(pod: &Pod) -> Option<&str> {
            pod.status.as_ref()?.phase.as_deref()
        }

        let started = kube::runtime::wait::await_condition(
            self.api(&handle.namespace),
            &handle.pod_name,
            |obj: Option<&Pod>| obj.and_then(phase).is_some_and(|p| p != "Pending"),
        )
        .await
        .map_err(Error::upstream)?;
        match started.as_ref().and_then(phase) {
            Some("Running") => Ok(()),
            phase => Err(Error::upstream(format!(
                "helper pod {} is {}",
                handle.pod_name,
                phase.unwrap_or("gone")
            ))),
        }
    }

    async fn delete(&self, handle: &EphemeralPodHandle) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..DeleteParams::default()
        };
        match self
            .api(&handle.namespace)
            .delete(&handle.pod_name, &params)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(Error::upstream(e)),
        }
    }

    async fn list_managed(&self, namespace: &str) -> Result<Vec<EphemeralPodHandle>> {
        let params = ListParams::default().labels(&format!(
            "{MANAGED_BY_LABEL}={MANAGED_BY_VALUE},{ROLE_LABEL}={ROLE_NODE_SHELL}"
        ));
        let pods = self
            .api(namespace)
            .list(&params)
            .await
            .map_err(Error::upstream)?;
        Ok(pods.items.iter().filter_map(handle_of).collect())
    }
}

// === impl NodeShell ===

impl NodeShell {
    pub fn new(config: NodeShellConfig) -> Self {
        Self {
            config,
            cleanup: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &NodeShellConfig {
        &self.config
    }

    /// Background deletions. Shutdown closes and waits on this tracker.
    pub fn cleanup(&self) -> &TaskTracker {
        &self.cleanup
    }

    /// Creates a helper pod on `node` and waits for it to run.
    pub async fn open(
        &self,
        pods: Arc<dyn HelperPods>,
        session: SessionId,
        node: &str,
    ) -> Result<EphemeralPod> {
        if let Err(error) = self.sweep(&*pods).await {
            warn!(%error, "Failed to sweep expired helper pods");
        }

        let spec = helper_pod(&self.config, session, node, Utc::now());
        let handle = handle_of(&spec)
            .ok_or_else(|| Error::upstream("helper pod has no name"))?;
        // The guard exists before the create is sent, so a create that is
        // cancelled in flight still deletes whatever it left behind.
        let pod = EphemeralPod {
            handle,
            pods: pods.clone(),
            cleanup: self.cleanup.clone(),
            grace: self.config.cancel_grace,
            released: false,
        };
        if let Err(error) = pods.create(spec).await {
            pod.release().await;
            return Err(error);
        }
        info!(pod = %pod.handle.pod_name, %node, %session, "Created helper pod");

        let ready = time::timeout(self.config.ready_timeout, pods.wait_running(pod.handle())).await;
        match ready {
            Ok(Ok(())) => {
                debug!(pod = %pod.handle.pod_name, "Helper pod is running");
                Ok(pod)
            }
            Ok(Err(error)) => {
                pod.release().await;
                Err(error)
            }
            Err(_) => {
                pod.release().await;
                Err(Error::PodSpawnTimeout(self.config.ready_timeout))
            }
        }
    }

    /// Deletes managed helper pods older than the maximum lifetime.
    pub async fn sweep(&self, pods: &dyn HelperPods) -> Result<usize> {
        let now = Utc::now();
        let mut deleted = 0;
        for handle in pods.list_managed(&self.config.namespace).await? {
            let age = (now - handle.created_at).to_std().unwrap_or_default();
            if age < self.config.max_lifetime {
                continue;
            }
            pods.delete(&handle).await?;
            info!(pod = %handle.pod_name, node = %handle.node_name, "Deleted expired helper pod");
            deleted += 1;
        }
        Ok(deleted)
    }
}

// === impl EphemeralPod ===

impl EphemeralPod {
    pub fn handle(&self) -> &EphemeralPodHandle {
        &self.handle
    }

    /// Deletes the pod, waiting at most the cancel grace. A deletion that
    /// fails or doesn't finish in time is retried in the background.
    pub async fn release(mut self) {
        self.released = true;
        match time::timeout(self.grace, self.pods.delete(&self.handle)).await {
            Ok(Ok(())) => info!(pod = %self.handle.pod_name, "Deleted helper pod"),
            Ok(Err(error)) => {
                warn!(pod = %self.handle.pod_name, %error, "Failed to delete helper pod");
                self.delete_in_background();
            }
            Err(_) => {
                warn!(pod = %self.handle.pod_name, "Helper pod deletion timed out");
                self.delete_in_background();
            }
        }
    }

    fn delete_in_background(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(pod = %self.handle.pod_name, "No runtime to delete helper pod");
            return;
        };
        let pods = self.pods.clone();
        let handle = self.handle.clone();
        self.cleanup.spawn_on(
            async move {
                for attempt in 1..=DELETE_ATTEMPTS {
                    match pods.delete(&handle).await {
                        Ok(()) => {
                            info!(pod = %handle.pod_name, "Deleted helper pod");
                            return;
                        }
                        Err(error) => {
                            warn!(pod = %handle.pod_name, attempt, %error, "Failed to delete helper pod");
                            time::sleep(Duration::from_secs(attempt.into())).await;
                        }
                    }
                }
                error!(pod = %handle.pod_name, "Giving up on helper pod deletion");
            },
            &runtime,
        );
    }
}

impl Drop for EphemeralPod {
    fn drop(&mut self) {
        if !self.released {
            debug!(pod = %self.handle.pod_name, "Helper pod guard dropped");
            self.delete_in_background();
        }
    }
}

impl std::fmt::Debug for EphemeralPod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralPod")
            .field("handle", &self.handle)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}
