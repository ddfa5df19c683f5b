use crate::{
    metrics::SessionMetrics,
    session::{Session, SessionConfig},
};
use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use futures::{Sink, Stream};
use kubedeck_core::{
    frame::{ClientFrame, ServerFrame},
    session::{CloseReason, SessionId, SessionInfo, SessionKind, SessionStatus, Target},
    upstream::Connect,
    UserId,
};
use parking_lot::RwLock;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    task::{AbortHandle, JoinHandle},
    time,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, info_span, warn, Instrument};

/// Tracks every live proxy session.
///
/// Sessions are spawned onto a shared tracker so that shutdown can cancel
/// them together and wait, within a deadline, for each to release its
/// upstream.
#[derive(Clone, Debug)]
pub struct SessionRegistry {
    config: SessionConfig,
    sessions: Arc<RwLock<HashMap<SessionId, Entry>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    metrics: SessionMetrics,
}

#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    status: watch::Receiver<SessionStatus>,
    task: JoinHandle<CloseReason>,
}

#[derive(Debug)]
struct Entry {
    subject: UserId,
    target: Target,
    created_at: DateTime<Utc>,
    status: watch::Receiver<SessionStatus>,
    terminate: CancellationToken,
    abort: Option<AbortHandle>,
}

/// Removes a session from the registry when its task ends, including when
/// the task is aborted.
struct Deregister {
    id: SessionId,
    kind: SessionKind,
    started: time::Instant,
    reason: Option<CloseReason>,
    sessions: Arc<RwLock<HashMap<SessionId, Entry>>>,
    metrics: SessionMetrics,
}

// === impl SessionRegistry ===

impl SessionRegistry {
    pub fn new(config: SessionConfig, metrics: SessionMetrics) -> Self {
        Self {
            config,
            sessions: Arc::default(),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            metrics,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Starts a session streaming between the client halves and the upstream
    /// opened by `connect`.
    ///
    /// The session is registered before this returns, so it is visible to
    /// [`SessionRegistry::list`] while it connects.
    pub fn spawn<I, O>(
        &self,
        id: SessionId,
        subject: UserId,
        target: Target,
        client_rx: I,
        client_tx: O,
        connect: Connect,
    ) -> SessionHandle
    where
        I: Stream<Item = ClientFrame> + Send + Unpin + 'static,
        O: Sink<ServerFrame> + Send + Unpin + 'static,
    {
        let kind = target.kind();
        let terminate = CancellationToken::new();
        let (session, status) = Session::new(
            self.config.clone(),
            self.shutdown.child_token(),
            terminate.clone(),
        );

        let span = info_span!("session", %id, %kind, cluster = %target.cluster());
        self.sessions.write().insert(
            id,
            Entry {
                subject: subject.clone(),
                target: target.clone(),
                created_at: Utc::now(),
                status: status.clone(),
                terminate,
                abort: None,
            },
        );
        self.metrics.started(kind);

        let mut deregister = Deregister {
            id,
            kind,
            started: time::Instant::now(),
            reason: None,
            sessions: self.sessions.clone(),
            metrics: self.metrics.clone(),
        };
        let task = self.tracker.spawn(
            async move {
                info!(%subject, target = %target, "Session started");
                let reason = session.run(client_rx, client_tx, connect).await;
                info!(reason = reason.as_str(), "Session closed");
                deregister.reason = Some(reason);
                drop(deregister);
                reason
            }
            .instrument(span),
        );

        // The task may already have finished and removed its entry.
        if let Some(entry) = self.sessions.write().get_mut(&id) {
            entry.abort = Some(task.abort_handle());
        }

        SessionHandle { id, status, task }
    }

    /// Lists live sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions = self
            .sessions
            .read()
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: *id,
                subject: entry.subject.clone(),
                kind: entry.target.kind(),
                target: entry.target.clone(),
                created_at: entry.created_at,
                status: *entry.status.borrow(),
            })
            .collect::<Vec<_>>();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    pub fn get(&self, id: SessionId) -> Option<SessionInfo> {
        self.list().into_iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Asks a session to close. Returns false if no such session is live.
    pub fn terminate(&self, id: SessionId) -> bool {
        match self.sessions.read().get(&id) {
            Some(entry) => {
                info!(%id, "Terminating session");
                entry.terminate.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every session and waits up to `deadline` for them to close.
    /// Sessions still running after the deadline are aborted.
    ///
    /// Returns the number of sessions that had to be aborted.
    pub async fn shutdown(&self, deadline: Duration) -> usize {
        let live = self.len();
        info!(sessions = live, "Shutting down sessions");
        self.shutdown.cancel();
        self.tracker.close();
        if time::timeout(deadline, self.tracker.wait()).await.is_ok() {
            return 0;
        }

        let aborts = self
            .sessions
            .read()
            .values()
            .filter_map(|entry| entry.abort.clone())
            .collect::<Vec<_>>();
        warn!(sessions = aborts.len(), ?deadline, "Aborting sessions that did not close");
        for abort in &aborts {
            abort.abort();
        }
        self.tracker.wait().await;
        aborts.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

// === impl SessionHandle ===

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Waits for the session to close. Returns `None` if it was aborted.
    pub async fn closed(self) -> Option<CloseReason> {
        self.task.await.ok()
    }
}

// === impl Deregister ===

impl Drop for Deregister {
    fn drop(&mut self) {
        self.sessions.write().remove(&self.id);
        let reason = self.reason.unwrap_or(CloseReason::Shutdown);
        self.metrics
            .closed(self.kind, reason, self.started.elapsed());
    }
}
