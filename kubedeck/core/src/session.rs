use crate::{access::AccessRequest, credential::UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    Logs,
    Terminal,
    NodeTerminal,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Streaming,
    Closing,
    Closed,
}

/// Why a session ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseReason {
    /// The client closed its socket or sent a close frame.
    Client,
    /// The cluster-side stream finished.
    Upstream,
    /// No client frame arrived within the idle timeout.
    Idle,
    /// The process is shutting down.
    Shutdown,
    /// An operator terminated the session.
    Terminated,
    /// The session failed.
    Error,
}

/// What a session streams from. Each variant carries exactly the parameters
/// its kind needs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Target {
    Logs {
        cluster: String,
        namespace: String,
        pod: String,
        #[serde(flatten)]
        options: LogOptions,
    },
    Terminal {
        cluster: String,
        namespace: String,
        pod: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        container: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        command: Vec<String>,
    },
    NodeTerminal {
        cluster: String,
        node: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default = "default_follow")]
    pub follow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tail_lines: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_seconds: Option<i64>,
    #[serde(default)]
    pub timestamps: bool,
    #[serde(default)]
    pub previous: bool,
}

/// Observable state of a session. Only the session's own task writes it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: SessionState,
    pub last_activity: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub subject: UserId,
    pub kind: SessionKind,
    pub target: Target,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub status: SessionStatus,
}

/// Identifies a helper pod owned by a node-terminal session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralPodHandle {
    pub namespace: String,
    pub pod_name: String,
    pub node_name: String,
    pub created_at: DateTime<Utc>,
}

fn default_follow() -> bool {
    true
}

// === impl SessionId ===

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// === impl SessionKind ===

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Logs => "logs",
            Self::Terminal => "terminal",
            Self::NodeTerminal => "node-terminal",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl CloseReason ===

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Upstream => "upstream",
            Self::Idle => "idle",
            Self::Shutdown => "shutdown",
            Self::Terminated => "terminated",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl Target ===

impl Target {
    pub fn kind(&self) -> SessionKind {
        match self {
            Self::Logs { .. } => SessionKind::Logs,
            Self::Terminal { .. } => SessionKind::Terminal,
            Self::NodeTerminal { .. } => SessionKind::NodeTerminal,
        }
    }

    pub fn cluster(&self) -> &str {
        match self {
            Self::Logs { cluster, .. }
            | Self::Terminal { cluster, .. }
            | Self::NodeTerminal { cluster, .. } => cluster,
        }
    }

    /// The request that must be allowed before the session touches the
    /// cluster.
    pub fn access_request(&self, subject: UserId) -> AccessRequest {
        match self {
            Self::Logs {
                cluster,
                namespace,
                pod,
                ..
            } => AccessRequest::pod_logs(subject, cluster, namespace, pod),
            Self::Terminal {
                cluster,
                namespace,
                pod,
                ..
            } => AccessRequest::pod_exec(subject, cluster, namespace, pod),
            Self::NodeTerminal { cluster, node } => {
                AccessRequest::node_terminal(subject, cluster, node)
            }
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Logs {
                cluster,
                namespace,
                pod,
                ..
            }
            | Self::Terminal {
                cluster,
                namespace,
                pod,
                ..
            } => write!(f, "{cluster}/{namespace}/{pod}"),
            Self::NodeTerminal { cluster, node } => write!(f, "{cluster}/node/{node}"),
        }
    }
}

// === impl LogOptions ===

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            container: None,
            follow: true,
            tail_lines: None,
            since_seconds: None,
            timestamps: false,
            previous: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_map_to_access_requests() {
        let alice = UserId::new("alice");

        let logs = Target::Logs {
            cluster: "prod".into(),
            namespace: "default".into(),
            pod: "web-0".into(),
            options: LogOptions::default(),
        };
        let req = logs.access_request(alice.clone());
        assert_eq!((req.verb.as_str(), req.kind.as_str()), ("get", "pods/log"));
        assert_eq!(logs.kind(), SessionKind::Logs);

        let term = Target::Terminal {
            cluster: "prod".into(),
            namespace: "default".into(),
            pod: "web-0".into(),
            container: Some("app".into()),
            command: vec![],
        };
        let req = term.access_request(alice.clone());
        assert_eq!((req.verb.as_str(), req.kind.as_str()), ("create", "pods/exec"));
        assert_eq!(req.name, "web-0");

        let node = Target::NodeTerminal {
            cluster: "prod".into(),
            node: "node-1".into(),
        };
        let req = node.access_request(alice);
        assert_eq!(
            (req.verb.as_str(), req.kind.as_str(), req.namespace.as_str()),
            ("create", "nodes/terminal", "")
        );
        assert_eq!(node.cluster(), "prod");
    }

    #[test]
    fn log_options_default_to_follow() {
        let target: Target = serde_json::from_value(serde_json::json!({
            "kind": "logs",
            "cluster": "prod",
            "namespace": "default",
            "pod": "web-0",
            "tailLines": 100,
        }))
        .unwrap();
        let Target::Logs { options, .. } = target else {
            panic!("expected a logs target");
        };
        assert!(options.follow);
        assert_eq!(options.tail_lines, Some(100));
    }
}
