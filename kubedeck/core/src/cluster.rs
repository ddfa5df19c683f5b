use crate::{credential::Provider, secret::SealedSecret, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};
use uuid::Uuid;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(Uuid);

/// Stored connection and auth configuration for one remote cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDescriptor {
    pub id: ClusterId,
    pub name: String,
    #[serde(default)]
    pub endpoint: Endpoint,
    pub auth: AuthMode,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub reachability: Reachability,
    /// Bumped on every edit. Cached clients are keyed by it.
    #[serde(default)]
    pub revision: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub server: String,

    /// Base64-encoded PEM bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,

    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

/// How kubedeck authenticates to a cluster.
///
/// Adding a mode is a compile-time change: every consumer matches this enum
/// exhaustively.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum AuthMode {
    /// A static bearer token, sealed at rest.
    Token { token: SealedSecret },

    /// An exec plugin backed by the user's AWS credentials file.
    ExecAws { exec: ExecSpec },

    /// An exec plugin backed by a per-user git credential helper.
    ExecGitHelper { exec: ExecSpec },

    /// The ambient in-cluster or local configuration of the process.
    InProcess,
}

/// An exec credential plugin invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecSpec {
    pub api_version: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Reachability {
    #[default]
    Unknown,
    Reachable {
        version: String,
        checked_at: DateTime<Utc>,
    },
    Unreachable {
        reason: String,
        checked_at: DateTime<Utc>,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
    #[serde(default)]
    pub auth: Option<AuthMode>,
    #[serde(default)]
    pub default: Option<bool>,
}

// === impl ClusterId ===

impl ClusterId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ClusterId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// === impl ClusterDescriptor ===

impl ClusterDescriptor {
    pub fn new(name: impl Into<String>, endpoint: Endpoint, auth: AuthMode) -> Self {
        Self {
            id: ClusterId::generate(),
            name: name.into(),
            endpoint,
            auth,
            default: false,
            reachability: Reachability::Unknown,
            revision: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidDescriptor("name must not be empty".into()));
        }
        if self.name.trim() != self.name {
            return Err(Error::InvalidDescriptor(format!(
                "name {:?} has surrounding whitespace",
                self.name
            )));
        }
        if !matches!(self.auth, AuthMode::InProcess) && self.endpoint.server.is_empty() {
            return Err(Error::InvalidDescriptor(format!(
                "cluster {} has no server endpoint",
                self.name
            )));
        }
        Ok(())
    }
}

// === impl AuthMode ===

impl AuthMode {
    /// The credential provider that must materialize per-user material before
    /// this mode can authenticate.
    pub fn provider(&self) -> Option<Provider> {
        match self {
            Self::ExecAws { .. } => Some(Provider::Aws),
            Self::ExecGitHelper { .. } => Some(Provider::GitHelper),
            Self::Token { .. } | Self::InProcess => None,
        }
    }

    pub fn exec(&self) -> Option<&ExecSpec> {
        match self {
            Self::ExecAws { exec } | Self::ExecGitHelper { exec } => Some(exec),
            Self::Token { .. } | Self::InProcess => None,
        }
    }

    /// Clients for per-user modes can't be shared between users.
    pub fn is_per_user(&self) -> bool {
        self.provider().is_some()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Token { .. } => "token",
            Self::ExecAws { .. } => "exec-aws",
            Self::ExecGitHelper { .. } => "exec-git-helper",
            Self::InProcess => "in-process",
        }
    }
}

// === impl ClusterPatch ===

impl ClusterPatch {
    pub fn apply(self, desc: &mut ClusterDescriptor) {
        if let Some(name) = self.name {
            desc.name = name;
        }
        if let Some(endpoint) = self.endpoint {
            desc.endpoint = endpoint;
            desc.reachability = Reachability::Unknown;
        }
        if let Some(auth) = self.auth {
            desc.auth = auth;
        }
        if let Some(default) = self.default {
            desc.default = default;
        }
    }

    /// True when the patch changes how a client connects, and so requires
    /// cached clients to be rebuilt.
    pub fn changes_connection(&self) -> bool {
        self.endpoint.is_some() || self.auth.is_some()
    }
}
