use crate::{cluster::ClusterId, secret::SealedSecret};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// An authenticated subject, as supplied by the identity layer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

/// A stable, opaque per-user identifier that scopes on-disk credential
/// material. It is assigned once and never derived from the user's name.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageNamespace(Uuid);

/// External credential providers that need per-user material on disk.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    Aws,
    GitHelper,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Validation {
    #[default]
    Unvalidated,
    Valid,
    Invalid,
}

/// A user's secret for one cluster. The payload stays sealed except while a
/// materialization holds it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserClusterCredential {
    pub user: UserId,
    pub cluster: ClusterId,
    pub secret: SealedSecret,
    #[serde(default)]
    pub validation: Validation,
    pub updated_at: DateTime<Utc>,
}

// === impl UserId ===

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

// === impl StorageNamespace ===

impl StorageNamespace {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for StorageNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.simple().fmt(f)
    }
}

// === impl Provider ===

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::GitHelper => "git-helper",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl UserClusterCredential ===

impl UserClusterCredential {
    pub fn new(user: UserId, cluster: ClusterId, secret: SealedSecret) -> Self {
        Self {
            user,
            cluster,
            secret,
            validation: Validation::Unvalidated,
            updated_at: Utc::now(),
        }
    }
}
