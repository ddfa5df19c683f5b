#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod access;
pub mod cluster;
pub mod credential;
mod error;
pub mod frame;
pub mod pipe;
pub mod secret;
pub mod session;
pub mod store;
pub mod upstream;

pub use self::{
    access::{AccessRequest, AccessRule, Authorizer, Decision, Pattern, Role, RoleTable},
    cluster::{AuthMode, ClusterDescriptor, ClusterId, ClusterPatch, Endpoint, ExecSpec},
    credential::{Provider, StorageNamespace, UserClusterCredential, UserId, Validation},
    error::{Error, Result},
    secret::{DecryptionError, Plaintext, SealedSecret, SecretKey, SecretStore},
};

/// The label applied to every object kubedeck creates in a cluster.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "kubedeck";
