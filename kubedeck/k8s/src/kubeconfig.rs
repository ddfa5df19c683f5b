//! A minimal kubeconfig model.
//!
//! Bundles are parsed into these types on import, and each client is built
//! from a single-context kubeconfig rendered from its descriptor.

use crate::materialize::EnvOverlay;
use kube::config::KubeConfigOptions;
use kubedeck_core::{AuthMode, ClusterDescriptor, Error, Result};
use serde::{Deserialize, Serialize};

const CONTEXT: &str = "kubedeck";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Kubeconfig {
    #[serde(rename = "apiVersion", default = "api_version")]
    pub api_version: String,
    #[serde(default = "kind")]
    pub kind: String,
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    #[serde(default)]
    pub users: Vec<NamedUser>,
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    #[serde(
        rename = "current-context",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub current_context: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: Cluster,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Cluster {
    #[serde(default)]
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure_skip_tls_verify: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
    #[serde(default)]
    pub user: User,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<Exec>,

    // Read only to recognize, and skip, unsupported auth methods.
    #[serde(default, skip_serializing)]
    pub client_certificate: Option<String>,
    #[serde(default, skip_serializing)]
    pub client_certificate_data: Option<String>,
    #[serde(default, skip_serializing)]
    pub auth_provider: Option<serde_yaml::Value>,
    #[serde(default, skip_serializing)]
    pub username: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exec {
    #[serde(default = "exec_api_version")]
    pub api_version: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<ExecEnv>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interactive_mode: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecEnv {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: Context,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub cluster: String,
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Credentials resolved for a single client build.
#[derive(Debug)]
pub enum Credentials<'a> {
    /// A plaintext bearer token. It is only ever held in memory.
    Token(&'a str),
    Exec(&'a EnvOverlay),
}

fn api_version() -> String {
    "v1".to_string()
}

fn kind() -> String {
    "Config".to_string()
}

fn exec_api_version() -> String {
    "client.authentication.k8s.io/v1beta1".to_string()
}

// === impl Kubeconfig ===

impl Kubeconfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::InvalidBundle(e.to_string()))
    }

    /// Renders a kubeconfig with a single context for `desc`.
    pub fn for_cluster(desc: &ClusterDescriptor, creds: Credentials<'_>) -> Result<Self> {
        let user = match (&desc.auth, creds) {
            (AuthMode::Token { .. }, Credentials::Token(token)) => User {
                token: Some(token.to_string()),
                ..User::default()
            },
            (AuthMode::ExecAws { exec } | AuthMode::ExecGitHelper { exec }, Credentials::Exec(overlay)) => {
                let mut env = exec
                    .env
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect::<std::collections::BTreeMap<_, _>>();
                env.extend(overlay.iter().map(|(k, v)| (k.to_string(), v.to_string())));
                User {
                    exec: Some(Exec {
                        api_version: exec.api_version.clone(),
                        command: exec.command.clone(),
                        args: exec.args.clone(),
                        env: env
                            .into_iter()
                            .map(|(name, value)| ExecEnv { name, value })
                            .collect(),
                        interactive_mode: Some("Never".to_string()),
                    }),
                    ..User::default()
                }
            }
            (auth, _) => {
                return Err(Error::InvalidDescriptor(format!(
                    "{} auth cannot be rendered as a kubeconfig",
                    auth.name()
                )))
            }
        };

        Ok(Self {
            api_version: api_version(),
            kind: kind(),
            clusters: vec![NamedCluster {
                name: CONTEXT.to_string(),
                cluster: Cluster {
                    server: desc.endpoint.server.clone(),
                    certificate_authority_data: desc.endpoint.certificate_authority_data.clone(),
                    insecure_skip_tls_verify: desc
                        .endpoint
                        .insecure_skip_tls_verify
                        .then_some(true),
                },
            }],
            users: vec![NamedUser {
                name: CONTEXT.to_string(),
                user,
            }],
            contexts: vec![NamedContext {
                name: CONTEXT.to_string(),
                context: Context {
                    cluster: CONTEXT.to_string(),
                    user: CONTEXT.to_string(),
                    namespace: None,
                },
            }],
            current_context: Some(CONTEXT.to_string()),
        })
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::InvalidDescriptor(e.to_string()))
    }

    pub fn cluster(&self, name: &str) -> Option<&Cluster> {
        self.clusters
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.cluster)
    }

    pub fn user(&self, name: &str) -> Option<&User> {
        self.users.iter().find(|u| u.name == name).map(|u| &u.user)
    }
}

/// Builds a client configuration for `desc` using the given credentials.
pub async fn client_config(
    desc: &ClusterDescriptor,
    creds: Credentials<'_>,
) -> Result<kube::Config> {
    let yaml = Kubeconfig::for_cluster(desc, creds)?.to_yaml()?;
    let kubeconfig = kube::config::Kubeconfig::from_yaml(&yaml)
        .map_err(|e| Error::InvalidDescriptor(e.to_string()))?;
    kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::InvalidDescriptor(e.to_string()))
}
