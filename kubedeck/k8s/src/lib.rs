#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod bundle;
mod client;
pub mod kubeconfig;
pub mod materialize;
pub mod node_shell;
pub mod pool;
mod registry;
pub mod upstream;

pub use self::{
    client::{ClusterClient, KubeClientBuilder},
    materialize::{EnvOverlay, HelperRunner, Materializer, MaterializeCredentials, ProcessRunner},
    node_shell::{EphemeralPod, HelperPods, KubeHelperPods, NodeShell, NodeShellConfig},
    pool::{BuildClient, ClientKey, ClientPool, InvalidateClients, PoolMetrics, PooledClient},
    registry::ClusterRegistry,
    upstream::{ExecUpstream, LogUpstream, NodeShellUpstream, StreamClient},
};
