use crate::{console::Console, http, roles};
use anyhow::{anyhow, bail, Context, Result};
use axum::{http::HeaderName, Router};
use clap::Parser;
use kubedeck_core::{store, Authorizer, SecretKey, SecretStore};
use kubedeck_k8s::{
    ClientPool, ClusterRegistry, KubeClientBuilder, Materializer, NodeShell, NodeShellConfig,
    PoolMetrics, ProcessRunner,
};
use kubedeck_stream::{SessionConfig, SessionMetrics, SessionRegistry};
use prometheus_client::registry::Registry;
use std::{future::IntoFuture, net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::{
    net::TcpListener,
    signal::{self, unix::SignalKind},
    time::{self, Duration},
};
use tracing::{info, info_span, warn, Instrument};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[clap(name = "kubedeck", about = "Multi-cluster access and streaming proxy")]
pub struct Args {
    #[clap(long, default_value = "kubedeck=info,warn", env = "KUBEDECK_LOG")]
    log_level: String,

    #[clap(long, default_value = "plain")]
    log_format: LogFormat,

    #[clap(long, default_value = "0.0.0.0:8080", env = "KUBEDECK_LISTEN_ADDR")]
    listen_addr: SocketAddr,

    /// Passphrase the process-wide secret key is derived from.
    #[clap(long, env = "KUBEDECK_SECRET_KEY", hide_env_values = true)]
    secret_key: String,

    /// A key that secrets may still be sealed with. Secrets sealed by it are
    /// resealed with the current key at startup.
    #[clap(long, env = "KUBEDECK_PREVIOUS_SECRET_KEY", hide_env_values = true)]
    previous_secret_key: Option<String>,

    #[clap(
        long,
        default_value = "/var/lib/kubedeck/credentials",
        env = "KUBEDECK_CREDENTIALS_DIR"
    )]
    credentials_dir: PathBuf,

    /// A YAML file of roles and their assignments.
    #[clap(long)]
    roles_file: Option<PathBuf>,

    /// Kubeconfig bundles to import at startup. May be repeated.
    #[clap(long = "bundle")]
    bundles: Vec<PathBuf>,

    /// The request header carrying the authenticated user.
    #[clap(long, default_value = "x-kubedeck-user")]
    identity_header: HeaderName,

    #[clap(long, default_value = "30s", value_parser = parse_duration)]
    helper_timeout: Duration,

    #[clap(long, default_value = "10m", value_parser = parse_duration)]
    session_idle_timeout: Duration,

    #[clap(long, default_value = "2s", value_parser = parse_duration)]
    cancel_grace: Duration,

    #[clap(long, default_value = "10s", value_parser = parse_duration)]
    shutdown_grace: Duration,

    #[clap(long, default_value = "busybox:1.36")]
    node_shell_image: String,

    #[clap(long, default_value = "kube-system")]
    node_shell_namespace: String,

    /// How long a node shell's helper pod may take to become ready.
    #[clap(long, default_value = "60s", value_parser = parse_duration)]
    node_shell_timeout: Duration,

    #[clap(long, default_value = "4h", value_parser = parse_duration)]
    node_shell_max_lifetime: Duration,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            listen_addr,
            secret_key,
            previous_secret_key,
            credentials_dir,
            roles_file,
            bundles,
            identity_header,
            helper_timeout,
            session_idle_timeout,
            cancel_grace,
            shutdown_grace,
            node_shell_image,
            node_shell_namespace,
            node_shell_timeout,
            node_shell_max_lifetime,
        } = self;

        log_format.try_init(&log_level)?;

        let secrets = SecretStore::new(SecretKey::from_passphrase(&secret_key)).with_previous(
            previous_secret_key
                .as_deref()
                .map(SecretKey::from_passphrase),
        );
        let stores = store::Stores::memory();

        let table = match roles_file {
            Some(path) => {
                let table = roles::load(&path).await?;
                stores.roles.save_roles(&table).await?;
                table
            }
            None => stores.roles.load_roles().await?,
        };
        info!(
            roles = table.roles.len(),
            subjects = table.assignments.len(),
            "Loaded roles"
        );
        let authorizer = Authorizer::new(table);

        let mut prom = <Registry>::default();
        let session_metrics = SessionMetrics::register(&mut prom);
        let pool_metrics = PoolMetrics::register(&mut prom);

        let materializer = Arc::new(Materializer::new(
            credentials_dir,
            secrets.clone(),
            stores.credentials.clone(),
            Arc::new(ProcessRunner::default()),
            helper_timeout,
        ));
        let clients = Arc::new(ClientPool::new(
            KubeClientBuilder::new(materializer.clone(), secrets.clone()),
            pool_metrics,
        ));
        let registry = Arc::new(
            ClusterRegistry::load(
                stores.clusters.clone(),
                stores.credentials.clone(),
                secrets.clone(),
                clients.clone(),
            )
            .await?,
        );

        if previous_secret_key.is_some() {
            let resealed = store::reseal_all(&stores, &secrets).await?;
            info!(secrets = resealed, "Resealed secrets with the current key");
        }

        for path in bundles {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let ids = registry
                .import_bundle(&bytes)
                .await
                .with_context(|| format!("failed to import {}", path.display()))?;
            info!(path = %path.display(), clusters = ids.len(), "Imported bundle");
        }

        let node_shell = NodeShell::new(NodeShellConfig {
            image: node_shell_image,
            namespace: node_shell_namespace,
            ready_timeout: node_shell_timeout,
            max_lifetime: node_shell_max_lifetime,
            cancel_grace,
        });
        let sessions = SessionRegistry::new(
            SessionConfig {
                idle_timeout: session_idle_timeout,
                cancel_grace,
                ..SessionConfig::default()
            },
            session_metrics,
        );

        let console = Console {
            stores,
            secrets,
            authorizer,
            materializer,
            registry,
            clients,
            node_shell: node_shell.clone(),
            sessions: sessions.clone(),
        };

        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("failed to bind {listen_addr}"))?;
        let (drain_tx, drain_rx) = drain::channel();
        let app = http::router(console, identity_header, prom);
        let mut server = tokio::spawn(serve(listener, app, drain_rx).instrument(info_span!("http")));

        tokio::select! {
            res = &mut server => {
                res??;
                bail!("HTTP server exited");
            }
            res = shutdown_signal() => res?,
        }
        info!("Shutting down");

        // Sessions hold upgraded connections, so they're closed while the
        // server drains.
        let (drained, aborted) = tokio::join!(
            time::timeout(shutdown_grace, drain_tx.drain()),
            sessions.shutdown(shutdown_grace),
        );
        if drained.is_err() {
            warn!(timeout = ?shutdown_grace, "HTTP server did not drain");
            server.abort();
        }
        if aborted > 0 {
            warn!(sessions = aborted, "Aborted sessions that did not close");
        }

        let cleanup = node_shell.cleanup();
        cleanup.close();
        if time::timeout(cancel_grace, cleanup.wait()).await.is_err() {
            warn!(pods = cleanup.len(), "Helper pod deletions did not finish");
        }

        Ok(())
    }
}

// === impl LogFormat ===

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plain" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            _ => bail!("invalid log format {s:?}; expected plain or json"),
        }
    }
}

impl LogFormat {
    fn try_init(self, filter: &str) -> Result<()> {
        let filter = EnvFilter::try_new(filter).context("invalid log filter")?;
        let registry = tracing_subscriber::registry().with(filter);
        match self {
            Self::Plain => registry.with(fmt::layer()).try_init()?,
            Self::Json => registry.with(fmt::layer().json()).try_init()?,
        }
        Ok(())
    }
}

/// Parses durations written as an integer with a `ms`, `s`, `m`, or `h`
/// suffix.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let unit_at = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| anyhow!("duration {s:?} has no unit"))?;
    let (n, unit) = s.split_at(unit_at);
    let n = n
        .parse::<u64>()
        .with_context(|| format!("invalid duration {s:?}"))?;
    let secs = |mul: u64| {
        n.checked_mul(mul)
            .map(Duration::from_secs)
            .ok_or_else(|| anyhow!("duration {s:?} is too large"))
    };
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => secs(1),
        "m" => secs(60),
        "h" => secs(60 * 60),
        _ => bail!("duration {s:?} has an invalid unit"),
    }
}

async fn serve(listener: TcpListener, app: Router, drain: drain::Watch) -> Result<()> {
    let addr = listener.local_addr()?;
    let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
    let srv = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = close_rx.await;
        })
        .into_future();
    tokio::pin!(srv);

    info!(%addr, "HTTP server listening");
    tokio::select! {
        res = &mut srv => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let mut term = signal::unix::signal(SignalKind::terminate())?;
    tokio::select! {
        res = signal::ctrl_c() => res?,
        _ = term.recv() => {}
    }
    Ok(())
}
