//! Cluster-side streams: pod logs, container exec, and node shells.

use crate::{
    client::ClusterClient,
    node_shell::{self, EphemeralPod, KubeHelperPods, NodeShell},
    pool::PooledClient,
};
use bytes::Bytes;
use futures::{channel::mpsc, SinkExt};
use k8s_openapi::{api::core::v1::Pod, apimachinery::pkg::apis::meta::v1::Status};
use kube::api::{Api, AttachParams, AttachedProcess, LogParams, TerminalSize};
use kubedeck_core::{
    pipe::PipeWriter,
    session::{LogOptions, SessionId, Target},
    upstream::{Exit, Upstream},
    Error, Result,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    task::JoinHandle,
};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, trace};

/// Used when a terminal session doesn't name a command.
pub const DEFAULT_SHELL: &[&str] = &[
    "/bin/sh",
    "-c",
    "TERM=xterm-256color; export TERM; [ -x /bin/bash ] && exec /bin/bash || exec /bin/sh",
];

const READ_BUFFER: usize = 8 * 1024;

/// A pooled client that can probe its cluster and open session streams.
#[async_trait::async_trait]
pub trait StreamClient: PooledClient {
    /// Requests the server version once.
    async fn server_version(&self) -> Result<String>;

    async fn open_upstream(
        &self,
        shell: &NodeShell,
        session: SessionId,
        target: Target,
        output: PipeWriter,
    ) -> Result<Box<dyn Upstream>>;
}

/// Follows a container's log.
#[derive(Debug)]
pub struct LogUpstream {
    reader: JoinHandle<Result<(), String>>,
}

/// An interactive process attached through the exec subresource.
pub struct ExecUpstream {
    attached: AttachedProcess,
    stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    terminal: Terminal,
    readers: Vec<JoinHandle<Result<(), String>>>,
    remaining: Arc<AtomicUsize>,
}

/// The resize channel of an attached terminal.
#[derive(Debug, Default)]
struct Terminal {
    tx: Option<mpsc::Sender<TerminalSize>>,
    size: Option<(u16, u16)>,
}

/// A shell in a node's host namespaces, through a helper pod.
pub struct NodeShellUpstream {
    exec: ExecUpstream,
    pod: EphemeralPod,
}

/// Copies `reader` into the pipe until it ends, the pipe closes, or a read
/// fails. `remaining` is decremented before the writer is dropped so that
/// the upstream knows its output is complete once the pipe ends.
async fn forward<R: AsyncRead + Unpin>(
    mut reader: R,
    output: PipeWriter,
    remaining: Arc<AtomicUsize>,
) -> Result<(), String> {
    let mut buf = vec![0u8; READ_BUFFER];
    let res = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => {
                trace!(bytes = n, "Forwarding output");
                if output.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break Ok(());
                }
            }
            Err(error) => {
                debug!(%error, "Stream read failed");
                break Err(error.to_string());
            }
        }
    };
    remaining.fetch_sub(1, Ordering::AcqRel);
    drop(output);
    res
}

fn exit_of(status: Option<Status>) -> Exit {
    let Some(status) = status else {
        return Exit::success();
    };
    if status.status.as_deref() == Some("Success") {
        return Exit::success();
    }
    let code = status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| causes.iter().find(|c| c.reason.as_deref() == Some("ExitCode")))
        .and_then(|c| c.message.as_deref()?.parse().ok());
    Exit::failure(code, status.message.unwrap_or_default())
}

fn log_params(options: &LogOptions) -> LogParams {
    LogParams {
        container: options.container.clone(),
        follow: options.follow,
        tail_lines: options.tail_lines,
        since_seconds: options.since_seconds,
        timestamps: options.timestamps,
        previous: options.previous,
        ..LogParams::default()
    }
}

// === impl LogUpstream ===

impl LogUpstream {
    pub async fn open(
        client: kube::Client,
        namespace: &str,
        pod: &str,
        options: &LogOptions,
        output: PipeWriter,
    ) -> Result<Self> {
        let stream = Api::<Pod>::namespaced(client, namespace)
            .log_stream(pod, &log_params(options))
            .await
            .map_err(Error::upstream)?;
        let reader = tokio::spawn(forward(
            Box::pin(stream).compat(),
            output,
            Arc::new(AtomicUsize::new(1)),
        ));
        Ok(Self { reader })
    }
}

#[async_trait::async_trait]
impl Upstream for LogUpstream {
    async fn write(&mut self, _: Bytes) -> Result<()> {
        debug!("Ignoring input to a log stream");
        Ok(())
    }

    async fn resize(&mut self, _: u16, _: u16) -> Result<()> {
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Option<Exit> {
        if !self.reader.is_finished() {
            self.reader.abort();
            return None;
        }
        match (&mut self.reader).await {
            Ok(Err(message)) => Some(Exit::failure(None, message)),
            _ => None,
        }
    }
}

impl Drop for LogUpstream {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// === impl ExecUpstream ===

impl ExecUpstream {
    /// Runs `command` in a container with a terminal attached.
    pub async fn open(
        client: kube::Client,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: &[String],
        output: PipeWriter,
    ) -> Result<Self> {
        let mut params = AttachParams::interactive_tty();
        if let Some(container) = container {
            params = params.container(container);
        }
        let command = if command.is_empty() {
            DEFAULT_SHELL.iter().map(|s| s.to_string()).collect()
        } else {
            command.to_vec()
        };
        let attached = Api::<Pod>::namespaced(client, namespace)
            .exec(pod, command, &params)
            .await
            .map_err(Error::upstream)?;
        Ok(Self::new(attached, output))
    }

    pub fn new(mut attached: AttachedProcess, output: PipeWriter) -> Self {
        let mut readers = Vec::with_capacity(2);
        let remaining = Arc::new(AtomicUsize::new(0));
        if let Some(stdout) = attached.stdout() {
            remaining.fetch_add(1, Ordering::AcqRel);
            readers.push(tokio::spawn(forward(stdout, output.clone(), remaining.clone())));
        }
        if let Some(stderr) = attached.stderr() {
            remaining.fetch_add(1, Ordering::AcqRel);
            readers.push(tokio::spawn(forward(stderr, output, remaining.clone())));
        }
        let stdin = attached
            .stdin()
            .map(|w| Box::new(w) as Box<dyn AsyncWrite + Send + Unpin>);
        let terminal = Terminal {
            tx: attached.terminal_size(),
            size: None,
        };
        Self {
            attached,
            stdin,
            terminal,
            readers,
            remaining,
        }
    }
}

#[async_trait::async_trait]
impl Upstream for ExecUpstream {
    async fn write(&mut self, data: Bytes) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::upstream("stdin is closed"))?;
        stdin.write_all(&data).await.map_err(Error::upstream)?;
        stdin.flush().await.map_err(Error::upstream)
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.terminal.resize(cols, rows).await
    }

    async fn keepalive(&mut self) -> Result<()> {
        self.terminal.keepalive().await
    }

    async fn close(mut self: Box<Self>) -> Option<Exit> {
        self.stdin = None;
        self.terminal.tx = None;
        if self.remaining.load(Ordering::Acquire) > 0 {
            // The client went away first.
            self.attached.abort();
            return None;
        }
        let status = self.attached.take_status()?.await;
        Some(exit_of(status))
    }
}

impl Drop for ExecUpstream {
    fn drop(&mut self) {
        self.attached.abort();
        for reader in &self.readers {
            reader.abort();
        }
    }
}

impl std::fmt::Debug for ExecUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecUpstream")
            .field("readers", &self.readers.len())
            .field("remaining", &self.remaining.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// === impl Terminal ===

impl Terminal {
    async fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.size = Some((cols, rows));
        self.send().await
    }

    /// Resends the current size, so that an idle terminal's connection still
    /// carries traffic. Nothing is sent before the first resize.
    async fn keepalive(&mut self) -> Result<()> {
        if self.size.is_none() {
            return Ok(());
        }
        self.send().await
    }

    async fn send(&mut self) -> Result<()> {
        let (Some(tx), Some((width, height))) = (self.tx.as_mut(), self.size) else {
            return Ok(());
        };
        tx.send(TerminalSize { width, height })
            .await
            .map_err(Error::upstream)
    }
}

// === impl NodeShellUpstream ===

impl NodeShellUpstream {
    /// Starts a helper pod on `node` and attaches a host shell to it.
    pub async fn open(
        client: kube::Client,
        shell: &NodeShell,
        session: SessionId,
        node: &str,
        output: PipeWriter,
    ) -> Result<Self> {
        let pods = Arc::new(KubeHelperPods::new(client.clone()));
        let pod = shell.open(pods, session, node).await?;
        let command = node_shell::SHELL
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>();
        let exec = ExecUpstream::open(
            client,
            &pod.handle().namespace,
            &pod.handle().pod_name,
            Some(node_shell::CONTAINER),
            &command,
            output,
        )
        .await;
        match exec {
            Ok(exec) => Ok(Self { exec, pod }),
            Err(error) => {
                pod.release().await;
                Err(error)
            }
        }
    }
}

#[async_trait::async_trait]
impl Upstream for NodeShellUpstream {
    async fn write(&mut self, data: Bytes) -> Result<()> {
        self.exec.write(data).await
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.exec.resize(cols, rows).await
    }

    async fn keepalive(&mut self) -> Result<()> {
        self.exec.keepalive().await
    }

    async fn close(self: Box<Self>) -> Option<Exit> {
        let Self { exec, pod } = *self;
        let exit = Box::new(exec).close().await;
        pod.release().await;
        exit
    }
}

// === impl ClusterClient ===

#[async_trait::async_trait]
impl StreamClient for ClusterClient {
    async fn server_version(&self) -> Result<String> {
        self.version().await
    }

    async fn open_upstream(
        &self,
        shell: &NodeShell,
        session: SessionId,
        target: Target,
        output: PipeWriter,
    ) -> Result<Box<dyn Upstream>> {
        let client = self.client();
        let upstream: Box<dyn Upstream> = match target {
            Target::Logs {
                namespace,
                pod,
                options,
                ..
            } => Box::new(LogUpstream::open(client, &namespace, &pod, &options, output).await?),
            Target::Terminal {
                namespace,
                pod,
                container,
                command,
                ..
            } => Box::new(
                ExecUpstream::open(
                    client,
                    &namespace,
                    &pod,
                    container.as_deref(),
                    &command,
                    output,
                )
                .await?,
            ),
            Target::NodeTerminal { node, .. } => {
                Box::new(NodeShellUpstream::open(client, shell, session, &node, output).await?)
            }
        };
        Ok(upstream)
    }
}
