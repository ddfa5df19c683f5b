//! The cluster-facing side of a proxy session.

use crate::{pipe::PipeWriter, Result};
use bytes::Bytes;
use serde::Serialize;
use std::{future::Future, pin::Pin};

/// A cluster-side stream, opened by a [`Connect`].
///
/// Output does not flow through this trait: the upstream writes into the
/// [`PipeWriter`] it was opened with and drops it when the stream ends.
#[async_trait::async_trait]
pub trait Upstream: Send + 'static {
    /// Forwards client input unmodified.
    async fn write(&mut self, data: Bytes) -> Result<()>;

    /// Applies a terminal resize. Upstreams without a terminal ignore it.
    async fn resize(&mut self, cols: u16, rows: u16) -> Result<()>;

    /// Keeps the cluster-side connection alive in response to a client ping.
    /// The default sends nothing, for streams with no control channel to
    /// send on, such as a followed log response.
    async fn keepalive(&mut self) -> Result<()> {
        Ok(())
    }

    /// Stops the stream and releases everything it holds, returning the exit
    /// status if the upstream reported one. Callers bound this with a grace
    /// period; dropping the upstream must also stop it.
    async fn close(self: Box<Self>) -> Option<Exit>;
}

/// Opens an upstream that writes its output into the given pipe.
pub type Connect = Box<dyn FnOnce(PipeWriter) -> ConnectFuture + Send + 'static>;

pub type ConnectFuture = Pin<Box<dyn Future<Output = Result<Box<dyn Upstream>>> + Send + 'static>>;

/// How a command or container finished.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Exit {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// === impl Exit ===

impl Exit {
    pub fn success() -> Self {
        Self {
            success: true,
            code: Some(0),
            message: None,
        }
    }

    pub fn failure(code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            code,
            message: Some(message.into()),
        }
    }
}
