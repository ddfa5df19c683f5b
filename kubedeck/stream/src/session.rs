use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use kubedeck_core::{
    frame::{ClientFrame, ServerFrame},
    pipe::{self, PipeReader},
    session::{CloseReason, SessionState, SessionStatus},
    upstream::{Connect, Exit, Upstream},
    Error,
};
use std::{collections::VecDeque, pin::Pin, time::Duration};
use tokio::{sync::watch, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Closes sessions that receive no client frame for this long.
    pub idle_timeout: Duration,
    /// Bounds how long an upstream may take to stop.
    pub cancel_grace: Duration,
    pub high_water: usize,
    pub low_water: usize,
}

/// Drives one session from connect to close.
///
/// The session task is the only writer of the session's status.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    shutdown: CancellationToken,
    terminate: CancellationToken,
    status: watch::Sender<SessionStatus>,
}

enum Connected {
    Upstream(Box<dyn Upstream>),
    Failed(Error),
    Cancelled(CloseReason),
}

// === impl SessionConfig ===

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10 * 60),
            cancel_grace: Duration::from_secs(2),
            high_water: pipe::DEFAULT_HIGH_WATER,
            low_water: pipe::DEFAULT_LOW_WATER,
        }
    }
}

// === impl Session ===

impl Session {
    /// Creates a session that stops with [`CloseReason::Shutdown`] when
    /// `shutdown` is cancelled and with [`CloseReason::Terminated`] when
    /// `terminate` is.
    pub fn new(
        config: SessionConfig,
        shutdown: CancellationToken,
        terminate: CancellationToken,
    ) -> (Self, watch::Receiver<SessionStatus>) {
        let (status, rx) = watch::channel(SessionStatus {
            state: SessionState::Connecting,
            last_activity: Utc::now(),
        });
        let session = Self {
            config,
            shutdown,
            terminate,
            status,
        };
        (session, rx)
    }

    pub async fn run<I, O>(self, mut client_rx: I, mut client_tx: O, connect: Connect) -> CloseReason
    where
        I: Stream<Item = ClientFrame> + Send + Unpin,
        O: Sink<ServerFrame> + Send + Unpin,
    {
        let (writer, mut output) = pipe::pipe(self.config.high_water, self.config.low_water);

        // Frames that arrive while connecting are applied once connected.
        let mut pending = VecDeque::new();
        let connected = {
            let mut connecting = connect(writer);
            loop {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break Connected::Cancelled(CloseReason::Shutdown),
                    _ = self.terminate.cancelled() => break Connected::Cancelled(CloseReason::Terminated),
                    res = &mut connecting => break match res {
                        Ok(upstream) => Connected::Upstream(upstream),
                        Err(error) => Connected::Failed(error),
                    },
                    frame = client_rx.next() => match frame {
                        None | Some(ClientFrame::Close) => break Connected::Cancelled(CloseReason::Client),
                        Some(frame) => pending.push_back(frame),
                    },
                }
            }
        };

        let mut upstream = match connected {
            Connected::Upstream(upstream) => upstream,
            Connected::Failed(error) => {
                let error = match error {
                    error @ Error::PermissionDenied(_) => error,
                    error => Error::UpstreamUnavailable(error.to_string()),
                };
                warn!(%error, "Failed to connect");
                self.finish(&mut client_tx, ServerFrame::error(&error)).await;
                return CloseReason::Error;
            }
            Connected::Cancelled(reason) => {
                debug!(reason = reason.as_str(), "Cancelled while connecting");
                self.set_state(SessionState::Closing);
                let frame = ServerFrame::Closed { reason, exit: None };
                self.finish(&mut client_tx, frame).await;
                return reason;
            }
        };

        self.set_state(SessionState::Streaming);
        info!("Streaming");

        let idle = time::sleep(self.config.idle_timeout);
        tokio::pin!(idle);

        let mut failure = None;
        let mut reason = None;
        for frame in pending {
            match self.apply(&mut *upstream, frame).await {
                Ok(None) => {}
                Ok(Some(reply)) => {
                    reason = self.send(&mut client_tx, reply, idle.as_mut()).await;
                    if reason.is_some() {
                        break;
                    }
                }
                Err(error) => {
                    failure = Some(error);
                    reason = Some(CloseReason::Error);
                    break;
                }
            }
        }

        let reason = match reason {
            Some(reason) => reason,
            None => loop {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break CloseReason::Shutdown,
                    _ = self.terminate.cancelled() => break CloseReason::Terminated,
                    frame = client_rx.next() => {
                        let frame = match frame {
                            None | Some(ClientFrame::Close) => break CloseReason::Client,
                            Some(frame) => frame,
                        };
                        idle.as_mut().reset(time::Instant::now() + self.config.idle_timeout);
                        self.touch();
                        match self.apply(&mut *upstream, frame).await {
                            Ok(None) => {}
                            Ok(Some(reply)) => {
                                if let Some(reason) = self.send(&mut client_tx, reply, idle.as_mut()).await {
                                    break reason;
                                }
                            }
                            Err(error) => {
                                failure = Some(error);
                                break CloseReason::Error;
                            }
                        }
                    }
                    chunk = output.recv() => match chunk {
                        None => break CloseReason::Upstream,
                        Some(chunk) => {
                            let frame = ServerFrame::Data(chunk.bytes().clone());
                            if let Some(reason) = self.send(&mut client_tx, frame, idle.as_mut()).await {
                                break reason;
                            }
                        }
                    },
                    _ = &mut idle => break CloseReason::Idle,
                }
            },
        };

        self.set_state(SessionState::Closing);
        debug!(reason = reason.as_str(), "Closing");
        let exit = self.close_upstream(upstream).await;

        // The client gets what the upstream already produced, but a client
        // that stopped reading can't hold the session open.
        let deadline = time::Instant::now() + self.config.cancel_grace;
        if matches!(
            reason,
            CloseReason::Idle | CloseReason::Shutdown | CloseReason::Terminated
        ) && time::timeout_at(deadline, flush(&mut output, &mut client_tx))
            .await
            .is_err()
        {
            debug!("Client did not accept buffered output");
        }
        drop(output);

        let frame = match failure {
            Some(error) => ServerFrame::error(&error),
            None => ServerFrame::Closed { reason, exit },
        };
        self.finish_by(deadline, &mut client_tx, frame).await;
        reason
    }

    /// Routes one client frame: data to the upstream, control frames to
    /// their upstream equivalents. Returns the frame owed to the client, if
    /// any.
    async fn apply(
        &self,
        upstream: &mut dyn Upstream,
        frame: ClientFrame,
    ) -> Result<Option<ServerFrame>, Error> {
        match frame {
            ClientFrame::Data(data) => upstream.write(data).await.map(|()| None),
            ClientFrame::Resize { cols, rows } => {
                if let Err(error) = upstream.resize(cols, rows).await {
                    debug!(%error, cols, rows, "Failed to resize terminal");
                }
                Ok(None)
            }
            ClientFrame::Ping => {
                if let Err(error) = upstream.keepalive().await {
                    debug!(%error, "Keepalive failed");
                }
                Ok(Some(ServerFrame::Pong))
            }
            // Handled by the caller.
            ClientFrame::Close => Ok(None),
        }
    }

    /// Sends a frame to the client, returning the reason the session must
    /// stop if the client fails or the session is stopped while waiting on it.
    async fn send<O>(
        &self,
        client_tx: &mut O,
        frame: ServerFrame,
        idle: Pin<&mut time::Sleep>,
    ) -> Option<CloseReason>
    where
        O: Sink<ServerFrame> + Send + Unpin,
    {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Some(CloseReason::Shutdown),
            _ = self.terminate.cancelled() => Some(CloseReason::Terminated),
            _ = idle => Some(CloseReason::Idle),
            res = client_tx.send(frame) => res.err().map(|_| CloseReason::Client),
        }
    }

    async fn close_upstream(&self, upstream: Box<dyn Upstream>) -> Option<Exit> {
        match time::timeout(self.config.cancel_grace, upstream.close()).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!(grace = ?self.config.cancel_grace, "Upstream did not stop in time");
                None
            }
        }
    }

    async fn finish<O>(&self, client_tx: &mut O, frame: ServerFrame)
    where
        O: Sink<ServerFrame> + Send + Unpin,
    {
        let deadline = time::Instant::now() + self.config.cancel_grace;
        self.finish_by(deadline, client_tx, frame).await
    }

    /// Sends the last frame and closes the client, giving up at `deadline`.
    async fn finish_by<O>(&self, deadline: time::Instant, client_tx: &mut O, frame: ServerFrame)
    where
        O: Sink<ServerFrame> + Send + Unpin,
    {
        let last = async {
            let _ = client_tx.send(frame).await;
            let _ = client_tx.close().await;
        };
        if time::timeout_at(deadline, last).await.is_err() {
            debug!("Client did not accept the closing frame");
        }
        self.set_state(SessionState::Closed);
    }

    fn set_state(&self, state: SessionState) {
        self.status.send_modify(|status| status.state = state);
    }

    fn touch(&self) {
        self.status
            .send_modify(|status| status.last_activity = Utc::now());
    }
}

/// Sends output that is already buffered.
async fn flush<O>(output: &mut PipeReader, client_tx: &mut O)
where
    O: Sink<ServerFrame> + Send + Unpin,
{
    while let Some(chunk) = output.try_recv() {
        if client_tx
            .send(ServerFrame::Data(chunk.bytes().clone()))
            .await
            .is_err()
        {
            return;
        }
    }
}
