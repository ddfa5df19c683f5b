use crate::{Session, SessionConfig, SessionMetrics, SessionRegistry};
use bytes::Bytes;
use futures::{channel::mpsc, sink, StreamExt};
use kubedeck_core::{
    frame::{ClientFrame, ServerFrame},
    pipe::PipeWriter,
    session::{CloseReason, LogOptions, SessionId, SessionState, Target},
    upstream::{Connect, ConnectFuture, Exit, Upstream},
    Error, Result, UserId,
};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// The cluster side of a test session.
#[derive(Default)]
struct Remote {
    state: Mutex<RemoteState>,
}

#[derive(Default)]
struct RemoteState {
    output: Option<PipeWriter>,
    writes: Vec<Bytes>,
    resizes: Vec<(u16, u16)>,
    keepalives: usize,
    closed: bool,
    fail_writes: bool,
}

struct FakeUpstream {
    remote: Arc<Remote>,
    exit: Option<Exit>,
    stall_close: bool,
}

#[async_trait::async_trait]
impl Upstream for FakeUpstream {
    async fn write(&mut self, data: Bytes) -> Result<()> {
        let mut state = self.remote.state.lock();
        if state.fail_writes {
            return Err(Error::upstream("broken pipe"));
        }
        state.writes.push(data);
        Ok(())
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.remote.state.lock().resizes.push((cols, rows));
        Ok(())
    }

    async fn keepalive(&mut self) -> Result<()> {
        self.remote.state.lock().keepalives += 1;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Option<Exit> {
        if self.stall_close {
            futures::future::pending::<()>().await;
        }
        let mut state = self.remote.state.lock();
        state.output = None;
        state.closed = true;
        self.exit
    }
}

impl Remote {
    fn connect(self: &Arc<Self>, exit: Option<Exit>) -> Connect {
        self.connect_with(exit, false)
    }

    fn connect_with(self: &Arc<Self>, exit: Option<Exit>, stall_close: bool) -> Connect {
        let remote = self.clone();
        Box::new(move |output: PipeWriter| -> ConnectFuture {
            Box::pin(async move {
                remote.state.lock().output = Some(output);
                let upstream = FakeUpstream {
                    remote,
                    exit,
                    stall_close,
                };
                Ok(Box::new(upstream) as Box<dyn Upstream>)
            })
        })
    }

    async fn emit(&self, data: &'static [u8]) {
        let output = self
            .state
            .lock()
            .output
            .clone()
            .expect("upstream must be connected");
        output.send(Bytes::from_static(data)).await.unwrap();
    }

    /// Ends the upstream's output.
    fn finish(&self) {
        self.state.lock().output = None;
    }

    fn writes(&self) -> Vec<Bytes> {
        self.state.lock().writes.clone()
    }

    fn closed(&self) -> bool {
        self.state.lock().closed
    }
}

fn connect_pending() -> Connect {
    Box::new(|_: PipeWriter| -> ConnectFuture { Box::pin(futures::future::pending()) })
}

fn connect_failing(error: fn() -> Error) -> Connect {
    Box::new(move |_: PipeWriter| -> ConnectFuture { Box::pin(async move { Err(error()) }) })
}

fn terminal() -> Target {
    Target::Terminal {
        cluster: "prod".into(),
        namespace: "default".into(),
        pod: "web-0".into(),
        container: None,
        command: vec![],
    }
}

fn logs() -> Target {
    Target::Logs {
        cluster: "prod".into(),
        namespace: "default".into(),
        pod: "web-0".into(),
        options: LogOptions::default(),
    }
}

fn registry(config: SessionConfig) -> SessionRegistry {
    SessionRegistry::new(config, SessionMetrics::default())
}

fn config() -> SessionConfig {
    SessionConfig {
        idle_timeout: Duration::from_secs(60),
        cancel_grace: Duration::from_secs(2),
        ..SessionConfig::default()
    }
}

/// Polls until `f` holds, advancing paused time in small steps.
async fn eventually(mut f: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if f() {
            return;
        }
        time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not met");
}

fn data(frame: &ServerFrame) -> &[u8] {
    match frame {
        ServerFrame::Data(bytes) => bytes,
        frame => panic!("expected data, got {frame:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn forwards_both_directions() {
    let sessions = registry(config());
    let remote = Arc::new(Remote::default());
    let (client_tx, client_rx) = mpsc::unbounded();
    let (server_tx, mut server_rx) = mpsc::unbounded();

    let handle = sessions.spawn(
        SessionId::generate(),
        UserId::new("alice"),
        terminal(),
        client_rx,
        server_tx,
        remote.connect(Some(Exit::success())),
    );
    assert_eq!(sessions.len(), 1);

    client_tx
        .unbounded_send(ClientFrame::Data(Bytes::from_static(b"ls\n")))
        .unwrap();
    client_tx
        .unbounded_send(ClientFrame::Resize {
            cols: 120,
            rows: 40,
        })
        .unwrap();
    client_tx.unbounded_send(ClientFrame::Ping).unwrap();
    assert_eq!(server_rx.next().await, Some(ServerFrame::Pong));
    assert_eq!(remote.writes(), vec![Bytes::from_static(b"ls\n")]);
    assert_eq!(remote.state.lock().resizes, vec![(120, 40)]);
    assert_eq!(remote.state.lock().keepalives, 1);
    assert_eq!(handle.status().state, SessionState::Streaming);

    remote.emit(b"bin\netc\n").await;
    assert_eq!(data(&server_rx.next().await.unwrap()), b"bin\netc\n");

    // The upstream finishing closes the session with its exit status.
    remote.finish();
    assert_eq!(
        server_rx.next().await,
        Some(ServerFrame::Closed {
            reason: CloseReason::Upstream,
            exit: Some(Exit::success()),
        })
    );
    assert_eq!(server_rx.next().await, None, "nothing follows the closed frame");
    assert_eq!(handle.closed().await, Some(CloseReason::Upstream));
    assert!(remote.closed());
    assert!(sessions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn client_disconnects_cancel_the_upstream() {
    let sessions = registry(config());
    let remote = Arc::new(Remote::default());
    let (client_tx, client_rx) = mpsc::unbounded();
    let (server_tx, mut server_rx) = mpsc::unbounded();

    let handle = sessions.spawn(
        SessionId::generate(),
        UserId::new("alice"),
        logs(),
        client_rx,
        server_tx,
        remote.connect(None),
    );
    remote_connected(&remote).await;

    drop(client_tx);
    let reason = time::timeout(Duration::from_secs(2), handle.closed())
        .await
        .expect("session must close within the grace period");
    assert_eq!(reason, Some(CloseReason::Client));
    assert!(remote.closed());

    assert_eq!(
        server_rx.next().await,
        Some(ServerFrame::Closed {
            reason: CloseReason::Client,
            exit: None,
        })
    );
    assert!(sessions.list().is_empty());
}

#[tokio::test(start_paused = true)]
async fn close_frames_end_the_session() {
    let sessions = registry(config());
    let remote = Arc::new(Remote::default());
    let (client_tx, client_rx) = mpsc::unbounded();
    let (server_tx, _server_rx) = mpsc::unbounded();

    let handle = sessions.spawn(
        SessionId::generate(),
        UserId::new("alice"),
        terminal(),
        client_rx,
        server_tx,
        remote.connect(None),
    );
    client_tx.unbounded_send(ClientFrame::Close).unwrap();
    assert_eq!(handle.closed().await, Some(CloseReason::Client));
}

#[tokio::test(start_paused = true)]
async fn stalled_upstreams_are_dropped_after_the_grace_period() {
    let sessions = registry(config());
    let remote = Arc::new(Remote::default());
    let (client_tx, client_rx) = mpsc::unbounded();
    let (server_tx, _server_rx) = mpsc::unbounded();

    let handle = sessions.spawn(
        SessionId::generate(),
        UserId::new("alice"),
        terminal(),
        client_rx,
        server_tx,
        remote.connect_with(None, true),
    );
    remote_connected(&remote).await;

    let start = time::Instant::now();
    drop(client_tx);
    assert_eq!(handle.closed().await, Some(CloseReason::Client));
    assert!(start.elapsed() <= Duration::from_secs(2) + Duration::from_millis(10));
    assert!(sessions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn idle_sessions_close() {
    let sessions = registry(config());
    let remote = Arc::new(Remote::default());
    let (client_tx, client_rx) = mpsc::unbounded();
    let (server_tx, mut server_rx) = mpsc::unbounded();

    let handle = sessions.spawn(
        SessionId::generate(),
        UserId::new("alice"),
        terminal(),
        client_rx,
        server_tx,
        remote.connect(None),
    );
    remote_connected(&remote).await;

    // Client frames keep the session alive.
    time::sleep(Duration::from_secs(45)).await;
    client_tx.unbounded_send(ClientFrame::Ping).unwrap();
    assert_eq!(server_rx.next().await, Some(ServerFrame::Pong));
    time::sleep(Duration::from_secs(45)).await;
    assert_eq!(handle.status().state, SessionState::Streaming);

    // Output does not count as activity.
    remote.emit(b"tick").await;
    let reason = handle.closed().await;
    assert_eq!(reason, Some(CloseReason::Idle));

    let frames = server_rx.collect::<Vec<_>>().await;
    assert_eq!(data(&frames[0]), b"tick");
    assert_eq!(
        frames.last(),
        Some(&ServerFrame::Closed {
            reason: CloseReason::Idle,
            exit: None,
        })
    );
    drop(client_tx);
}

#[tokio::test(start_paused = true)]
async fn connect_failures_send_an_error_frame() {
    let sessions = registry(config());
    let (_client_tx, client_rx) = mpsc::unbounded::<ClientFrame>();
    let (server_tx, server_rx) = mpsc::unbounded();

    let handle = sessions.spawn(
        SessionId::generate(),
        UserId::new("alice"),
        terminal(),
        client_rx,
        server_tx,
        connect_failing(|| Error::unreachable("prod", "connection refused")),
    );
    assert_eq!(handle.closed().await, Some(CloseReason::Error));

    let frames = server_rx.collect::<Vec<_>>().await;
    assert_eq!(frames.len(), 1, "{frames:?}");
    let ServerFrame::Error { code, message } = &frames[0] else {
        panic!("expected an error frame, got {:?}", frames[0]);
    };
    assert_eq!(code, "upstream_unavailable");
    assert!(message.contains("connection refused"), "{message}");
}

#[tokio::test(start_paused = true)]
async fn denials_keep_their_code() {
    let sessions = registry(config());
    let (_client_tx, client_rx) = mpsc::unbounded::<ClientFrame>();
    let (server_tx, server_rx) = mpsc::unbounded();

    let handle = sessions.spawn(
        SessionId::generate(),
        UserId::new("mallory"),
        terminal(),
        client_rx,
        server_tx,
        connect_failing(|| Error::PermissionDenied("create pods/exec".into())),
    );
    assert_eq!(handle.closed().await, Some(CloseReason::Error));
    let frames = server_rx.collect::<Vec<_>>().await;
    assert!(
        matches!(&frames[..], [ServerFrame::Error { code, .. }] if code == "permission_denied"),
        "{frames:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn connect_failures_close_without_closing() {
    let (session, status) = Session::new(
        config(),
        CancellationToken::new(),
        CancellationToken::new(),
    );
    let (_client_tx, client_rx) = mpsc::unbounded::<ClientFrame>();
    // Records the session's state as each frame reaches the client.
    let seen = Arc::new(Mutex::new(Vec::new()));
    let client = sink::unfold((), {
        let seen = seen.clone();
        move |(), _: ServerFrame| {
            seen.lock().push(status.borrow().state);
            futures::future::ready(Ok::<_, std::convert::Infallible>(()))
        }
    });
    tokio::pin!(client);

    let reason = session
        .run(
            client_rx,
            client,
            connect_failing(|| Error::unreachable("prod", "connection refused")),
        )
        .await;
    assert_eq!(reason, CloseReason::Error);
    assert_eq!(*seen.lock(), vec![SessionState::Connecting]);
}

#[tokio::test(start_paused = true)]
async fn write_failures_end_the_session() {
    let sessions = registry(config());
    let remote = Arc::new(Remote::default());
    let (client_tx, client_rx) = mpsc::unbounded();
    let (server_tx, server_rx) = mpsc::unbounded();

    let handle = sessions.spawn(
        SessionId::generate(),
        UserId::new("alice"),
        terminal(),
        client_rx,
        server_tx,
        remote.connect(None),
    );
    remote_connected(&remote).await;
    remote.state.lock().fail_writes = true;
    client_tx
        .unbounded_send(ClientFrame::Data(Bytes::from_static(b"x")))
        .unwrap();

    assert_eq!(handle.closed().await, Some(CloseReason::Error));
    assert!(remote.closed());
    let frames = server_rx.collect::<Vec<_>>().await;
    assert!(
        matches!(&frames[..], [ServerFrame::Error { code, .. }] if code == "upstream_unavailable"),
        "{frames:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn frames_sent_while_connecting_are_applied() {
    let sessions = registry(config());
    let remote = Arc::new(Remote::default());
    let (client_tx, client_rx) = mpsc::unbounded();
    let (server_tx, _server_rx) = mpsc::unbounded();

    client_tx
        .unbounded_send(ClientFrame::Data(Bytes::from_static(b"early")))
        .unwrap();
    let handle = sessions.spawn(
        SessionId::generate(),
        UserId::new("alice"),
        terminal(),
        client_rx,
        server_tx,
        remote.connect(None),
    );
    eventually(|| !remote.writes().is_empty()).await;
    assert_eq!(remote.writes(), vec![Bytes::from_static(b"early")]);

    drop(client_tx);
    assert_eq!(handle.closed().await, Some(CloseReason::Client));
}

#[tokio::test(start_paused = true)]
async fn slow_clients_pause_the_upstream() {
    let sessions = registry(SessionConfig {
        high_water: 64,
        low_water: 16,
        ..config()
    });
    let remote = Arc::new(Remote::default());
    let (client_tx, client_rx) = mpsc::unbounded();
    // A client that accepts nothing until read.
    let (server_tx, mut server_rx) = mpsc::channel(0);

    let handle = sessions.spawn(
        SessionId::generate(),
        UserId::new("alice"),
        logs(),
        client_rx,
        server_tx,
        remote.connect(None),
    );
    remote_connected(&remote).await;

    let producer = tokio::spawn({
        let remote = remote.clone();
        async move {
            for _ in 0..16 {
                remote.emit(&[b'x'; 32]).await;
            }
        }
    });
    time::sleep(Duration::from_millis(100)).await;
    assert!(!producer.is_finished(), "the upstream must be paused");

    // Reading everything lets the producer finish.
    let mut received = 0;
    while received < 16 * 32 {
        received += data(&server_rx.next().await.unwrap()).len();
    }
    time::timeout(Duration::from_secs(1), producer)
        .await
        .expect("producer must resume")
        .unwrap();

    drop(client_tx);
    assert_eq!(handle.closed().await, Some(CloseReason::Client));
}

#[tokio::test(start_paused = true)]
async fn sessions_can_be_listed_and_terminated() {
    let sessions = registry(config());
    let remote = Arc::new(Remote::default());
    let (_client_tx, client_rx) = mpsc::unbounded();
    let (server_tx, mut server_rx) = mpsc::unbounded();

    let id = SessionId::generate();
    let handle = sessions.spawn(
        id,
        UserId::new("alice"),
        terminal(),
        client_rx,
        server_tx,
        remote.connect(None),
    );
    remote_connected(&remote).await;

    let listed = sessions.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
    assert_eq!(listed[0].subject, UserId::new("alice"));
    assert_eq!(listed[0].target, terminal());
    assert_eq!(sessions.get(id).unwrap().status.state, SessionState::Streaming);

    assert!(sessions.terminate(id));
    assert_eq!(handle.closed().await, Some(CloseReason::Terminated));
    assert_eq!(
        server_rx.next().await,
        Some(ServerFrame::Closed {
            reason: CloseReason::Terminated,
            exit: None,
        })
    );
    assert!(!sessions.terminate(id));
    assert!(sessions.get(id).is_none());
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_every_session() {
    let sessions = registry(config());
    let mut handles = Vec::new();
    let mut clients = Vec::new();
    for target in [terminal(), logs()] {
        let remote = Arc::new(Remote::default());
        let (client_tx, client_rx) = mpsc::unbounded();
        let (server_tx, server_rx) = mpsc::unbounded();
        handles.push(sessions.spawn(
            SessionId::generate(),
            UserId::new("alice"),
            target,
            client_rx,
            server_tx,
            remote.connect(None),
        ));
        clients.push((client_tx, server_rx));
    }
    // One session never finishes connecting.
    let (_client_tx, client_rx) = mpsc::unbounded();
    let (server_tx, _server_rx) = mpsc::unbounded();
    handles.push(sessions.spawn(
        SessionId::generate(),
        UserId::new("bob"),
        terminal(),
        client_rx,
        server_tx,
        connect_pending(),
    ));
    assert_eq!(sessions.len(), 3);

    let aborted = sessions.shutdown(Duration::from_secs(10)).await;
    assert_eq!(aborted, 0);
    assert!(sessions.is_empty());
    assert!(sessions.is_shutting_down());
    for handle in handles {
        assert_eq!(handle.closed().await, Some(CloseReason::Shutdown));
    }
    for (_, server_rx) in clients {
        let frames = server_rx.collect::<Vec<_>>().await;
        assert_eq!(
            frames.last(),
            Some(&ServerFrame::Closed {
                reason: CloseReason::Shutdown,
                exit: None,
            })
        );
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_aborts_sessions_that_overrun_the_deadline() {
    let sessions = registry(SessionConfig {
        cancel_grace: Duration::from_secs(30),
        ..config()
    });
    let remote = Arc::new(Remote::default());
    let (_client_tx, client_rx) = mpsc::unbounded();
    let (server_tx, _server_rx) = mpsc::unbounded();
    let handle = sessions.spawn(
        SessionId::generate(),
        UserId::new("alice"),
        terminal(),
        client_rx,
        server_tx,
        remote.connect_with(None, true),
    );
    remote_connected(&remote).await;

    assert_eq!(sessions.shutdown(Duration::from_secs(5)).await, 1);
    assert!(sessions.is_empty());
    assert_eq!(handle.closed().await, None);
}

#[tokio::test(start_paused = true)]
async fn sessions_started_after_shutdown_close_immediately() {
    let sessions = registry(config());
    sessions.shutdown(Duration::from_secs(1)).await;

    let (_client_tx, client_rx) = mpsc::unbounded::<ClientFrame>();
    let (server_tx, _server_rx) = mpsc::unbounded();
    let handle = sessions.spawn(
        SessionId::generate(),
        UserId::new("alice"),
        terminal(),
        client_rx,
        server_tx,
        connect_pending(),
    );
    assert_eq!(handle.closed().await, Some(CloseReason::Shutdown));
}

#[tokio::test(start_paused = true)]
async fn stalled_clients_do_not_block_termination() {
    let sessions = registry(config());
    let remote = Arc::new(Remote::default());
    let (_client_tx, client_rx) = mpsc::unbounded();
    // A client that never reads.
    let (server_tx, _server_rx) = mpsc::channel(0);

    let id = SessionId::generate();
    let handle = sessions.spawn(
        id,
        UserId::new("alice"),
        terminal(),
        client_rx,
        server_tx,
        remote.connect(None),
    );
    remote_connected(&remote).await;
    for chunk in [b"one", b"two", b"six"] {
        remote.emit(chunk).await;
    }
    time::sleep(Duration::from_millis(100)).await;

    assert!(sessions.terminate(id));
    let reason = time::timeout(Duration::from_secs(5), handle.closed())
        .await
        .expect("session must close within the grace period");
    assert_eq!(reason, Some(CloseReason::Terminated));
    assert!(remote.closed());
    assert!(sessions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn stalled_clients_still_go_idle() {
    let sessions = registry(config());
    let remote = Arc::new(Remote::default());
    let (_client_tx, client_rx) = mpsc::unbounded();
    let (server_tx, _server_rx) = mpsc::channel(0);

    let handle = sessions.spawn(
        SessionId::generate(),
        UserId::new("alice"),
        logs(),
        client_rx,
        server_tx,
        remote.connect(None),
    );
    remote_connected(&remote).await;
    remote.emit(b"first").await;
    remote.emit(b"second").await;

    let reason = time::timeout(Duration::from_secs(65), handle.closed())
        .await
        .expect("idle timeout must fire while the client is stalled");
    assert_eq!(reason, Some(CloseReason::Idle));
    assert!(remote.closed());
}

async fn remote_connected(remote: &Remote) {
    eventually(|| remote.state.lock().output.is_some()).await;
}
