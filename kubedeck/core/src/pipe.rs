//! A bounded byte pipe between an upstream reader and the client writer.
//!
//! Writers are admitted while fewer than `high` bytes are buffered. Once the
//! high-water mark is reached, writers wait until the buffer drains below
//! `low`. A chunk stays counted against the buffer until the reader drops it,
//! i.e. until it has actually been written to the client.

use bytes::Bytes;
use parking_lot::Mutex;
use std::{collections::VecDeque, ops::Deref, sync::Arc};
use tokio::sync::Notify;

pub const DEFAULT_HIGH_WATER: usize = 256 * 1024;
pub const DEFAULT_LOW_WATER: usize = 64 * 1024;

#[derive(Debug)]
pub struct PipeWriter {
    shared: Arc<Shared>,
}

#[derive(Debug)]
pub struct PipeReader {
    shared: Arc<Shared>,
}

/// A chunk of output. Dropping it releases its share of the buffer.
#[derive(Debug)]
pub struct Chunk {
    bytes: Bytes,
    shared: Arc<Shared>,
}

#[derive(Debug, thiserror::Error)]
#[error("pipe reader closed")]
pub struct Closed(pub Bytes);

#[derive(Debug)]
struct Shared {
    high: usize,
    low: usize,
    state: Mutex<State>,
    readable: Notify,
    writable: Notify,
}

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<Bytes>,
    buffered: usize,
    paused: bool,
    writers: usize,
    reader_closed: bool,
}

pub fn pipe(high: usize, low: usize) -> (PipeWriter, PipeReader) {
    let high = high.max(1);
    let shared = Arc::new(Shared {
        high,
        low: low.min(high - 1),
        state: Mutex::new(State {
            writers: 1,
            ..State::default()
        }),
        readable: Notify::new(),
        writable: Notify::new(),
    });
    (
        PipeWriter {
            shared: shared.clone(),
        },
        PipeReader { shared },
    )
}

// === impl PipeWriter ===

impl PipeWriter {
    /// Buffers `bytes`, waiting while the pipe is above its high-water mark.
    pub async fn send(&self, bytes: Bytes) -> Result<(), Closed> {
        if bytes.is_empty() {
            return Ok(());
        }
        loop {
            let notified = self.shared.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                if state.reader_closed {
                    return Err(Closed(bytes));
                }
                if !state.paused {
                    state.buffered += bytes.len();
                    if state.buffered >= self.shared.high {
                        state.paused = true;
                    }
                    state.queue.push_back(bytes);
                    drop(state);
                    self.shared.readable.notify_one();
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().reader_closed
    }

    /// Completes when the reader has gone away.
    pub async fn closed(&self) {
        loop {
            let notified = self.shared.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

impl Clone for PipeWriter {
    fn clone(&self) -> Self {
        self.shared.state.lock().writers += 1;
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let last = {
            let mut state = self.shared.state.lock();
            state.writers -= 1;
            state.writers == 0
        };
        if last {
            self.shared.readable.notify_one();
        }
    }
}

// === impl PipeReader ===

impl PipeReader {
    /// Returns the next chunk, or `None` once every writer has been dropped
    /// and the buffer is empty.
    pub async fn recv(&mut self) -> Option<Chunk> {
        loop {
            let notified = self.shared.readable.notified();
            {
                let mut state = self.shared.state.lock();
                if let Some(bytes) = state.queue.pop_front() {
                    return Some(self.chunk(bytes));
                }
                if state.writers == 0 {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Returns a chunk only if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Chunk> {
        let bytes = self.shared.state.lock().queue.pop_front()?;
        Some(self.chunk(bytes))
    }

    /// Bytes queued or held by undropped chunks.
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().buffered
    }

    fn chunk(&self, bytes: Bytes) -> Chunk {
        Chunk {
            bytes,
            shared: self.shared.clone(),
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.reader_closed = true;
            state.queue.clear();
        }
        self.shared.writable.notify_waiters();
    }
}

// === impl Chunk ===

impl Chunk {
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }
}

impl Deref for Chunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        let resume = {
            let mut state = self.shared.state.lock();
            state.buffered -= self.bytes.len();
            if state.paused && state.buffered <= self.shared.low {
                state.paused = false;
                true
            } else {
                false
            }
        };
        if resume {
            self.shared.writable.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    fn bytes(n: usize) -> Bytes {
        Bytes::from(vec![b'x'; n])
    }

    #[tokio::test]
    async fn delivers_in_order_then_ends() {
        let (tx, mut rx) = pipe(1024, 256);
        tx.send(Bytes::from_static(b"one")).await.unwrap();
        tx.send(Bytes::from_static(b"two")).await.unwrap();
        drop(tx);

        assert_eq!(&*rx.recv().await.unwrap(), b"one");
        assert_eq!(&*rx.recv().await.unwrap(), b"two");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn writers_pause_until_low_water() {
        let (tx, mut rx) = pipe(100, 40);
        tx.send(bytes(60)).await.unwrap();
        tx.send(bytes(40)).await.unwrap();

        // At the high-water mark the next write waits.
        let blocked = tokio::spawn(async move {
            tx.send(bytes(10)).await.unwrap();
            tx
        });
        time::sleep(time::Duration::from_millis(10)).await;
        assert!(!blocked.is_finished());

        // Taking a chunk does not release it until it is dropped.
        let first = rx.recv().await.unwrap();
        time::sleep(time::Duration::from_millis(10)).await;
        assert!(!blocked.is_finished());

        // 40 bytes remain buffered, which is at the low-water mark.
        drop(first);
        let _tx = time::timeout(time::Duration::from_secs(1), blocked)
            .await
            .expect("writer must resume")
            .unwrap();
        assert_eq!(rx.buffered(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn draining_above_low_water_keeps_writers_paused() {
        let (tx, mut rx) = pipe(100, 20);
        tx.send(bytes(50)).await.unwrap();
        tx.send(bytes(50)).await.unwrap();

        let blocked = tokio::spawn(async move { tx.send(bytes(1)).await });
        drop(rx.recv().await.unwrap());
        time::sleep(time::Duration::from_millis(10)).await;
        assert!(!blocked.is_finished(), "50 bytes are still above low water");

        drop(rx.recv().await.unwrap());
        time::timeout(time::Duration::from_secs(1), blocked)
            .await
            .expect("writer must resume")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn writers_fail_once_the_reader_is_gone() {
        let (tx, rx) = pipe(100, 20);
        drop(rx);
        assert!(tx.is_closed());
        let Closed(returned) = tx.send(Bytes::from_static(b"late")).await.unwrap_err();
        assert_eq!(returned, Bytes::from_static(b"late"));
        tx.closed().await;
    }

    #[tokio::test(start_paused = true)]
    async fn paused_writers_wake_when_the_reader_drops() {
        let (tx, rx) = pipe(10, 5);
        tx.send(bytes(10)).await.unwrap();
        let blocked = tokio::spawn(async move { tx.send(bytes(1)).await });
        time::sleep(time::Duration::from_millis(10)).await;
        drop(rx);
        let res = time::timeout(time::Duration::from_secs(1), blocked)
            .await
            .expect("writer must wake")
            .unwrap();
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn ends_only_after_every_writer_drops() {
        let (tx, mut rx) = pipe(1024, 256);
        let tx2 = tx.clone();
        drop(tx);
        tx2.send(Bytes::from_static(b"err")).await.unwrap();
        assert_eq!(&*rx.recv().await.unwrap(), b"err");
        assert!(rx.try_recv().is_none());
        drop(tx2);
        assert!(rx.recv().await.is_none());
    }
}
