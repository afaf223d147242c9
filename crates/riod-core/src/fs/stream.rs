//! Blocking-read engine for streaming output files.
//!
//! One `OutputStream` backs each of `scene/stdout`, `scene/STDERR`,
//! `terms/*/stdout` and `terms/*/output`. The protocol has three states:
//!
//! 1. idle/armed — nothing posted since the last rearm
//! 2. active — `post()` has accumulated chunks, readiness not yet signalled
//! 3. ready — `mark_ready()` latched; readers drain the batch
//!
//! A read at offset 0 after the batch was fully delivered *rearms* the
//! stream (clears chunks, drops the latch). `mark_ready()` on an empty
//! buffer is a no-op — a spurious wake would otherwise return an empty
//! batch and put `while true; do cat X; done` loops into a tight spin.

use std::sync::Mutex;

use tokio::sync::Notify;

/// Idle-read behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Reads return empty immediately unless a producer is mid-batch
    /// (`scene/stdout` — `ls` and stat never hang).
    StateAware,
    /// Reads always block until the first `mark_ready` (`scene/STDERR`,
    /// terminal `stdout`/`output` — well-defined route sources).
    AlwaysBlock,
}

#[derive(Default)]
struct StreamState {
    chunks: Vec<Vec<u8>>,
    total: usize,
    ready: bool,
    consumed: bool,
    active: bool,
}

/// Shared streaming buffer with latched readiness.
pub struct OutputStream {
    name: String,
    mode: StreamMode,
    state: Mutex<StreamState>,
    notify: Notify,
    /// Cap on buffered bytes; oldest chunks are dropped past it.
    cap: usize,
}

const DEFAULT_CAP: usize = 1_000_000;

impl OutputStream {
    pub fn new(name: impl Into<String>, mode: StreamMode) -> Self {
        Self {
            name: name.into(),
            mode,
            state: Mutex::new(StreamState::default()),
            notify: Notify::new(),
            cap: DEFAULT_CAP,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    /// Append a chunk. Never signals readiness.
    pub fn post(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut s = self.state.lock().unwrap();
        s.chunks.push(data.to_vec());
        s.total += data.len();
        s.active = true;
        while s.total > self.cap && s.chunks.len() > 1 {
            let dropped = s.chunks.remove(0);
            s.total -= dropped.len();
        }
    }

    /// Latch readiness for the accumulated batch. No-op when nothing was
    /// posted. Stays set until the next rearm; every waiting reader wakes.
    pub fn mark_ready(&self) {
        let mut s = self.state.lock().unwrap();
        if s.chunks.is_empty() {
            return;
        }
        s.ready = true;
        drop(s);
        self.notify.notify_waiters();
    }

    /// Clear chunks and the latch without deactivating — arms the stream
    /// for a fresh capture (terminal `stdin` calls this before executing).
    pub fn start_capture(&self) {
        let mut s = self.state.lock().unwrap();
        s.chunks.clear();
        s.total = 0;
        s.ready = false;
        s.consumed = false;
        s.active = true;
    }

    /// Reset to idle: clears chunks, latch, consumed and active flags.
    /// Producers call this at the start of a logical batch.
    pub fn reset(&self) {
        let mut s = self.state.lock().unwrap();
        *s = StreamState::default();
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap().active
    }

    /// Convenience for producers injecting a complete message (sandbox
    /// rejections): post and latch in one step.
    pub fn feed_line(&self, text: &str) {
        self.post(text.as_bytes());
        self.mark_ready();
    }

    /// Streaming read. Suspends on the readiness latch according to the
    /// stream mode; never holds the state lock across the suspension.
    pub async fn read_at(&self, offset: u64, count: u32) -> Vec<u8> {
        {
            let mut s = self.state.lock().unwrap();
            // Rearm: previous batch fully delivered, reader is back at 0.
            if offset == 0 && s.consumed {
                *s = StreamState::default();
            }
            if self.mode == StreamMode::StateAware && !s.active && !s.ready {
                return Vec::new();
            }
        }

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking, so a mark_ready between the check
            // and the await still wakes us.
            notified.as_mut().enable();
            {
                let s = self.state.lock().unwrap();
                if s.ready {
                    break;
                }
                // A producer may have gone idle between our first check and
                // now (reset during a concurrent rearm); re-check the mode.
                if self.mode == StreamMode::StateAware && !s.active {
                    return Vec::new();
                }
            }
            notified.await;
        }

        let mut s = self.state.lock().unwrap();
        if !s.ready {
            // Lost a race with a rearm; treat as an empty delivery.
            return Vec::new();
        }
        let content: Vec<u8> = s.chunks.concat();
        let offset = offset as usize;
        if offset >= content.len() {
            s.consumed = true;
            return Vec::new();
        }
        let end = (offset + count as usize).min(content.len());
        if end >= content.len() {
            s.consumed = true;
        }
        content[offset..end].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn state_aware_idle_read_returns_empty_immediately() {
        let s = OutputStream::new("stdout", StreamMode::StateAware);
        let got = timeout(Duration::from_millis(10), s.read_at(0, 4096))
            .await
            .expect("idle read must not block");
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn always_block_read_blocks_until_ready() {
        let s = Arc::new(OutputStream::new("STDERR", StreamMode::AlwaysBlock));
        let blocked = timeout(Duration::from_millis(100), s.read_at(0, 4096)).await;
        assert!(blocked.is_err(), "idle STDERR read must block");

        let s2 = Arc::clone(&s);
        let reader = tokio::spawn(async move { s2.read_at(0, 4096).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        s.post(b"boom\n");
        s.mark_ready();
        let got = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert_eq!(got, b"boom\n");
    }

    #[tokio::test]
    async fn mark_ready_on_empty_buffer_does_not_wake_readers() {
        let s = Arc::new(OutputStream::new("STDERR", StreamMode::AlwaysBlock));
        s.mark_ready();
        let blocked = timeout(Duration::from_millis(80), s.read_at(0, 4096)).await;
        assert!(blocked.is_err(), "empty mark_ready must not unblock");
    }

    #[tokio::test]
    async fn rearm_delivers_next_batch_not_stale_prefix() {
        let s = OutputStream::new("stdout", StreamMode::StateAware);
        s.post(b"first");
        s.mark_ready();
        assert_eq!(s.read_at(0, 4096).await, b"first");
        assert!(s.read_at(5, 4096).await.is_empty()); // EOF, consumed

        // Rearm happens on the next offset-0 read; stream goes idle.
        assert!(s.read_at(0, 4096).await.is_empty());

        s.post(b"second");
        s.mark_ready();
        assert_eq!(s.read_at(0, 4096).await, b"second");
    }

    #[tokio::test]
    async fn ready_latches_for_late_readers() {
        let s = OutputStream::new("out", StreamMode::AlwaysBlock);
        s.post(b"batch");
        s.mark_ready();
        // Reader arrives after the latch was set.
        let got = timeout(Duration::from_millis(50), s.read_at(0, 4096))
            .await
            .expect("latched ready must not block");
        assert_eq!(got, b"batch");
    }

    #[tokio::test]
    async fn concurrent_readers_all_unblock() {
        let s = Arc::new(OutputStream::new("out", StreamMode::AlwaysBlock));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let s = Arc::clone(&s);
            handles.push(tokio::spawn(async move { s.read_at(0, 4096).await }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        s.post(b"x");
        s.mark_ready();
        for h in handles {
            let got = timeout(Duration::from_secs(1), h).await.unwrap().unwrap();
            assert_eq!(got, b"x");
        }
    }

    #[tokio::test]
    async fn partial_reads_advance_then_eof() {
        let s = OutputStream::new("out", StreamMode::AlwaysBlock);
        s.post(b"hello ");
        s.post(b"world");
        s.mark_ready();
        assert_eq!(s.read_at(0, 6).await, b"hello ");
        assert_eq!(s.read_at(6, 64).await, b"world");
        assert!(s.read_at(11, 64).await.is_empty());
    }

    #[tokio::test]
    async fn cap_drops_oldest_chunks() {
        let s = OutputStream::new("out", StreamMode::AlwaysBlock);
        let big = vec![b'a'; DEFAULT_CAP];
        s.post(&big);
        s.post(b"tail");
        assert!(s.len() <= DEFAULT_CAP + 4);
        s.mark_ready();
        let content = s.read_at(0, u32::MAX).await;
        assert!(content.ends_with(b"tail"));
    }
}
