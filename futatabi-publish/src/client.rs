//! Per-client state: a bounded in-memory backlog, a condvar
//! the connection-handling thread blocks on, and the stream-start safety
//! rule (suppress `DATA_TYPE_OTHER` until the first keyframe).
//!
//! Adapted from the original's `HTTPD::Stream` (`buffer_mutex` +
//! `has_buffered_data` condvar + `buffered_data` deque); the 60 s reader
//! timeout and 1 GiB backlog cap are spec-given constants rather than
//! microhttpd configuration.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub const BACKLOG_CAP_BYTES: usize = 1 << 30;
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Header,
    Keyframe,
    Other,
}

struct Inner {
    chunks: VecDeque<Vec<u8>>,
    bytes_buffered: usize,
    seen_keyframe: bool,
    overflowed: bool,
    should_quit: bool,
}

/// One connected client's outbound backlog. Producers push via
/// [`Client::push`]; the connection thread drains via
/// [`Client::next_chunk`], which blocks on the condvar up to
/// [`WATCHDOG_TIMEOUT`].
pub struct Client {
    inner: Mutex<Inner>,
    has_data: Condvar,
    overflow_high_water: AtomicBool,
}

impl Client {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                chunks: VecDeque::new(),
                bytes_buffered: 0,
                seen_keyframe: false,
                overflowed: false,
                should_quit: false,
            }),
            has_data: Condvar::new(),
            overflow_high_water: AtomicBool::new(false),
        }
    }

    /// Appends a chunk, applying the stream-start safety rule and the
    /// 1 GiB backlog cap. Returns `false` if this push overflowed the
    /// client (the caller should terminate the connection).
    pub fn push(&self, data: Vec<u8>, data_type: DataType) -> bool {
        let mut inner = self.inner.lock().expect("client mutex poisoned");
        if inner.overflowed {
            return false;
        }

        match data_type {
            DataType::Header | DataType::Keyframe => {
                inner.seen_keyframe = true;
            }
            DataType::Other if !inner.seen_keyframe => {
                return true; // suppressed until the first keyframe, not an error
            }
            DataType::Other => {}
        }

        if inner.bytes_buffered + data.len() > BACKLOG_CAP_BYTES {
            inner.overflowed = true;
            self.overflow_high_water.store(true, Ordering::Relaxed);
            self.has_data.notify_all();
            return false;
        }

        inner.bytes_buffered += data.len();
        inner.chunks.push_back(data);
        self.has_data.notify_all();
        true
    }

    /// Blocks up to [`WATCHDOG_TIMEOUT`] waiting for the next chunk.
    /// Returns `None` on timeout, overflow, or shutdown — the caller
    /// should drop the connection in every `None` case (the original's
    /// reader callback returns -1 so the server reaps the socket).
    pub fn next_chunk(&self) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().expect("client mutex poisoned");
        loop {
            if inner.overflowed || inner.should_quit {
                return None;
            }
            if let Some(chunk) = inner.chunks.pop_front() {
                inner.bytes_buffered -= chunk.len();
                return Some(chunk);
            }
            let (guard, timeout) = self
                .has_data
                .wait_timeout(inner, WATCHDOG_TIMEOUT)
                .expect("client mutex poisoned");
            inner = guard;
            if timeout.timed_out() && inner.chunks.is_empty() {
                return None;
            }
        }
    }

    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("client mutex poisoned");
        inner.should_quit = true;
        self.has_data.notify_all();
    }

    pub fn is_overflowed(&self) -> bool {
        self.inner.lock().expect("client mutex poisoned").overflowed
    }

    pub fn bytes_buffered(&self) -> usize {
        self.inner.lock().expect("client mutex poisoned").bytes_buffered
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn other_data_suppressed_until_keyframe() {
        let client = Client::new();
        assert!(client.push(b"subtitle".to_vec(), DataType::Other));
        assert_eq!(client.bytes_buffered(), 0);

        assert!(client.push(b"keyframe-bytes".to_vec(), DataType::Keyframe));
        assert!(client.push(b"more-subtitle".to_vec(), DataType::Other));
        assert!(client.bytes_buffered() > 0);
    }

    #[test]
    fn overflow_marks_client_and_stops_accepting() {
        let client = Client::new();
        client.push(vec![0u8; BACKLOG_CAP_BYTES], DataType::Keyframe);
        assert!(!client.push(vec![1u8; 1], DataType::Keyframe));
        assert!(client.is_overflowed());
    }

    #[test]
    fn shutdown_wakes_a_blocked_reader() {
        let client = Arc::new(Client::new());
        let reader = client.clone();
        let handle = thread::spawn(move || reader.next_chunk());
        thread::sleep(Duration::from_millis(20));
        client.shutdown();
        assert!(handle.join().unwrap().is_none());
    }
}
