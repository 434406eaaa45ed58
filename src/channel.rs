//! Blocking, disconnect-aware in-process channels.
//!
//! A `DuplexChannel` is one endpoint of a bidirectional pipe. Either side may
//! disconnect; a disconnect wakes every blocked sender and receiver on both
//! sides. The demultiplexer uses byte-chunk channels, the view protocol uses
//! typed message channels, both built from the same primitive.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::core::{FabricError, Result};

struct PipeState<T> {
    queue: VecDeque<T>,
    closed: bool,
}

struct Pipe<T> {
    state: Mutex<PipeState<T>>,
    cond: Condvar,
}

impl<T> Pipe<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(PipeState {
                queue: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn push(&self, item: T) -> Result<()> {
        let mut state = self.state.lock()?;
        if state.closed {
            return Err(FabricError::Disconnected("channel closed".to_string()));
        }
        state.queue.push_back(item);
        self.cond.notify_one();
        Ok(())
    }

    fn pop(&self) -> Result<T> {
        let mut state = self.state.lock()?;
        loop {
            if let Some(item) = state.queue.pop_front() {
                return Ok(item);
            }
            if state.closed {
                return Err(FabricError::Disconnected("channel closed".to_string()));
            }
            state = self.cond.wait(state)?;
        }
    }

    fn pop_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock()?;
        loop {
            if let Some(item) = state.queue.pop_front() {
                return Ok(Some(item));
            }
            if state.closed {
                return Err(FabricError::Disconnected("channel closed".to_string()));
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (next, _) = self.cond.wait_timeout(state, deadline - now)?;
            state = next;
        }
    }

    fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
            self.cond.notify_all();
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }
}

/// One endpoint of a bidirectional in-process channel sending `S` and
/// receiving `R`.
pub struct DuplexChannel<S, R> {
    outgoing: Arc<Pipe<S>>,
    incoming: Arc<Pipe<R>>,
}

impl<S, R> Clone for DuplexChannel<S, R> {
    fn clone(&self) -> Self {
        Self {
            outgoing: Arc::clone(&self.outgoing),
            incoming: Arc::clone(&self.incoming),
        }
    }
}

impl<S, R> DuplexChannel<S, R> {
    /// Create a connected pair of endpoints.
    pub fn pair() -> (DuplexChannel<S, R>, DuplexChannel<R, S>) {
        let forward = Arc::new(Pipe::<S>::new());
        let backward = Arc::new(Pipe::<R>::new());
        (
            DuplexChannel {
                outgoing: Arc::clone(&forward),
                incoming: Arc::clone(&backward),
            },
            DuplexChannel {
                outgoing: backward,
                incoming: forward,
            },
        )
    }

    /// Send an item; fails with `Disconnected` once either side disconnected.
    pub fn send(&self, item: S) -> Result<()> {
        self.outgoing.push(item)
    }

    /// Block until an item arrives; fails with `Disconnected` once the
    /// channel is closed and drained.
    pub fn recv(&self) -> Result<R> {
        self.incoming.pop()
    }

    /// Block up to `timeout`; `Ok(None)` on timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<R>> {
        self.incoming.pop_timeout(timeout)
    }

    /// Close both directions, waking every blocked caller on either side.
    pub fn disconnect(&self) {
        self.outgoing.close();
        self.incoming.close();
    }

    pub fn is_disconnected(&self) -> bool {
        self.outgoing.is_closed() && self.incoming.is_closed()
    }
}

/// A logical stream of byte chunks, as consumed and produced by the
/// demultiplexer's local endpoints.
pub type ByteChannel = DuplexChannel<Vec<u8>, Vec<u8>>;

/// A connected pair of byte-chunk endpoints.
pub fn byte_channel_pair() -> (ByteChannel, ByteChannel) {
    DuplexChannel::pair()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_send_recv() {
        let (a, b) = byte_channel_pair();
        a.send(vec![1, 2, 3]).unwrap();
        assert_eq!(b.recv().unwrap(), vec![1, 2, 3]);
        b.send(vec![4]).unwrap();
        assert_eq!(a.recv().unwrap(), vec![4]);
    }

    #[test]
    fn test_disconnect_wakes_blocked_receiver() {
        let (a, b) = byte_channel_pair();
        let handle = thread::spawn(move || b.recv());
        thread::sleep(Duration::from_millis(20));
        a.disconnect();
        assert!(handle.join().unwrap().is_err());
    }

    #[test]
    fn test_recv_drains_before_reporting_disconnect() {
        let (a, b) = byte_channel_pair();
        a.send(vec![9]).unwrap();
        a.disconnect();
        // the queued chunk is still delivered
        assert_eq!(b.recv().unwrap(), vec![9]);
        assert!(b.recv().is_err());
    }

    #[test]
    fn test_recv_timeout() {
        let (_a, b) = byte_channel_pair();
        let got = b.recv_timeout(Duration::from_millis(10)).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_send_after_disconnect_fails() {
        let (a, b) = byte_channel_pair();
        b.disconnect();
        assert!(a.send(vec![1]).is_err());
    }
}
