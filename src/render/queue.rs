//! Byte queues at the render boundary.
//!
//! A [`ByteQueue`] is an unbounded FIFO shared by exactly one producer and
//! one consumer. The render worker sits on a blocking thread and uses the
//! `std::io` adapters ([`InputReader`], [`OutputWriter`]); the connection task
//! is async and waits on the shared [`Notify`] that every state change
//! signals.
//!
//! Closing a queue means "no more pushes": readers still drain what is
//! buffered, then see EOF. Pushing to a closed queue fails with
//! `BrokenPipe`, which is how a torn-down connection stops the renderer.

use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct QueueState {
    buf: BytesMut,
    closed: bool,
    /// Readers parked in `read_blocking` on an empty queue.
    blocked_readers: usize,
}

/// Unbounded single-producer/single-consumer byte FIFO.
#[derive(Debug)]
pub struct ByteQueue {
    state: Mutex<QueueState>,
    readable: Condvar,
    progress: Arc<Notify>,
}

impl ByteQueue {
    /// Create a queue that signals `progress` on every state change.
    pub fn new(progress: Arc<Notify>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            readable: Condvar::new(),
            progress,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn signal(&self) {
        self.readable.notify_all();
        self.progress.notify_waiters();
    }

    /// Append bytes.
    pub fn push(&self, data: &[u8]) -> io::Result<()> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "render queue closed",
                ));
            }
            state.buf.extend_from_slice(data);
        }
        self.signal();
        Ok(())
    }

    /// Remove up to `max` bytes from the front.
    pub fn take(&self, max: usize) -> Bytes {
        let mut state = self.lock();
        let n = max.min(state.buf.len());
        state.buf.split_to(n).freeze()
    }

    /// Mark the queue as finished. Idempotent.
    pub fn close(&self) {
        self.lock().closed = true;
        self.signal();
    }

    pub fn len(&self) -> usize {
        self.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A reader is parked waiting for bytes that are not there.
    pub fn is_starved(&self) -> bool {
        let state = self.lock();
        state.blocked_readers > 0 && state.buf.is_empty() && !state.closed
    }

    /// Blocking read for the render worker thread.
    ///
    /// Returns 0 only once the queue is closed and drained.
    pub fn read_blocking(&self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        let mut state = self.lock();
        if state.buf.is_empty() && !state.closed {
            state.blocked_readers += 1;
            // The async side decides on keepalives from this transition.
            self.progress.notify_waiters();
            while state.buf.is_empty() && !state.closed {
                state = self
                    .readable
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            state.blocked_readers -= 1;
        }

        let n = out.len().min(state.buf.len());
        out[..n].copy_from_slice(&state.buf[..n]);
        let _ = state.buf.split_to(n);
        Ok(n)
    }
}

/// `std::io::Read` view of an input boundary.
#[derive(Debug, Clone)]
pub struct InputReader {
    queue: Arc<ByteQueue>,
}

impl InputReader {
    pub fn new(queue: Arc<ByteQueue>) -> Self {
        Self { queue }
    }
}

impl io::Read for InputReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.queue.read_blocking(buf)
    }
}

/// `std::io::Write` view of an output boundary.
#[derive(Debug, Clone)]
pub struct OutputWriter {
    queue: Arc<ByteQueue>,
}

impl OutputWriter {
    pub fn new(queue: Arc<ByteQueue>) -> Self {
        Self { queue }
    }
}

impl io::Write for OutputWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.queue.push(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
