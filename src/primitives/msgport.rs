// Copyright (c) 2024-present, edspine
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A thread-safe FIFO message port whose readable side is backed by a real
//! OS pipe, so that a consumer can `select`/`poll` on it instead of
//! blocking in a condvar wait.
//!
//! This is the Rust equivalent of Camel's `CamelMsgPort`: a queue plus a
//! pipe used purely as a cancellation/wakeup signal. The operation facility
//! uses one of these per [`Operation`](crate::operation::Operation) to carry
//! a single cancellation message and to expose [`Port::raw_fd`] as the
//! `cancel_fd`.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Condvar, Mutex};

#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};

/// A message carried through a [`Port`], optionally tagged with a reply
/// port the receiver can push a response onto.
pub struct Msg<T> {
    pub payload: T,
    pub reply_port: Option<std::sync::Arc<Port<T>>>,
}

struct Inner<T> {
    queue: VecDeque<Msg<T>>,
}

/// A FIFO queue with a readable file descriptor that mirrors "queue is
/// non-empty".
pub struct Port<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    reader: os_pipe::PipeReader,
    writer: Mutex<os_pipe::PipeWriter>,
}

impl<T> Port<T> {
    /// Creates a new, empty port.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to hand out a pipe (file descriptor
    /// exhaustion); this mirrors Camel, which has no recovery path for that
    /// failure either.
    #[must_use]
    pub fn new() -> Self {
        let (reader, writer) = os_pipe::pipe().expect("failed to create message port pipe");
        reader.set_nonblocking(true).expect("pipe must support non-blocking reads");
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
            }),
            not_empty: Condvar::new(),
            reader,
            writer: Mutex::new(writer),
        }
    }

    /// Pushes a message onto the back of the queue and marks the fd
    /// readable.
    pub fn push(&self, msg: Msg<T>) {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        inner.queue.push_back(msg);
        self.signal();
        self.not_empty.notify_one();
    }

    fn signal(&self) {
        let mut writer = self.writer.lock().expect("lock is poisoned");
        // A single byte per queued message; best-effort, a full pipe buffer
        // still leaves the fd readable which is all callers rely on.
        let _ = writer.write_all(&[0u8]);
    }

    fn drain_one(&self) {
        let mut buf = [0u8; 1];
        loop {
            match self.reader.try_clone().and_then(|mut r| r.read(&mut buf)) {
                Ok(0) | Err(_) => break,
                Ok(_) => break,
            }
        }
    }

    /// Pops the front message without blocking, returning `None` if the
    /// queue is empty.
    pub fn try_pop(&self) -> Option<Msg<T>> {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        let msg = inner.queue.pop_front();
        drop(inner);
        if msg.is_some() {
            self.drain_one();
        }
        msg
    }

    /// Pops the front message, blocking until one is available.
    pub fn pop(&self) -> Msg<T> {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        loop {
            if let Some(msg) = inner.queue.pop_front() {
                drop(inner);
                self.drain_one();
                return msg;
            }
            inner = self.not_empty.wait(inner).expect("lock is poisoned");
        }
    }

    /// Pops the front message, blocking until one is available or `timeout`
    /// elapses.
    pub fn pop_timeout(&self, timeout: std::time::Duration) -> Option<Msg<T>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = self.inner.lock().expect("lock is poisoned");
        loop {
            if let Some(msg) = inner.queue.pop_front() {
                drop(inner);
                self.drain_one();
                return Some(msg);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = self
                .not_empty
                .wait_timeout(inner, deadline - now)
                .expect("lock is poisoned");
            inner = guard;
            if result.timed_out() && inner.queue.is_empty() {
                return None;
            }
        }
    }

    /// Returns `true` if the queue currently has no pending messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("lock is poisoned").queue.is_empty()
    }

    /// The raw, non-blocking, readable file descriptor that becomes
    /// readable precisely when the queue is non-empty. Returns `-1` on
    /// platforms without a raw fd concept.
    #[must_use]
    #[cfg(unix)]
    pub fn raw_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    #[must_use]
    #[cfg(not(unix))]
    pub fn raw_fd(&self) -> i32 {
        -1
    }
}

impl<T> Default for Port<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn push_then_try_pop_round_trips() {
        let port: Port<u32> = Port::new();
        assert!(port.is_empty());
        port.push(Msg {
            payload: 7,
            reply_port: None,
        });
        assert!(!port.is_empty());
        let msg = port.try_pop().expect("message should be present");
        assert_eq!(msg.payload, 7);
        assert!(port.is_empty());
        assert!(port.try_pop().is_none());
    }

    #[test]
    #[cfg(unix)]
    fn fd_is_a_valid_raw_descriptor() {
        let port: Port<()> = Port::new();
        assert!(port.raw_fd() >= 0);
    }

    #[test]
    fn pop_timeout_returns_none_when_empty() {
        let port: Port<()> = Port::new();
        let start = std::time::Instant::now();
        let result = port.pop_timeout(std::time::Duration::from_millis(20));
        assert!(result.is_none());
        assert!(start.elapsed() >= std::time::Duration::from_millis(15));
    }
}
