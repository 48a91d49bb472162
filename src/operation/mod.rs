// Copyright (c) 2024-present, edspine
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Cooperative cancellation and nested status reporting.
//!
//! Grounded in `camel-operation.c`: a process-wide registry of live
//! operations, a thread-local "current operation", a cancel message posted
//! through a [`Port`](crate::primitives::msgport::Port) whose raw fd callers
//! can `poll`/`select` on, and a stack of status frames so that nested
//! sub-operations report a sensible status when they finish.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

#[cfg(unix)]
use std::os::fd::RawFd;

use crate::primitives::msgport::{Msg, Port};
use crate::time::{stamp, TRANSIENT_DELAY_TICKS};

/// What fired: the start of a status frame, a progress tick in `0..=100`,
/// or the frame's end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Start,
    Progress(u8),
    End,
}

pub type StatusCallback = dyn Fn(&str, Status) + Send + Sync;

struct StatusFrame {
    message: String,
    transient: bool,
    started_tick: u32,
    /// `None` until this frame has actually fired once.
    last_reported_tick: Option<u32>,
    last_pc: i32,
}

/// A cancellable, status-reporting unit of work.
///
/// Refcounting is modeled by `Arc<Operation>` itself: cloning the `Arc` is
/// `ref`, dropping it is `unref`, there is no explicit method for either.
pub struct Operation {
    cancelled: AtomicBool,
    block_depth: AtomicU32,
    status_cb: Mutex<Option<Box<StatusCallback>>>,
    status_stack: Mutex<Vec<StatusFrame>>,
    cancel_port: Port<()>,
}

impl Operation {
    fn new_raw(status_cb: Option<Box<StatusCallback>>) -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            block_depth: AtomicU32::new(0),
            status_cb: Mutex::new(status_cb),
            status_stack: Mutex::new(Vec::new()),
            cancel_port: Port::new(),
        })
    }

    /// Drops the status callback; the operation and its cancellation state
    /// stay live.
    pub fn mute(&self) {
        *self.status_cb.lock().expect("lock is poisoned") = None;
    }

    /// Marks the operation cancelled and posts exactly one message to its
    /// cancel port.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_port.push(Msg {
            payload: (),
            reply_port: None,
        });
        log::debug!("operation cancelled");
    }

    /// Drains the cancel port and clears the cancelled flag.
    pub fn uncancel(&self) {
        while self.cancel_port.try_pop().is_some() {}
        self.cancelled.store(false, Ordering::SeqCst);
        log::debug!("operation uncancelled");
    }

    /// Suppresses `cancel_check` while any block is outstanding.
    pub fn block(&self) {
        self.block_depth.fetch_add(1, Ordering::SeqCst);
    }

    /// Reverses one [`Operation::block`] call.
    pub fn unblock(&self) {
        self.block_depth.fetch_sub(1, Ordering::SeqCst);
    }

    /// `true` iff cancelled and not currently blocked. Consumes any pending
    /// cancellation messages.
    pub fn cancel_check(&self) -> bool {
        while self.cancel_port.try_pop().is_some() {}
        self.cancelled.load(Ordering::SeqCst) && self.block_depth.load(Ordering::SeqCst) == 0
    }

    /// A readable descriptor that becomes readable when [`Operation::cancel`]
    /// is posted. Consumers must `poll`/`select` then confirm with
    /// [`Operation::cancel_check`]; spurious wakeups are possible. Returns
    /// `-1` while the operation is blocked.
    #[cfg(unix)]
    #[must_use]
    pub fn cancel_fd(&self) -> RawFd {
        if self.block_depth.load(Ordering::SeqCst) > 0 {
            return -1;
        }
        self.cancel_port.raw_fd()
    }

    #[cfg(not(unix))]
    #[must_use]
    pub fn cancel_fd(&self) -> i32 {
        -1
    }

    /// Pushes a status frame and fires `Status::Start` immediately.
    pub fn start(&self, message: impl Into<String>) {
        let message = message.into();
        let now = stamp();
        self.status_stack.lock().expect("lock is poisoned").push(StatusFrame {
            message: message.clone(),
            transient: false,
            started_tick: now,
            last_reported_tick: Some(now),
            last_pc: -1,
        });
        log::trace!("operation status pushed: {message}");
        self.fire(&message, Status::Start);
    }

    /// Pushes a transient status frame. It does not fire until its age
    /// first exceeds [`TRANSIENT_DELAY_TICKS`] and a later `progress` call
    /// observes that.
    pub fn start_transient(&self, message: impl Into<String>) {
        let message = message.into();
        self.status_stack.lock().expect("lock is poisoned").push(StatusFrame {
            message,
            transient: true,
            started_tick: stamp(),
            last_reported_tick: None,
            last_pc: -1,
        });
        log::trace!("operation transient status pushed");
    }

    /// Records `pc` on the top frame, firing the status callback if the
    /// frame is eligible and the clock tick has advanced since last report.
    pub fn progress(&self, pc: u8) {
        let now = stamp();
        let message = {
            let mut stack = self.status_stack.lock().expect("lock is poisoned");
            let Some(frame) = stack.last_mut() else {
                return;
            };

            if frame.transient && now.saturating_sub(frame.started_tick) < TRANSIENT_DELAY_TICKS {
                return;
            }
            if frame.last_reported_tick == Some(now) {
                return;
            }

            frame.last_pc = i32::from(pc);
            frame.last_reported_tick = Some(now);
            frame.message.clone()
        };
        log::trace!("operation progress {pc}");
        self.fire(&message, Status::Progress(pc));
    }

    /// Pops the top status frame. A non-transient frame fires `Status::End`;
    /// a transient frame that never fired stays silent; a transient frame
    /// that did fire re-reports the next already-reported frame down the
    /// stack (or stays silent if there is none).
    pub fn end(&self) {
        let mut stack = self.status_stack.lock().expect("lock is poisoned");
        let Some(frame) = stack.pop() else {
            return;
        };

        if !frame.transient {
            drop(stack);
            log::trace!("operation status popped: {}", frame.message);
            self.fire(&frame.message, Status::End);
            return;
        }

        if frame.last_reported_tick.is_none() {
            return;
        }

        if let Some(next) = stack.last() {
            if !next.transient || next.last_reported_tick.is_some() {
                let message = next.message.clone();
                let pc = next.last_pc;
                drop(stack);
                if pc < 0 {
                    self.fire(&message, Status::Start);
                } else {
                    self.fire(&message, Status::Progress(pc as u8));
                }
            }
        }
    }

    fn fire(&self, message: &str, status: Status) {
        if let Some(cb) = self.status_cb.lock().expect("lock is poisoned").as_ref() {
            cb(message, status);
        }
    }
}

/// Owns the process-wide registry of live operations.
pub struct OperationSystem {
    registry: Mutex<Vec<Weak<Operation>>>,
}

impl OperationSystem {
    fn new() -> Self {
        Self {
            registry: Mutex::new(Vec::new()),
        }
    }

    fn new_operation(&self, status_cb: Option<Box<StatusCallback>>) -> Arc<Operation> {
        let op = Operation::new_raw(status_cb);
        let mut registry = self.registry.lock().expect("lock is poisoned");
        registry.retain(|weak| weak.strong_count() > 0);
        registry.push(Arc::downgrade(&op));
        op
    }

    fn cancel_all(&self) {
        let registry = self.registry.lock().expect("lock is poisoned");
        for weak in registry.iter() {
            if let Some(op) = weak.upgrade() {
                op.cancel();
            }
        }
    }
}

static OPERATIONS: OnceLock<OperationSystem> = OnceLock::new();

fn system() -> &'static OperationSystem {
    OPERATIONS.get_or_init(OperationSystem::new)
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Operation>>> = const { RefCell::new(None) };
}

/// Creates a new operation attached to the process-wide registry.
#[must_use]
pub fn new(status_cb: Option<Box<StatusCallback>>) -> Arc<Operation> {
    system().new_operation(status_cb)
}

/// Sets the thread-local current operation, returning the previously
/// registered value so callers can restore it later.
pub fn register(op: Option<Arc<Operation>>) -> Option<Arc<Operation>> {
    CURRENT.with(|c| c.replace(op))
}

/// Clears the thread-local current operation, returning its prior value.
pub fn unregister() -> Option<Arc<Operation>> {
    CURRENT.with(|c| c.replace(None))
}

/// The thread-local current operation, if any.
#[must_use]
pub fn current() -> Option<Arc<Operation>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Cancels `op`, or every live operation in the registry if `None`.
pub fn cancel(op: Option<&Operation>) {
    match op {
        Some(op) => op.cancel(),
        None => system().cancel_all(),
    }
}

/// `op`'s cancellation state, or the thread-local current operation's if
/// `None`. `false` if there is no operation to check.
#[must_use]
pub fn cancel_check(op: Option<&Operation>) -> bool {
    match op {
        Some(op) => op.cancel_check(),
        None => current().is_some_and(|op| op.cancel_check()),
    }
}

/// `op`'s cancel descriptor, or the thread-local current operation's if
/// `None`. `-1` if there is no operation to poll.
#[cfg(unix)]
#[must_use]
pub fn cancel_fd(op: Option<&Operation>) -> RawFd {
    match op {
        Some(op) => op.cancel_fd(),
        None => current().map_or(-1, |op| op.cancel_fd()),
    }
}

#[cfg(not(unix))]
#[must_use]
pub fn cancel_fd(op: Option<&Operation>) -> i32 {
    match op {
        Some(op) => op.cancel_fd(),
        None => current().map_or(-1, |op| op.cancel_fd()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn o1_cancel_then_check_is_true_without_a_poll() {
        let op = new(None);
        op.cancel();
        assert!(op.cancel_check());
    }

    #[test]
    fn o2_block_suppresses_cancel_check_until_unblocked() {
        let op = new(None);
        op.block();
        op.cancel();
        assert!(!op.cancel_check());
        op.unblock();
        assert!(op.cancel_check());
    }

    #[test]
    fn o3_transient_status_only_fires_after_its_delay() {
        crate::time::test_override::set(Some(0));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = fired.clone();
        let op = new(Some(Box::new(move |_msg, _status| {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        })));

        op.start_transient("scanning");
        op.progress(10);
        assert_eq!(fired.load(Ordering::SeqCst), 0, "must not fire before the delay elapses");

        crate::time::test_override::set(Some(TRANSIENT_DELAY_TICKS + 1));
        op.progress(20);
        assert_eq!(fired.load(Ordering::SeqCst), 1, "first progress past the delay must fire once");

        op.end();
        assert_eq!(fired.load(Ordering::SeqCst), 1, "end of a transient frame must not fire a spurious END");

        crate::time::test_override::set(None);
    }

    #[test]
    fn o4_nested_register_restores_the_prior_operation() {
        let op1 = new(None);
        let op2 = new(None);

        let saved1 = register(Some(op1.clone()));
        let saved2 = register(Some(op2.clone()));
        register(saved2);
        assert!(Arc::ptr_eq(&current().unwrap(), &op1));
        register(saved1);
        assert!(current().is_none());
    }

    #[test]
    fn cancel_fd_goes_negative_while_blocked() {
        let op = new(None);
        let fd = op.cancel_fd();
        assert!(fd >= 0);
        op.block();
        assert_eq!(op.cancel_fd(), -1);
        op.unblock();
        assert_eq!(op.cancel_fd(), fd);
    }

    #[test]
    fn free_functions_fall_back_to_the_current_operation() {
        assert!(!cancel_check(None));
        assert_eq!(cancel_fd(None), -1, "no current operation to poll");

        let op = new(None);
        register(Some(op.clone()));
        assert_eq!(cancel_fd(None), op.cancel_fd());
        op.cancel();
        assert!(cancel_check(None));

        op.block();
        assert_eq!(cancel_fd(None), -1, "current operation is blocked");
        op.unblock();

        unregister();
        assert!(!cancel_check(None));
        assert_eq!(cancel_fd(None), -1, "no current operation to poll");
    }

    #[test]
    fn e_o1_cancel_on_another_thread_is_observed_via_cancel_check() {
        let op = new(None);
        let op_t1 = op.clone();

        let handle = std::thread::spawn(move || {
            register(Some(op_t1.clone()));
            loop {
                if op_t1.cancel_check() {
                    return true;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        });

        std::thread::sleep(Duration::from_millis(10));
        cancel(Some(&op));

        assert!(handle.join().expect("thread must not panic"));
    }
}
