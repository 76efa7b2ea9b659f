//! Session event fabric
//!
//! Small blocking primitives the pipelines coordinate through: a latest-wins
//! event slot, a FIFO queue, and a one-way latch. All of them share the same
//! lifecycle protocol — `stop()` wakes every waiter and makes further pops
//! return `None`, which is how shutdown cascades through the capture threads.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::encode::Packet;
use crate::types::{IdrRequest, TouchPort};

struct SlotState<T> {
    value: Option<T>,
    stopped: bool,
}

struct Inner<T> {
    state: Mutex<SlotState<T>>,
    cond: Condvar,
}

/// Single-slot event: `raise` replaces any pending value, consumers observe
/// only the most recent payload. Used for frame fan-out, IDR requests and
/// shutdown notification.
pub struct Event<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Event<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SlotState {
                    value: None,
                    stopped: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Publish a value, replacing any unconsumed one.
    pub fn raise(&self, value: T) {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return;
        }
        state.value = Some(value);
        self.inner.cond.notify_all();
    }

    /// True if a value is pending.
    pub fn peek(&self) -> bool {
        self.inner.state.lock().value.is_some()
    }

    /// Block until a value arrives or the event is stopped.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(value) = state.value.take() {
                return Some(value);
            }
            if state.stopped {
                return None;
            }
            self.inner.cond.wait(&mut state);
        }
    }

    /// Block up to `timeout`; `None` on timeout or stop.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(value) = state.value.take() {
                return Some(value);
            }
            if state.stopped {
                return None;
            }
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                return state.value.take();
            }
        }
    }

    /// Discard any pending value without consuming the event.
    pub fn clear(&self) {
        self.inner.state.lock().value = None;
    }

    pub fn running(&self) -> bool {
        !self.inner.state.lock().stopped
    }

    /// Stop the event: pending waiters wake, later pops return `None`.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        state.stopped = true;
        state.value = None;
        self.inner.cond.notify_all();
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    stopped: bool,
}

struct QueueInner<T> {
    state: Mutex<QueueState<T>>,
    cond: Condvar,
}

/// FIFO queue with the same stop protocol as [`Event`]. Used for packet
/// delivery and pipeline registration.
pub struct Queue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    stopped: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn raise(&self, value: T) {
        let _ = self.try_raise(value);
    }

    /// Push unless the queue has stopped; hands the value back on failure so
    /// the caller can tell a dropped registration from an accepted one.
    pub fn try_raise(&self, value: T) -> std::result::Result<(), T> {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return Err(value);
        }
        state.items.push_back(value);
        self.inner.cond.notify_one();
        Ok(())
    }

    pub fn peek(&self) -> bool {
        !self.inner.state.lock().items.is_empty()
    }

    pub fn pop(&self) -> Option<T> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(value) = state.items.pop_front() {
                return Some(value);
            }
            if state.stopped {
                return None;
            }
            self.inner.cond.wait(&mut state);
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.inner.state.lock().items.pop_front()
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(value) = state.items.pop_front() {
                return Some(value);
            }
            if state.stopped {
                return None;
            }
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                return state.items.pop_front();
            }
        }
    }

    pub fn running(&self) -> bool {
        !self.inner.state.lock().stopped
    }

    /// Stop the queue and return everything still enqueued, so the caller can
    /// run per-item cleanup.
    pub fn stop(&self) -> Vec<T> {
        let mut state = self.inner.state.lock();
        state.stopped = true;
        self.inner.cond.notify_all();
        state.items.drain(..).collect()
    }
}

struct SignalState {
    raised: bool,
}

struct SignalInner {
    state: Mutex<SignalState>,
    cond: Condvar,
}

/// One-way latch: raised once, observed by many, manually reset.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                state: Mutex::new(SignalState { raised: false }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn raise(&self) {
        let mut state = self.inner.state.lock();
        state.raised = true;
        self.inner.cond.notify_all();
    }

    pub fn peek(&self) -> bool {
        self.inner.state.lock().raised
    }

    pub fn reset(&self) {
        self.inner.state.lock().raised = false;
    }

    /// Block until the signal is raised.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        while !state.raised {
            self.inner.cond.wait(&mut state);
        }
    }

    /// Block up to `timeout`; true if the signal was raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.raised {
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                return state.raised;
            }
        }
        true
    }
}

/// Named-topic mailbox for one streaming session.
#[derive(Clone)]
pub struct SessionMail {
    /// Session teardown request
    pub shutdown: Event<bool>,
    /// Keyframe demand from the client: `(start_frame, end_frame)`
    pub idr: Event<IdrRequest>,
    /// Pointer-mapping announcements for the input subsystem
    pub touch_port: Event<TouchPort>,
    /// Encoded packet delivery to the muxer
    pub packets: Queue<Packet>,
}

impl Default for SessionMail {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMail {
    pub fn new() -> Self {
        Self {
            shutdown: Event::new(),
            idr: Event::new(),
            touch_port: Event::new(),
            packets: Queue::new(),
        }
    }
}
