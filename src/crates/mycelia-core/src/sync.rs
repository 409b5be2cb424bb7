//! Concurrency primitives used across the engine
//!
//! Three small building blocks the interactor leans on:
//!
//! - [`ValueEvent`] deduplicates concurrent admissions of the same call id:
//!   one task admits, everyone else awaits the resulting session id.
//! - [`SubscriberEvent`] is the per-session cancellation signal; the
//!   subscriber count drives pruning of the worker's session registry.
//! - [`SessionLock`] serialises session-row creation: the first acquirer
//!   creates the row, later acquirers just observe the fresh id.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;

use crate::error::{Error, Result};

enum ValueState<T> {
    Pending,
    Set(T),
    Failed(String),
}

/// A single-assignment event carrying a value or a failure
///
/// Dropping the guard returned by [`ValueEvent::arm`] before the event is
/// set fails the event, so tasks awaiting a dependency admission observe the
/// admitting task's abort instead of hanging.
pub struct ValueEvent<T> {
    state: Mutex<ValueState<T>>,
    notify: Notify,
}

impl<T: Clone> ValueEvent<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ValueState::Pending),
            notify: Notify::new(),
        }
    }

    /// True once `set` or `fail` has been called
    pub fn is_set(&self) -> bool {
        !matches!(*self.state.lock(), ValueState::Pending)
    }

    /// Resolve the event. Resolving twice is a programming error.
    pub fn set(&self, value: T) {
        let mut state = self.state.lock();
        assert!(
            matches!(*state, ValueState::Pending),
            "value event resolved twice"
        );
        *state = ValueState::Set(value);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Fail the event; waiters receive the message as an orchestration error
    pub fn fail(&self, message: impl Into<String>) {
        let mut state = self.state.lock();
        if matches!(*state, ValueState::Pending) {
            *state = ValueState::Failed(message.into());
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Wait until the event resolves
    pub async fn wait(&self) -> Result<T> {
        loop {
            let notified = self.notify.notified();
            match &*self.state.lock() {
                ValueState::Set(value) => return Ok(value.clone()),
                ValueState::Failed(message) => return Err(Error::Orchestration(message.clone())),
                ValueState::Pending => {}
            }
            notified.await;
        }
    }
}

impl<T: Clone> Default for ValueEvent<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A set-once event with a subscriber count
///
/// Workers register one subscriber per in-flight node of a session; the
/// registry entry is pruned when the count returns to zero.
pub struct SubscriberEvent {
    set: AtomicBool,
    subscribers: AtomicUsize,
    notify: Notify,
}

impl SubscriberEvent {
    pub fn new() -> Self {
        Self {
            set: AtomicBool::new(false),
            subscribers: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    pub fn set(&self) {
        self.set.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn subscribe(&self) {
        self.subscribers.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unsubscribe(&self) {
        let previous = self.subscribers.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "unsubscribe without a matching subscribe");
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Acquire)
    }

    /// Wait until the event is set; returns immediately if it already is
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for SubscriberEvent {
    fn default() -> Self {
        Self::new()
    }
}

enum LockState {
    Unused,
    Held,
    Released,
}

/// A single-use async lock carrying a value
///
/// The first acquirer observes `first() == true` and holds the lock until
/// its guard drops; everyone else blocks until then and observes `false`.
/// The lock never resets: once released it admits all comers immediately.
pub struct SessionLock<T> {
    value: T,
    state: Mutex<LockState>,
    notify: Notify,
}

/// Guard for [`SessionLock::acquire`]; releases the lock on drop
pub struct SessionGuard<'a, T> {
    lock: &'a SessionLock<T>,
    first: bool,
}

impl<T> SessionGuard<'_, T> {
    /// True when this acquirer is the first to hold the lock
    pub fn first(&self) -> bool {
        self.first
    }
}

impl<T> Drop for SessionGuard<'_, T> {
    fn drop(&mut self) {
        if self.first {
            *self.lock.state.lock() = LockState::Released;
            self.lock.notify.notify_waiters();
        }
    }
}

impl<T> SessionLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            state: Mutex::new(LockState::Unused),
            notify: Notify::new(),
        }
    }

    /// Create a lock that is already spent, for contexts whose session exists
    pub fn used(value: T) -> Self {
        Self {
            value,
            state: Mutex::new(LockState::Released),
            notify: Notify::new(),
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub async fn acquire(&self) -> SessionGuard<'_, T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                match *state {
                    LockState::Unused => {
                        *state = LockState::Held;
                        return SessionGuard { lock: self, first: true };
                    }
                    LockState::Released => {
                        return SessionGuard { lock: self, first: false };
                    }
                    LockState::Held => {}
                }
            }
            notified.await;
        }
    }
}
