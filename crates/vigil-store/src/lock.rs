//! Exclusive-access coordinator with a bounded FIFO of waiters.
//!
//! `lock()` hands out a [`LockKey`]; the holder passes it back to `unlock()`.
//! When the holder unlocks and waiters are queued, the lock stays held and the
//! next waiter inherits the same key. When a new `lock()` arrives while the
//! queue is already full, the current holder is preempted: the key rotates
//! (the old key stops working) and the head waiter is granted the new one.
//! A preempted holder sees [`LockError::WrongKey`] from `unlock()` and should
//! treat it as a non-fatal event.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::oneshot;

/// Default number of queued waiters before the holder is preempted.
pub const DEFAULT_MAX_WAITING: usize = 8;

/// Keys are unique across every coordinator in the process.
static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    #[error("wrong key for the current lock holder")]
    WrongKey,
    #[error("already unlocked")]
    AlreadyUnlocked,
    #[error("locked; acquire the lock before mutating")]
    Locked,
}

/// Opaque proof of lock ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey(u64);

impl LockKey {
    fn fresh() -> Self {
        Self(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

struct LockState {
    locked: bool,
    key: LockKey,
    waiters: VecDeque<oneshot::Sender<LockKey>>,
}

impl LockState {
    /// Grant the lock to the next live waiter, or mark unlocked if none remain.
    /// Waiters whose `lock()` future was dropped are skipped.
    fn hand_over(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.send(self.key).is_ok() {
                return;
            }
        }
        self.locked = false;
    }
}

enum Acquire {
    Granted(LockKey),
    Queued(oneshot::Receiver<LockKey>),
}

/// A queued `lock()` call. If the call is cancelled after the key was sent
/// but before it was read, dropping the waiter passes the key on.
struct Waiter<'a> {
    coordinator: &'a LockCoordinator,
    rx: Option<oneshot::Receiver<LockKey>>,
}

impl Waiter<'_> {
    async fn granted(mut self) -> Option<LockKey> {
        let rx = self.rx.as_mut()?;
        let key = rx.await.ok();
        self.rx = None;
        key
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        rx.close();
        if let Ok(key) = rx.try_recv() {
            tracing::debug!(key = key.0, "lock granted to a cancelled waiter; releasing");
            if let Err(e) = self.coordinator.unlock(key) {
                tracing::debug!(error = %e, "cancelled waiter lost the lock before release");
            }
        }
    }
}

pub struct LockCoordinator {
    max_waiting: usize,
    state: Mutex<LockState>,
}

impl LockCoordinator {
    /// Create a coordinator that queues at most `max_waiting` waiters.
    /// `0` disables preemption and lets the queue grow.
    pub fn new(max_waiting: usize) -> Self {
        Self {
            max_waiting,
            state: Mutex::new(LockState {
                locked: false,
                key: LockKey::fresh(),
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn max_waiting(&self) -> usize {
        self.max_waiting
    }

    pub fn is_locked(&self) -> bool {
        self.state().locked
    }

    /// Number of callers currently suspended in `lock()`.
    pub fn waiting(&self) -> usize {
        self.state().waiters.len()
    }

    /// Acquire the lock, suspending until it is granted.
    pub async fn lock(&self) -> LockKey {
        loop {
            match self.try_acquire() {
                Acquire::Granted(key) => return key,
                Acquire::Queued(rx) => {
                    let waiter = Waiter {
                        coordinator: self,
                        rx: Some(rx),
                    };
                    if let Some(key) = waiter.granted().await {
                        return key;
                    }
                }
            }
        }
    }

    fn try_acquire(&self) -> Acquire {
        let mut state = self.state();

        if !state.locked {
            state.locked = true;
            return Acquire::Granted(state.key);
        }

        if self.max_waiting > 0 && state.waiters.len() >= self.max_waiting {
            let preempted = state.key;
            state.key = LockKey::fresh();
            tracing::debug!(
                preempted = preempted.0,
                key = state.key.0,
                waiting = state.waiters.len(),
                "waiter queue full; preempting lock holder"
            );
            state.hand_over();

            if !state.locked {
                state.locked = true;
                return Acquire::Granted(state.key);
            }
        }

        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        Acquire::Queued(rx)
    }

    /// Release the lock. The next waiter, if any, inherits the same key.
    pub fn unlock(&self, key: LockKey) -> Result<(), LockError> {
        let mut state = self.state();

        if !state.locked {
            return Err(LockError::AlreadyUnlocked);
        }
        if key != state.key {
            return Err(LockError::WrongKey);
        }

        state.hand_over();
        Ok(())
    }

    /// Gate a mutation: passes when unlocked, or when locked and `key` matches.
    pub fn check(&self, key: Option<LockKey>) -> Result<(), LockError> {
        let state = self.state();

        if !state.locked {
            return Ok(());
        }
        match key {
            None => Err(LockError::Locked),
            Some(key) if key != state.key => Err(LockError::WrongKey),
            Some(_) => Ok(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LockCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WAITING)
    }
}

impl std::fmt::Debug for LockCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("LockCoordinator")
            .field("locked", &state.locked)
            .field("waiting", &state.waiters.len())
            .field("max_waiting", &self.max_waiting)
            .finish()
    }
}
