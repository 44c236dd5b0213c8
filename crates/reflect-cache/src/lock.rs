//! Compact reentrant exclusive lock
//!
//! `LockableObject` guards short critical sections inside the caches
//! (segment mutation, lazy field population). The uncontended path is a
//! single compare-and-swap; contended threads queue up FIFO and park.

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, Thread};

/// Identifier of a thread that can own a `LockableObject`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct OwnerId(NonZeroU64);

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_OWNER: OwnerId = OwnerId::next();
}

impl OwnerId {
    fn next() -> Self {
        let id = NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed);
        // Starts at 1 and would need 2^64 threads to wrap.
        OwnerId(NonZeroU64::new(id).unwrap_or(NonZeroU64::MIN))
    }

    /// Owner id of the calling thread
    pub fn current() -> Self {
        CURRENT_OWNER.with(|id| *id)
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0.get()
    }
}

/// Errors that can occur when releasing a `LockableObject`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// Unlock called by a thread that does not hold the lock
    #[error("Unlock called by non-owner thread {0:?}")]
    NotOwner(OwnerId),
}

struct Waiter {
    owner: OwnerId,
    thread: Thread,
}

/// Reentrant exclusive lock with a CAS fast path
///
/// The state counts acquisitions by the owning thread: 0 is unlocked,
/// N is held N times. Releasing from a thread that does not own the lock
/// is an illegal monitor state and panics in [`LockableObject::unlock`].
pub struct LockableObject {
    /// Hold count (0 = unlocked)
    state: AtomicUsize,

    /// Current owner (None if unlocked)
    owner: AtomicCell<Option<OwnerId>>,

    /// FIFO queue of parked threads
    waiters: Mutex<VecDeque<Waiter>>,
}

impl LockableObject {
    /// Create a new unlocked lock
    pub fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
            owner: AtomicCell::new(None),
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Acquire the lock, parking the calling thread while another thread holds it
    pub fn lock(&self) {
        let me = OwnerId::current();
        if self.try_acquire(me) {
            return;
        }
        self.lock_slow(me);
    }

    /// Acquire the lock only if that is possible without waiting
    pub fn try_lock(&self) -> bool {
        self.try_acquire(OwnerId::current())
    }

    fn try_acquire(&self, me: OwnerId) -> bool {
        if self
            .state
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(Some(me));
            return true;
        }
        // Only this thread can have stored `me`, and it clears the owner
        // before giving the lock up.
        if self.owner.load() == Some(me) {
            self.state.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    fn lock_slow(&self, me: OwnerId) {
        loop {
            {
                let mut waiters = self.waiters.lock();
                // Re-check under the queue lock: an unlocker publishes state 0
                // before it inspects the queue, so a wakeup cannot be lost.
                if self.try_acquire(me) {
                    waiters.retain(|w| w.owner != me);
                    return;
                }
                if !waiters.iter().any(|w| w.owner == me) {
                    waiters.push_back(Waiter {
                        owner: me,
                        thread: thread::current(),
                    });
                }
            }
            thread::park();
        }
    }

    /// Release one acquisition of the lock
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not hold the lock.
    pub fn unlock(&self) {
        if let Err(err) = self.try_unlock() {
            panic!("illegal monitor state: {err}");
        }
    }

    /// Release one acquisition, reporting a non-owner release as an error
    pub fn try_unlock(&self) -> Result<(), LockError> {
        let me = OwnerId::current();
        if self.owner.load() != Some(me) {
            return Err(LockError::NotOwner(me));
        }

        let held = self.state.load(Ordering::Relaxed);
        if held > 1 {
            self.state.store(held - 1, Ordering::Relaxed);
            return Ok(());
        }

        self.owner.store(None);
        self.state.store(0, Ordering::Release);

        let next = self.waiters.lock().pop_front();
        if let Some(waiter) = next {
            waiter.thread.unpark();
        }
        Ok(())
    }

    /// Acquire the lock and return a guard that releases it on drop
    pub fn guard(&self) -> LockGuard<'_> {
        self.lock();
        LockGuard { lock: self }
    }

    /// Check if the lock is held by any thread
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Acquire) != 0
    }

    /// Check if the calling thread holds the lock
    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load() == Some(OwnerId::current())
    }

    /// Number of acquisitions held by the calling thread (0 if it is not the owner)
    pub fn hold_count(&self) -> usize {
        if self.is_held_by_current_thread() {
            self.state.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    /// Number of threads parked waiting for the lock
    pub fn queue_len(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl Default for LockableObject {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockableObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockableObject")
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("owner", &self.owner.load())
            .finish()
    }
}

/// RAII guard for `LockableObject` (releases one acquisition on drop)
pub struct LockGuard<'a> {
    lock: &'a LockableObject,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        // The guard is only created by the owning thread.
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_owner_id_uniqueness() {
        let here = OwnerId::current();
        let there = thread::spawn(OwnerId::current).join().unwrap();
        assert_ne!(here, there);
        assert_eq!(here, OwnerId::current());
    }

    #[test]
    fn test_uncontended_lock_unlock() {
        let lock = LockableObject::new();
        assert!(!lock.is_locked());

        lock.lock();
        assert!(lock.is_locked());
        assert!(lock.is_held_by_current_thread());
        assert_eq!(lock.hold_count(), 1);

        lock.unlock();
        assert!(!lock.is_locked());
        assert_eq!(lock.hold_count(), 0);
    }

    #[test]
    fn test_reentrant_lock_needs_matching_unlocks() {
        let lock = Arc::new(LockableObject::new());
        lock.lock();
        lock.lock();
        assert_eq!(lock.hold_count(), 2);

        lock.unlock();
        assert!(lock.is_locked());

        let other = {
            let lock = lock.clone();
            thread::spawn(move || lock.try_lock())
        };
        assert!(!other.join().unwrap());

        lock.unlock();
        let other = {
            let lock = lock.clone();
            thread::spawn(move || {
                let acquired = lock.try_lock();
                if acquired {
                    lock.unlock();
                }
                acquired
            })
        };
        assert!(other.join().unwrap());
    }

    #[test]
    fn test_unlock_non_owner_is_error() {
        let lock = Arc::new(LockableObject::new());
        lock.lock();

        let result = {
            let lock = lock.clone();
            thread::spawn(move || lock.try_unlock()).join().unwrap()
        };
        assert!(matches!(result, Err(LockError::NotOwner(_))));
        assert!(lock.is_held_by_current_thread());
        lock.unlock();
    }

    #[test]
    fn test_unlock_without_lock_is_error() {
        let lock = LockableObject::new();
        assert_eq!(
            lock.try_unlock(),
            Err(LockError::NotOwner(OwnerId::current()))
        );
    }

    #[test]
    #[should_panic(expected = "illegal monitor state")]
    fn test_unlock_without_lock_panics() {
        LockableObject::new().unlock();
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let lock = LockableObject::new();
        {
            let _outer = lock.guard();
            let _inner = lock.guard();
            assert_eq!(lock.hold_count(), 2);
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_contended_waiter_acquires_after_release() {
        let lock = Arc::new(LockableObject::new());
        let acquired = Arc::new(AtomicBool::new(false));
        lock.lock();

        let waiter = {
            let lock = lock.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                lock.lock();
                acquired.store(true, Ordering::SeqCst);
                lock.unlock();
            })
        };

        while lock.queue_len() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!acquired.load(Ordering::SeqCst));

        lock.unlock();
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(lock.queue_len(), 0);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_mutual_exclusion_under_contention() {
        let lock = Arc::new(LockableObject::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        let _guard = lock.guard();
                        // Non-atomic read-modify-write; only correct under the lock.
                        let value = counter.load(Ordering::Relaxed);
                        counter.store(value + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 8_000);
        assert!(!lock.is_locked());
    }
}
