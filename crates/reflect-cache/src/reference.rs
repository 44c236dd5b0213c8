//! Reclaimable references
//!
//! Cache entries are keyed by values that the rest of the runtime owns. A
//! `ManagedReference` holds such a key weakly, softly, or strongly, depending
//! on its `ReferenceBundle`. When a [`Referent`] is dropped, its `DropSignal`
//! posts the referent's id to every subscribed `ReferenceQueue`; draining the
//! queue runs the finalizers registered for that id, which is how map entries
//! remove themselves once their key is gone.

use crate::error::{CacheError, CacheResult};
use crate::lock::LockableObject;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use crossbeam::epoch::{self, Atomic, Owned};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// How strongly a `ManagedReference` holds its referent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceType {
    /// Does not keep the referent alive
    Weak,
    /// Keeps the referent alive until the bundle reclaims soft references
    Soft,
    /// Keeps the referent alive until the reference is cleared
    Hard,
}

/// Unique identifier of a referent
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ReferentId(u64);

static NEXT_REFERENT_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

impl ReferentId {
    /// Generate a new unique ReferentId
    pub fn new() -> Self {
        ReferentId(NEXT_REFERENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for ReferentId {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop notification carried by every referent
///
/// Embed one in a type and implement [`Referent`] to let managed maps
/// forget entries keyed by that value once it is dropped.
pub struct DropSignal {
    id: ReferentId,
    subscribers: Mutex<Vec<(u64, Sender<ReferentId>)>>,
}

impl DropSignal {
    /// Create a signal with a fresh referent id
    pub fn new() -> Self {
        Self {
            id: ReferentId::new(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Id posted to subscribed queues on drop
    pub fn id(&self) -> ReferentId {
        self.id
    }

    fn subscribe(&self, queue: &ReferenceQueue) {
        let mut subscribers = self.subscribers.lock();
        if !subscribers.iter().any(|(id, _)| *id == queue.id) {
            subscribers.push((queue.id, queue.tx.clone()));
        }
    }

    /// Number of queues notified when the referent is dropped
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for DropSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DropSignal {
    fn drop(&mut self) {
        for (_, tx) in self.subscribers.get_mut().drain(..) {
            // A closed queue has nothing left to finalize.
            let _ = tx.send(self.id);
        }
    }
}

impl std::fmt::Debug for DropSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DropSignal").field("id", &self.id).finish()
    }
}

/// A value whose drop can be observed through a `ReferenceQueue`
pub trait Referent: Send + Sync + 'static {
    /// The drop signal owned by this value
    fn drop_signal(&self) -> &DropSignal;
}

/// Cleanup callback run when a referent has been dropped
pub trait Finalizable: Send + Sync {
    /// Release whatever was tied to the dropped referent
    fn finalize_reference(&self);
}

/// Queue of dropped referents and the finalizers waiting on them
pub struct ReferenceQueue {
    id: u64,
    tx: Sender<ReferentId>,
    rx: Receiver<ReferentId>,
    finalizers: DashMap<ReferentId, Vec<Weak<dyn Finalizable>>>,
    finalized: AtomicU64,
}

impl ReferenceQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            rx,
            finalizers: DashMap::new(),
            finalized: AtomicU64::new(0),
        }
    }

    /// Run `finalizer` once `referent` has been dropped and the queue drained
    pub fn register<T: Referent + ?Sized>(&self, referent: &T, finalizer: Weak<dyn Finalizable>) {
        let signal = referent.drop_signal();
        signal.subscribe(self);
        let mut list = self.finalizers.entry(signal.id()).or_default();
        list.retain(|f| f.strong_count() > 0);
        list.push(finalizer);
    }

    /// Take the next dropped referent id without running its finalizers
    pub fn poll(&self) -> Option<ReferentId> {
        self.rx.try_recv().ok()
    }

    /// Number of dropped referents waiting to be processed
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Number of referents with registered finalizers
    pub fn registered(&self) -> usize {
        self.finalizers.len()
    }

    /// Total finalizers run by this queue
    pub fn finalized_count(&self) -> u64 {
        self.finalized.load(Ordering::Relaxed)
    }

    /// Drain the queue, running finalizers; returns how many ran
    pub fn process(&self) -> usize {
        let mut count = 0;
        while let Ok(id) = self.rx.try_recv() {
            count += self.finalize(id);
        }
        count
    }

    /// Run the finalizers registered for `id`
    pub fn finalize(&self, id: ReferentId) -> usize {
        let Some((_, finalizers)) = self.finalizers.remove(&id) else {
            return 0;
        };
        let mut count = 0;
        for finalizer in finalizers.iter().filter_map(Weak::upgrade) {
            finalizer.finalize_reference();
            count += 1;
        }
        self.finalized.fetch_add(count as u64, Ordering::Relaxed);
        tracing::trace!(referent = id.as_u64(), count, "finalized references");
        count
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<ReferentId, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

impl Default for ReferenceQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// When a `ReferenceManager` drains its queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ManagerKind {
    /// Drain after every managed reference creation and on `process`
    #[default]
    Callback,
    /// Drain continuously on a background thread
    Threaded,
    /// Drain only on explicit `process`
    Idle,
}

const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Owns a `ReferenceQueue` and the policy for draining it
pub struct ReferenceManager {
    kind: ManagerKind,
    queue: Arc<ReferenceQueue>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ReferenceManager {
    /// Create a manager with the given policy
    pub fn new(kind: ManagerKind) -> CacheResult<Self> {
        let queue = Arc::new(ReferenceQueue::new());
        let stop = Arc::new(AtomicBool::new(false));
        let worker = match kind {
            ManagerKind::Threaded => Some(Self::spawn_worker(queue.clone(), stop.clone())?),
            ManagerKind::Callback | ManagerKind::Idle => None,
        };
        Ok(Self {
            kind,
            queue,
            stop,
            worker: Mutex::new(worker),
        })
    }

    /// Manager that drains on reference creation
    pub fn callback() -> Self {
        Self::passive(ManagerKind::Callback)
    }

    /// Manager that never drains on its own
    pub fn idle() -> Self {
        Self::passive(ManagerKind::Idle)
    }

    /// Manager with a background drain thread
    pub fn threaded() -> CacheResult<Self> {
        Self::new(ManagerKind::Threaded)
    }

    fn passive(kind: ManagerKind) -> Self {
        Self {
            kind,
            queue: Arc::new(ReferenceQueue::new()),
            stop: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    fn spawn_worker(queue: Arc<ReferenceQueue>, stop: Arc<AtomicBool>) -> CacheResult<JoinHandle<()>> {
        let handle = std::thread::Builder::new()
            .name("reference-manager".to_string())
            .spawn(move || {
                tracing::debug!("reference manager thread started");
                while !stop.load(Ordering::Acquire) {
                    match queue.recv_timeout(WORKER_POLL_INTERVAL) {
                        Ok(id) => {
                            queue.finalize(id);
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!("reference manager thread stopped");
            })
            .map_err(CacheError::ManagerSpawn)?;
        Ok(handle)
    }

    /// The drain policy
    pub fn kind(&self) -> ManagerKind {
        self.kind
    }

    /// The queue this manager drains
    pub fn queue(&self) -> &Arc<ReferenceQueue> {
        &self.queue
    }

    /// Hook called after a managed reference has been registered
    pub fn after_reference_creation(&self) {
        if self.kind == ManagerKind::Callback {
            self.queue.process();
        }
    }

    /// Drain the queue now, whatever the policy
    pub fn process(&self) -> usize {
        self.queue.process()
    }

    /// Stop the background thread, if any
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if handle.join().is_err() {
                tracing::warn!("reference manager thread panicked");
            }
        }
    }
}

impl Drop for ReferenceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ReferenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceManager")
            .field("kind", &self.kind)
            .field("pending", &self.queue.pending())
            .finish()
    }
}

trait SoftHold: Send + Sync {
    fn release(&self) -> bool;
}

struct StrongHold<T: ?Sized> {
    value: Mutex<Option<Arc<T>>>,
}

impl<T: ?Sized + Send + Sync> SoftHold for StrongHold<T> {
    fn release(&self) -> bool {
        self.value.lock().take().is_some()
    }
}

/// A reference type paired with the manager that finalizes its referents
pub struct ReferenceBundle {
    kind: ReferenceType,
    manager: Arc<ReferenceManager>,
    soft: Mutex<Vec<Weak<dyn SoftHold>>>,
}

impl ReferenceBundle {
    /// Create a bundle of `kind` references managed by `manager`
    pub fn new(kind: ReferenceType, manager: Arc<ReferenceManager>) -> Self {
        Self {
            kind,
            manager,
            soft: Mutex::new(Vec::new()),
        }
    }

    /// Weak references drained on creation
    pub fn weak() -> Self {
        Self::new(ReferenceType::Weak, Arc::new(ReferenceManager::callback()))
    }

    /// Soft references drained on creation
    pub fn soft() -> Self {
        Self::new(ReferenceType::Soft, Arc::new(ReferenceManager::callback()))
    }

    /// The reference type created by this bundle
    pub fn kind(&self) -> ReferenceType {
        self.kind
    }

    /// The manager finalizing referents of this bundle
    pub fn manager(&self) -> &Arc<ReferenceManager> {
        &self.manager
    }

    /// Release every soft reference created through this bundle
    ///
    /// This is the runtime's memory-pressure hook: referents that nothing
    /// else holds are dropped, and their finalizers become due.
    pub fn reclaim_soft(&self) -> usize {
        let holds: Vec<_> = std::mem::take(&mut *self.soft.lock());
        let released = holds
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|hold| hold.release())
            .count();
        tracing::debug!(released, "reclaimed soft references");
        released
    }

    fn track_soft(&self, hold: Weak<dyn SoftHold>) {
        let mut soft = self.soft.lock();
        soft.retain(|h| h.strong_count() > 0);
        soft.push(hold);
    }
}

impl std::fmt::Debug for ReferenceBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceBundle")
            .field("kind", &self.kind)
            .field("manager", &self.manager)
            .finish()
    }
}

/// A weak, soft, or hard reference created through a `ReferenceBundle`
pub struct ManagedReference<T: ?Sized> {
    kind: ReferenceType,
    weak: Weak<T>,
    hold: Option<Arc<StrongHold<T>>>,
    cleared: AtomicBool,
}

impl<T: ?Sized + Send + Sync + 'static> ManagedReference<T> {
    /// Reference `referent` with the bundle's reference type
    pub fn new(bundle: &ReferenceBundle, referent: &Arc<T>) -> Self {
        let hold = match bundle.kind {
            ReferenceType::Weak => None,
            ReferenceType::Soft | ReferenceType::Hard => Some(Arc::new(StrongHold {
                value: Mutex::new(Some(referent.clone())),
            })),
        };
        if bundle.kind == ReferenceType::Soft {
            if let Some(hold) = &hold {
                let hold: Arc<dyn SoftHold> = hold.clone();
                bundle.track_soft(Arc::downgrade(&hold));
            }
        }
        Self {
            kind: bundle.kind,
            weak: Arc::downgrade(referent),
            hold,
            cleared: AtomicBool::new(false),
        }
    }

    /// The referent, if it is still alive and the reference was not cleared
    pub fn get(&self) -> Option<Arc<T>> {
        if self.cleared.load(Ordering::Acquire) {
            return None;
        }
        self.weak.upgrade()
    }

    /// Check the referent without upgrading it
    pub fn is_alive(&self) -> bool {
        !self.cleared.load(Ordering::Acquire) && self.weak.strong_count() > 0
    }

    /// Check if the reference points at `referent`
    pub fn refers_to(&self, referent: &Arc<T>) -> bool {
        std::ptr::addr_eq(self.weak.as_ptr(), Arc::as_ptr(referent))
    }

    /// Drop any strong hold and stop returning the referent
    pub fn clear(&self) {
        self.cleared.store(true, Ordering::Release);
        if let Some(hold) = &self.hold {
            hold.release();
        }
    }

    /// The reference type this reference was created with
    pub fn kind(&self) -> ReferenceType {
        self.kind
    }
}

impl<T: Referent> ManagedReference<T> {
    /// Reference `referent` and run `finalizer` once it has been dropped
    pub fn with_finalizer(
        bundle: &ReferenceBundle,
        referent: &Arc<T>,
        finalizer: Weak<dyn Finalizable>,
    ) -> Self {
        bundle.manager.queue().register(referent.as_ref(), finalizer);
        Self::new(bundle, referent)
    }
}

impl<T: ?Sized> std::fmt::Debug for ManagedReference<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedReference")
            .field("kind", &self.kind)
            .field("alive", &(self.weak.strong_count() > 0))
            .finish()
    }
}

/// A value computed on first access and held through a `ReferenceBundle`
///
/// Reads are lock-free. With a soft bundle the value may be reclaimed and is
/// then recomputed on the next access; a failed computation is not stored.
pub struct LazyReference<T: ?Sized + Send + Sync + 'static> {
    bundle: Arc<ReferenceBundle>,
    current: Atomic<ManagedReference<T>>,
    init: LockableObject,
}

impl<T: ?Sized + Send + Sync + 'static> LazyReference<T> {
    /// Create an empty lazy reference
    pub fn new(bundle: Arc<ReferenceBundle>) -> Self {
        Self {
            bundle,
            current: Atomic::null(),
            init: LockableObject::new(),
        }
    }

    /// The current value, without computing it
    pub fn get(&self) -> Option<Arc<T>> {
        let guard = epoch::pin();
        let current = self.current.load(Ordering::Acquire, &guard);
        // SAFETY: non-null pointers are only retired through `defer_destroy`
        // while this guard is pinned.
        unsafe { current.as_ref() }.and_then(ManagedReference::get)
    }

    /// The current value, computing and storing it if absent
    pub fn get_or_try_init<E, F>(&self, init: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Result<Arc<T>, E>,
    {
        if let Some(value) = self.get() {
            return Ok(value);
        }
        let _guard = self.init.guard();
        if let Some(value) = self.get() {
            return Ok(value);
        }

        let value = init()?;
        self.store(ManagedReference::new(&self.bundle, &value));
        Ok(value)
    }

    /// Forget the current value
    pub fn clear(&self) {
        let guard = epoch::pin();
        let old = self.current.swap(epoch::Shared::null(), Ordering::AcqRel, &guard);
        if let Some(reference) = unsafe { old.as_ref() } {
            reference.clear();
            // SAFETY: `old` was unlinked above and is destroyed once no pinned
            // reader can still observe it.
            unsafe { guard.defer_destroy(old) };
        }
    }

    fn store(&self, reference: ManagedReference<T>) {
        let guard = epoch::pin();
        let old = self
            .current
            .swap(Owned::new(reference), Ordering::AcqRel, &guard);
        if !old.is_null() {
            // SAFETY: `old` was unlinked by the swap above.
            unsafe { guard.defer_destroy(old) };
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> Drop for LazyReference<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread can reach `current`.
        unsafe {
            let current = self.current.load(Ordering::Relaxed, epoch::unprotected());
            if !current.is_null() {
                drop(current.into_owned());
            }
        }
    }
}
