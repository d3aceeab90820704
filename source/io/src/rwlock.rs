//! Writer-priority Reader/Writer Lock
//!
//! Shared state that is written by one task (for example a receiver decode
//! task) and read by several control tasks is guarded by this lock.
//!
//! ## The Rules
//!
//! The lock is made of two binary [Gate]s and a pair of counters:
//!
//! * `read_gate` is closed while any writer is waiting or active. New readers
//!   must pass through it, so a waiting writer keeps new readers out.
//! * `write_gate` is held either by exactly one writer, or collectively by the
//!   group of active readers. The first reader in closes it, the last reader out
//!   opens it again.
//! * `readers` and `writers` are only touched under a short blocking critical
//!   section, never across an `.await`.
//!
//! Every acquisition can be bounded by a timeout. A timed-out (or dropped)
//! acquisition undoes every partial step it took, so once all contenders
//! have left, both counters are zero and both gates are open.

use core::{
    cell::{Cell, RefCell, UnsafeCell},
    ops::{Deref, DerefMut},
    task::Poll,
};

use embassy_sync::{
    blocking_mutex::{raw::RawMutex, Mutex as BlockingMutex},
    waitqueue::MultiWakerRegistration,
};
use embassy_time::{with_timeout, Duration, Instant};
use futures::future::poll_fn;

/// The number of tasks that can be parked on one gate before all of them
/// are woken to re-register.
pub const GATE_WAITERS: usize = 8;

struct GateState {
    open: bool,
    waiters: MultiWakerRegistration<GATE_WAITERS>,
}

/// A binary semaphore.
///
/// Unlike a mutex guard, a gate may be closed by one task and opened again by
/// another. The reader group relies on this for the write gate.
pub(crate) struct Gate<R: RawMutex> {
    inner: BlockingMutex<R, RefCell<GateState>>,
}

impl<R: RawMutex> Gate<R> {
    pub(crate) const fn new() -> Self {
        Self {
            inner: BlockingMutex::new(RefCell::new(GateState {
                open: true,
                waiters: MultiWakerRegistration::new(),
            })),
        }
    }

    /// Close the gate if it is open. Never waits.
    pub(crate) fn try_close(&self) -> bool {
        self.inner.lock(|s| {
            let mut s = s.borrow_mut();
            core::mem::replace(&mut s.open, false)
        })
    }

    /// Wait until the gate is open, then close it.
    ///
    /// Dropping the future before it resolves leaves the gate untouched.
    pub(crate) async fn close(&self) {
        poll_fn(|cx| {
            self.inner.lock(|s| {
                let mut s = s.borrow_mut();
                if s.open {
                    s.open = false;
                    Poll::Ready(())
                } else {
                    s.waiters.register(cx.waker());
                    Poll::Pending
                }
            })
        })
        .await
    }

    /// Like [Gate::close], giving up at `deadline`. `None` waits forever.
    pub(crate) async fn close_by(&self, deadline: Option<Instant>) -> bool {
        match deadline {
            None => {
                self.close().await;
                true
            }
            Some(d) => {
                let remaining = d.saturating_duration_since(Instant::now());
                with_timeout(remaining, self.close()).await.is_ok()
            }
        }
    }

    /// Open the gate and wake everyone waiting on it.
    ///
    /// Opening an already open gate does nothing.
    pub(crate) fn open(&self) {
        self.inner.lock(|s| {
            let mut s = s.borrow_mut();
            s.open = true;
            s.waiters.wake();
        })
    }

    #[cfg(test)]
    pub(crate) fn is_open(&self) -> bool {
        self.inner.lock(|s| s.borrow().open)
    }
}

#[derive(Clone, Copy)]
struct Counts {
    readers: u32,
    writers: u32,
    /// Set by the writer that closed `read_gate`, cleared by whichever
    /// writer brings `writers` back to zero.
    read_gate_held: bool,
}

/// Runs the closure on drop, unless defused first.
struct Undo<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Undo<F> {
    fn defuse(mut self) {
        self.0 = None;
    }
}

impl<F: FnOnce()> Drop for Undo<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f()
        }
    }
}

/// The data-less lock primitive
///
/// Every successful `*_lock` must be paired with exactly one matching
/// `*_unlock`. [RwLock] does the pairing with guards and should be preferred
/// when the lock protects a value.
pub struct RawRwLock<R: RawMutex> {
    read_gate: Gate<R>,
    write_gate: Gate<R>,
    counts: BlockingMutex<R, Cell<Counts>>,
}

impl<R: RawMutex> Default for RawRwLock<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RawMutex> RawRwLock<R> {
    /// Create a new, unlocked lock
    ///
    /// ```rust
    /// use pyro_io::rwlock::RawRwLock;
    /// use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    ///
    /// static LOCK: RawRwLock<CriticalSectionRawMutex> = RawRwLock::new();
    /// ```
    pub const fn new() -> Self {
        Self {
            read_gate: Gate::new(),
            write_gate: Gate::new(),
            counts: BlockingMutex::new(Cell::new(Counts {
                readers: 0,
                writers: 0,
                read_gate_held: false,
            })),
        }
    }

    fn with_counts<U>(&self, f: impl FnOnce(&mut Counts) -> U) -> U {
        self.counts.lock(|c| {
            let mut v = c.get();
            let out = f(&mut v);
            c.set(v);
            out
        })
    }

    /// The number of readers currently holding the lock
    pub fn reader_count(&self) -> u32 {
        self.counts.lock(|c| c.get().readers)
    }

    /// The number of writers waiting for, or holding, the lock
    pub fn writer_waiting_count(&self) -> u32 {
        self.counts.lock(|c| c.get().writers)
    }

    /// Acquire shared access, waiting as long as necessary
    pub async fn read_lock(&self) {
        self.read_lock_by(None).await;
    }

    /// Acquire shared access, giving up after `timeout`
    ///
    /// Returns `false` on timeout. Nothing is held in that case.
    pub async fn read_lock_timeout(&self, timeout: Duration) -> bool {
        self.read_lock_by(Instant::now().checked_add(timeout)).await
    }

    /// Acquire shared access only if that is possible without waiting
    pub fn try_read_lock(&self) -> bool {
        if !self.read_gate.try_close() {
            return false;
        }
        let first = self.with_counts(|c| {
            c.readers += 1;
            c.readers == 1
        });
        let entered = !first || self.write_gate.try_close();
        if !entered {
            self.with_counts(|c| c.readers -= 1);
        }
        self.read_gate.open();
        entered
    }

    async fn read_lock_by(&self, deadline: Option<Instant>) -> bool {
        if !self.read_gate.close_by(deadline).await {
            return false;
        }
        let gate = Undo(Some(|| self.read_gate.open()));

        let first = self.with_counts(|c| {
            c.readers += 1;
            c.readers == 1
        });
        let entry = Undo(Some(|| self.with_counts(|c| c.readers -= 1)));

        // Only the first reader competes with writers for the write gate,
        // later readers ride along until the last one leaves.
        if first && !self.write_gate.close_by(deadline).await {
            return false;
        }

        entry.defuse();
        drop(gate);
        true
    }

    /// Release shared access
    pub fn read_unlock(&self) {
        let last = self.with_counts(|c| {
            debug_assert!(c.readers > 0, "read_unlock without read_lock");
            c.readers = c.readers.saturating_sub(1);
            c.readers == 0
        });
        if last {
            self.write_gate.open();
        }
    }

    /// Acquire exclusive access, waiting as long as necessary
    pub async fn write_lock(&self) {
        self.write_lock_by(None).await;
    }

    /// Acquire exclusive access, giving up after `timeout`
    ///
    /// Returns `false` on timeout. Nothing is held in that case, and new
    /// readers are admitted again if no other writer is waiting.
    pub async fn write_lock_timeout(&self, timeout: Duration) -> bool {
        self.write_lock_by(Instant::now().checked_add(timeout)).await
    }

    /// Acquire exclusive access only if that is possible without waiting
    pub fn try_write_lock(&self) -> bool {
        let first = self.with_counts(|c| {
            c.writers += 1;
            c.writers == 1
        });
        if first {
            if !self.read_gate.try_close() {
                self.leave_writer();
                return false;
            }
            self.with_counts(|c| c.read_gate_held = true);
        }
        if !self.write_gate.try_close() {
            self.leave_writer();
            return false;
        }
        true
    }

    async fn write_lock_by(&self, deadline: Option<Instant>) -> bool {
        let first = self.with_counts(|c| {
            c.writers += 1;
            c.writers == 1
        });
        let entry = Undo(Some(|| self.leave_writer()));

        if first {
            if !self.read_gate.close_by(deadline).await {
                return false;
            }
            self.with_counts(|c| c.read_gate_held = true);
        }

        if !self.write_gate.close_by(deadline).await {
            return false;
        }

        entry.defuse();
        true
    }

    /// Release exclusive access
    pub fn write_unlock(&self) {
        self.write_gate.open();
        self.leave_writer();
    }

    fn leave_writer(&self) {
        let reopen = self.with_counts(|c| {
            debug_assert!(c.writers > 0, "writer count underflow");
            c.writers = c.writers.saturating_sub(1);
            if c.writers == 0 && c.read_gate_held {
                c.read_gate_held = false;
                true
            } else {
                false
            }
        });
        if reopen {
            self.read_gate.open();
        }
    }
}

/// A writer-priority reader/writer lock protecting a value of type `T`
///
/// The lock is only shared between contexts when its mutex is, so a lock
/// built on a `NoopRawMutex` stays on one thread:
///
/// ```compile_fail
/// use embassy_sync::blocking_mutex::raw::NoopRawMutex;
/// use pyro_io::rwlock::RwLock;
///
/// fn shared<T: Sync>(_: &T) {}
/// shared(&RwLock::<NoopRawMutex, u32>::new(0));
/// ```
pub struct RwLock<R: RawMutex, T> {
    raw: RawRwLock<R>,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is handed out only through guards, which hold
// the raw lock in the matching mode. The counters are only consistent
// across contexts if `R` itself may be shared.
unsafe impl<R: RawMutex + Sync, T: Send + Sync> Sync for RwLock<R, T> {}

impl<R: RawMutex, T> RwLock<R, T> {
    /// Create a new, unlocked lock holding `value`
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawRwLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Borrow the underlying primitive, e.g. to inspect the counters
    pub fn raw(&self) -> &RawRwLock<R> {
        &self.raw
    }

    /// Acquire shared access
    pub async fn read(&self) -> ReadGuard<'_, R, T> {
        self.raw.read_lock().await;
        ReadGuard { lock: self }
    }

    /// Acquire shared access, giving up after `timeout`
    pub async fn read_timeout(&self, timeout: Duration) -> Option<ReadGuard<'_, R, T>> {
        self.raw
            .read_lock_timeout(timeout)
            .await
            .then_some(ReadGuard { lock: self })
    }

    /// Acquire shared access without waiting
    pub fn try_read(&self) -> Option<ReadGuard<'_, R, T>> {
        self.raw.try_read_lock().then_some(ReadGuard { lock: self })
    }

    /// Acquire exclusive access
    pub async fn write(&self) -> WriteGuard<'_, R, T> {
        self.raw.write_lock().await;
        WriteGuard { lock: self }
    }

    /// Acquire exclusive access, giving up after `timeout`
    pub async fn write_timeout(&self, timeout: Duration) -> Option<WriteGuard<'_, R, T>> {
        self.raw
            .write_lock_timeout(timeout)
            .await
            .then_some(WriteGuard { lock: self })
    }

    /// Acquire exclusive access without waiting
    pub fn try_write(&self) -> Option<WriteGuard<'_, R, T>> {
        self.raw.try_write_lock().then_some(WriteGuard { lock: self })
    }

    /// Access the value through a unique borrow, no locking required
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consume the lock, returning the value
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// Shared access to the value of a [RwLock], released on drop
pub struct ReadGuard<'a, R: RawMutex, T> {
    lock: &'a RwLock<R, T>,
}

impl<R: RawMutex, T> Deref for ReadGuard<'_, R, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we hold the lock in shared mode, no writer can exist.
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawMutex, T> Drop for ReadGuard<'_, R, T> {
    fn drop(&mut self) {
        self.lock.raw.read_unlock();
    }
}

/// Exclusive access to the value of a [RwLock], released on drop
pub struct WriteGuard<'a, R: RawMutex, T> {
    lock: &'a RwLock<R, T>,
}

impl<R: RawMutex, T> Deref for WriteGuard<'_, R, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we hold the lock exclusively.
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawMutex, T> DerefMut for WriteGuard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we hold the lock exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<R: RawMutex, T> Drop for WriteGuard<'_, R, T> {
    fn drop(&mut self) {
        self.lock.raw.write_unlock();
    }
}
