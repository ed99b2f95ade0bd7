use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};

/// Holder value while nobody owns the lock.
const UNLOCKED: usize = usize::MAX;

/// The systemwide kernel lock.
///
/// A test-and-test-and-set spin lock that remembers which CPU holds it.
/// Every CPU takes it on kernel entry and gives it up exactly when it hands
/// control to an environment or halts; the guard returned by
/// [`lock`](Self::lock) is what the scheduler consumes on the way out.
pub struct KernelLock<T> {
    /// CPU number of the holder, or [`UNLOCKED`].
    holder: AtomicUsize,
    inner: UnsafeCell<T>,
}

// Safety: mutual exclusion; only T: Send may cross threads.
unsafe impl<T: Send> Sync for KernelLock<T> {}

impl<T> KernelLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            holder: AtomicUsize::new(UNLOCKED),
            inner: UnsafeCell::new(inner),
        }
    }

    #[inline]
    fn try_acquire(&self, cpu: usize) -> bool {
        self.holder
            .compare_exchange(UNLOCKED, cpu, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Try once on behalf of `cpu`; returns immediately.
    #[inline]
    pub fn try_lock(&self, cpu: usize) -> Option<KernelLockGuard<'_, T>> {
        self.try_acquire(cpu).then_some(KernelLockGuard { lock: self, cpu })
    }

    /// Spin until `cpu` owns the lock (TATAS), then return a guard.
    ///
    /// # Panics
    /// If `cpu` already holds the lock; the kernel lock is not recursive.
    #[inline]
    pub fn lock(&self, cpu: usize) -> KernelLockGuard<'_, T> {
        assert_ne!(cpu, UNLOCKED, "invalid CPU number");
        if !self.try_acquire(cpu) {
            assert_ne!(
                self.holder.load(Ordering::Relaxed),
                cpu,
                "CPU {cpu} already holds the kernel lock"
            );
            loop {
                while self.holder.load(Ordering::Relaxed) != UNLOCKED {
                    spin_loop();
                }
                if self.try_acquire(cpu) {
                    break;
                }
            }
        }
        KernelLockGuard { lock: self, cpu }
    }

    /// The CPU currently holding the lock.
    #[inline]
    pub fn holder(&self) -> Option<usize> {
        match self.holder.load(Ordering::Relaxed) {
            UNLOCKED => None,
            cpu => Some(cpu),
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.holder().is_some()
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

/// Proof that one CPU holds the [`KernelLock`]. Dropping it releases the lock.
pub struct KernelLockGuard<'a, T> {
    lock: &'a KernelLock<T>,
    cpu: usize,
}

impl<T> KernelLockGuard<'_, T> {
    /// The CPU that acquired this guard.
    #[inline]
    #[must_use]
    pub const fn cpu(&self) -> usize {
        self.cpu
    }
}

impl<T> Deref for KernelLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for KernelLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for KernelLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.holder.store(UNLOCKED, Ordering::Release);
    }
}
