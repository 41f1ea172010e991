//! Lock capability.
//!
//! Components are generic over a [`LockKind`], a family of mutex and
//! reader/writer lock types. [`Blocking`] wraps the standard library locks
//! and is what a multi-threaded host uses. [`Uncontended`] is an atomic-flag
//! lock for single-threaded test harnesses: acquiring it never parks the
//! thread, and contention (which such a harness never produces) degrades to
//! yielding until the flag clears.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A family of lock types selected per hosting environment.
pub trait LockKind: Send + Sync + 'static {
    type Mutex<T: Send + 'static>: PortMutex<T>;
    type RwLock<T: Send + Sync + 'static>: PortRwLock<T>;
}

/// Scoped mutual exclusion. The guard releases on drop.
pub trait PortMutex<T>: Send + Sync {
    type Guard<'a>: DerefMut<Target = T>
    where
        Self: 'a;

    fn new(value: T) -> Self;
    fn lock(&self) -> Self::Guard<'_>;
}

/// Reader/writer lock: many concurrent readers or one writer.
pub trait PortRwLock<T>: Send + Sync {
    type ReadGuard<'a>: Deref<Target = T>
    where
        Self: 'a;
    type WriteGuard<'a>: DerefMut<Target = T>
    where
        Self: 'a;

    fn new(value: T) -> Self;
    fn read(&self) -> Self::ReadGuard<'_>;
    fn write(&self) -> Self::WriteGuard<'_>;
}

// ---------------------------------------------------------------------------
// Blocking (std)
// ---------------------------------------------------------------------------

/// Standard library locks. A poisoned lock is recovered: the protected state
/// is only ever mutated after all fallible checks have passed.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blocking;

impl LockKind for Blocking {
    type Mutex<T: Send + 'static> = Mutex<T>;
    type RwLock<T: Send + Sync + 'static> = RwLock<T>;
}

impl<T: Send + 'static> PortMutex<T> for Mutex<T> {
    type Guard<'a>
        = MutexGuard<'a, T>
    where
        Self: 'a;

    fn new(value: T) -> Self {
        Mutex::new(value)
    }

    fn lock(&self) -> Self::Guard<'_> {
        Mutex::lock(self).unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Send + Sync + 'static> PortRwLock<T> for RwLock<T> {
    type ReadGuard<'a>
        = RwLockReadGuard<'a, T>
    where
        Self: 'a;
    type WriteGuard<'a>
        = RwLockWriteGuard<'a, T>
    where
        Self: 'a;

    fn new(value: T) -> Self {
        RwLock::new(value)
    }

    fn read(&self) -> Self::ReadGuard<'_> {
        RwLock::read(self).unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> Self::WriteGuard<'_> {
        RwLock::write(self).unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Uncontended (atomic flag)
// ---------------------------------------------------------------------------

/// Atomic-flag locks for single-threaded harnesses.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uncontended;

impl LockKind for Uncontended {
    type Mutex<T: Send + 'static> = FlagLock<T>;
    type RwLock<T: Send + Sync + 'static> = FlagLock<T>;
}

/// Exclusive lock over a single atomic flag. Readers are exclusive too.
pub struct FlagLock<T> {
    held: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` only happens through a `FlagGuard`, and at most one
// guard exists at a time because acquisition is a compare-exchange on `held`.
unsafe impl<T: Send> Sync for FlagLock<T> {}

impl<T> FlagLock<T> {
    fn acquire(&self) -> FlagGuard<'_, T> {
        while self
            .held
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            crate::time::yield_now();
        }
        FlagGuard { lock: self }
    }
}

pub struct FlagGuard<'a, T> {
    lock: &'a FlagLock<T>,
}

impl<T> Deref for FlagGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: this guard holds the flag, so no other reference exists.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for FlagGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: this guard holds the flag, so no other reference exists.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for FlagGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
    }
}

impl<T: Send + 'static> PortMutex<T> for FlagLock<T> {
    type Guard<'a>
        = FlagGuard<'a, T>
    where
        Self: 'a;

    fn new(value: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    fn lock(&self) -> Self::Guard<'_> {
        self.acquire()
    }
}

impl<T: Send + Sync + 'static> PortRwLock<T> for FlagLock<T> {
    type ReadGuard<'a>
        = FlagGuard<'a, T>
    where
        Self: 'a;
    type WriteGuard<'a>
        = FlagGuard<'a, T>
    where
        Self: 'a;

    fn new(value: T) -> Self {
        <Self as PortMutex<T>>::new(value)
    }

    fn read(&self) -> Self::ReadGuard<'_> {
        self.acquire()
    }

    fn write(&self) -> Self::WriteGuard<'_> {
        self.acquire()
    }
}
