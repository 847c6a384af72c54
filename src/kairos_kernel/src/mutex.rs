//! Mutexes with the priority inheritance protocol
//!
//! # Owned-mutex stack
//!
//! Each thread keeps the mutexes it holds in a LIFO stack, chained through
//! [`ThreadCb::last_mutex_held`] and [`MutexCb::prev_mutex_held`]. Mutexes must
//! be unlocked in the reverse order of locking. The stack is also what
//! [`Kernel::evaluate_priority`] walks to find the inherited priority.
//!
//! # Priority inheritance
//!
//! When a thread blocks on a mutex, every thread in the chain of owners
//! (the owner, the owner of the mutex the owner is waiting for, and so on)
//! whose effective priority is lower is raised to the blocking thread's. The
//! walk stops at the first thread that already has a sufficient priority or
//! that isn't waiting for a mutex.
use core::fmt;

use crate::{
    error::{
        LockMutexError, ManageMutexError, QueryError, TryLockMutexError,
        UnlockAllMutexesError, UnlockMutexError,
    },
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    thread::{ThreadCb, ThreadSt},
    utils::{
        intrusive_list::{self, ListAccessorCell, ListHead},
        Init,
    },
    Kernel, KernelTraits, MutexId, Priority, ThreadId,
};

/// *Mutex control block* - the state data of a mutex.
pub struct MutexCb<Traits: KernelTraits> {
    /// The thread currently owning the mutex.
    pub(crate) owning_thread: CpuLockCell<Traits, Option<ThreadId>>,

    /// Threads waiting for the mutex, sorted by descending effective priority
    /// and FIFO among equal priorities.
    pub(crate) wait_queue: CpuLockCell<Traits, ListHead<ThreadId>>,

    /// The next element in the owned-mutex stack of the owning thread.
    pub(crate) prev_mutex_held: CpuLockCell<Traits, Option<MutexId>>,

    /// The number of times the owner has locked the mutex.
    #[cfg(feature = "recursive_mutex")]
    pub(crate) count: CpuLockCell<Traits, usize>,
}

impl<Traits: KernelTraits> Init for MutexCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        owning_thread: Init::INIT,
        wait_queue: Init::INIT,
        prev_mutex_held: Init::INIT,
        #[cfg(feature = "recursive_mutex")]
        count: Init::INIT,
    };
}

impl<Traits: KernelTraits> MutexCb<Traits> {
    pub const fn new() -> Self {
        Self::INIT
    }
}

impl<Traits: KernelTraits> Default for MutexCb<Traits> {
    fn default() -> Self {
        Self::INIT
    }
}

impl<Traits: KernelTraits> fmt::Debug for MutexCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MutexCb")
            .field("self", &(self as *const _))
            .field("owning_thread", &self.owning_thread)
            .field("prev_mutex_held", &self.prev_mutex_held)
            .finish_non_exhaustive()
    }
}

/// Get a `ListAccessorCell` used to access a mutex's wait queue.
macro_rules! wait_queue_accessor {
    ($kernel:expr, $mutex_cb:expr, $key:expr) => {
        ListAccessorCell::new(
            &$mutex_cb.wait_queue,
            &$kernel.threads,
            |thread_cb: &ThreadCb<_>| &thread_cb.wait_link,
            $key,
        )
    };
}

impl<'a, Traits: KernelTraits> Kernel<'a, Traits> {
    /// Lock a mutex, blocking the current thread until it's handed over if
    /// another thread owns it.
    pub fn mutex_lock(&self, mutex: MutexId) -> Result<(), LockMutexError> {
        let mut lock = lock_cpu::<Traits>()?;
        self.mutex_lock_locked(lock.borrow_mut(), mutex)
    }

    /// [`Self::mutex_lock`] for callers already holding CPU Lock. CPU Lock is
    /// temporarily released while the current thread is blocked.
    pub fn mutex_lock_locked(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        mutex: MutexId,
    ) -> Result<(), LockMutexError> {
        let mutex_cb = self.mutex_cb(mutex)?;
        let current = self.expect_thread_context()?;

        let Some(owner) = mutex_cb.owning_thread.get(&*lock) else {
            self.lock_core(lock, mutex, current);
            return Ok(());
        };

        if owner == current {
            return self.relock(lock, mutex_cb).map_err(|()| LockMutexError::WouldDeadlock);
        }

        let current_cb = &self.threads[current];
        let priority = current_cb.effective_priority.get(&*lock);

        self.propagate_priority(lock.borrow_mut(), owner, priority);

        // Enqueue the current thread and block
        self.wait_queue_insert(lock.borrow_mut(), mutex_cb, current, priority);
        current_cb
            .st
            .replace(&mut *lock, ThreadSt::BlockedOnMutex(mutex));

        while current_cb.st.get(&*lock) == ThreadSt::BlockedOnMutex(mutex) {
            Traits::suspend_current(lock.borrow_mut());
        }

        // The thread that unlocked the mutex has made us the owner
        debug_assert_eq!(mutex_cb.owning_thread.get(&*lock), Some(current));

        Ok(())
    }

    /// Lock a mutex if it's available. Fails with `Timeout` if another thread
    /// owns it.
    pub fn mutex_try_lock(&self, mutex: MutexId) -> Result<(), TryLockMutexError> {
        let mut lock = lock_cpu::<Traits>()?;
        self.mutex_try_lock_locked(lock.borrow_mut(), mutex)
    }

    pub fn mutex_try_lock_locked(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        mutex: MutexId,
    ) -> Result<(), TryLockMutexError> {
        let mutex_cb = self.mutex_cb(mutex)?;
        let current = self.expect_thread_context()?;

        match mutex_cb.owning_thread.get(&*lock) {
            None => {
                self.lock_core(lock, mutex, current);
                Ok(())
            }
            Some(owner) if owner == current => self
                .relock(lock, mutex_cb)
                .map_err(|()| TryLockMutexError::WouldDeadlock),
            Some(_) => Err(TryLockMutexError::Timeout),
        }
    }

    /// Unlock a mutex held by the current thread.
    ///
    /// # Panics
    ///
    /// Panics if the current thread does not own the mutex or if the mutex is
    /// not the most recently locked one among those held by the current
    /// thread.
    pub fn mutex_unlock(&self, mutex: MutexId) -> Result<(), UnlockMutexError> {
        match self.mutex_unlock_checked(mutex) {
            Err(UnlockMutexError::NotOwner) => {
                panic!("{mutex:?} is not owned by the current thread")
            }
            Err(UnlockMutexError::BadObjectState) => {
                panic!("{mutex:?} is not the most recently locked mutex of the current thread")
            }
            result => result,
        }
    }

    /// Like [`Self::mutex_unlock`], but reports ownership and ordering
    /// violations as errors instead of panicking.
    pub fn mutex_unlock_checked(&self, mutex: MutexId) -> Result<(), UnlockMutexError> {
        let mut lock = lock_cpu::<Traits>()?;
        let new_priority = self.unlock_core(lock.borrow_mut(), mutex)?;
        Traits::reschedule(lock.borrow_mut(), new_priority);
        Ok(())
    }

    /// Unlock a mutex without checking for preemption. Meant for condition
    /// variables, which block the current thread right after releasing the
    /// mutex.
    pub fn mutex_unlock_locked_no_reschedule(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        mutex: MutexId,
    ) -> Result<(), UnlockMutexError> {
        self.unlock_core(lock, mutex).map(drop)
    }

    /// Unlock all mutexes held by the current thread and restore its base
    /// priority.
    pub fn mutex_unlock_all(&self) -> Result<(), UnlockAllMutexesError> {
        let mut lock = lock_cpu::<Traits>()?;
        let current = self.expect_thread_context()?;
        let current_cb = &self.threads[current];

        while let Some(mutex) = current_cb.last_mutex_held.get(&*lock) {
            let mutex_cb = &self.mutexes[mutex];
            let prev = mutex_cb.prev_mutex_held.replace(&mut *lock, None);
            current_cb.last_mutex_held.replace(&mut *lock, prev);

            #[cfg(feature = "recursive_mutex")]
            mutex_cb.count.replace(&mut *lock, 0);

            self.hand_over(lock.borrow_mut(), mutex);
        }

        let base_priority = current_cb.base_priority;
        current_cb
            .effective_priority
            .replace(&mut *lock, base_priority);

        Traits::reschedule(lock.borrow_mut(), base_priority);
        Ok(())
    }

    /// Put a mutex into the unlocked state. Fails with `BadObjectState` if
    /// it's in use.
    pub fn mutex_init(&self, mutex: MutexId) -> Result<(), ManageMutexError> {
        let mut lock = lock_cpu::<Traits>()?;
        let mutex_cb = self.mutex_cb(mutex)?;
        self.expect_mutex_unused(lock.borrow_mut(), mutex_cb)?;

        mutex_cb.prev_mutex_held.replace(&mut *lock, None);
        #[cfg(feature = "recursive_mutex")]
        mutex_cb.count.replace(&mut *lock, 0);
        Ok(())
    }

    /// Retire a mutex. The mutex must be unowned and have no waiters.
    pub fn mutex_dispose(&self, mutex: MutexId) -> Result<(), ManageMutexError> {
        let mut lock = lock_cpu::<Traits>()?;
        let mutex_cb = self.mutex_cb(mutex)?;
        self.expect_mutex_unused(lock.borrow_mut(), mutex_cb)
    }

    /// Get the owner of a mutex.
    pub fn mutex_owner(&self, mutex: MutexId) -> Result<Option<ThreadId>, QueryError> {
        let lock = lock_cpu::<Traits>()?;
        Ok(self.mutex_cb(mutex)?.owning_thread.get(&*lock))
    }

    pub fn mutex_is_locked(&self, mutex: MutexId) -> Result<bool, QueryError> {
        Ok(self.mutex_owner(mutex)?.is_some())
    }

    pub fn mutex_queue_is_empty(&self, mutex: MutexId) -> Result<bool, QueryError> {
        Ok(self.mutex_first_waiter(mutex)?.is_none())
    }

    /// Get the first thread waiting for a mutex.
    pub fn mutex_first_waiter(&self, mutex: MutexId) -> Result<Option<ThreadId>, QueryError> {
        let lock = lock_cpu::<Traits>()?;
        Ok(self.mutex_cb(mutex)?.wait_queue.get(&*lock).first)
    }

    fn expect_mutex_unused(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        mutex_cb: &MutexCb<Traits>,
    ) -> Result<(), ManageMutexError> {
        if mutex_cb.owning_thread.get(&*lock).is_some()
            || !mutex_cb.wait_queue.get(&*lock).is_empty()
        {
            Err(ManageMutexError::BadObjectState)
        } else {
            Ok(())
        }
    }

    /// Give the ownership of the mutex to `thread` and push the mutex onto the
    /// thread's owned-mutex stack.
    fn lock_core(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, mutex: MutexId, thread: ThreadId) {
        let mutex_cb = &self.mutexes[mutex];
        let thread_cb = &self.threads[thread];

        mutex_cb.owning_thread.replace(&mut *lock, Some(thread));

        let prev = thread_cb.last_mutex_held.replace(&mut *lock, Some(mutex));
        mutex_cb.prev_mutex_held.replace(&mut *lock, prev);

        #[cfg(feature = "recursive_mutex")]
        mutex_cb.count.replace(&mut *lock, 1);
    }

    /// Lock a mutex already owned by the current thread. Fails if recursive
    /// locking is disabled.
    #[allow(unused_variables, unused_mut)]
    fn relock(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        mutex_cb: &MutexCb<Traits>,
    ) -> Result<(), ()> {
        #[cfg(feature = "recursive_mutex")]
        {
            mutex_cb.count.replace_with(&mut *lock, |c| *c + 1);
            Ok(())
        }
        #[cfg(not(feature = "recursive_mutex"))]
        {
            Err(())
        }
    }

    /// Validate and perform an unlock. Returns the current thread's new
    /// effective priority.
    fn unlock_core(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        mutex: MutexId,
    ) -> Result<Priority, UnlockMutexError> {
        let mutex_cb = self.mutex_cb(mutex)?;
        let current = self.expect_thread_context()?;
        let current_cb = &self.threads[current];

        if mutex_cb.owning_thread.get(&*lock) != Some(current) {
            return Err(UnlockMutexError::NotOwner);
        }
        if current_cb.last_mutex_held.get(&*lock) != Some(mutex) {
            return Err(UnlockMutexError::BadObjectState);
        }

        #[cfg(feature = "recursive_mutex")]
        {
            let count = mutex_cb.count.replace_with(&mut *lock, |c| *c - 1) - 1;
            if count > 0 {
                return Ok(current_cb.effective_priority.get(&*lock));
            }
        }

        // Pop the mutex from the owned-mutex stack
        let prev = mutex_cb.prev_mutex_held.replace(&mut *lock, None);
        current_cb.last_mutex_held.replace(&mut *lock, prev);

        // Undo the priority inheritance that is no longer needed
        let new_priority = self.evaluate_priority(lock.borrow_mut(), current);
        current_cb
            .effective_priority
            .replace(&mut *lock, new_priority);

        self.hand_over(lock, mutex);

        Ok(new_priority)
    }

    /// Give the mutex to the first waiter and wake it up, or mark the mutex
    /// unowned if there are no waiters. The mutex must have been popped from
    /// its previous owner's stack.
    fn hand_over(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, mutex: MutexId) {
        let mutex_cb = &self.mutexes[mutex];
        let next = wait_queue_accessor!(self, mutex_cb, lock.borrow_mut()).pop_front();

        if let Some(next) = next {
            debug_assert_eq!(
                self.threads[next].st.get(&*lock),
                ThreadSt::BlockedOnMutex(mutex)
            );
            self.lock_core(lock.borrow_mut(), mutex, next);
            self.make_ready(lock, next);
        } else {
            mutex_cb.owning_thread.replace(&mut *lock, None);
        }
    }

    /// Calculate the effective priority of `thread` from its base priority and
    /// the first waiter of each mutex it holds.
    pub(crate) fn evaluate_priority(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        thread: ThreadId,
    ) -> Priority {
        let thread_cb = &self.threads[thread];
        let mut priority = thread_cb.base_priority;

        let mut maybe_mutex = thread_cb.last_mutex_held.get(&*lock);
        while let Some(mutex) = maybe_mutex {
            let mutex_cb = &self.mutexes[mutex];
            if let Some(waiter) = mutex_cb.wait_queue.get(&*lock).first {
                // The queue is sorted, so the first waiter has the highest
                // priority
                priority = priority.max(self.threads[waiter].effective_priority.get(&*lock));
            }
            maybe_mutex = mutex_cb.prev_mutex_held.get(&*lock);
        }

        priority
    }

    /// Raise the effective priority of `thread` and the threads it's
    /// transitively waiting for to `priority`.
    fn propagate_priority(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        mut thread: ThreadId,
        priority: Priority,
    ) {
        loop {
            let thread_cb = &self.threads[thread];
            if thread_cb.effective_priority.get(&*lock) >= priority {
                break;
            }
            thread_cb.effective_priority.replace(&mut *lock, priority);

            match thread_cb.st.get(&*lock) {
                ThreadSt::BlockedOnMutex(mutex) => {
                    // Move the thread to the position corresponding to the new
                    // priority and continue with the owner of that mutex
                    let mutex_cb = &self.mutexes[mutex];
                    wait_queue_accessor!(self, mutex_cb, lock.borrow_mut()).remove(thread);
                    self.wait_queue_insert(lock.borrow_mut(), mutex_cb, thread, priority);

                    match mutex_cb.owning_thread.get(&*lock) {
                        Some(owner) => thread = owner,
                        None => break,
                    }
                }
                ThreadSt::BlockedOnOther(wait_set) => {
                    Traits::wait_set_reorder(lock, wait_set, thread, priority);
                    break;
                }
                ThreadSt::Ready => {
                    Traits::ready_reorder(lock, thread, priority);
                    break;
                }
            }
        }
    }

    /// Insert `thread` into a mutex's wait queue, after all threads whose
    /// priority is not lower than `priority`.
    fn wait_queue_insert(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        mutex_cb: &MutexCb<Traits>,
        thread: ThreadId,
        priority: Priority,
    ) {
        let mut accessor = wait_queue_accessor!(self, mutex_cb, lock);

        // Scan from the back, since the new waiter tends to end up near it
        let mut insert_at = None;
        let mut cursor = accessor.back();
        while let Some(waiter) = cursor {
            let waiter_priority = intrusive_list::CellLike::get(
                &accessor.element(waiter).effective_priority,
                accessor.cell_key(),
            );
            if waiter_priority >= priority {
                break;
            }
            insert_at = Some(waiter);
            cursor = accessor.prev(waiter);
        }

        accessor.insert(thread, insert_at);
    }
}
