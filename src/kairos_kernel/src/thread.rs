//! The parts of the thread control block the mutex engine reads and mutates
use core::fmt;

use crate::{
    error::{BadContextError, BadIdError, QueryError},
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    utils::intrusive_list::Link,
    Kernel, KernelTraits, MutexId, Priority, ThreadId, WaitSetId,
};

/// The blocking state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadSt {
    /// The thread is running or in the ready set.
    Ready,
    /// The thread is waiting for a mutex to be handed over to it.
    BlockedOnMutex(MutexId),
    /// The thread is waiting in a priority-ordered wait set managed by the
    /// scheduler.
    BlockedOnOther(WaitSetId),
}

/// *Thread control block* - the state data of a thread.
pub struct ThreadCb<Traits: KernelTraits> {
    /// The thread's own priority. Never changed by the kernel.
    pub(crate) base_priority: Priority,

    /// The priority used for scheduling, raised by priority inheritance.
    ///
    /// Invariant: `effective_priority >= base_priority`
    pub(crate) effective_priority: CpuLockCell<Traits, Priority>,

    pub(crate) st: CpuLockCell<Traits, ThreadSt>,

    /// The top of the owned-mutex stack. The rest is chained through
    /// [`MutexCb::prev_mutex_held`].
    ///
    /// [`MutexCb::prev_mutex_held`]: crate::MutexCb
    pub(crate) last_mutex_held: CpuLockCell<Traits, Option<MutexId>>,

    /// Links this thread into a mutex wait queue while it's
    /// [`ThreadSt::BlockedOnMutex`].
    pub(crate) wait_link: CpuLockCell<Traits, Option<Link<ThreadId>>>,
}

impl<Traits: KernelTraits> ThreadCb<Traits> {
    /// Construct a `ThreadCb` for a thread with the specified base priority.
    pub const fn new(base_priority: Priority) -> Self {
        Self {
            base_priority,
            effective_priority: CpuLockCell::new(base_priority),
            st: CpuLockCell::new(ThreadSt::Ready),
            last_mutex_held: CpuLockCell::new(None),
            wait_link: CpuLockCell::new(None),
        }
    }

    #[inline]
    pub fn base_priority(&self) -> Priority {
        self.base_priority
    }
}

impl<Traits: KernelTraits> fmt::Debug for ThreadCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadCb")
            .field("self", &(self as *const _))
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("st", &self.st)
            .field("last_mutex_held", &self.last_mutex_held)
            .finish()
    }
}

impl<'a, Traits: KernelTraits> Kernel<'a, Traits> {
    /// Get the current thread, failing if there isn't one or the caller is
    /// an interrupt handler.
    pub(crate) fn expect_thread_context(&self) -> Result<ThreadId, BadContextError> {
        if Traits::is_interrupt_context() {
            return Err(BadContextError::BadContext);
        }
        Traits::current_thread().ok_or(BadContextError::BadContext)
    }

    /// Get a thread's effective priority.
    pub fn thread_priority(&self, thread: ThreadId) -> Result<Priority, QueryError> {
        let lock = lock_cpu::<Traits>()?;
        let thread_cb = self.thread_cb(thread)?;
        Ok(thread_cb.effective_priority.get(&*lock))
    }

    /// Get a thread's base priority.
    pub fn thread_base_priority(&self, thread: ThreadId) -> Result<Priority, BadIdError> {
        Ok(self.thread_cb(thread)?.base_priority)
    }

    pub fn thread_state(&self, thread: ThreadId) -> Result<ThreadSt, QueryError> {
        let lock = lock_cpu::<Traits>()?;
        let thread_cb = self.thread_cb(thread)?;
        Ok(thread_cb.st.get(&*lock))
    }

    /// Get the most recently locked mutex held by a thread.
    pub fn thread_last_mutex_held(&self, thread: ThreadId) -> Result<Option<MutexId>, QueryError> {
        let lock = lock_cpu::<Traits>()?;
        let thread_cb = self.thread_cb(thread)?;
        Ok(thread_cb.last_mutex_held.get(&*lock))
    }

    /// Record that `thread` (which must be [`ThreadSt::Ready`]) is about to
    /// wait in `wait_set`. Called by the implementations of waitable objects
    /// other than mutexes so that priority inheritance can reposition the
    /// thread in the wait set.
    pub fn thread_block_on_other_locked(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread: ThreadId,
        wait_set: WaitSetId,
    ) -> Result<(), BadIdError> {
        let thread_cb = self.thread_cb(thread)?;
        debug_assert_eq!(thread_cb.st.get(&*lock), ThreadSt::Ready);
        thread_cb
            .st
            .replace(&mut *lock, ThreadSt::BlockedOnOther(wait_set));
        Ok(())
    }

    /// Transition `thread` from [`ThreadSt::BlockedOnOther`] to
    /// [`ThreadSt::Ready`] and insert it into the ready set.
    pub fn thread_make_ready_locked(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread: ThreadId,
    ) -> Result<(), BadIdError> {
        let thread_cb = self.thread_cb(thread)?;
        debug_assert!(matches!(
            thread_cb.st.get(&*lock),
            ThreadSt::BlockedOnOther(_)
        ));
        self.make_ready(lock.borrow_mut(), thread);
        Ok(())
    }

    /// Mark `thread` as ready and tell the scheduler about it.
    pub(crate) fn make_ready(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, thread: ThreadId) {
        let thread_cb = &self.threads[thread];
        thread_cb.st.replace(&mut *lock, ThreadSt::Ready);
        let priority = thread_cb.effective_priority.get(&*lock);
        Traits::ready_insert(lock, thread, priority);
    }
}
