#![doc = include_str!("./lib.md")]
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]
use core::fmt;
use num_traits::{AsPrimitive, PrimInt, Unsigned, WrappingAdd, WrappingSub};

#[macro_use]
pub mod utils;

mod error;
mod klock;
mod mutex;
mod thread;
mod vtimer;


pub use self::{
    error::*,
    klock::{lock_cpu, CpuLockCell, CpuLockGuard, CpuLockTag, CpuLockTokenRefMut},
    mutex::MutexCb,
    thread::{ThreadCb, ThreadSt},
    vtimer::{TimerCallback, VirtualTimer},
};

use self::utils::{Init, Pool};

/// Thread priority. Larger values are more urgent.
pub type Priority = u32;

define_id! {
    /// Identifies a thread control block in [`Kernel`]'s thread pool.
    pub struct ThreadId;
}

define_id! {
    /// Identifies a mutex in [`Kernel`]'s mutex pool.
    pub struct MutexId;
}

define_id! {
    /// Identifies a virtual timer in [`Kernel`]'s timer pool.
    pub struct TimerId;
}

define_id! {
    /// Identifies a priority-ordered wait structure that is not a mutex (a
    /// semaphore, a condition variable, a message queue, ...). Such structures
    /// are managed by the scheduler, not by this crate.
    pub struct WaitSetId;
}

/// Implemented by a port. Provides CPU Lock, the kernel's critical section.
///
/// # Safety
///
/// `try_enter_cpu_lock` must not succeed while CPU Lock is active, and no
/// kernel code may run concurrently while it's active.
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    /// Enter a CPU Lock state if it's inactive. Return `true` on success.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Enter a CPU Lock state. CPU Lock must be inactive.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn enter_cpu_lock();

    /// Leave a CPU Lock state. CPU Lock must be active.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn leave_cpu_lock();

    fn is_cpu_lock_active() -> bool;

    /// Return `true` if the current context is an interrupt context.
    fn is_interrupt_context() -> bool;
}

/// Implemented by a port. The scheduler proper, as seen by the mutex engine.
///
/// All methods are called with CPU Lock active, which is witnessed by the
/// `lock` parameter.
///
/// # Safety
///
/// `suspend_current` must not return until the current thread's
/// [`ThreadSt`] has been changed to something else by the kernel (or, for
/// foreign wait sets, by the scheduler), and must reacquire CPU Lock before
/// returning.
pub unsafe trait PortScheduler: PortThreading {
    /// Get the currently running thread. Returns `None` before the first
    /// thread is dispatched.
    fn current_thread() -> Option<ThreadId>;

    /// Insert `thread` into the ready set at `priority`.
    fn ready_insert(lock: CpuLockTokenRefMut<'_, Self>, thread: ThreadId, priority: Priority);

    /// Move `thread` (which is in the ready set) to the position
    /// corresponding to its new priority.
    fn ready_reorder(lock: CpuLockTokenRefMut<'_, Self>, thread: ThreadId, priority: Priority);

    /// Move `thread` (which is waiting in `wait_set`) to the position
    /// corresponding to its new priority.
    fn wait_set_reorder(
        lock: CpuLockTokenRefMut<'_, Self>,
        wait_set: WaitSetId,
        thread: ThreadId,
        priority: Priority,
    );

    /// Switch the current thread out. The kernel has already put it in a
    /// blocked state.
    fn suspend_current(lock: CpuLockTokenRefMut<'_, Self>);

    /// Switch to a ready thread if its priority exceeds
    /// `current_priority`.
    fn reschedule(lock: CpuLockTokenRefMut<'_, Self>, current_priority: Priority);
}

/// Selects how the virtual timer list is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// A periodic tick interrupt calls [`Kernel::handle_tick`].
    Periodic,
    /// A free-running counter and a compare-match alarm drive the timers.
    /// The alarm interrupt calls [`Kernel::handle_alarm`].
    Tickless,
}

/// Unsigned tick count with wrap-around arithmetic.
pub trait TickCount:
    PrimInt
    + Unsigned
    + WrappingAdd
    + WrappingSub
    + AsPrimitive<u64>
    + fmt::Debug
    + Init
    + Send
    + Sync
    + 'static
{
    /// Convert a `u64`, discarding the bits that don't fit.
    fn truncate_from_u64(x: u64) -> Self;

    /// Zero-extend to `u64`.
    #[inline]
    fn to_u64(self) -> u64 {
        self.as_()
    }
}

macro_rules! impl_tick_count {
    ( $( $ty:ty ),* ) => {
        $(
            impl TickCount for $ty {
                #[inline]
                fn truncate_from_u64(x: u64) -> Self {
                    x as Self
                }
            }
        )*
    };
}

impl_tick_count!(u16, u32, u64);

/// Implemented by a port. The alarm timer hardware (or the periodic tick).
pub trait PortTimer: PortThreading {
    /// The counter type.
    type Ticks: TickCount;

    const TIMER_MODE: TimerMode;

    /// The minimum distance between the current time and an alarm deadline
    /// that the hardware can reliably honor. Must be non-zero.
    const MIN_DELAY: Self::Ticks;

    /// The maximum distance between the current time and an alarm deadline.
    const MAX_ALARM_DELAY: Self::Ticks;

    /// Read the free-running counter. Not called in [`TimerMode::Periodic`].
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn read_counter() -> Self::Ticks;

    /// Start the alarm, which was stopped, at `deadline`.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn arm_alarm(deadline: Self::Ticks);

    /// Change the deadline of the running alarm.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn reprogram_alarm(deadline: Self::Ticks);

    /// Stop the alarm.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn disarm_alarm();
}

/// The combination of all port traits the kernel needs.
pub trait KernelTraits: PortThreading + PortScheduler + PortTimer {}

impl<T: PortThreading + PortScheduler + PortTimer> KernelTraits for T {}

/// The tick type of `Traits`.
pub type Ticks<Traits> = <Traits as PortTimer>::Ticks;

/// A kernel instance: the object pools plus the virtual timer list.
///
/// The pools are borrowed, so an instance typically lives in a `static`
/// alongside them:
///
/// ```rust,ignore
/// static THREADS: [ThreadCb<SystemTraits>; 2] = [ThreadCb::new(1), ThreadCb::new(2)];
/// static MUTEXES: [MutexCb<SystemTraits>; 1] = Init::INIT;
/// static TIMERS: [VirtualTimer<SystemTraits>; 1] = Init::INIT;
/// static KERNEL: Kernel<'static, SystemTraits> = Kernel::new(&THREADS, &MUTEXES, &TIMERS);
/// ```
pub struct Kernel<'a, Traits: KernelTraits> {
    pub(crate) threads: Pool<'a, ThreadCb<Traits>, ThreadId>,
    pub(crate) mutexes: Pool<'a, MutexCb<Traits>, MutexId>,
    pub(crate) timers: Pool<'a, VirtualTimer<Traits>, TimerId>,
    pub(crate) vt_list: vtimer::VirtualTimerList<Traits>,
}

impl<'a, Traits: KernelTraits> Kernel<'a, Traits> {
    pub const fn new(
        threads: &'a [ThreadCb<Traits>],
        mutexes: &'a [MutexCb<Traits>],
        timers: &'a [VirtualTimer<Traits>],
    ) -> Self {
        Self {
            threads: Pool::new(threads),
            mutexes: Pool::new(mutexes),
            timers: Pool::new(timers),
            vt_list: vtimer::VirtualTimerList::new(),
        }
    }

    /// Enter CPU Lock. Fails with `BadContext` if it's already active.
    ///
    /// The returned guard provides the token required by the `*_locked`
    /// operations.
    #[inline]
    pub fn lock_cpu(&self) -> Result<CpuLockGuard<Traits>, BadContextError> {
        klock::lock_cpu()
    }

    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    pub fn num_mutexes(&self) -> usize {
        self.mutexes.len()
    }

    pub fn num_timers(&self) -> usize {
        self.timers.len()
    }

    pub(crate) fn thread_cb(&self, thread: ThreadId) -> Result<&'a ThreadCb<Traits>, BadIdError> {
        self.threads.get(thread).ok_or(BadIdError::BadId)
    }

    pub(crate) fn mutex_cb(&self, mutex: MutexId) -> Result<&'a MutexCb<Traits>, BadIdError> {
        self.mutexes.get(mutex).ok_or(BadIdError::BadId)
    }

    pub(crate) fn timer_cb(&self, timer: TimerId) -> Result<&'a VirtualTimer<Traits>, BadIdError> {
        self.timers.get(timer).ok_or(BadIdError::BadId)
    }
}

impl<Traits: KernelTraits> fmt::Debug for Kernel<'_, Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("threads", &self.threads)
            .field("mutexes", &self.mutexes)
            .field("timers", &self.timers)
            .finish_non_exhaustive()
    }
}
