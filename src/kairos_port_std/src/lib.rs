#![doc = include_str!("./lib.md")]
#![deny(unsafe_op_in_unsafe_fn)]
use kairos_kernel::{
    Kernel, KernelTraits, Priority, QueryError, ThreadId, TickCount, Ticks, TimerMode, WaitSetId,
};
use once_cell::sync::OnceCell;
use spin::Mutex as SpinMutex;
use std::{
    cell::Cell,
    panic,
    thread::{self, Thread},
};

mod sched;

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate kairos_kernel;
/// Used by `use_port!`
#[doc(hidden)]
pub extern crate env_logger;

/// Implemented on a kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
#[doc(hidden)]
pub unsafe trait PortInstance: KernelTraits {
    fn port_state() -> &'static State;
}

/// The internal state of the port.
///
/// The simulated system has a single CPU. At any moment it's held by exactly
/// one of the following: a simulated thread (each of which is backed by an OS
/// thread), or the *driver*, the OS thread controlling the simulation through
/// [`run`] and [`advance_time`]. Interrupt handlers run on the driver.
#[doc(hidden)]
pub struct State {
    sched: SpinMutex<sched::SchedState>,
    driver: OnceCell<Thread>,
}

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    /// Not managed by the port. The driver has this role.
    Unknown,
    /// The driver running an interrupt handler.
    Interrupt,
    /// The backing thread for a simulated thread.
    Thread(ThreadId),
}

thread_local! {
    /// The current thread's role. It's automatically assigned after the
    /// creation of a thread managed by the port.
    static THREAD_ROLE: Cell<ThreadRole> = Cell::new(ThreadRole::Unknown);
}

fn thread_role() -> ThreadRole {
    THREAD_ROLE.with(Cell::get)
}

/// Assert that the current thread holds the simulated CPU.
fn expect_cpu_owner(st: &sched::SchedState) -> ThreadRole {
    let role = thread_role();
    match role {
        ThreadRole::Thread(thread) => assert_eq!(
            st.running,
            Some(thread),
            "{thread:?} is executing without holding the CPU"
        ),
        ThreadRole::Unknown | ThreadRole::Interrupt => assert_eq!(
            st.running, None,
            "the CPU is held by a simulated thread"
        ),
    }
    role
}

/// Assert that the current thread is a simulated thread and get its id.
fn expect_simulated_thread() -> ThreadId {
    match thread_role() {
        ThreadRole::Thread(thread) => thread,
        role => panic!("expected a simulated thread, but the current role is {role:?}"),
    }
}

/// Switches [`THREAD_ROLE`] back when dropped.
struct RoleGuard(ThreadRole);

impl Drop for RoleGuard {
    fn drop(&mut self) {
        THREAD_ROLE.with(|role| role.set(self.0));
    }
}

impl State {
    pub const fn new() -> Self {
        Self {
            sched: SpinMutex::new(sched::SchedState::new()),
            driver: OnceCell::new(),
        }
    }

    /// Register the current thread as the driver. Only one OS thread may
    /// drive a simulated system.
    fn claim_driver(&self) -> &Thread {
        assert_eq!(
            thread_role(),
            ThreadRole::Unknown,
            "this function cannot be called from a port-managed context"
        );
        let current = thread::current();
        let driver = self.driver.get_or_init(|| current.clone());
        assert_eq!(
            driver.id(),
            current.id(),
            "the simulated system is driven by another thread"
        );
        driver
    }

    /// Block until the current simulated thread is dispatched.
    fn wait_for_cpu(&self, thread: ThreadId) {
        loop {
            if self.sched.lock().running == Some(thread) {
                break;
            }
            thread::park();
        }
    }

    pub fn try_enter_cpu_lock(&self) -> bool {
        log::trace!("try_enter_cpu_lock");
        let mut st = self.sched.lock();
        expect_cpu_owner(&st);
        !std::mem::replace(&mut st.cpu_lock, true)
    }

    pub fn enter_cpu_lock(&self) {
        log::trace!("enter_cpu_lock");
        let mut st = self.sched.lock();
        expect_cpu_owner(&st);
        assert!(!st.cpu_lock, "CPU Lock is already active");
        st.cpu_lock = true;
    }

    pub fn leave_cpu_lock(&self) {
        log::trace!("leave_cpu_lock");
        let mut st = self.sched.lock();
        expect_cpu_owner(&st);
        assert!(st.cpu_lock, "CPU Lock is inactive");
        st.cpu_lock = false;
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        let st = self.sched.lock();
        expect_cpu_owner(&st);
        st.cpu_lock
    }

    pub fn is_interrupt_context(&self) -> bool {
        thread_role() == ThreadRole::Interrupt
    }

    pub fn current_thread(&self) -> Option<ThreadId> {
        match thread_role() {
            ThreadRole::Thread(thread) => Some(thread),
            ThreadRole::Unknown | ThreadRole::Interrupt => None,
        }
    }

    pub fn ready_insert(&self, thread: ThreadId, priority: Priority) {
        log::trace!("ready_insert({thread:?}, {priority})");
        let mut st = self.sched.lock();
        debug_assert!(st.cpu_lock);
        assert!(
            st.worker(thread).is_some(),
            "{thread:?} has no backing thread"
        );
        st.ready.push_back(thread, priority);
    }

    pub fn ready_reorder(&self, thread: ThreadId, priority: Priority) {
        log::trace!("ready_reorder({thread:?}, {priority})");
        let mut st = self.sched.lock();
        debug_assert!(st.cpu_lock);
        if !st.ready.reorder(thread, priority) {
            // The thread is running, or it has exited without releasing
            // its mutexes
            log::trace!("{thread:?} is not in the ready queue");
        }
    }

    pub fn wait_set_reorder(&self, wait_set: WaitSetId, thread: ThreadId, priority: Priority) {
        log::trace!("wait_set_reorder({wait_set:?}, {thread:?}, {priority})");
        let mut st = self.sched.lock();
        debug_assert!(st.cpu_lock);
        // Wait sets are owned by whoever blocked the thread on them, so
        // there's no ordering to maintain. Keep the change for the driver.
        st.wait_set_reorders.push((wait_set, thread, priority));
    }

    pub fn suspend_current(&self) {
        let thread = expect_simulated_thread();
        log::trace!("suspend_current({thread:?})");

        {
            let mut st = self.sched.lock();
            expect_cpu_owner(&st);
            assert!(st.cpu_lock, "CPU Lock is inactive");
            st.dispatch_next(self.driver.get());
        }

        self.wait_for_cpu(thread);
        self.sched.lock().cpu_lock = true;
        log::trace!("{thread:?} resumed");
    }

    pub fn reschedule(&self, current_priority: Priority) {
        // Interrupt handlers can't be preempted. The driver dispatches when
        // the handler returns.
        let ThreadRole::Thread(thread) = thread_role() else {
            return;
        };

        {
            let mut st = self.sched.lock();
            expect_cpu_owner(&st);
            match st.ready.highest_priority() {
                Some(priority) if priority > current_priority => {}
                _ => return,
            }
            log::trace!("{thread:?} (priority {current_priority}) is preempted");
            st.ready.push_front(thread, current_priority);
            st.dispatch_next(self.driver.get());
        }

        self.wait_for_cpu(thread);
        self.sched.lock().cpu_lock = true;
        log::trace!("{thread:?} resumed");
    }

    pub fn read_counter<Traits: PortInstance>(&self) -> Ticks<Traits> {
        Ticks::<Traits>::truncate_from_u64(self.sched.lock().counter)
    }

    pub fn arm_alarm<Traits: PortInstance>(&self, deadline: Ticks<Traits>) {
        log::trace!("arm_alarm({deadline:?})");
        self.sched.lock().alarm = Some(deadline.to_u64());
    }

    pub fn reprogram_alarm<Traits: PortInstance>(&self, deadline: Ticks<Traits>) {
        log::trace!("reprogram_alarm({deadline:?})");
        self.sched.lock().alarm = Some(deadline.to_u64());
    }

    pub fn disarm_alarm(&self) {
        log::trace!("disarm_alarm");
        self.sched.lock().alarm = None;
    }

    pub fn spawn<Traits: PortInstance>(
        &'static self,
        kernel: &Kernel<'_, Traits>,
        thread: ThreadId,
        entry: impl FnOnce() + Send + 'static,
    ) -> Result<(), QueryError> {
        self.claim_driver();
        let priority = kernel.thread_priority(thread)?;

        let join_handle = thread::spawn(move || {
            THREAD_ROLE.with(|role| role.set(ThreadRole::Thread(thread)));
            self.wait_for_cpu(thread);
            log::debug!("{thread:?} is now running");

            let result = panic::catch_unwind(panic::AssertUnwindSafe(entry));

            let mut st = self.sched.lock();
            match result {
                Ok(()) => log::debug!("{thread:?} exited"),
                Err(e) => {
                    log::debug!("{thread:?} panicked");
                    st.panic.get_or_insert(e);
                }
            }
            st.set_worker(thread, None);
            st.dispatch_next(self.driver.get());
        });

        let mut st = self.sched.lock();
        assert!(
            st.worker(thread).is_none(),
            "{thread:?} already has a backing thread"
        );
        st.set_worker(thread, Some(join_handle.thread().clone()));
        st.ready.push_back(thread, priority);
        log::debug!("spawned {thread:?} at priority {priority}");
        Ok(())
    }

    pub fn run(&self) {
        let driver = self.claim_driver();

        {
            let mut st = self.sched.lock();
            expect_cpu_owner(&st);
            assert!(!st.cpu_lock, "CPU Lock is active");
            st.dispatch_next(Some(driver));
        }

        loop {
            {
                let mut st = self.sched.lock();
                if st.running.is_none() {
                    // Propagate any panic that occurred in a simulated thread
                    if let Some(e) = st.panic.take() {
                        drop(st);
                        panic::resume_unwind(e);
                    }
                    break;
                }
            }
            thread::park();
        }
    }

    pub fn advance_time<Traits: PortInstance>(&self, ticks: u64, mut handler: impl FnMut()) {
        self.claim_driver();
        let mask = Ticks::<Traits>::truncate_from_u64(u64::MAX).to_u64();

        for _ in 0..ticks {
            let fire = {
                let mut st = self.sched.lock();
                expect_cpu_owner(&st);
                st.counter = st.counter.wrapping_add(1);
                match Traits::TIMER_MODE {
                    TimerMode::Periodic => true,
                    TimerMode::Tickless => {
                        let now = st.counter & mask;
                        if st.alarm == Some(now) {
                            st.alarm = None;
                            true
                        } else {
                            false
                        }
                    }
                }
            };

            if fire {
                log::trace!("timer interrupt");
                {
                    let _guard = RoleGuard(thread_role());
                    THREAD_ROLE.with(|role| role.set(ThreadRole::Interrupt));
                    handler();
                }
                self.run();
            }
        }
    }

    pub fn now(&self) -> u64 {
        self.sched.lock().counter
    }

    pub fn blocked_threads(&self) -> Vec<ThreadId> {
        self.sched.lock().blocked_threads()
    }

    pub fn take_wait_set_reorders(&self) -> Vec<(WaitSetId, ThreadId, Priority)> {
        std::mem::take(&mut self.sched.lock().wait_set_reorders)
    }
}

/// Create an OS thread backing the simulated thread `thread` and make it
/// ready at its current priority. It starts running `entry` when it's
/// dispatched by [`run`] (or by a thread giving up the CPU).
///
/// A simulated thread can be spawned again after its previous `entry`
/// returns.
///
/// # Panics
///
/// Panics if `thread` is alive or if the caller is not the driver.
pub fn spawn<Traits: PortInstance>(
    kernel: &Kernel<'_, Traits>,
    thread: ThreadId,
    entry: impl FnOnce() + Send + 'static,
) -> Result<(), QueryError> {
    Traits::port_state().spawn(kernel, thread, entry)
}

/// Dispatch ready threads until all of them exit or block.
///
/// If a simulated thread panics, the panic is propagated to the caller once
/// the CPU becomes idle.
pub fn run<Traits: PortInstance>() {
    Traits::port_state().run();
}

/// Advance the simulated counter by `ticks` ticks, calling `handler` as an
/// interrupt handler whenever the timer interrupt fires and then dispatching
/// the threads it has woken up.
///
/// In [`TimerMode::Periodic`] the interrupt fires on every tick, and
/// `handler` is expected to call [`Kernel::handle_tick`]. In
/// [`TimerMode::Tickless`] it fires when the counter reaches the alarm
/// deadline, and `handler` is expected to call [`Kernel::handle_alarm`].
pub fn advance_time<Traits: PortInstance>(ticks: u64, handler: impl FnMut()) {
    Traits::port_state().advance_time::<Traits>(ticks, handler);
}

/// Get the number of ticks elapsed since the simulation started.
pub fn now<Traits: PortInstance>() -> u64 {
    Traits::port_state().now()
}

/// List the live simulated threads that are waiting for something. When
/// called after [`run`], a thread listed here will never run again unless
/// something (e.g., a timer) wakes it up.
pub fn blocked_threads<Traits: PortInstance>() -> Vec<ThreadId> {
    Traits::port_state().blocked_threads()
}

/// Collect the priority changes the kernel has reported, in order, for
/// threads blocked on a wait set (i.e., outside the kernel's mutex wait
/// queues) since the last call.
pub fn take_wait_set_reorders<Traits: PortInstance>() -> Vec<(WaitSetId, ThreadId, Priority)> {
    Traits::port_state().take_wait_set_reorders()
}

/// Define a kernel trait type implementing the port traits.
///
/// ```rust,ignore
/// kairos_port_std::use_port! {
///     unsafe struct SystemTraits;
///     type Ticks = u32;
///     const TIMER_MODE = Tickless;
///     const MIN_DELAY = 1;
///     const MAX_ALARM_DELAY = u32::MAX / 2;
/// }
/// ```
#[macro_export]
macro_rules! use_port {
    (
        unsafe $vis:vis struct $SystemTraits:ident;
        type Ticks = $Ticks:ty;
        const TIMER_MODE = $mode:ident;
        const MIN_DELAY = $min_delay:expr;
        const MAX_ALARM_DELAY = $max_alarm_delay:expr;
    ) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::kairos_kernel::{
                CpuLockTokenRefMut, PortScheduler, PortThreading, PortTimer, Priority, ThreadId,
                TimerMode, WaitSetId,
            };
            use $crate::{PortInstance, State};

            pub(super) static PORT_STATE: State = State::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            unsafe impl PortThreading for $SystemTraits {
                unsafe fn try_enter_cpu_lock() -> bool {
                    PORT_STATE.try_enter_cpu_lock()
                }

                unsafe fn enter_cpu_lock() {
                    PORT_STATE.enter_cpu_lock()
                }

                unsafe fn leave_cpu_lock() {
                    PORT_STATE.leave_cpu_lock()
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active()
                }

                fn is_interrupt_context() -> bool {
                    PORT_STATE.is_interrupt_context()
                }
            }

            unsafe impl PortScheduler for $SystemTraits {
                fn current_thread() -> Option<ThreadId> {
                    PORT_STATE.current_thread()
                }

                fn ready_insert(_: CpuLockTokenRefMut<'_, Self>, thread: ThreadId, priority: Priority) {
                    PORT_STATE.ready_insert(thread, priority)
                }

                fn ready_reorder(_: CpuLockTokenRefMut<'_, Self>, thread: ThreadId, priority: Priority) {
                    PORT_STATE.ready_reorder(thread, priority)
                }

                fn wait_set_reorder(
                    _: CpuLockTokenRefMut<'_, Self>,
                    wait_set: WaitSetId,
                    thread: ThreadId,
                    priority: Priority,
                ) {
                    PORT_STATE.wait_set_reorder(wait_set, thread, priority)
                }

                fn suspend_current(_: CpuLockTokenRefMut<'_, Self>) {
                    PORT_STATE.suspend_current()
                }

                fn reschedule(_: CpuLockTokenRefMut<'_, Self>, current_priority: Priority) {
                    PORT_STATE.reschedule(current_priority)
                }
            }

            impl PortTimer for $SystemTraits {
                type Ticks = $Ticks;

                const TIMER_MODE: TimerMode = TimerMode::$mode;
                const MIN_DELAY: $Ticks = $min_delay;
                const MAX_ALARM_DELAY: $Ticks = $max_alarm_delay;

                unsafe fn read_counter() -> $Ticks {
                    PORT_STATE.read_counter::<Self>()
                }

                unsafe fn arm_alarm(deadline: $Ticks) {
                    PORT_STATE.arm_alarm::<Self>(deadline)
                }

                unsafe fn reprogram_alarm(deadline: $Ticks) {
                    PORT_STATE.reprogram_alarm::<Self>(deadline)
                }

                unsafe fn disarm_alarm() {
                    PORT_STATE.disarm_alarm()
                }
            }
        }
    };
}
