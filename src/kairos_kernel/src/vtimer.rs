//! Virtual timers
//!
//! All armed timers are kept in a single list sorted by deadline. Each node
//! stores the difference between its deadline and the preceding node's
//! deadline (a *delta*), so the tick handler only has to touch the first node.
//! See [`VirtualTimerList`] for the layout.
//!
//! In [`TimerMode::Tickless`], the list is driven by a free-running counter
//! and a single alarm that is programmed for the first node's deadline. The
//! alarm's reach is limited by [`PortTimer::MAX_ALARM_DELAY`]; timers farther
//! in the future are reached by re-arming the alarm from the service routine.
//!
//! [`PortTimer::MAX_ALARM_DELAY`]: crate::PortTimer::MAX_ALARM_DELAY
use core::fmt;
use num_traits::{One, WrappingAdd, WrappingSub, Zero};

use crate::{
    error::{BadContextError, QueryError, ResetTimerError, SetTimerError},
    klock::{lock_cpu, relock_cpu, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    utils::{
        intrusive_list::{Link, ListAccessorCell, ListHead},
        Init,
    },
    Kernel, KernelTraits, Ticks, TimerId, TimerMode,
};

#[cfg(feature = "timestamp")]
use {crate::TickCount, num_traits::AsPrimitive};

/// The callback function of a virtual timer. Receives the kernel and the
/// argument specified when the timer was set.
///
/// Callbacks run with CPU Lock inactive. They may set, reset, or restart any
/// timer, including the one being fired, but must not block.
pub type TimerCallback<Traits> = for<'k> fn(&Kernel<'k, Traits>, usize);

/// A virtual timer.
pub struct VirtualTimer<Traits: KernelTraits> {
    /// The number of ticks between the preceding node's deadline (or the
    /// list's base time if this is the first node) and this timer's
    /// deadline. Meaningless while the timer is disarmed.
    pub(crate) delta: CpuLockCell<Traits, Ticks<Traits>>,

    /// Links this timer into [`VirtualTimerList`]. `Some(_)` iff armed.
    pub(crate) link: CpuLockCell<Traits, Option<Link<TimerId>>>,

    pub(crate) callback: CpuLockCell<Traits, Option<(TimerCallback<Traits>, usize)>>,

    /// The period of a continuous timer, or zero for a one-shot timer.
    pub(crate) reload: CpuLockCell<Traits, Ticks<Traits>>,
}

impl<Traits: KernelTraits> Init for VirtualTimer<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        delta: Init::INIT,
        link: Init::INIT,
        callback: Init::INIT,
        reload: Init::INIT,
    };
}

impl<Traits: KernelTraits> VirtualTimer<Traits> {
    pub const fn new() -> Self {
        Self::INIT
    }
}

impl<Traits: KernelTraits> Default for VirtualTimer<Traits> {
    fn default() -> Self {
        Self::INIT
    }
}

impl<Traits: KernelTraits> fmt::Debug for VirtualTimer<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VirtualTimer")
            .field("self", &(self as *const _))
            .field("delta", &self.delta)
            .field("link", &self.link)
            .field("reload", &self.reload)
            .finish_non_exhaustive()
    }
}

/// The list of armed timers.
///
/// <center>
///
#[doc = svgbobdoc::transform!(
/// ```svgbob
///  base_time                  now
///     |                        |
/// ----*-------------*----------+---------*-------------------*------> time
///     |<-- delta 0 ->|                   |                   |
///     |              |<---- delta 1 ---->|                   |
///     |              |                   |<---- delta 2 ---->|
///               timer 0             timer 1             timer 2
/// ```
)]
///
/// </center>
///
/// The deadline of the `k`-th node is `base_time` plus the sum of the deltas
/// of the nodes `0..=k`. The list end takes the role of a node with an
/// infinite delta.
///
/// In [`TimerMode::Periodic`], `base_time` is the current time: the tick
/// handler increments it and decrements the first delta in lockstep. In
/// [`TimerMode::Tickless`], `base_time` lags behind the counter and is only
/// brought forward when the list is serviced or compressed.
pub(crate) struct VirtualTimerList<Traits: KernelTraits> {
    pub(crate) head: CpuLockCell<Traits, ListHead<TimerId>>,

    pub(crate) base_time: CpuLockCell<Traits, Ticks<Traits>>,

    /// The minimum distance between the current time and a programmed alarm
    /// deadline. Starts at `PortTimer::MIN_DELAY` and grows every time the
    /// alarm is found to have been programmed too close.
    pub(crate) min_delay: CpuLockCell<Traits, Ticks<Traits>>,

    /// The number of times the alarm was found to have been programmed too
    /// close to the current time.
    pub(crate) alarm_faults: CpuLockCell<Traits, usize>,

    /// The last value returned by [`Kernel::get_timestamp`].
    #[cfg(feature = "timestamp")]
    pub(crate) last_stamp: CpuLockCell<Traits, u64>,
}

impl<Traits: KernelTraits> VirtualTimerList<Traits> {
    pub(crate) const fn new() -> Self {
        Self {
            head: Init::INIT,
            base_time: Init::INIT,
            min_delay: CpuLockCell::new(Traits::MIN_DELAY),
            alarm_faults: Init::INIT,
            #[cfg(feature = "timestamp")]
            last_stamp: Init::INIT,
        }
    }
}

/// Get a `ListAccessorCell` used to access the timer list.
macro_rules! vt_list_accessor {
    ($kernel:expr, $key:expr) => {
        ListAccessorCell::new(
            &$kernel.vt_list.head,
            &$kernel.timers,
            |timer: &VirtualTimer<_>| &timer.link,
            $key,
        )
    };
}

#[inline]
fn read_counter<Traits: KernelTraits>() -> Ticks<Traits> {
    // Safety: We are the kernel
    unsafe { Traits::read_counter() }
}

impl<'a, Traits: KernelTraits> Kernel<'a, Traits> {
    /// Arm a one-shot timer to call `callback(kernel, arg)` after `delay`
    /// ticks.
    ///
    /// The timer must be disarmed. Setting an armed timer is a contract
    /// violation, reported by a debug assertion; release builds restart it.
    pub fn timer_set(
        &self,
        timer: TimerId,
        delay: Ticks<Traits>,
        callback: TimerCallback<Traits>,
        arg: usize,
    ) -> Result<(), SetTimerError> {
        let mut lock = lock_cpu::<Traits>()?;
        self.timer_set_locked(lock.borrow_mut(), timer, delay, callback, arg)
    }

    pub fn timer_set_locked(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        timer: TimerId,
        delay: Ticks<Traits>,
        callback: TimerCallback<Traits>,
        arg: usize,
    ) -> Result<(), SetTimerError> {
        self.set_core(lock, timer, delay, Zero::zero(), (callback, arg), false)
    }

    /// Arm a continuous timer. The callback is first called after `delay`
    /// ticks and then every `reload` ticks until the timer is reset or
    /// cancelled.
    pub fn timer_set_continuous(
        &self,
        timer: TimerId,
        delay: Ticks<Traits>,
        reload: Ticks<Traits>,
        callback: TimerCallback<Traits>,
        arg: usize,
    ) -> Result<(), SetTimerError> {
        let mut lock = lock_cpu::<Traits>()?;
        if reload.is_zero() {
            return Err(SetTimerError::BadParam);
        }
        self.set_core(lock.borrow_mut(), timer, delay, reload, (callback, arg), false)
    }

    /// Like [`Self::timer_set`], but disarms the timer first if it's armed.
    pub fn timer_restart(
        &self,
        timer: TimerId,
        delay: Ticks<Traits>,
        callback: TimerCallback<Traits>,
        arg: usize,
    ) -> Result<(), SetTimerError> {
        let mut lock = lock_cpu::<Traits>()?;
        self.set_core(lock.borrow_mut(), timer, delay, Zero::zero(), (callback, arg), true)
    }

    fn set_core(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        timer: TimerId,
        delay: Ticks<Traits>,
        reload: Ticks<Traits>,
        callback: (TimerCallback<Traits>, usize),
        restart: bool,
    ) -> Result<(), SetTimerError> {
        let timer_cb = self.timer_cb(timer)?;
        if delay.is_zero() {
            return Err(SetTimerError::BadParam);
        }

        if timer_cb.link.read(&*lock).is_some() {
            debug_assert!(restart, "{timer:?} is already armed");
            self.dequeue(lock.borrow_mut(), timer);
        }

        timer_cb.callback.replace(&mut *lock, Some(callback));
        timer_cb.reload.replace(&mut *lock, reload);
        self.enqueue(lock, timer, delay);
        Ok(())
    }

    /// Disarm an armed timer. This also stops a continuous timer.
    ///
    /// Resetting a disarmed timer is a contract violation, reported by a
    /// debug assertion; it's a no-op in release builds. Use
    /// [`Self::timer_cancel`] if the timer might have already fired.
    pub fn timer_reset(&self, timer: TimerId) -> Result<(), ResetTimerError> {
        let mut lock = lock_cpu::<Traits>()?;
        self.timer_reset_locked(lock.borrow_mut(), timer)
    }

    pub fn timer_reset_locked(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        timer: TimerId,
    ) -> Result<(), ResetTimerError> {
        let armed = self.timer_cancel_locked(lock, timer)?;
        debug_assert!(armed, "{timer:?} is not armed");
        Ok(())
    }

    /// Disarm a timer if it's armed. Returns `true` if it was.
    pub fn timer_cancel(&self, timer: TimerId) -> Result<bool, ResetTimerError> {
        let mut lock = lock_cpu::<Traits>()?;
        self.timer_cancel_locked(lock.borrow_mut(), timer)
    }

    pub fn timer_cancel_locked(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        timer: TimerId,
    ) -> Result<bool, ResetTimerError> {
        let timer_cb = self.timer_cb(timer)?;
        timer_cb.reload.replace(&mut *lock, Zero::zero());

        if timer_cb.link.read(&*lock).is_some() {
            self.dequeue(lock, timer);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn timer_is_armed(&self, timer: TimerId) -> Result<bool, QueryError> {
        let mut lock = lock_cpu::<Traits>()?;
        self.timer_is_armed_locked(lock.borrow_mut(), timer)
    }

    pub fn timer_is_armed_locked(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        timer: TimerId,
    ) -> Result<bool, QueryError> {
        Ok(self.timer_cb(timer)?.link.read(&*lock).is_some())
    }

    /// Get the number of ticks left until the timer fires, or `None` if it's
    /// disarmed. An overdue timer reports zero.
    pub fn timer_remaining(&self, timer: TimerId) -> Result<Option<Ticks<Traits>>, QueryError> {
        let mut lock = lock_cpu::<Traits>()?;
        let timer_cb = self.timer_cb(timer)?;
        if timer_cb.link.read(&*lock).is_none() {
            return Ok(None);
        }

        let mut deadline = Ticks::<Traits>::zero();
        let mut cursor = self.vt_list.head.get(&*lock).first;
        while let Some(other) = cursor {
            deadline = deadline + self.timers[other].delta.get(&*lock);
            if other == timer {
                break;
            }
            cursor = vt_list_accessor!(self, lock.borrow_mut()).next(other);
        }

        let elapsed = self.elapsed(lock.borrow_mut()).1;
        Ok(Some(if deadline > elapsed {
            deadline - elapsed
        } else {
            Zero::zero()
        }))
    }

    /// Get the number of times the alarm was programmed too close to the
    /// current time and had to be retried with a larger margin.
    pub fn timer_alarm_faults(&self) -> Result<usize, BadContextError> {
        let lock = lock_cpu::<Traits>()?;
        Ok(self.vt_list.alarm_faults.get(&*lock))
    }

    /// Get the current system time.
    ///
    /// In [`TimerMode::Periodic`], this is the number of ticks processed by
    /// [`Self::handle_tick`]. In [`TimerMode::Tickless`], this is the
    /// counter value.
    pub fn system_time(&self) -> Result<Ticks<Traits>, BadContextError> {
        let mut lock = lock_cpu::<Traits>()?;
        Ok(self.current_time(lock.borrow_mut()))
    }

    /// Check if the current system time is in the range `start..end`, which
    /// may wrap around.
    pub fn time_is_within(
        &self,
        start: Ticks<Traits>,
        end: Ticks<Traits>,
    ) -> Result<bool, BadContextError> {
        let now = self.system_time()?;
        Ok(now.wrapping_sub(&start) < end.wrapping_sub(&start))
    }

    /// Get a 64-bit timestamp that never goes backwards.
    ///
    /// Must be called at least once every `Ticks::MAX` ticks. Otherwise the
    /// wrap-arounds in between are not accounted for.
    #[cfg(feature = "timestamp")]
    pub fn get_timestamp(&self) -> Result<u64, BadContextError> {
        let mut lock = lock_cpu::<Traits>()?;
        Ok(self.get_timestamp_locked(lock.borrow_mut()))
    }

    #[cfg(feature = "timestamp")]
    pub fn get_timestamp_locked(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> u64 {
        let now = self.current_time(lock.borrow_mut());
        let last = self.vt_list.last_stamp.get(&*lock);
        let elapsed: u64 = now
            .wrapping_sub(&Ticks::<Traits>::truncate_from_u64(last))
            .as_();
        let stamp = last.wrapping_add(elapsed);
        debug_assert!(stamp >= last, "timestamp went backwards");
        self.vt_list.last_stamp.replace(&mut *lock, stamp);
        stamp
    }

    /// Restart the timestamp sequence from the current system time.
    #[cfg(feature = "timestamp")]
    pub fn reset_timestamp(&self) -> Result<(), BadContextError> {
        let mut lock = lock_cpu::<Traits>()?;
        let now: u64 = self.current_time(lock.borrow_mut()).as_();
        self.vt_list.last_stamp.replace(&mut *lock, now);
        Ok(())
    }

    /// The periodic tick interrupt handler. Advances the system time by one
    /// tick and fires expired timers.
    pub fn handle_tick(&self) -> Result<(), BadContextError> {
        debug_assert_eq!(
            Traits::TIMER_MODE,
            TimerMode::Periodic,
            "`handle_tick` called in tickless mode"
        );

        let mut lock = lock_cpu::<Traits>()?;
        let list = &self.vt_list;

        list.base_time
            .replace_with(&mut *lock, |t| t.wrapping_add(&Ticks::<Traits>::one()));

        if let Some(head) = list.head.get(&*lock).first {
            self.timers[head].delta.replace_with(&mut *lock, |d| {
                if d.is_zero() {
                    *d
                } else {
                    *d - Ticks::<Traits>::one()
                }
            });
        }

        while let Some(head) = list.head.get(&*lock).first {
            if !self.timers[head].delta.get(&*lock).is_zero() {
                break;
            }
            lock = self.expire(lock, head);
        }

        Ok(())
    }

    /// The alarm interrupt handler. Fires expired timers and programs the
    /// alarm for the next deadline.
    pub fn handle_alarm(&self) -> Result<(), BadContextError> {
        debug_assert_eq!(
            Traits::TIMER_MODE,
            TimerMode::Tickless,
            "`handle_alarm` called in periodic mode"
        );

        let mut lock = lock_cpu::<Traits>()?;
        let list = &self.vt_list;

        while let Some(head) = list.head.get(&*lock).first {
            let head_cb = &self.timers[head];
            let (now, elapsed) = self.elapsed(lock.borrow_mut());
            let head_delta = head_cb.delta.get(&*lock);

            if elapsed < head_delta {
                // Not yet. Fold the elapsed time into the list and wait for
                // the rest.
                let remaining = head_delta - elapsed;
                list.base_time.replace(&mut *lock, now);
                head_cb.delta.replace(&mut *lock, remaining);
                self.program_alarm(lock.borrow_mut(), now, remaining, true);
                break;
            }

            list.base_time
                .replace_with(&mut *lock, |t| t.wrapping_add(&head_delta));
            head_cb.delta.replace(&mut *lock, Zero::zero());
            lock = self.expire(lock, head);
        }

        Ok(())
    }

    /// Unlink the first timer, whose deadline has been folded into
    /// `base_time`, and call its callback with CPU Lock released.
    fn expire(&self, mut lock: CpuLockGuard<Traits>, timer: TimerId) -> CpuLockGuard<Traits> {
        let list = &self.vt_list;
        let timer_cb = &self.timers[timer];

        vt_list_accessor!(self, lock.borrow_mut()).remove(timer);
        if Traits::TIMER_MODE == TimerMode::Tickless && list.head.get(&*lock).is_empty() {
            // Safety: We are the kernel
            unsafe { Traits::disarm_alarm() };
        }

        let fired_at = list.base_time.get(&*lock);
        let callback = timer_cb.callback.get(&*lock);

        drop(lock);
        if let Some((callback, arg)) = callback {
            callback(self, arg);
        }
        let mut lock = relock_cpu::<Traits>();

        let reload = timer_cb.reload.get(&*lock);
        if !reload.is_zero() && timer_cb.link.read(&*lock).is_none() {
            // Stay in phase with the original deadline, skipping the periods
            // that were missed entirely
            let late = self.current_time(lock.borrow_mut()).wrapping_sub(&fired_at);
            self.enqueue(lock.borrow_mut(), timer, reload - late % reload);
        }

        lock
    }

    fn current_time(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> Ticks<Traits> {
        match Traits::TIMER_MODE {
            TimerMode::Periodic => self.vt_list.base_time.get(&*lock),
            TimerMode::Tickless => read_counter::<Traits>(),
        }
    }

    /// Get the current time and the time elapsed since `base_time`.
    fn elapsed(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> (Ticks<Traits>, Ticks<Traits>) {
        let base = self.vt_list.base_time.get(&*lock);
        match Traits::TIMER_MODE {
            TimerMode::Periodic => (base, Zero::zero()),
            TimerMode::Tickless => {
                let now = read_counter::<Traits>();
                (now, now.wrapping_sub(&base))
            }
        }
    }

    /// Insert a disarmed timer so that it expires `delay` ticks from now.
    fn enqueue(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, timer: TimerId, delay: Ticks<Traits>) {
        let list = &self.vt_list;

        if Traits::TIMER_MODE == TimerMode::Periodic {
            self.insert_sorted(lock, timer, delay);
            return;
        }

        let now = read_counter::<Traits>();

        if list.head.get(&*lock).is_empty() {
            // The alarm is stopped. Measure from the current time.
            list.base_time.replace(&mut *lock, now);
            self.insert_sorted(lock.borrow_mut(), timer, delay);
            self.program_alarm(lock, now, delay, false);
            return;
        }

        let elapsed = now.wrapping_sub(&list.base_time.get(&*lock));
        let mut delta = elapsed.wrapping_add(&delay);
        if delta < elapsed {
            // The deadline is not representable relative to `base_time`
            self.compress(lock.borrow_mut(), now, elapsed);
            delta = delay;
        }

        self.insert_sorted(lock.borrow_mut(), timer, delta);

        if list.head.get(&*lock).first == Some(timer) {
            self.program_alarm(lock, now, delay, true);
        }
    }

    /// Insert `timer` at the position corresponding to `delta`, measured from
    /// `base_time`. Timers with equal deadlines fire in insertion order.
    fn insert_sorted(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        timer: TimerId,
        mut delta: Ticks<Traits>,
    ) {
        let mut cursor = self.vt_list.head.get(&*lock).first;
        while let Some(other) = cursor {
            let other_delta = self.timers[other].delta.get(&*lock);
            if other_delta > delta {
                // Re-encode the following node relative to the new one
                self.timers[other]
                    .delta
                    .replace(&mut *lock, other_delta - delta);
                break;
            }
            delta = delta - other_delta;
            cursor = vt_list_accessor!(self, lock.borrow_mut()).next(other);
        }

        self.timers[timer].delta.replace(&mut *lock, delta);
        vt_list_accessor!(self, lock).insert(timer, cursor);
    }

    /// Move `base_time` to `now` (which is `elapsed` ticks after it),
    /// consuming the deltas of the nodes that were passed. Overdue nodes end
    /// up with a zero delta.
    fn compress(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        now: Ticks<Traits>,
        elapsed: Ticks<Traits>,
    ) {
        self.vt_list.base_time.replace(&mut *lock, now);

        let mut remaining = elapsed;
        let mut cursor = self.vt_list.head.get(&*lock).first;
        while let Some(timer) = cursor {
            if remaining.is_zero() {
                break;
            }
            let delta = self.timers[timer].delta.get(&*lock);
            if delta >= remaining {
                self.timers[timer]
                    .delta
                    .replace(&mut *lock, delta - remaining);
                break;
            }
            self.timers[timer].delta.replace(&mut *lock, Zero::zero());
            remaining = remaining - delta;
            cursor = vt_list_accessor!(self, lock.borrow_mut()).next(timer);
        }
    }

    /// Unlink an armed timer.
    fn dequeue(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, timer: TimerId) {
        let list = &self.vt_list;
        let was_first = list.head.get(&*lock).first == Some(timer);
        let delta = self.timers[timer].delta.get(&*lock);

        let next = vt_list_accessor!(self, lock.borrow_mut()).next(timer);
        vt_list_accessor!(self, lock.borrow_mut()).remove(timer);

        if let Some(next) = next {
            self.timers[next]
                .delta
                .replace_with(&mut *lock, |d| *d + delta);
        }

        if !was_first || Traits::TIMER_MODE == TimerMode::Periodic {
            return;
        }

        let Some(next) = next else {
            // Safety: We are the kernel
            unsafe { Traits::disarm_alarm() };
            return;
        };

        // The alarm is programmed for the removed timer's deadline (or
        // earlier), which is not later than the new first timer's. Leave it
        // as it is, and it will fire early. Only if the new deadline is
        // closer than the minimum delay, re-arm for it.
        let (now, elapsed) = self.elapsed(lock.borrow_mut());
        let head_delta = self.timers[next].delta.get(&*lock);
        if elapsed < head_delta {
            let remaining = head_delta - elapsed;
            if remaining < list.min_delay.get(&*lock) {
                self.program_alarm(lock, now, remaining, true);
            }
        }
    }

    /// Program the alarm to fire `delay` ticks after `now`, clamped to the
    /// hardware's range. `running` selects between `reprogram_alarm` and
    /// `arm_alarm`.
    ///
    /// After programming, the counter is checked to see if the deadline was
    /// passed before the alarm took effect. If so, the alarm is reprogrammed
    /// with a larger minimum delay, which is kept for subsequent calls.
    fn program_alarm(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        mut now: Ticks<Traits>,
        delay: Ticks<Traits>,
        mut running: bool,
    ) {
        let list = &self.vt_list;
        let max_delay = Traits::MAX_ALARM_DELAY;
        let mut min_delay = list.min_delay.get(&*lock);
        let mut delay = delay.max(min_delay).min(max_delay);
        let mut faults = 0;

        loop {
            let deadline = now.wrapping_add(&delay);

            // Safety: We are the kernel
            unsafe {
                if running {
                    Traits::reprogram_alarm(deadline);
                } else {
                    Traits::arm_alarm(deadline);
                    running = true;
                }
            }

            let then = read_counter::<Traits>();
            if then.wrapping_sub(&now) < delay {
                break;
            }

            faults += 1;
            if min_delay < max_delay {
                min_delay = min_delay + Ticks::<Traits>::one();
            }
            now = then;
            delay = min_delay;
        }

        if faults > 0 {
            list.min_delay.replace(&mut *lock, min_delay);
            list.alarm_faults.replace_with(&mut *lock, |f| *f + faults);
        }
    }
}
