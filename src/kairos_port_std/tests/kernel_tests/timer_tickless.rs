//! Virtual timers driven by a free-running counter and an alarm
use kairos_kernel::{Kernel, LockMutexError, MutexId, ThreadId, TimerId};
use kairos_port_std::{advance_time, now, run, spawn};

use crate::{init_logger, park, Trace};

define_kernel! {
    mod one_shot {
        type Ticks = u32;
        const TIMER_MODE = Tickless;
        const MIN_DELAY = 1;
        const MAX_ALARM_DELAY = 1 << 31;
        const PRIORITIES = [];
        const NUM_MUTEXES = 0;
        const NUM_TIMERS = 3;
    }
}

#[test]
fn one_shot_timers() {
    use self::one_shot::{SystemTraits, KERNEL};
    static TRACE: Trace = Trace::new();
    init_logger();

    fn record(_: &Kernel<'_, SystemTraits>, arg: usize) {
        TRACE.push(format!("timer {arg} at {}", now::<SystemTraits>()));
    }

    let [t0, t1, t2] = [0, 1, 2].map(TimerId::new);
    KERNEL.timer_set(t0, 10, record, 0).unwrap();
    KERNEL.timer_set(t1, 5, record, 1).unwrap();
    KERNEL.timer_set(t2, 10, record, 2).unwrap();

    advance_time::<SystemTraits>(4, || KERNEL.handle_alarm().unwrap());
    assert_eq!(KERNEL.system_time(), Ok(4));
    assert_eq!(KERNEL.timer_remaining(t0), Ok(Some(6)));

    advance_time::<SystemTraits>(16, || KERNEL.handle_alarm().unwrap());
    assert_eq!(
        TRACE.take(),
        ["timer 1 at 5", "timer 0 at 10", "timer 2 at 10"]
    );
    for timer in [t0, t1, t2] {
        assert_eq!(KERNEL.timer_is_armed(timer), Ok(false));
    }
}

define_kernel! {
    mod interrupt_context {
        type Ticks = u32;
        const TIMER_MODE = Tickless;
        const MIN_DELAY = 1;
        const MAX_ALARM_DELAY = 1 << 31;
        const PRIORITIES = [];
        const NUM_MUTEXES = 1;
        const NUM_TIMERS = 1;
    }
}

/// Timer callbacks run in an interrupt context, where blocking operations
/// are unavailable.
#[test]
fn callbacks_cannot_block() {
    use self::interrupt_context::{SystemTraits, KERNEL};
    static RESULT: std::sync::Mutex<Option<Result<(), LockMutexError>>> =
        std::sync::Mutex::new(None);
    init_logger();

    fn try_lock(kernel: &Kernel<'_, SystemTraits>, _: usize) {
        *RESULT.lock().unwrap() = Some(kernel.mutex_lock(MutexId::new(0)));
    }

    KERNEL.timer_set(TimerId::new(0), 3, try_lock, 0).unwrap();
    advance_time::<SystemTraits>(3, || KERNEL.handle_alarm().unwrap());

    assert_eq!(
        *RESULT.lock().unwrap(),
        Some(Err(LockMutexError::BadContext))
    );
}

define_kernel! {
    mod sleeper {
        type Ticks = u32;
        const TIMER_MODE = Tickless;
        const MIN_DELAY = 1;
        const MAX_ALARM_DELAY = 1 << 31;
        const PRIORITIES = [3, 4];
        const NUM_MUTEXES = 0;
        const NUM_TIMERS = 2;
    }
}

/// Block the current thread for `delay` ticks, using the timer whose index
/// matches the thread's.
fn sleep(kernel: &Kernel<'_, sleeper::SystemTraits>, thread: ThreadId, delay: u32) {
    fn wake_up(kernel: &Kernel<'_, sleeper::SystemTraits>, arg: usize) {
        crate::wake(kernel, ThreadId::new(arg));
    }

    kernel
        .timer_set(TimerId::new(thread.get()), delay, wake_up, thread.get())
        .unwrap();
    park(kernel);
}

/// A timer callback wakes up a thread, which runs once the interrupt
/// handler returns.
#[test]
fn sleeping_threads() {
    use self::sleeper::{SystemTraits, KERNEL};
    static TRACE: Trace = Trace::new();
    init_logger();

    for (i, delay) in [(0, 7), (1, 3)] {
        let thread = ThreadId::new(i);
        spawn(&KERNEL, thread, move || {
            TRACE.push(format!("t{i} sleeps at {}", now::<SystemTraits>()));
            sleep(&KERNEL, thread, delay);
            TRACE.push(format!("t{i} wakes at {}", now::<SystemTraits>()));
            sleep(&KERNEL, thread, delay);
            TRACE.push(format!("t{i} wakes at {}", now::<SystemTraits>()));
        })
        .unwrap();
    }
    run::<SystemTraits>();

    advance_time::<SystemTraits>(20, || KERNEL.handle_alarm().unwrap());

    assert_eq!(
        TRACE.take(),
        [
            "t1 sleeps at 0",
            "t0 sleeps at 0",
            "t1 wakes at 3",
            "t1 wakes at 6",
            "t0 wakes at 7",
            "t0 wakes at 14",
        ]
    );
}

define_kernel! {
    mod narrow_counter {
        type Ticks = u16;
        const TIMER_MODE = Tickless;
        const MIN_DELAY = 2;
        const MAX_ALARM_DELAY = 1000;
        const PRIORITIES = [];
        const NUM_MUTEXES = 0;
        const NUM_TIMERS = 2;
    }
}

/// Delays exceeding the alarm's range and the counter's wrap-around don't
/// affect when timers fire.
#[test]
fn long_delays() {
    use self::narrow_counter::{SystemTraits, KERNEL};
    static TRACE: Trace = Trace::new();
    init_logger();

    fn record(_: &Kernel<'_, SystemTraits>, arg: usize) {
        TRACE.push(format!("timer {arg} at {}", now::<SystemTraits>()));
    }

    KERNEL.timer_set(TimerId::new(0), 5000, record, 0).unwrap();
    advance_time::<SystemTraits>(64_000, || KERNEL.handle_alarm().unwrap());
    KERNEL.timer_set(TimerId::new(1), 3000, record, 1).unwrap();
    advance_time::<SystemTraits>(4_000, || KERNEL.handle_alarm().unwrap());

    assert_eq!(TRACE.take(), ["timer 0 at 5000", "timer 1 at 67000"]);
    assert_eq!(KERNEL.system_time(), Ok((68_000 % 65_536) as u16));
}

define_kernel! {
    mod periodic_callback {
        type Ticks = u32;
        const TIMER_MODE = Tickless;
        const MIN_DELAY = 1;
        const MAX_ALARM_DELAY = 1 << 31;
        const PRIORITIES = [];
        const NUM_MUTEXES = 0;
        const NUM_TIMERS = 1;
    }
}

#[test]
fn continuous_timer() {
    use self::periodic_callback::{SystemTraits, KERNEL};
    static TRACE: Trace = Trace::new();
    init_logger();

    fn record(_: &Kernel<'_, SystemTraits>, _: usize) {
        TRACE.push(format!("{}", now::<SystemTraits>()));
    }

    let timer = TimerId::new(0);
    KERNEL.timer_set_continuous(timer, 3, 5, record, 0).unwrap();
    advance_time::<SystemTraits>(14, || KERNEL.handle_alarm().unwrap());
    assert_eq!(KERNEL.timer_cancel(timer), Ok(true));
    advance_time::<SystemTraits>(10, || KERNEL.handle_alarm().unwrap());

    assert_eq!(TRACE.take(), ["3", "8", "13"]);
    assert_eq!(KERNEL.timer_cancel(timer), Ok(false));
}
