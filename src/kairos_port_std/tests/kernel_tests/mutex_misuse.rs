//! Non-blocking locking, bulk release, and contract violations
use kairos_kernel::{MutexId, ThreadId, TryLockMutexError};
use kairos_port_std::{run, spawn};

use crate::{init_logger, park, wake, Trace};

define_kernel! {
    mod two_threads {
        type Ticks = u32;
        const TIMER_MODE = Periodic;
        const MIN_DELAY = 1;
        const MAX_ALARM_DELAY = u32::MAX;
        const PRIORITIES = [1, 5];
        const NUM_MUTEXES = 2;
        const NUM_TIMERS = 0;
    }
}

#[test]
fn try_lock() {
    use self::two_threads::{SystemTraits, KERNEL};
    init_logger();

    let [t0, t1] = [0, 1].map(ThreadId::new);
    let m = MutexId::new(0);

    spawn(&KERNEL, t0, move || {
        KERNEL.mutex_lock(m).unwrap();
        park(&KERNEL);
        KERNEL.mutex_unlock(m).unwrap();
    })
    .unwrap();
    run::<SystemTraits>();

    spawn(&KERNEL, t1, move || {
        assert_eq!(KERNEL.mutex_try_lock(m), Err(TryLockMutexError::Timeout));
    })
    .unwrap();
    run::<SystemTraits>();

    // A failed attempt doesn't lend the priority
    assert_eq!(KERNEL.thread_priority(t0), Ok(1));

    wake(&KERNEL, t0);
    run::<SystemTraits>();

    spawn(&KERNEL, t1, move || {
        KERNEL.mutex_try_lock(m).unwrap();
        assert_eq!(KERNEL.mutex_owner(m), Ok(Some(t1)));
        KERNEL.mutex_unlock(m).unwrap();
    })
    .unwrap();
    run::<SystemTraits>();
    assert_eq!(KERNEL.mutex_is_locked(m), Ok(false));
}

define_kernel! {
    mod recursive {
        type Ticks = u32;
        const TIMER_MODE = Periodic;
        const MIN_DELAY = 1;
        const MAX_ALARM_DELAY = u32::MAX;
        const PRIORITIES = [1];
        const NUM_MUTEXES = 1;
        const NUM_TIMERS = 0;
    }
}

#[test]
fn recursive_lock() {
    use self::recursive::{SystemTraits, KERNEL};
    init_logger();

    let m = MutexId::new(0);

    spawn(&KERNEL, ThreadId::new(0), move || {
        KERNEL.mutex_lock(m).unwrap();
        KERNEL.mutex_lock(m).unwrap();
        KERNEL.mutex_try_lock(m).unwrap();
        KERNEL.mutex_unlock(m).unwrap();
        KERNEL.mutex_unlock(m).unwrap();
        assert_eq!(KERNEL.mutex_is_locked(m), Ok(true));
        KERNEL.mutex_unlock(m).unwrap();
        assert_eq!(KERNEL.mutex_is_locked(m), Ok(false));
    })
    .unwrap();
    run::<SystemTraits>();
}

define_kernel! {
    mod bulk_release {
        type Ticks = u32;
        const TIMER_MODE = Periodic;
        const MIN_DELAY = 1;
        const MAX_ALARM_DELAY = u32::MAX;
        const PRIORITIES = [1, 4, 6];
        const NUM_MUTEXES = 2;
        const NUM_TIMERS = 0;
    }
}

#[test]
fn unlock_all() {
    use self::bulk_release::{SystemTraits, KERNEL};
    static TRACE: Trace = Trace::new();
    init_logger();

    let [t0, t1, t2] = [0, 1, 2].map(ThreadId::new);
    let [a, b] = [0, 1].map(MutexId::new);

    spawn(&KERNEL, t0, move || {
        KERNEL.mutex_lock(a).unwrap();
        KERNEL.mutex_lock(b).unwrap();
        park(&KERNEL);
        KERNEL.mutex_unlock_all().unwrap();
        let priority = KERNEL.thread_priority(t0).unwrap();
        TRACE.push(format!("t0: released all at {priority}"));
    })
    .unwrap();
    run::<SystemTraits>();

    for (thread, mutex) in [(t1, a), (t2, b)] {
        spawn(&KERNEL, thread, move || {
            KERNEL.mutex_lock(mutex).unwrap();
            TRACE.push(format!("{thread:?}: acquired {mutex:?}"));
            KERNEL.mutex_unlock(mutex).unwrap();
        })
        .unwrap();
        run::<SystemTraits>();
    }
    assert_eq!(KERNEL.thread_priority(t0), Ok(6));

    wake(&KERNEL, t0);
    run::<SystemTraits>();

    assert_eq!(
        TRACE.take(),
        [
            "ThreadId(2): acquired MutexId(1)",
            "ThreadId(1): acquired MutexId(0)",
            "t0: released all at 1",
        ]
    );
    assert_eq!(KERNEL.thread_last_mutex_held(t0), Ok(None));
}

define_kernel! {
    mod out_of_order {
        type Ticks = u32;
        const TIMER_MODE = Periodic;
        const MIN_DELAY = 1;
        const MAX_ALARM_DELAY = u32::MAX;
        const PRIORITIES = [1];
        const NUM_MUTEXES = 2;
        const NUM_TIMERS = 0;
    }
}

/// The panic raised in the simulated thread is propagated to the driver.
#[test]
#[should_panic(expected = "is not the most recently locked mutex")]
fn unlock_out_of_order() {
    use self::out_of_order::{SystemTraits, KERNEL};
    init_logger();

    let [a, b] = [0, 1].map(MutexId::new);

    spawn(&KERNEL, ThreadId::new(0), move || {
        KERNEL.mutex_lock(a).unwrap();
        KERNEL.mutex_lock(b).unwrap();
        let _ = KERNEL.mutex_unlock(a);
    })
    .unwrap();
    run::<SystemTraits>();
}

define_kernel! {
    mod unowned {
        type Ticks = u32;
        const TIMER_MODE = Periodic;
        const MIN_DELAY = 1;
        const MAX_ALARM_DELAY = u32::MAX;
        const PRIORITIES = [1, 2];
        const NUM_MUTEXES = 1;
        const NUM_TIMERS = 0;
    }
}

#[test]
#[should_panic(expected = "is not owned by the current thread")]
fn unlock_unowned() {
    use self::unowned::{SystemTraits, KERNEL};
    init_logger();

    let m = MutexId::new(0);

    spawn(&KERNEL, ThreadId::new(0), move || {
        KERNEL.mutex_lock(m).unwrap();
        park(&KERNEL);
    })
    .unwrap();
    spawn(&KERNEL, ThreadId::new(1), move || {
        let _ = KERNEL.mutex_unlock(m);
    })
    .unwrap();
    run::<SystemTraits>();
}
