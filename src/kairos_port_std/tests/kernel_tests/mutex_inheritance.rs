//! Priority inheritance with threads that really block
use kairos_kernel::{MutexId, ThreadId, ThreadSt};
use kairos_port_std::{blocked_threads, run, spawn, take_wait_set_reorders};

use crate::{init_logger, park, wake, Trace, GATE};

define_kernel! {
    mod low_medium_high {
        type Ticks = u32;
        const TIMER_MODE = Periodic;
        const MIN_DELAY = 1;
        const MAX_ALARM_DELAY = u32::MAX;
        const PRIORITIES = [1, 5, 10];
        const NUM_MUTEXES = 1;
        const NUM_TIMERS = 0;
    }
}

/// A low-priority owner inherits the priority of each thread that blocks on
/// its mutex and drops back once it releases the mutex.
#[test]
fn low_medium_high() {
    use self::low_medium_high::{SystemTraits, KERNEL};
    static TRACE: Trace = Trace::new();
    init_logger();

    let [low, mid, high] = [0, 1, 2].map(ThreadId::new);
    let m = MutexId::new(0);

    spawn(&KERNEL, low, move || {
        KERNEL.mutex_lock(m).unwrap();
        park(&KERNEL);
        let priority = KERNEL.thread_priority(low).unwrap();
        TRACE.push(format!("low: unlocking at {priority}"));
        KERNEL.mutex_unlock(m).unwrap();
        let priority = KERNEL.thread_priority(low).unwrap();
        TRACE.push(format!("low: unlocked at {priority}"));
    })
    .unwrap();
    run::<SystemTraits>();
    assert_eq!(KERNEL.mutex_owner(m), Ok(Some(low)));
    assert_eq!(blocked_threads::<SystemTraits>(), [low]);

    spawn(&KERNEL, mid, move || {
        KERNEL.mutex_lock(m).unwrap();
        TRACE.push("mid: acquired");
        KERNEL.mutex_unlock(m).unwrap();
    })
    .unwrap();
    run::<SystemTraits>();
    assert_eq!(KERNEL.thread_priority(low), Ok(5));
    assert_eq!(KERNEL.thread_state(mid), Ok(ThreadSt::BlockedOnMutex(m)));

    spawn(&KERNEL, high, move || {
        KERNEL.mutex_lock(m).unwrap();
        TRACE.push("high: acquired");
        KERNEL.mutex_unlock(m).unwrap();
    })
    .unwrap();
    run::<SystemTraits>();
    assert_eq!(KERNEL.thread_priority(low), Ok(10));
    assert_eq!(KERNEL.mutex_first_waiter(m), Ok(Some(high)));
    assert_eq!(blocked_threads::<SystemTraits>(), [low, mid, high]);

    wake(&KERNEL, low);
    run::<SystemTraits>();

    assert_eq!(
        TRACE.take(),
        [
            "low: unlocking at 10",
            "high: acquired",
            "mid: acquired",
            "low: unlocked at 1",
        ]
    );
    assert_eq!(KERNEL.mutex_owner(m), Ok(None));
    assert!(blocked_threads::<SystemTraits>().is_empty());
}

define_kernel! {
    mod wait_queue {
        type Ticks = u32;
        const TIMER_MODE = Periodic;
        const MIN_DELAY = 1;
        const MAX_ALARM_DELAY = u32::MAX;
        const PRIORITIES = [1, 3, 5, 5, 8];
        const NUM_MUTEXES = 1;
        const NUM_TIMERS = 0;
    }
}

/// Waiters receive the mutex in the order of descending priority, and in the
/// order of arrival among equal priorities.
#[test]
fn wait_queue_order() {
    use self::wait_queue::{SystemTraits, KERNEL};
    static TRACE: Trace = Trace::new();
    init_logger();

    let owner = ThreadId::new(0);
    let m = MutexId::new(0);

    spawn(&KERNEL, owner, move || {
        KERNEL.mutex_lock(m).unwrap();
        park(&KERNEL);
        KERNEL.mutex_unlock(m).unwrap();
        TRACE.push("owner: done");
    })
    .unwrap();
    run::<SystemTraits>();

    for i in 1..5 {
        spawn(&KERNEL, ThreadId::new(i), move || {
            KERNEL.mutex_lock(m).unwrap();
            TRACE.push(format!("t{i}"));
            KERNEL.mutex_unlock(m).unwrap();
        })
        .unwrap();
    }
    run::<SystemTraits>();

    assert_eq!(KERNEL.thread_priority(owner), Ok(8));
    assert_eq!(KERNEL.mutex_first_waiter(m), Ok(Some(ThreadId::new(4))));

    wake(&KERNEL, owner);
    run::<SystemTraits>();

    assert_eq!(TRACE.take(), ["t4", "t2", "t3", "t1", "owner: done"]);
    assert_eq!(KERNEL.thread_priority(owner), Ok(1));
}

define_kernel! {
    mod chain {
        type Ticks = u32;
        const TIMER_MODE = Periodic;
        const MIN_DELAY = 1;
        const MAX_ALARM_DELAY = u32::MAX;
        const PRIORITIES = [1, 3, 9];
        const NUM_MUTEXES = 2;
        const NUM_TIMERS = 0;
    }
}

/// A thread blocking on a mutex whose owner is itself blocked raises the
/// priority of every owner down the chain.
#[test]
fn transitive_inheritance() {
    use self::chain::{SystemTraits, KERNEL};
    static TRACE: Trace = Trace::new();
    init_logger();

    let [t0, t1, t2] = [0, 1, 2].map(ThreadId::new);
    let [a, b] = [0, 1].map(MutexId::new);

    spawn(&KERNEL, t0, move || {
        KERNEL.mutex_lock(a).unwrap();
        park(&KERNEL);
        KERNEL.mutex_unlock(a).unwrap();
    })
    .unwrap();
    run::<SystemTraits>();

    spawn(&KERNEL, t1, move || {
        KERNEL.mutex_lock(b).unwrap();
        KERNEL.mutex_lock(a).unwrap();
        TRACE.push("t1: acquired a");
        KERNEL.mutex_unlock(a).unwrap();
        KERNEL.mutex_unlock(b).unwrap();
        TRACE.push("t1: done");
    })
    .unwrap();
    run::<SystemTraits>();
    assert_eq!(KERNEL.thread_priority(t0), Ok(3));
    assert_eq!(KERNEL.thread_state(t1), Ok(ThreadSt::BlockedOnMutex(a)));

    spawn(&KERNEL, t2, move || {
        KERNEL.mutex_lock(b).unwrap();
        TRACE.push("t2: acquired b");
        KERNEL.mutex_unlock(b).unwrap();
    })
    .unwrap();
    run::<SystemTraits>();
    assert_eq!(KERNEL.thread_priority(t1), Ok(9));
    assert_eq!(KERNEL.thread_priority(t0), Ok(9));

    wake(&KERNEL, t0);
    run::<SystemTraits>();

    assert_eq!(
        TRACE.take(),
        ["t1: acquired a", "t2: acquired b", "t1: done"]
    );
    for (thread, base) in [(t0, 1), (t1, 3), (t2, 9)] {
        assert_eq!(KERNEL.thread_priority(thread), Ok(base));
    }
}

define_kernel! {
    mod restoration {
        type Ticks = u32;
        const TIMER_MODE = Periodic;
        const MIN_DELAY = 1;
        const MAX_ALARM_DELAY = u32::MAX;
        const PRIORITIES = [1, 5, 10];
        const NUM_MUTEXES = 2;
        const NUM_TIMERS = 0;
    }
}

/// Unlocking one of several held mutexes only drops the priority inherited
/// through that mutex.
#[test]
fn partial_restoration() {
    use self::restoration::{SystemTraits, KERNEL};
    static TRACE: Trace = Trace::new();
    init_logger();

    let [t0, t1, t2] = [0, 1, 2].map(ThreadId::new);
    let [m1, m2] = [0, 1].map(MutexId::new);

    spawn(&KERNEL, t0, move || {
        KERNEL.mutex_lock(m1).unwrap();
        KERNEL.mutex_lock(m2).unwrap();
        park(&KERNEL);
        KERNEL.mutex_unlock(m2).unwrap();
        TRACE.push(format!("t0: at {}", KERNEL.thread_priority(t0).unwrap()));
        KERNEL.mutex_unlock(m1).unwrap();
        TRACE.push(format!("t0: at {}", KERNEL.thread_priority(t0).unwrap()));
    })
    .unwrap();
    run::<SystemTraits>();

    spawn(&KERNEL, t1, move || {
        KERNEL.mutex_lock(m1).unwrap();
        TRACE.push("t1: acquired m1");
        KERNEL.mutex_unlock(m1).unwrap();
    })
    .unwrap();
    run::<SystemTraits>();
    assert_eq!(KERNEL.thread_priority(t0), Ok(5));

    spawn(&KERNEL, t2, move || {
        KERNEL.mutex_lock(m2).unwrap();
        TRACE.push("t2: acquired m2");
        KERNEL.mutex_unlock(m2).unwrap();
    })
    .unwrap();
    run::<SystemTraits>();
    assert_eq!(KERNEL.thread_priority(t0), Ok(10));

    wake(&KERNEL, t0);
    run::<SystemTraits>();

    assert_eq!(
        TRACE.take(),
        ["t2: acquired m2", "t0: at 5", "t1: acquired m1", "t0: at 1"]
    );
}

define_kernel! {
    mod parked_owner {
        type Ticks = u32;
        const TIMER_MODE = Periodic;
        const MIN_DELAY = 1;
        const MAX_ALARM_DELAY = u32::MAX;
        const PRIORITIES = [2, 6, 4];
        const NUM_MUTEXES = 1;
        const NUM_TIMERS = 0;
    }
}

/// An owner blocked outside of any mutex inherits priorities too, and the
/// port is told about it so it can reorder the wait set holding the owner.
#[test]
fn owner_blocked_on_wait_set() {
    use self::parked_owner::{SystemTraits, KERNEL};
    static TRACE: Trace = Trace::new();
    init_logger();

    let [owner, t1, t2] = [0, 1, 2].map(ThreadId::new);
    let m = MutexId::new(0);

    spawn(&KERNEL, owner, move || {
        KERNEL.mutex_lock(m).unwrap();
        park(&KERNEL);
        let priority = KERNEL.thread_priority(owner).unwrap();
        TRACE.push(format!("owner: unlocking at {priority}"));
        KERNEL.mutex_unlock(m).unwrap();
        let priority = KERNEL.thread_priority(owner).unwrap();
        TRACE.push(format!("owner: unlocked at {priority}"));
    })
    .unwrap();
    run::<SystemTraits>();
    assert!(take_wait_set_reorders::<SystemTraits>().is_empty());

    for thread in [t1, t2] {
        spawn(&KERNEL, thread, move || {
            KERNEL.mutex_lock(m).unwrap();
            TRACE.push(format!("{thread:?}: acquired"));
            KERNEL.mutex_unlock(m).unwrap();
        })
        .unwrap();
        run::<SystemTraits>();
    }

    // Only the first waiter raised the owner's priority
    assert_eq!(
        take_wait_set_reorders::<SystemTraits>(),
        [(GATE, owner, 6)]
    );
    assert_eq!(KERNEL.thread_state(owner), Ok(ThreadSt::BlockedOnOther(GATE)));
    assert_eq!(KERNEL.thread_priority(owner), Ok(6));

    wake(&KERNEL, owner);
    run::<SystemTraits>();

    assert_eq!(
        TRACE.take(),
        [
            "owner: unlocking at 6",
            "ThreadId(1): acquired",
            "ThreadId(2): acquired",
            "owner: unlocked at 2",
        ]
    );
    assert!(take_wait_set_reorders::<SystemTraits>().is_empty());
    assert!(blocked_threads::<SystemTraits>().is_empty());
}
