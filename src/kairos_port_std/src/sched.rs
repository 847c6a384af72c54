//! The simulated scheduler state
use kairos_kernel::{Priority, ThreadId, WaitSetId};
use std::{any::Any, thread::Thread};

/// Threads ready to run, sorted by descending priority.
#[derive(Debug, Default)]
pub(crate) struct ReadyQueue {
    entries: Vec<(Priority, ThreadId)>,
}

impl ReadyQueue {
    pub(crate) const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Insert `thread` behind all threads of the same or higher priority.
    pub(crate) fn push_back(&mut self, thread: ThreadId, priority: Priority) {
        debug_assert!(!self.contains(thread), "{thread:?} is already ready");
        let i = self.entries.partition_point(|&(p, _)| p >= priority);
        self.entries.insert(i, (priority, thread));
    }

    /// Insert `thread` ahead of all threads of the same priority. Used for
    /// preempted threads.
    pub(crate) fn push_front(&mut self, thread: ThreadId, priority: Priority) {
        debug_assert!(!self.contains(thread), "{thread:?} is already ready");
        let i = self.entries.partition_point(|&(p, _)| p > priority);
        self.entries.insert(i, (priority, thread));
    }

    /// Move `thread` to the position for `priority`. Returns `false` if it's
    /// not in the queue.
    pub(crate) fn reorder(&mut self, thread: ThreadId, priority: Priority) -> bool {
        let Some(i) = self.entries.iter().position(|&(_, t)| t == thread) else {
            return false;
        };
        self.entries.remove(i);
        self.push_back(thread, priority);
        true
    }

    pub(crate) fn pop(&mut self) -> Option<ThreadId> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0).1)
        }
    }

    pub(crate) fn highest_priority(&self) -> Option<Priority> {
        self.entries.first().map(|&(p, _)| p)
    }

    pub(crate) fn contains(&self, thread: ThreadId) -> bool {
        self.entries.iter().any(|&(_, t)| t == thread)
    }
}

/// Everything protected by the scheduler lock.
pub(crate) struct SchedState {
    /// The simulated CPU Lock flag.
    pub(crate) cpu_lock: bool,

    /// The thread holding the simulated CPU. `None` means the CPU is idle,
    /// and the driving thread (or an interrupt handler it runs) owns it.
    pub(crate) running: Option<ThreadId>,

    pub(crate) ready: ReadyQueue,

    /// The OS threads backing live simulated threads, indexed by
    /// [`ThreadId`].
    pub(crate) workers: Vec<Option<Thread>>,

    /// The free-running counter, in ticks.
    pub(crate) counter: u64,

    /// The alarm deadline, truncated to the port's tick type.
    pub(crate) alarm: Option<u64>,

    /// The first panic raised by a simulated thread.
    pub(crate) panic: Option<Box<dyn Any + Send>>,

    /// Priority changes of threads blocked outside the kernel's wait queues,
    /// not yet collected by the driver.
    pub(crate) wait_set_reorders: Vec<(WaitSetId, ThreadId, Priority)>,
}

impl SchedState {
    pub(crate) const fn new() -> Self {
        Self {
            cpu_lock: false,
            running: None,
            ready: ReadyQueue::new(),
            workers: Vec::new(),
            counter: 0,
            alarm: None,
            panic: None,
            wait_set_reorders: Vec::new(),
        }
    }

    pub(crate) fn worker(&self, thread: ThreadId) -> Option<&Thread> {
        self.workers.get(thread.get()).and_then(Option::as_ref)
    }

    pub(crate) fn set_worker(&mut self, thread: ThreadId, handle: Option<Thread>) {
        let i = thread.get();
        if self.workers.len() <= i {
            self.workers.resize(i + 1, None);
        }
        self.workers[i] = handle;
    }

    /// Hand the CPU over to the highest-priority ready thread, or to
    /// `driver` if there's none. The caller must have given up the CPU.
    pub(crate) fn dispatch_next(&mut self, driver: Option<&Thread>) {
        self.cpu_lock = false;
        self.running = self.ready.pop();

        if let Some(next) = self.running {
            log::trace!("dispatching {next:?}");
            match self.worker(next) {
                Some(worker) => worker.unpark(),
                None => panic!("{next:?} was made ready but has no backing thread"),
            }
        } else {
            log::trace!("the CPU is now idle");
            if let Some(driver) = driver {
                driver.unpark();
            }
        }
    }

    /// List the live threads that are neither running nor ready.
    pub(crate) fn blocked_threads(&self) -> Vec<ThreadId> {
        (self.workers.iter().enumerate())
            .filter(|(_, w)| w.is_some())
            .map(|(i, _)| ThreadId::new(i))
            .filter(|&t| self.running != Some(t) && !self.ready.contains(t))
            .collect()
    }
}
