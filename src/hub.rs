//! The event loop: run queue, wait table, timer heap, and the dispatch
//! protocol that moves the single execution baton between tasks.
//!
//! Whichever thread last gave up its task (by suspending or finishing) drives
//! the loop: it drains the run queue, fires expired deadlines, and blocks in
//! the readiness probe bounded by the nearest deadline. Resuming another task
//! hands the baton over and parks the driver, so at most one task ever
//! executes at an instant even though each lives on its own OS thread.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::panic;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::task::{self, ParkSlot, Resume, TaskId};
use crate::timer::{self, TimerHeap};
use crate::{probe, Error};

/// Used to tell hubs apart when a thread outlives the hub it last drove.
static ID_GENERATOR: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Each thread lazily gets a hub of its own; task threads inherit the hub
    /// that spawned them.
    static CURRENT_HUB: RefCell<Option<Hub>> = RefCell::new(None);
}

/// The calling thread's hub, created on first access.
pub fn current() -> Hub {
    CURRENT_HUB.with(|cell| cell.borrow_mut().get_or_insert_with(Hub::new).clone())
}

fn adopt(hub: &Hub) {
    CURRENT_HUB.with(|cell| {
        let mut cell = cell.borrow_mut();
        if cell.is_none() {
            *cell = Some(hub.clone());
        }
    });
}

/// Readiness interest mask for [`Hub::poll`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const READ: Interest = Interest(0b001);
    pub const WRITE: Interest = Interest(0b010);
    pub const EXC: Interest = Interest(0b100);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }
}

/// Handle to an event loop. Clones share the same loop.
#[derive(Debug, Clone)]
pub struct Hub {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    id: usize,
    state: Mutex<HubState>,
}

#[derive(Debug)]
struct HubState {
    tasks: slab::Slab<ParkSlot>,
    waits: slab::Slab<Wait>,
    run_queue: VecDeque<(TaskId, Resume)>,
    timers: TimerHeap,
    /// Tasks suspended in [`Hub::run`], resumed when the loop drains.
    exit_waiters: Vec<TaskId>,
}

/// One pending suspension.
#[derive(Debug)]
struct Wait {
    task: TaskId,
    /// Live timer-heap registration, when the wait has a deadline.
    timer_seq: Option<timer::Seq>,
    kind: WaitKind,
}

#[derive(Debug)]
enum WaitKind {
    /// Fires on fd readiness; fires `Timeout` on deadline.
    Fd { fd: RawFd, interest: Interest },
    /// Fires normally on deadline.
    Sleep,
    /// Parked in a queue's wait deque; fires `Timeout` on deadline, at which
    /// point it withdraws itself from that deque.
    Queue { waiters: WaiterDeque },
}

/// A queue-side wait deque, shared by identity with the hub so deadline
/// firing can withdraw the entry.
pub(crate) type WaiterDeque = Arc<Mutex<VecDeque<usize>>>;

impl Hub {
    pub fn new() -> Hub {
        Hub {
            shared: Arc::new(Shared {
                id: ID_GENERATOR.fetch_add(1, Ordering::SeqCst),
                state: Mutex::new(HubState {
                    tasks: slab::Slab::new(),
                    waits: slab::Slab::new(),
                    run_queue: VecDeque::new(),
                    timers: TimerHeap::new(),
                    exit_waiters: Vec::new(),
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.shared.state.lock().unwrap()
    }

    /// The calling thread's task on this hub, registered on first use.
    fn current_task(&self) -> TaskId {
        if let Some(task) = task::current(self.shared.id) {
            return task;
        }
        let (slot, receiver) = task::park_slot();
        let task = TaskId(self.state().tasks.insert(slot));
        task::install(self.shared.id, task, receiver);
        task
    }

    /// Schedules `f` to run as a new task, after every currently runnable one.
    pub fn spawn(&self, f: impl FnOnce() + Send + 'static) {
        let task = self.spawn_parked(f);
        self.state().run_queue.push_back((task, Resume::Ready));
    }

    /// Schedules `f` to run as a new task once `delay` elapses. The caller is
    /// not suspended.
    pub fn call_later(&self, delay: Duration, f: impl FnOnce() + Send + 'static) {
        let task = self.spawn_parked(f);
        let mut state = self.state();
        let key = state.waits.insert(Wait {
            task,
            timer_seq: None,
            kind: WaitKind::Sleep,
        });
        let seq = state.timers.push(Instant::now() + delay, key);
        state.waits[key].timer_seq = Some(seq);
    }

    fn spawn_parked(&self, f: impl FnOnce() + Send + 'static) -> TaskId {
        let (slot, receiver) = task::park_slot();
        let task = TaskId(self.state().tasks.insert(slot));

        let hub = self.clone();
        thread::Builder::new()
            .name(format!("pollen-task-{}", task.0))
            .spawn(move || {
                task::install(hub.shared.id, task, receiver);
                adopt(&hub);
                if task::park() != Resume::Ready {
                    // the hub went away before the task first ran
                    task::uninstall();
                    return;
                }
                let result = panic::catch_unwind(panic::AssertUnwindSafe(f));
                task::uninstall();
                hub.retire(task);
                if let Err(payload) = result {
                    panic::resume_unwind(payload);
                }
            })
            .expect("failed to spawn task thread");

        task
    }

    /// Cooperatively yields, letting every other runnable task go first.
    pub fn yield_now(&self) {
        let me = self.current_task();
        self.state().run_queue.push_back((me, Resume::Ready));
        match self.dispatch(me) {
            Resume::Ready => {}
            resume => unreachable!("yield resumed with {resume:?}"),
        }
    }

    /// Runs the loop until no task is runnable, sleeping, or waiting on I/O.
    pub fn run(&self) {
        let me = self.current_task();
        self.state().exit_waiters.push(me);
        match self.dispatch(me) {
            Resume::Exited => {}
            resume => unreachable!("run resumed with {resume:?}"),
        }
    }

    /// Suspends the current task until `duration` elapses.
    ///
    /// A zero duration still takes one trip through the timer heap, resuming
    /// on the next dispatch cycle rather than behaving like [`Hub::yield_now`].
    pub fn sleep(&self, duration: Duration) {
        let me = self.current_task();
        {
            let mut state = self.state();
            let key = state.waits.insert(Wait {
                task: me,
                timer_seq: None,
                kind: WaitKind::Sleep,
            });
            let seq = state.timers.push(Instant::now() + duration, key);
            state.waits[key].timer_seq = Some(seq);
        }
        match self.dispatch(me) {
            Resume::Ready => {}
            resume => unreachable!("sleep resumed with {resume:?}"),
        }
    }

    /// Suspends the current task until `fd` reports readiness for `interest`,
    /// or fails with [`Error::Timeout`] once `timeout` elapses.
    ///
    /// A zero timeout is the try-or-fail-now idiom: the wait fires `Timeout`
    /// on the next dispatch cycle unless the descriptor is already ready.
    pub fn poll(
        &self,
        fd: &impl AsRawFd,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> crate::Result<()> {
        assert!(!interest.is_empty(), "poll requires at least one interest");
        let me = self.current_task();
        {
            let mut state = self.state();
            let key = state.waits.insert(Wait {
                task: me,
                timer_seq: None,
                kind: WaitKind::Fd {
                    fd: fd.as_raw_fd(),
                    interest,
                },
            });
            if let Some(timeout) = timeout {
                let seq = state.timers.push(Instant::now() + timeout, key);
                state.waits[key].timer_seq = Some(seq);
            }
        }
        match self.dispatch(me) {
            Resume::Ready => Ok(()),
            Resume::Timeout => Err(Error::Timeout),
            Resume::Exited => unreachable!("fd wait outlived the loop"),
        }
    }

    /// Suspends until `fd` is readable.
    pub fn readable(&self, fd: &impl AsRawFd, timeout: Option<Duration>) -> crate::Result<()> {
        self.poll(fd, Interest::READ, timeout)
    }

    /// Suspends until `fd` is writeable.
    pub fn writeable(&self, fd: &impl AsRawFd, timeout: Option<Duration>) -> crate::Result<()> {
        self.poll(fd, Interest::WRITE, timeout)
    }

    /// Parks the current task on a queue's wait deque. Used by [`crate::Queue`].
    ///
    /// On `Exited` the wait can never be woken; it is withdrawn before
    /// reporting so no stale registration survives.
    pub(crate) fn queue_suspend(
        &self,
        waiters: &WaiterDeque,
        deadline: Option<Instant>,
    ) -> Resume {
        let me = self.current_task();
        let key = {
            let mut state = self.state();
            let key = state.waits.insert(Wait {
                task: me,
                timer_seq: None,
                kind: WaitKind::Queue {
                    waiters: Arc::clone(waiters),
                },
            });
            if let Some(deadline) = deadline {
                let seq = state.timers.push(deadline, key);
                state.waits[key].timer_seq = Some(seq);
            }
            key
        };
        waiters.lock().unwrap().push_back(key);

        let resume = self.dispatch(me);
        if resume == Resume::Exited {
            let _ = self.state().waits.try_remove(key);
            waiters.lock().unwrap().retain(|&waiting| waiting != key);
        }
        resume
    }

    /// Completes a queue wait out of band: drops its deadline registration and
    /// schedules its task. The caller has already taken `key` off the deque.
    pub(crate) fn queue_complete(&self, key: usize) {
        let mut state = self.state();
        if let Some(wait) = state.waits.try_remove(key) {
            state.run_queue.push_back((wait.task, Resume::Ready));
        }
    }

    /// Gives up the baton and drives the loop until `me` is resumed.
    fn dispatch(&self, me: TaskId) -> Resume {
        self.drive(Some(me))
    }

    /// Called by a finishing task thread: unregisters the task, then keeps the
    /// loop moving until the baton is handed off or the loop goes idle.
    fn retire(&self, task: TaskId) {
        self.state().tasks.remove(task.0);
        self.drive(None);
    }

    fn drive(&self, me: Option<TaskId>) -> Resume {
        loop {
            let step = self.state().next_step(Instant::now());
            match step {
                Step::Run(task, resume) => {
                    if me == Some(task) {
                        return resume;
                    }
                    let handed_off = match self.state().tasks.get(task.0) {
                        Some(slot) => slot.resume(resume).is_ok(),
                        None => false, // task leaked its thread; drop the resume
                    };
                    if !handed_off {
                        continue;
                    }
                    return match me {
                        Some(_) => task::park(),
                        None => Resume::Exited,
                    };
                }
                Step::Probe(entries, timeout) => {
                    log::trace!("probing {} fds, timeout {timeout:?}", entries.len());
                    match probe::probe(&entries, timeout) {
                        probe::Outcome::Ready(keys) => {
                            let mut state = self.state();
                            for key in keys {
                                if let Some(wait) = state.waits.try_remove(key) {
                                    state.run_queue.push_back((wait.task, Resume::Ready));
                                }
                            }
                        }
                        probe::Outcome::TimedOut | probe::Outcome::Interrupted => {}
                    }
                }
                Step::Sleep(duration) => thread::sleep(duration),
                Step::Idle => {
                    log::debug!("hub {} drained", self.shared.id);
                    return Resume::Exited;
                }
            }
        }
    }
}

impl Default for Hub {
    fn default() -> Hub {
        Hub::new()
    }
}

/// What the driving thread should do next.
#[derive(Debug)]
enum Step {
    /// Resume this task with this payload.
    Run(TaskId, Resume),
    /// Block in the readiness probe, bounded by the nearest deadline.
    Probe(Vec<probe::Entry>, Option<Duration>),
    /// No runnable tasks and no fd waits; idle until the nearest deadline.
    Sleep(Duration),
    /// Run queue, readiness table, and timer heap are all empty.
    Idle,
}

impl HubState {
    fn next_step(&mut self, now: Instant) -> Step {
        loop {
            if let Some((task, resume)) = self.run_queue.pop_front() {
                return Step::Run(task, resume);
            }

            if !self.has_work() {
                if self.exit_waiters.is_empty() {
                    return Step::Idle;
                }
                for task in mem::take(&mut self.exit_waiters) {
                    self.run_queue.push_back((task, Resume::Exited));
                }
                continue;
            }

            let timeout = self.fire_expired(now);
            if !self.run_queue.is_empty() {
                // fired tasks run before the next probe
                continue;
            }

            if self.has_fd_waits() {
                return Step::Probe(self.fd_entries(), timeout);
            }
            match timeout {
                Some(timeout) => return Step::Sleep(timeout),
                None => continue, // the heap held only stale entries
            }
        }
    }

    fn has_work(&self) -> bool {
        self.has_fd_waits() || !self.timers.is_empty()
    }

    fn has_fd_waits(&self) -> bool {
        self.waits
            .iter()
            .any(|(_, wait)| matches!(wait.kind, WaitKind::Fd { .. }))
    }

    fn fd_entries(&self) -> Vec<probe::Entry> {
        self.waits
            .iter()
            .filter_map(|(key, wait)| match wait.kind {
                WaitKind::Fd { fd, interest } => Some(probe::Entry { key, fd, interest }),
                _ => None,
            })
            .collect()
    }

    /// Fires every expired deadline and reports the time until the next live
    /// one. Fired waits are taken out of their sibling registration and
    /// scheduled, never resumed in place.
    fn fire_expired(&mut self, now: Instant) -> Option<Duration> {
        while let Some(entry) = self.timers.peek() {
            let live = self
                .waits
                .get(entry.key)
                .is_some_and(|wait| wait.timer_seq == Some(entry.seq));
            if !live {
                // cancelled by a completion that beat the deadline
                self.timers.pop();
                continue;
            }

            let remaining = entry.deadline.saturating_duration_since(now);
            if !remaining.is_zero() {
                return Some(remaining);
            }

            self.timers.pop();
            let wait = self.waits.remove(entry.key);
            match wait.kind {
                WaitKind::Fd { .. } => self.run_queue.push_back((wait.task, Resume::Timeout)),
                WaitKind::Sleep => self.run_queue.push_back((wait.task, Resume::Ready)),
                WaitKind::Queue { waiters } => {
                    waiters.lock().unwrap().retain(|&waiting| waiting != entry.key);
                    self.run_queue.push_back((wait.task, Resume::Timeout));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use super::*;

    mod run {
        use super::*;

        #[test]
        fn returns_immediately_when_empty() {
            let hub = Hub::new();

            let before = Instant::now();
            hub.run();

            assert!(before.elapsed() < Duration::from_millis(10));
        }

        #[test]
        fn runs_spawned_tasks_first() {
            let hub = Hub::new();
            let ran = Arc::new(AtomicBool::new(false));

            hub.spawn({
                let ran = Arc::clone(&ran);
                move || ran.store(true, Ordering::SeqCst)
            });

            assert!(!ran.load(Ordering::SeqCst));
            hub.run();
            assert!(ran.load(Ordering::SeqCst));
        }

        #[test]
        fn works_several_times() {
            let hub = Hub::new();
            hub.run();
            hub.run();
        }
    }

    mod spawn {
        use super::*;

        #[test]
        fn runs_in_fifo_order() {
            let hub = Hub::new();
            let order = Arc::new(Mutex::new(Vec::new()));

            for id in 1..=3 {
                hub.spawn({
                    let order = Arc::clone(&order);
                    move || order.lock().unwrap().push(id)
                });
            }
            hub.run();

            assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        }

        #[test]
        fn task_spawned_during_drain_runs_in_the_same_drain() {
            let hub = Hub::new();
            let ran = Arc::new(AtomicBool::new(false));

            hub.spawn({
                let hub = hub.clone();
                let ran = Arc::clone(&ran);
                move || {
                    hub.spawn(move || ran.store(true, Ordering::SeqCst));
                }
            });
            hub.run();

            assert!(ran.load(Ordering::SeqCst));
        }

        #[test]
        fn panicking_task_does_not_stall_the_loop() {
            let hub = Hub::new();
            let ran = Arc::new(AtomicBool::new(false));

            hub.spawn(|| panic!("task failure"));
            hub.spawn({
                let ran = Arc::clone(&ran);
                move || ran.store(true, Ordering::SeqCst)
            });
            hub.run();

            assert!(ran.load(Ordering::SeqCst));
        }
    }

    mod yield_now {
        use super::*;

        #[test]
        fn to_same_task() {
            let hub = Hub::new();
            hub.yield_now();
        }

        #[test]
        fn to_other_task() {
            let hub = Hub::new();
            let changed = Arc::new(AtomicBool::new(false));

            hub.spawn({
                let changed = Arc::clone(&changed);
                move || changed.store(true, Ordering::SeqCst)
            });

            assert!(!changed.load(Ordering::SeqCst));
            hub.yield_now();
            assert!(changed.load(Ordering::SeqCst));
        }
    }

    mod sleep {
        use super::*;

        #[test]
        fn passes_time() {
            let hub = Hub::new();

            let before = Instant::now();
            hub.sleep(Duration::from_millis(20));

            assert!(before.elapsed() >= Duration::from_millis(20));
        }

        #[test]
        fn zero_completes_immediately() {
            let hub = Hub::new();

            let before = Instant::now();
            hub.sleep(Duration::ZERO);

            assert!(before.elapsed() < Duration::from_millis(10));
        }
    }

    mod poll {
        use std::os::unix::net::UnixStream;

        use super::*;

        #[test]
        #[should_panic]
        fn rejects_empty_interest() {
            let hub = Hub::new();
            let (left, _right) = UnixStream::pair().unwrap();

            let _ = hub.poll(&left, Interest(0), None);
        }

        #[test]
        fn timeout_leaves_nothing_behind() {
            let hub = Hub::new();
            let (left, _right) = UnixStream::pair().unwrap();
            left.set_nonblocking(true).unwrap();

            let error = hub
                .poll(&left, Interest::READ, Some(Duration::from_millis(10)))
                .unwrap_err();
            assert!(matches!(error, Error::Timeout));

            // the wait is gone from both the table and the heap
            let before = Instant::now();
            hub.run();
            assert!(before.elapsed() < Duration::from_millis(10));
        }
    }
}
