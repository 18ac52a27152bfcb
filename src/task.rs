//! Task identity and the park-slot resume protocol.
//!
//! Every task runs on its own OS thread, but at most one task executes at any
//! instant: a suspended task is parked on its private resume channel, and the
//! hub hands the execution baton over by sending a [`Resume`] payload into the
//! park slot of exactly one task.

use std::cell::RefCell;
use std::sync::mpsc;

/// Index into the hub's task table.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct TaskId(pub(crate) usize);

/// What a suspended task observes when the hub resumes it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Resume {
    /// The awaited condition happened.
    Ready,
    /// The wait's deadline fired first.
    Timeout,
    /// The loop ran out of work.
    Exited,
}

/// Hub-side end of a task's park slot.
#[derive(Debug)]
pub(crate) struct ParkSlot(mpsc::Sender<Resume>);

impl ParkSlot {
    /// Hands the baton to the parked task. Fails if its thread is gone.
    pub(crate) fn resume(&self, resume: Resume) -> Result<(), ()> {
        self.0.send(resume).map_err(|_| ())
    }
}

/// Creates a park slot pair; the receiver half belongs in the task's thread
/// local context, the sender half in the hub's task table.
pub(crate) fn park_slot() -> (ParkSlot, mpsc::Receiver<Resume>) {
    let (sender, receiver) = mpsc::channel();
    (ParkSlot(sender), receiver)
}

thread_local! {
    /// The task identity of the calling thread, if it has one.
    static CONTEXT: RefCell<Option<TaskContext>> = RefCell::new(None);
}

#[derive(Debug)]
struct TaskContext {
    hub_id: usize,
    task: TaskId,
    receiver: mpsc::Receiver<Resume>,
}

/// Binds the calling thread to a task registered on hub `hub_id`.
/// A context left over from a previously driven hub is abandoned.
pub(crate) fn install(hub_id: usize, task: TaskId, receiver: mpsc::Receiver<Resume>) {
    CONTEXT.with(|cell| {
        *cell.borrow_mut() = Some(TaskContext {
            hub_id,
            task,
            receiver,
        });
    });
}

pub(crate) fn uninstall() {
    CONTEXT.with(|cell| *cell.borrow_mut() = None);
}

/// The calling thread's task on hub `hub_id`, if it is registered there.
pub(crate) fn current(hub_id: usize) -> Option<TaskId> {
    CONTEXT.with(|cell| {
        cell.borrow()
            .as_ref()
            .filter(|context| context.hub_id == hub_id)
            .map(|context| context.task)
    })
}

/// Parks the calling thread until the hub hands it the baton.
///
/// A disconnected slot reads as [`Resume::Exited`]: the hub state was torn
/// down while this task was still parked.
pub(crate) fn park() -> Resume {
    CONTEXT.with(|cell| {
        let cell = cell.borrow();
        let context = cell.as_ref().expect("parked a thread with no task identity");
        context.receiver.recv().unwrap_or(Resume::Exited)
    })
}
