//! A deque that suspends its callers on empty and full instead of failing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::hub::{Hub, WaiterDeque};
use crate::task::Resume;
use crate::Error;

/// Bounded or unbounded deque shared between tasks. Clones share storage.
///
/// Popping an empty queue suspends until some task appends; appending to a
/// full bounded queue suspends until some task pops. Waiters are woken in
/// FIFO order, one per handoff, and retry the operation once resumed.
#[derive(Debug)]
pub struct Queue<T> {
    shared: Arc<Shared<T>>,
}

#[derive(Debug)]
struct Shared<T> {
    hub: Hub,
    max_len: Option<usize>,
    items: Mutex<VecDeque<T>>,
    /// Appenders waiting for a pop to free a slot.
    pop_waits: WaiterDeque,
    /// Poppers waiting for an append to provide an item.
    append_waits: WaiterDeque,
}

impl<T> Queue<T> {
    /// Creates an unbounded queue on `hub`.
    pub fn new(hub: &Hub) -> Queue<T> {
        Queue::with_max_len(hub, None)
    }

    /// Creates a queue that holds at most `max_len` items.
    pub fn bounded(hub: &Hub, max_len: usize) -> Queue<T> {
        Queue::with_max_len(hub, Some(max_len))
    }

    fn with_max_len(hub: &Hub, max_len: Option<usize>) -> Queue<T> {
        Queue {
            shared: Arc::new(Shared {
                hub: hub.clone(),
                max_len,
                items: Mutex::new(VecDeque::new()),
                pop_waits: Arc::new(Mutex::new(VecDeque::new())),
                append_waits: Arc::new(Mutex::new(VecDeque::new())),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.shared.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether another append would suspend. Always false when unbounded.
    pub fn full(&self) -> bool {
        match self.shared.max_len {
            Some(max_len) => self.len() >= max_len,
            None => false,
        }
    }

    /// Empties the queue, then wakes every task waiting to append: the free
    /// slots can satisfy all of them at once.
    pub fn clear(&self) {
        self.shared.items.lock().unwrap().clear();
        let waiting: Vec<usize> = self.shared.pop_waits.lock().unwrap().drain(..).collect();
        for key in waiting {
            self.shared.hub.queue_complete(key);
        }
    }

    /// Appends at the back, suspending while the queue is full.
    pub fn append(&self, item: T, timeout: Option<Duration>) -> crate::Result<()> {
        self.push(End::Back, item, timeout)
    }

    /// Appends at the front, suspending while the queue is full.
    pub fn appendleft(&self, item: T, timeout: Option<Duration>) -> crate::Result<()> {
        self.push(End::Front, item, timeout)
    }

    /// Takes from the back, suspending while the queue is empty.
    pub fn pop(&self, timeout: Option<Duration>) -> crate::Result<T> {
        self.take(End::Back, timeout)
    }

    /// Takes from the front, suspending while the queue is empty.
    pub fn popleft(&self, timeout: Option<Duration>) -> crate::Result<T> {
        self.take(End::Front, timeout)
    }

    /// Suspends until the queue drains, without consuming anything itself.
    pub fn wait_until_empty(&self, timeout: Option<Duration>) -> crate::Result<()> {
        if self.shared.items.lock().unwrap().is_empty() {
            return Ok(());
        }
        let deadline = deadline_from(timeout);
        loop {
            self.wait_for_pop(deadline)?;
            if self.shared.items.lock().unwrap().is_empty() {
                break;
            }
        }
        // the wakeup consumed here may have been meant for an appender
        self.popped();
        Ok(())
    }

    fn push(&self, end: End, item: T, timeout: Option<Duration>) -> crate::Result<()> {
        let deadline = deadline_from(timeout);
        let mut item = Some(item);
        loop {
            {
                let mut items = self.shared.items.lock().unwrap();
                if self.shared.max_len.map_or(true, |max_len| items.len() < max_len) {
                    let item = item.take().expect("append retried after success");
                    match end {
                        End::Back => items.push_back(item),
                        End::Front => items.push_front(item),
                    }
                    break;
                }
            }
            self.wait_for_pop(deadline)?;
        }
        self.appended();
        Ok(())
    }

    fn take(&self, end: End, timeout: Option<Duration>) -> crate::Result<T> {
        let deadline = deadline_from(timeout);
        let item = loop {
            {
                let mut items = self.shared.items.lock().unwrap();
                let item = match end {
                    End::Back => items.pop_back(),
                    End::Front => items.pop_front(),
                };
                if let Some(item) = item {
                    break item;
                }
            }
            self.wait_for_append(deadline)?;
        };
        self.popped();
        Ok(item)
    }

    /// Parks until some task pops.
    fn wait_for_pop(&self, deadline: Option<Instant>) -> crate::Result<()> {
        check(self.shared.hub.queue_suspend(&self.shared.pop_waits, deadline))
    }

    /// Parks until some task appends.
    fn wait_for_append(&self, deadline: Option<Instant>) -> crate::Result<()> {
        check(self.shared.hub.queue_suspend(&self.shared.append_waits, deadline))
    }

    /// Hands one freed slot to the next waiting appender.
    fn popped(&self) {
        let key = self.shared.pop_waits.lock().unwrap().pop_front();
        if let Some(key) = key {
            self.shared.hub.queue_complete(key);
        }
    }

    /// Hands one new item to the next waiting popper.
    fn appended(&self) {
        let key = self.shared.append_waits.lock().unwrap().pop_front();
        if let Some(key) = key {
            self.shared.hub.queue_complete(key);
        }
    }
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Queue<T> {
        Queue {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[derive(Debug, Copy, Clone)]
enum End {
    Front,
    Back,
}

fn deadline_from(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|timeout| Instant::now() + timeout)
}

fn check(resume: Resume) -> crate::Result<()> {
    match resume {
        Resume::Ready => Ok(()),
        Resume::Timeout => Err(Error::Timeout),
        Resume::Exited => panic!("queue wait can never be woken: hub has no runnable tasks"),
    }
}
