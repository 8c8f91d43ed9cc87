//! The task executor.
//!
//! A single-threaded run queue: tasks live in a map owned by the loop's thread, and the
//! [`Injector`] is the only part other threads can touch. Waking a task pushes its id onto the
//! injector; the loop drains it between multiplexer waits.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, ThreadId};

use crossbeam_queue::SegQueue;
use metrics::{counter, gauge};
use tracing::{trace, warn};

use crate::adapter::ChannelId;
use crate::task::{Task, TaskFuture, TaskHeader, TaskId};
use crate::waker::task_waker;

/// Lock-free hand-off from wakers and channel callbacks to the loop's thread.
pub(crate) struct Injector {
    tasks: SegQueue<TaskId>,
    channels: SegQueue<ChannelId>,
    waker: mio::Waker,
    owner: ThreadId,
}

impl Injector {
    pub fn new(waker: mio::Waker) -> Self {
        Self {
            tasks: SegQueue::new(),
            channels: SegQueue::new(),
            waker,
            owner: thread::current().id(),
        }
    }

    pub fn schedule(&self, task: TaskId) {
        self.tasks.push(task);
        self.notify();
    }

    /// Flags a channel whose inbox has new notifications.
    pub fn mark_dirty(&self, channel: ChannelId) {
        self.channels.push(channel);
        self.notify();
    }

    pub fn pop_dirty(&self) -> Option<ChannelId> {
        self.channels.pop()
    }

    pub fn has_work(&self) -> bool {
        !self.tasks.is_empty() || !self.channels.is_empty()
    }

    // The loop thread always checks the queues before blocking; only other threads have to
    // interrupt the poll.
    fn notify(&self) {
        if thread::current().id() != self.owner {
            if let Err(e) = self.waker.wake() {
                warn!(error = %e, "failed to wake event loop");
            }
        }
    }
}

pub(crate) struct Executor {
    tasks: RefCell<HashMap<TaskId, Task>>,
    next_id: Cell<u64>,
    injector: Arc<Injector>,
}

impl Executor {
    pub fn new(injector: Arc<Injector>) -> Self {
        Self {
            tasks: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
            injector,
        }
    }

    pub fn injector(&self) -> &Arc<Injector> {
        &self.injector
    }

    /// Adds a task and queues it for its first poll. Safe to call from inside a running task.
    pub fn spawn(&self, future: TaskFuture) -> TaskId {
        let id = TaskId(self.next_id.get());
        self.next_id.set(id.0 + 1);

        let header = TaskHeader::new(id);
        let waker = task_waker(header.clone(), self.injector.clone());
        let schedule = header.try_schedule();
        self.tasks
            .borrow_mut()
            .insert(id, Task::new(header, waker, future));
        if schedule {
            self.injector.schedule(id);
        }

        counter!("chanloop_tasks_spawned_total").increment(1);
        gauge!("chanloop_tasks_pending_current").increment(1.0);
        trace!(task = id.0, "task spawned");
        id
    }

    /// Polls the tasks that were queued when the call started. Tasks woken meanwhile wait for
    /// the next call, so a task that keeps waking itself cannot starve the multiplexer.
    pub fn run_ready(&self) -> usize {
        let queued = self.injector.tasks.len();
        let mut polled = 0;

        for _ in 0..queued {
            let Some(id) = self.injector.tasks.pop() else {
                break;
            };

            let taken = {
                let mut tasks = self.tasks.borrow_mut();
                tasks.get_mut(&id).and_then(|task| {
                    task.try_take()
                        .map(|future| (task.header.clone(), task.waker.clone(), future))
                })
            };
            let Some((header, waker, mut future)) = taken else {
                continue;
            };

            header.begin_poll();
            let mut cx = Context::from_waker(&waker);
            polled += 1;
            match future.as_mut().poll(&mut cx) {
                Poll::Ready(()) => {
                    header.complete();
                    self.tasks.borrow_mut().remove(&id);
                    gauge!("chanloop_tasks_pending_current").decrement(1.0);
                    trace!(task = id.0, "task completed");
                }
                Poll::Pending => {
                    if let Some(task) = self.tasks.borrow_mut().get_mut(&id) {
                        task.restore(future);
                    }
                }
            }
        }
        polled
    }

    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Drops every task. Futures are dropped with no borrow held, so their destructors may
    /// call back into the loop.
    pub fn clear(&self) {
        let tasks = mem::take(&mut *self.tasks.borrow_mut());
        let n = tasks.len();
        drop(tasks);
        if n > 0 {
            gauge!("chanloop_tasks_pending_current").decrement(n as f64);
        }
    }
}
