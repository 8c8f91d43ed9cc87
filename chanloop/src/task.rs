//! Tasks: the suspendable units of sequential code the loop drives.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll, Waker};

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const COMPLETED: u8 = 2;

/// A pinned, heap-allocated future that produces no output.
///
/// Tasks never leave the loop's thread, so the future does not have to be `Send`.
pub(crate) type TaskFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) u64);

/// The part of a task that wakers carry around, possibly to other threads.
pub(crate) struct TaskHeader {
    pub id: TaskId,
    state: AtomicU8,
}

impl TaskHeader {
    pub fn new(id: TaskId) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: AtomicU8::new(IDLE),
        })
    }

    /// Moves an idle task to scheduled. `false` if it was already queued or has finished,
    /// in which case it must not be queued again.
    pub fn try_schedule(&self) -> bool {
        self.state
            .compare_exchange(IDLE, SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Called right before polling; wakes from now on queue the task again.
    pub fn begin_poll(&self) {
        self.state.store(IDLE, Ordering::Release);
    }

    pub fn complete(&self) {
        self.state.store(COMPLETED, Ordering::Release);
    }
}

pub(crate) struct Task {
    pub header: Arc<TaskHeader>,
    pub waker: Waker,
    future: Option<TaskFuture>,
}

impl Task {
    pub fn new(header: Arc<TaskHeader>, waker: Waker, future: TaskFuture) -> Self {
        Self {
            header,
            waker,
            future: Some(future),
        }
    }

    /// Takes the future out for polling. `None` while another poll holds it.
    pub fn try_take(&mut self) -> Option<TaskFuture> {
        self.future.take()
    }

    pub fn restore(&mut self, future: TaskFuture) {
        self.future = Some(future);
    }
}

struct JoinSlot<T> {
    output: Option<T>,
    finished: bool,
    waiter: Option<Waker>,
}

/// Awaitable result of a spawned task.
pub struct JoinHandle<T> {
    slot: Rc<RefCell<JoinSlot<T>>>,
}

impl<T> JoinHandle<T> {
    pub fn is_finished(&self) -> bool {
        self.slot.borrow().finished
    }

    pub(crate) fn try_take(&self) -> Option<T> {
        self.slot.borrow_mut().output.take()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut slot = self.slot.borrow_mut();
        match slot.output.take() {
            Some(output) => Poll::Ready(output),
            None => {
                slot.waiter = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Wraps `future` so its output lands in the returned [`JoinHandle`].
pub(crate) fn joinable<F>(future: F) -> (TaskFuture, JoinHandle<F::Output>)
where
    F: Future + 'static,
    F::Output: 'static,
{
    let slot = Rc::new(RefCell::new(JoinSlot {
        output: None,
        finished: false,
        waiter: None,
    }));
    let out = slot.clone();
    let task = Box::pin(async move {
        let output = future.await;
        let waiter = {
            let mut slot = out.borrow_mut();
            slot.output = Some(output);
            slot.finished = true;
            slot.waiter.take()
        };
        if let Some(waiter) = waiter {
            waiter.wake();
        }
    });
    (task, JoinHandle { slot })
}
