//! Task wakers.
//!
//! Waking a task re-queues it on the loop's [`Injector`]. Wakers are `Send + Sync` like any
//! [`Waker`], so a channel callback on a foreign thread can wake a task; the injector then
//! interrupts the loop's blocking poll.

use std::sync::Arc;
use std::task::{RawWaker, RawWakerVTable, Waker};

use crate::executor::Injector;
use crate::task::TaskHeader;

struct WakerData {
    task: Arc<TaskHeader>,
    injector: Arc<Injector>,
}

impl WakerData {
    fn schedule(&self) {
        if self.task.try_schedule() {
            self.injector.schedule(self.task.id);
        }
    }
}

pub(crate) fn task_waker(task: Arc<TaskHeader>, injector: Arc<Injector>) -> Waker {
    let data = Box::new(WakerData { task, injector });
    let ptr = Box::into_raw(data) as *const ();
    // SAFETY: `ptr` owns a `WakerData` and VTABLE treats it as exactly that.
    unsafe { Waker::from_raw(RawWaker::new(ptr, &VTABLE)) }
}

unsafe fn clone(data: *const ()) -> RawWaker {
    // Borrow, do not take ownership.
    let data = unsafe { &*(data as *const WakerData) };
    let cloned = Box::new(WakerData {
        task: data.task.clone(),
        injector: data.injector.clone(),
    });
    RawWaker::new(Box::into_raw(cloned) as *const (), &VTABLE)
}

unsafe fn wake(data: *const ()) {
    // Take ownership so the box drops at the end.
    let data = unsafe { Box::from_raw(data as *mut WakerData) };
    data.schedule();
}

unsafe fn wake_by_ref(data: *const ()) {
    let data = unsafe { &*(data as *const WakerData) };
    data.schedule();
}

unsafe fn drop(data: *const ()) {
    let _ = unsafe { Box::from_raw(data as *mut WakerData) };
}

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
