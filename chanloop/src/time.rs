//! Timed suspension.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use crate::runtime::Handle;
use crate::wait::WaitSlot;

/// Future returned by [`Handle::sleep`].
///
/// The deadline is fixed when the future is created. The first poll always suspends, even
/// when the deadline has already passed, so a zero sleep still yields to the loop once.
/// A duration too large to add to the current instant has no deadline: the sleep never
/// finishes on its own.
#[must_use = "futures do nothing unless awaited"]
pub struct Sleep {
    handle: Handle,
    deadline: Option<Instant>,
    slot: WaitSlot,
}

impl Sleep {
    pub(crate) fn new(handle: Handle, deadline: Option<Instant>) -> Self {
        Self {
            handle,
            deadline,
            slot: WaitSlot::Unregistered,
        }
    }

    /// When the sleep finishes; `None` when it never does.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let deadline = this.deadline;
        this.handle
            .with_state(|state| state.poll_sleep(deadline, &mut this.slot, cx))
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let WaitSlot::Waiting(wait) = self.slot {
            self.handle.cancel_wait(wait);
        }
    }
}
