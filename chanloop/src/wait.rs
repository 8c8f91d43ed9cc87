//! Pending waits: the resolution boxes between callbacks and suspended tasks.
//!
//! A wait is created when a task suspends in [`Recv`](crate::Recv) or
//! [`Sleep`](crate::time::Sleep). Exactly one of data/closure, timer expiry or cancellation
//! resolves it. Resolution writes the result into the box and wakes the task; the task picks
//! it up the next time the loop polls it. Resolving a wait that is no longer pending does
//! nothing, so a late event can never resume a task twice.

use std::collections::HashMap;
use std::task::{Poll, Waker};

use metrics::counter;
use tracing::trace;

use crate::adapter::ChannelId;
use crate::channel::Message;
use crate::error::InvariantViolation;
use crate::reactor::TimerId;

/// Terminal result of a receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A message arrived.
    Data(Message),
    /// The channel closed or failed while the wait was outstanding.
    Closed,
    /// The receive timeout elapsed first.
    TimedOut,
}

impl Outcome {
    pub fn into_data(self) -> Option<Message> {
        match self {
            Outcome::Data(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Outcome::Closed)
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Outcome::TimedOut)
    }

    fn label(&self) -> &'static str {
        match self {
            Outcome::Data(_) => "data",
            Outcome::Closed => "closed",
            Outcome::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitId(u64);

impl WaitId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Where a `recv` or `sleep` future stands with respect to its wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitSlot {
    Unregistered,
    Waiting(WaitId),
    /// Completed; carries the wait when there was one.
    Done(Option<WaitId>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Resolution {
    Outcome(Outcome),
    /// A bare sleep reached its deadline.
    Elapsed,
}

enum WaitState {
    Pending,
    Resolved(Resolution),
}

struct PendingWait {
    state: WaitState,
    waker: Waker,
    timer: Option<TimerId>,
    channel: Option<ChannelId>,
}

/// What a resolution or cancellation leaves for the caller to clean up.
#[derive(Debug, Default)]
pub(crate) struct Detached {
    pub timer: Option<TimerId>,
    pub channel: Option<ChannelId>,
    /// Data handed to a wait that was cancelled before its task saw it.
    pub unclaimed: Option<Message>,
}

#[derive(Default)]
pub(crate) struct WaitTable {
    waits: HashMap<WaitId, PendingWait>,
    next_id: u64,
}

impl WaitTable {
    pub fn insert(&mut self, channel: Option<ChannelId>, waker: Waker) -> WaitId {
        let id = WaitId(self.next_id);
        self.next_id += 1;
        self.waits.insert(
            id,
            PendingWait {
                state: WaitState::Pending,
                waker,
                timer: None,
                channel,
            },
        );
        id
    }

    pub fn set_timer(&mut self, id: WaitId, timer: TimerId) {
        if let Some(wait) = self.waits.get_mut(&id) {
            wait.timer = Some(timer);
        }
    }

    pub fn channel_of(&self, id: WaitId) -> Option<ChannelId> {
        self.waits.get(&id).and_then(|w| w.channel)
    }

    /// Resolves a pending wait and wakes its task.
    ///
    /// Returns `None` when the wait is not pending any more; nothing is woken then.
    pub fn resolve(&mut self, id: WaitId, resolution: Resolution) -> Option<Detached> {
        let wait = self.waits.get_mut(&id)?;
        if !matches!(wait.state, WaitState::Pending) {
            return None;
        }

        match &resolution {
            Resolution::Outcome(outcome) => {
                counter!("chanloop_waits_resolved_total", "outcome" => outcome.label())
                    .increment(1);
            }
            Resolution::Elapsed => {
                counter!("chanloop_waits_resolved_total", "outcome" => "elapsed").increment(1);
            }
        }
        trace!(wait = id.0, ?resolution, "wait resolved");

        wait.state = WaitState::Resolved(resolution);
        wait.waker.wake_by_ref();
        Some(Detached {
            timer: wait.timer.take(),
            channel: wait.channel,
            unclaimed: None,
        })
    }

    /// Takes the resolution if there is one, otherwise refreshes the stored waker.
    pub fn poll(
        &mut self,
        id: WaitId,
        waker: &Waker,
    ) -> Poll<Result<Resolution, InvariantViolation>> {
        let Some(wait) = self.waits.get_mut(&id) else {
            return Poll::Ready(Err(InvariantViolation::WaitPolledAfterCompletion {
                wait: Some(id.0),
                channel: None,
            }));
        };

        if let WaitState::Pending = wait.state {
            if !wait.waker.will_wake(waker) {
                wait.waker = waker.clone();
            }
            return Poll::Pending;
        }

        match self.waits.remove(&id).map(|w| w.state) {
            Some(WaitState::Resolved(resolution)) => Poll::Ready(Ok(resolution)),
            _ => Poll::Ready(Err(InvariantViolation::WaitPolledAfterCompletion {
                wait: Some(id.0),
                channel: None,
            })),
        }
    }

    /// Drops a wait whose future went away. Unknown ids are ignored.
    pub fn cancel(&mut self, id: WaitId) -> Option<Detached> {
        let wait = self.waits.remove(&id)?;
        trace!(wait = id.0, "wait cancelled");
        let unclaimed = match wait.state {
            WaitState::Resolved(Resolution::Outcome(Outcome::Data(msg))) => Some(msg),
            _ => None,
        };
        Some(Detached {
            timer: wait.timer,
            channel: wait.channel,
            unclaimed,
        })
    }

    pub fn is_pending(&self, id: WaitId) -> bool {
        matches!(
            self.waits.get(&id).map(|w| &w.state),
            Some(WaitState::Pending)
        )
    }

    pub fn len(&self) -> usize {
        self.waits.len()
    }
}
