//! The channel collaborator interface.
//!
//! A channel is an externally supplied message endpoint. The loop never owns its transport;
//! it only subscribes to its notifications, asks it to [`process`](Channel::process) buffered
//! input, and watches its optional readiness descriptor.
//!
//! Implementations must respect a small contract:
//!
//! - callbacks may be invoked from any thread, and must not block on the loop;
//! - state notifications are emitted in transition order;
//! - [`State::Closing`] (or a terminal state) is emitted *before* the readiness descriptor is
//!   released, so the loop can take it out of the poll set while the number is still theirs.

pub mod direct;
pub mod mem;

use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{ChannelError, PostError};

/// Channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Closed,
    Opening,
    Active,
    Closing,
    Error,
}

impl State {
    /// `true` for states after which no more data arrives until a reopen.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Closed | State::Error)
    }
}

/// One delivered message.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub seq: i64,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(seq: i64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            seq,
            data: data.into(),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("seq", &self.seq)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Result of one [`Channel::process`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Something was delivered; there may be more.
    Busy,
    /// Nothing left to deliver right now.
    Idle,
}

/// Data notification callback.
pub type DataCallback = Arc<dyn Fn(&Message) + Send + Sync>;

/// State-change notification callback.
pub type StateCallback = Arc<dyn Fn(State) + Send + Sync>;

/// A channel that can be handed across threads, as sub-channels are.
pub type SharedChannel = Arc<dyn Channel + Send + Sync>;

/// Sub-channel notification callback.
pub type ChildCallback = Arc<dyn Fn(ChildEvent) + Send + Sync>;

/// Identifies one [`Channel::subscribe`] call, for [`Channel::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Announcement of a sub-channel created or dropped by its parent, like an accepted
/// connection of a listening socket.
#[derive(Clone)]
pub enum ChildEvent {
    /// A new sub-channel. The loop registers it on the parent's behalf.
    Added(SharedChannel),
    /// The sub-channel with this name is gone.
    Deleted(String),
}

impl fmt::Debug for ChildEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildEvent::Added(child) => f.debug_tuple("Added").field(&child.name()).finish(),
            ChildEvent::Deleted(name) => f.debug_tuple("Deleted").field(name).finish(),
        }
    }
}

/// An external message endpoint.
pub trait Channel {
    fn name(&self) -> &str;

    fn open(&self) -> Result<(), ChannelError>;

    fn close(&self);

    fn post(&self, data: &[u8], seq: i64) -> Result<(), PostError>;

    fn state(&self) -> State;

    /// OS-level descriptor that turns readable when [`process`](Channel::process) has work.
    ///
    /// Only consulted while the channel is [`State::Active`].
    fn readiness(&self) -> Option<RawFd> {
        None
    }

    fn subscribe(&self, on_data: DataCallback, on_state: StateCallback) -> SubscriptionId;

    /// Drops the callbacks of `id`. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);

    /// Adds a sub-channel callback to subscription `id`.
    ///
    /// Only channels that spawn sub-channels need to keep it; the default drops it.
    fn watch_children(&self, _id: SubscriptionId, _on_child: ChildCallback) {}

    /// Deliver buffered input through the subscribed callbacks.
    fn process(&self) -> Result<Progress, ChannelError> {
        Ok(Progress::Idle)
    }

    /// Whether a descriptor-less channel needs to be polled at all.
    ///
    /// Channels that deliver synchronously from the peer's `post` return `false`.
    fn wants_process(&self) -> bool {
        true
    }
}

impl<C: Channel + ?Sized> Channel for Arc<C> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn open(&self) -> Result<(), ChannelError> {
        (**self).open()
    }

    fn close(&self) {
        (**self).close()
    }

    fn post(&self, data: &[u8], seq: i64) -> Result<(), PostError> {
        (**self).post(data, seq)
    }

    fn state(&self) -> State {
        (**self).state()
    }

    fn readiness(&self) -> Option<RawFd> {
        (**self).readiness()
    }

    fn subscribe(&self, on_data: DataCallback, on_state: StateCallback) -> SubscriptionId {
        (**self).subscribe(on_data, on_state)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        (**self).unsubscribe(id)
    }

    fn watch_children(&self, id: SubscriptionId, on_child: ChildCallback) {
        (**self).watch_children(id, on_child)
    }

    fn process(&self) -> Result<Progress, ChannelError> {
        (**self).process()
    }

    fn wants_process(&self) -> bool {
        (**self).wants_process()
    }
}

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    on_data: DataCallback,
    on_state: StateCallback,
}

/// Fan-out list of subscriber callbacks, shared by the reference channels.
#[derive(Default)]
pub(crate) struct Subscribers {
    entries: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl Subscribers {
    pub(crate) fn add(&self, on_data: DataCallback, on_state: StateCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push(Subscriber {
            id,
            on_data,
            on_state,
        });
        id
    }

    pub(crate) fn remove(&self, id: SubscriptionId) {
        self.lock().retain(|s| s.id != id);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn data(&self, msg: &Message) {
        // Clone out so callbacks run without the lock held.
        let entries = self.lock().clone();
        for s in &entries {
            (s.on_data)(msg);
        }
    }

    pub(crate) fn state(&self, state: State) {
        let entries = self.lock().clone();
        for s in &entries {
            (s.on_state)(state);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
