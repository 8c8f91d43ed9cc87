//! Channel registrations and the `recv` suspend point.
//!
//! Registering a channel subscribes an [`Inbox`] to its callbacks. The callbacks never touch
//! loop state directly: they push onto the inbox's lock-free queue and flag the channel on the
//! injector, and the loop drains the inbox on its own thread. The one exception is descriptor
//! disarm, which has to happen before the channel releases its descriptor and therefore runs
//! synchronously through the thread-safe [`Registrar`].

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use mio::Token;

use crate::channel::{ChildEvent, Channel, Message, State, SubscriptionId};
use crate::error::{LoopError, PostError};
use crate::executor::Injector;
use crate::reactor::{Registrar, TimerId};
use crate::runtime::Handle;
use crate::wait::{Outcome, WaitId, WaitSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub(crate) u64);

impl ChannelId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

pub(crate) enum Notification {
    Data(Message),
    State(State),
    Child(ChildEvent),
}

struct Arming {
    /// The channel last announced `Active` and has not started closing since.
    live: bool,
    token: Option<Token>,
}

/// Notification queue shared between a channel's callbacks and the loop.
pub(crate) struct Inbox {
    id: ChannelId,
    queue: SegQueue<Notification>,
    arming: Mutex<Arming>,
    detached: AtomicBool,
    injector: Arc<Injector>,
    registrar: Arc<Registrar>,
}

impl Inbox {
    pub fn new(
        id: ChannelId,
        live: bool,
        injector: Arc<Injector>,
        registrar: Arc<Registrar>,
    ) -> Self {
        Self {
            id,
            queue: SegQueue::new(),
            arming: Mutex::new(Arming { live, token: None }),
            detached: AtomicBool::new(false),
            injector,
            registrar,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Arming> {
        self.arming.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, notification: Notification) {
        if self.detached.load(Ordering::Acquire) {
            return;
        }
        self.queue.push(notification);
        self.injector.mark_dirty(self.id);
    }

    pub fn on_data(&self, msg: &Message) {
        self.push(Notification::Data(msg.clone()));
    }

    pub fn on_state(&self, state: State) {
        {
            let mut arming = self.lock();
            match state {
                State::Active => arming.live = true,
                State::Opening => {}
                State::Closing | State::Closed | State::Error => {
                    arming.live = false;
                    if let Some(token) = arming.token.take() {
                        self.registrar.deregister(token);
                    }
                }
            }
        }
        self.push(Notification::State(state));
    }

    pub fn on_child(&self, event: ChildEvent) {
        self.push(Notification::Child(event));
    }

    pub fn pop(&self) -> Option<Notification> {
        self.queue.pop()
    }

    pub fn is_live(&self) -> bool {
        self.lock().live
    }

    pub fn armed(&self) -> Option<Token> {
        self.lock().token
    }

    /// Registers a descriptor through `register` while holding the arming lock, so a
    /// concurrent close either happens first (nothing is registered) or waits and then
    /// deregisters what was registered.
    pub fn arm_with(
        &self,
        register: impl FnOnce() -> Result<Token, LoopError>,
    ) -> Result<Option<Token>, LoopError> {
        let mut arming = self.lock();
        if !arming.live || arming.token.is_some() {
            return Ok(None);
        }
        let token = register()?;
        arming.token = Some(token);
        Ok(Some(token))
    }

    pub fn disarm(&self) -> Option<Token> {
        let token = self.lock().token.take();
        if let Some(token) = token {
            self.registrar.deregister(token);
        }
        token
    }

    /// Stops accepting notifications and releases the descriptor.
    pub fn detach(&self) -> Option<Token> {
        self.detached.store(true, Ordering::Release);
        self.lock().live = false;
        self.disarm()
    }
}

/// Loop-side bookkeeping for one channel.
pub(crate) struct Registration {
    pub name: String,
    pub channel: Rc<dyn Channel>,
    pub inbox: Arc<Inbox>,
    /// Last state observed through notifications.
    pub state: State,
    /// The channel went to `Closed`/`Error` after being seen open; no more data is coming.
    pub ended: bool,
    /// Messages that arrived with nobody waiting, in emission order.
    pub buffer: VecDeque<Message>,
    /// Outstanding receives, oldest first.
    pub waiters: VecDeque<WaitId>,
    pub poll_tick: Option<TimerId>,
    pub subscription: SubscriptionId,
    /// Polling is paused: no descriptor in the poll set, no poll tick.
    pub suspended: bool,
    /// Parent that announced this channel; `None` for channels added through a handle.
    pub parent: Option<ChannelId>,
    /// A sub-channel that an adapter has taken over.
    pub claimed: bool,
    /// Sub-channels announced by this channel, in announcement order.
    pub children: Vec<ChannelId>,
}

impl Registration {
    pub fn new(
        channel: Rc<dyn Channel>,
        inbox: Arc<Inbox>,
        subscription: SubscriptionId,
        parent: Option<ChannelId>,
    ) -> Self {
        let state = channel.state();
        Self {
            name: channel.name().to_string(),
            channel,
            inbox,
            state,
            ended: state == State::Error,
            buffer: VecDeque::new(),
            waiters: VecDeque::new(),
            poll_tick: None,
            subscription,
            suspended: false,
            parent,
            claimed: false,
            children: Vec::new(),
        }
    }

    pub fn forget_waiter(&mut self, wait: WaitId) {
        self.waiters.retain(|w| *w != wait);
    }
}

/// A channel registered with a loop.
///
/// Dropping the adapter deregisters the channel; outstanding receives resolve with
/// [`Outcome::Closed`]. The channel itself stays with its owner.
pub struct ChannelAdapter {
    id: ChannelId,
    name: String,
    channel: Rc<dyn Channel>,
    handle: Handle,
}

impl ChannelAdapter {
    pub(crate) fn new(id: ChannelId, channel: Rc<dyn Channel>, handle: Handle) -> Self {
        Self {
            id,
            name: channel.name().to_string(),
            channel,
            handle,
        }
    }

    /// Registration id, unique within the loop.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Name of the channel at registration time.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The registered channel, for operations the adapter does not wrap.
    pub fn channel(&self) -> &Rc<dyn Channel> {
        &self.channel
    }

    /// Current channel state, as the channel reports it.
    ///
    /// This may run ahead of what the loop has processed: a channel that just closed
    /// reports `Closed` while a buffered message is still waiting for `recv`.
    pub fn state(&self) -> State {
        self.channel.state()
    }

    /// Posts through the channel. Never suspends.
    ///
    /// # Errors
    ///
    /// Whatever [`Channel::post`] reports, unchanged.
    pub fn post(&self, data: &[u8], seq: i64) -> Result<(), PostError> {
        self.channel.post(data, seq)
    }

    /// Stops watching the channel without closing it.
    ///
    /// Its descriptor leaves the poll set and its poll tick stops, so input piles up inside
    /// the channel. Outstanding receives keep waiting; their timeouts still run, and a
    /// close still resolves them. Data the channel pushes on its own, like a direct
    /// channel's, is still delivered.
    pub fn suspend(&self) {
        self.handle.with_state(|state| state.suspend(self.id));
    }

    /// Undoes [`suspend`](Self::suspend). Input that piled up meanwhile is delivered.
    ///
    /// # Errors
    ///
    /// [`LoopError::Invariant`] when the descriptor cannot go back into the poll set because
    /// another registration holds it.
    pub fn resume(&self) -> Result<(), LoopError> {
        self.handle.with_state(|state| state.resume(self.id))
    }

    pub fn is_suspended(&self) -> bool {
        self.handle.with_state(|state| state.is_suspended(self.id))
    }

    /// Takes over the sub-channels this channel announced since the last call.
    ///
    /// The loop watches announced sub-channels from the moment they are announced and
    /// buffers their data; the returned adapters receive it. Sub-channels nobody took over
    /// are deregistered together with their parent.
    pub fn take_children(&self) -> Vec<ChannelAdapter> {
        let children = self.handle.with_state(|state| state.take_children(self.id));
        children
            .into_iter()
            .map(|(id, channel)| ChannelAdapter::new(id, channel, self.handle.clone()))
            .collect()
    }

    /// Waits for the next message.
    ///
    /// Resolves with the oldest undelivered message, with [`Outcome::Closed`] once the channel
    /// has ended and nothing is buffered, or with [`Outcome::TimedOut`] when `timeout` elapses
    /// first. Concurrent receives on one channel are served first come, first served.
    pub fn recv(&self, timeout: Option<Duration>) -> Recv<'_> {
        Recv {
            adapter: self,
            timeout,
            slot: WaitSlot::Unregistered,
        }
    }
}

impl Drop for ChannelAdapter {
    fn drop(&mut self) {
        self.handle.detach_channel(self.id);
    }
}

/// Future returned by [`ChannelAdapter::recv`].
#[must_use = "futures do nothing unless awaited"]
pub struct Recv<'a> {
    adapter: &'a ChannelAdapter,
    timeout: Option<Duration>,
    slot: WaitSlot,
}

impl Future for Recv<'_> {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Outcome> {
        let this = self.get_mut();
        let adapter = this.adapter;
        adapter
            .handle
            .with_state(|state| state.poll_recv(adapter.id, this.timeout, &mut this.slot, cx))
    }
}

impl Drop for Recv<'_> {
    fn drop(&mut self) {
        if let WaitSlot::Waiting(wait) = self.slot {
            self.adapter.handle.cancel_wait(wait);
        }
    }
}
