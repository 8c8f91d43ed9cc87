//! The event loop.
//!
//! A [`Loop`] owns the multiplexer, the timer queue, the wait table and every channel
//! registration, and drives tasks on the thread that calls [`Loop::run`]. Each turn it
//!
//! 1. polls the tasks that were woken,
//! 2. drains channel inboxes, the processing backlog and expired timers,
//! 3. blocks in the multiplexer until the earliest timer deadline (not at all when there is
//!    work pending), and
//! 4. dispatches the readable descriptors and the timers that expired meanwhile.
//!
//! Everything runs on that one thread. Other threads only reach the loop through wakers and
//! channel callbacks, both of which go through lock-free queues.
//!
//! There is no ambient "current loop": code that needs the loop gets a [`Handle`].

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::mem;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use metrics::counter;
use mio::Token;
use tracing::{debug, error, info, trace, warn};

use crate::adapter::{ChannelAdapter, ChannelId, Inbox, Notification, Registration};
use crate::channel::{Channel, ChildEvent, Message, Progress, State};
use crate::config::{LoopConfig, POLL_TICK};
use crate::error::{InvariantViolation, LoopError};
use crate::executor::{Executor, Injector};
use crate::reactor::{Multiplexer, ReadinessHandle, Registrar, TimerQueue};
use crate::task::{JoinHandle, joinable};
use crate::time::Sleep;
use crate::wait::{Outcome, Resolution, WaitId, WaitSlot, WaitTable};

/// What a timer does when it fires.
pub(crate) enum TimerAction {
    /// Deadline of a sleep, or timeout of a receive.
    Expire(WaitId),
    /// Next poll of a channel that has no readiness descriptor.
    PollTick(ChannelId),
}

pub(crate) struct LoopState {
    registrations: HashMap<ChannelId, Registration>,
    tokens: HashMap<Token, ChannelId>,
    waits: WaitTable,
    timers: TimerQueue<TimerAction>,
    backlog: VecDeque<ChannelId>,
    violation: Option<InvariantViolation>,
    next_channel: u64,
    process_budget: usize,
    registrar: Arc<Registrar>,
    injector: Arc<Injector>,
}

impl LoopState {
    fn new(config: &LoopConfig, registrar: Arc<Registrar>, injector: Arc<Injector>) -> Self {
        Self {
            registrations: HashMap::new(),
            tokens: HashMap::new(),
            waits: WaitTable::default(),
            timers: TimerQueue::new(),
            backlog: VecDeque::new(),
            violation: None,
            next_channel: 0,
            process_budget: config.process_budget,
            registrar,
            injector,
        }
    }

    fn record(&mut self, violation: InvariantViolation) {
        error!(%violation, "invariant violation");
        // Keep the first one; later ones are usually fallout.
        if self.violation.is_none() {
            self.violation = Some(violation);
        }
    }

    fn add_channel(
        &mut self,
        channel: Rc<dyn Channel>,
        parent: Option<ChannelId>,
    ) -> Result<ChannelId, LoopError> {
        let id = ChannelId(self.next_channel);
        self.next_channel += 1;

        let inbox = Arc::new(Inbox::new(
            id,
            channel.state() == State::Active,
            self.injector.clone(),
            self.registrar.clone(),
        ));
        let on_data = inbox.clone();
        let on_state = inbox.clone();
        let subscription = channel.subscribe(
            Arc::new(move |msg: &Message| on_data.on_data(msg)),
            Arc::new(move |state: State| on_state.on_state(state)),
        );
        let on_child = inbox.clone();
        channel.watch_children(
            subscription,
            Arc::new(move |event: ChildEvent| on_child.on_child(event)),
        );

        let registration = Registration::new(channel, inbox, subscription, parent);
        info!(
            channel = %registration.name,
            id = id.0,
            parent = ?parent.map(ChannelId::as_u64),
            state = ?registration.state,
            readiness = ?ReadinessHandle::of(&*registration.channel),
            "channel added"
        );
        self.registrations.insert(id, registration);

        if let Err(e) = self.arm(id) {
            self.remove_channel(id);
            return Err(e);
        }
        Ok(id)
    }

    fn remove_channel(&mut self, id: ChannelId) {
        let Some(mut reg) = self.registrations.remove(&id) else {
            return;
        };
        if let Some(token) = reg.inbox.detach() {
            self.tokens.remove(&token);
        }
        reg.channel.unsubscribe(reg.subscription);
        if let Some(tick) = reg.poll_tick.take() {
            self.timers.cancel(tick);
        }
        self.backlog.retain(|c| *c != id);

        for child in mem::take(&mut reg.children) {
            if self.registrations.get(&child).is_some_and(|c| !c.claimed) {
                self.remove_channel(child);
            }
        }
        if let Some(parent) = reg.parent.and_then(|p| self.registrations.get_mut(&p)) {
            parent.children.retain(|c| *c != id);
        }

        for wait in reg.waiters.drain(..) {
            if let Some(detached) = self.waits.resolve(wait, Resolution::Outcome(Outcome::Closed))
            {
                if let Some(timer) = detached.timer {
                    self.timers.cancel(timer);
                }
            }
        }
        info!(channel = %reg.name, id = id.0, "channel removed");
    }

    /// Starts watching an active channel: its descriptor goes into the poll set, or a poll
    /// tick is scheduled when it has none.
    fn arm(&mut self, id: ChannelId) -> Result<(), LoopError> {
        let Some(reg) = self.registrations.get_mut(&id) else {
            return Ok(());
        };
        if reg.suspended || !reg.inbox.is_live() {
            return Ok(());
        }

        match ReadinessHandle::of(&*reg.channel).descriptor() {
            Some(fd) => {
                let registrar = &self.registrar;
                let name = &reg.name;
                if let Some(token) = reg.inbox.arm_with(|| registrar.register(fd, name))? {
                    info!(channel = %reg.name, fd, token = token.0, "descriptor armed");
                    self.tokens.insert(token, id);
                }
            }
            None => {
                if reg.channel.wants_process() && reg.poll_tick.is_none() {
                    let tick = self
                        .timers
                        .schedule(Instant::now() + POLL_TICK, TimerAction::PollTick(id));
                    reg.poll_tick = Some(tick);
                }
            }
        }
        Ok(())
    }

    fn disarm(&mut self, id: ChannelId) {
        let Some(reg) = self.registrations.get_mut(&id) else {
            return;
        };
        if let Some(token) = reg.inbox.disarm() {
            debug!(channel = %reg.name, token = token.0, "descriptor disarmed");
        }
        if let Some(tick) = reg.poll_tick.take() {
            self.timers.cancel(tick);
        }
        self.tokens.retain(|_, channel| *channel != id);
    }

    pub(crate) fn suspend(&mut self, id: ChannelId) {
        let Some(reg) = self.registrations.get_mut(&id) else {
            return;
        };
        if reg.suspended {
            return;
        }
        reg.suspended = true;
        debug!(channel = %reg.name, waiters = reg.waiters.len(), "channel suspended");
        self.disarm(id);
        self.backlog.retain(|c| *c != id);
    }

    pub(crate) fn resume(&mut self, id: ChannelId) -> Result<(), LoopError> {
        let Some(reg) = self.registrations.get_mut(&id) else {
            return Ok(());
        };
        if !reg.suspended {
            return Ok(());
        }
        reg.suspended = false;
        debug!(channel = %reg.name, "channel resumed");
        let live = reg.inbox.is_live();
        self.arm(id)?;
        // Input that arrived while suspended may not produce a fresh readiness edge.
        if live && !self.backlog.contains(&id) {
            self.backlog.push_back(id);
        }
        Ok(())
    }

    pub(crate) fn is_suspended(&self, id: ChannelId) -> bool {
        self.registrations.get(&id).is_some_and(|r| r.suspended)
    }

    /// Hands out the announced sub-channels nobody has taken yet.
    pub(crate) fn take_children(&mut self, id: ChannelId) -> Vec<(ChannelId, Rc<dyn Channel>)> {
        self.pump(id);
        let Some(reg) = self.registrations.get(&id) else {
            return Vec::new();
        };
        let mut taken = Vec::new();
        for child in reg.children.clone() {
            if let Some(c) = self.registrations.get_mut(&child) {
                if !c.claimed {
                    c.claimed = true;
                    taken.push((child, c.channel.clone()));
                }
            }
        }
        taken
    }

    fn on_child(&mut self, parent: ChannelId, event: ChildEvent) {
        match event {
            ChildEvent::Added(shared) => {
                let channel: Rc<dyn Channel> = Rc::new(shared);
                match self.add_channel(channel, Some(parent)) {
                    Ok(child) => {
                        if let Some(reg) = self.registrations.get_mut(&parent) {
                            reg.children.push(child);
                        }
                    }
                    Err(LoopError::Invariant(v)) => self.record(v),
                    Err(e) => warn!(error = %e, "failed to watch sub-channel"),
                }
            }
            ChildEvent::Deleted(name) => {
                let Some(reg) = self.registrations.get(&parent) else {
                    return;
                };
                let child = reg.children.iter().copied().find(|c| {
                    self.registrations
                        .get(c)
                        .is_some_and(|r| r.name == name)
                });
                match child {
                    Some(child) => self.remove_channel(child),
                    None => debug!(parent = %reg.name, child = %name, "unknown sub-channel deleted"),
                }
            }
        }
    }

    /// Moves everything the channel's callbacks queued into loop state, in arrival order.
    fn pump(&mut self, id: ChannelId) {
        loop {
            let Some(reg) = self.registrations.get(&id) else {
                return;
            };
            let Some(notification) = reg.inbox.pop() else {
                return;
            };
            match notification {
                Notification::Data(msg) => self.deliver(id, msg),
                Notification::State(state) => self.transition(id, state),
                Notification::Child(event) => self.on_child(id, event),
            }
        }
    }

    /// Hands `msg` to the oldest outstanding receive, or buffers it.
    fn deliver(&mut self, id: ChannelId, msg: Message) {
        let Some(reg) = self.registrations.get_mut(&id) else {
            return;
        };
        while let Some(wait) = reg.waiters.pop_front() {
            if !self.waits.is_pending(wait) {
                continue;
            }
            if let Some(detached) = self.waits.resolve(wait, Resolution::Outcome(Outcome::Data(msg)))
            {
                if let Some(timer) = detached.timer {
                    self.timers.cancel(timer);
                }
            }
            return;
        }
        reg.buffer.push_back(msg);
    }

    fn transition(&mut self, id: ChannelId, state: State) {
        let Some(reg) = self.registrations.get_mut(&id) else {
            return;
        };
        let old = reg.state;
        reg.state = state;
        debug!(channel = %reg.name, ?old, new = ?state, "channel state");

        if state.is_terminal() {
            self.disarm(id);
            let Some(reg) = self.registrations.get_mut(&id) else {
                return;
            };
            reg.ended = true;
            let waiters: Vec<_> = reg.waiters.drain(..).collect();
            for wait in waiters {
                self.resolve(wait, Resolution::Outcome(Outcome::Closed));
            }
            return;
        }

        match state {
            State::Active => {
                reg.ended = false;
                if let Err(e) = self.arm(id) {
                    match e {
                        LoopError::Invariant(v) => self.record(v),
                        other => warn!(error = %other, "failed to watch channel"),
                    }
                }
            }
            State::Closing => self.disarm(id),
            _ => reg.ended = false,
        }
    }

    /// Resolves a wait and tears down whatever else could still resolve it.
    fn resolve(&mut self, wait: WaitId, resolution: Resolution) {
        let Some(detached) = self.waits.resolve(wait, resolution) else {
            return;
        };
        if let Some(timer) = detached.timer {
            self.timers.cancel(timer);
        }
        if let Some(reg) = detached
            .channel
            .and_then(|c| self.registrations.get_mut(&c))
        {
            reg.forget_waiter(wait);
        }
    }

    pub(crate) fn cancel_wait(&mut self, wait: WaitId) {
        let Some(detached) = self.waits.cancel(wait) else {
            return;
        };
        if let Some(timer) = detached.timer {
            self.timers.cancel(timer);
        }
        let Some(channel) = detached.channel else {
            return;
        };
        if let Some(reg) = self.registrations.get_mut(&channel) {
            reg.forget_waiter(wait);
        }
        if let Some(msg) = detached.unclaimed {
            trace!(channel = channel.0, seq = msg.seq, "returning unclaimed message");
            self.requeue(channel, msg);
        }
    }

    /// Puts back a message whose receiver went away. It is older than anything buffered.
    fn requeue(&mut self, id: ChannelId, msg: Message) {
        let Some(reg) = self.registrations.get_mut(&id) else {
            return;
        };
        if reg.waiters.is_empty() {
            reg.buffer.push_front(msg);
        } else {
            self.deliver(id, msg);
        }
    }

    /// Lets a channel deliver up to the process budget, then pumps its inbox.
    fn drain(&mut self, id: ChannelId) {
        let Some(reg) = self.registrations.get(&id) else {
            return;
        };
        if reg.suspended {
            self.pump(id);
            return;
        }
        let channel = reg.channel.clone();

        let mut idle = false;
        for _ in 0..self.process_budget {
            match channel.process() {
                Ok(Progress::Busy) => {}
                Ok(Progress::Idle) => {
                    idle = true;
                    break;
                }
                Err(e) => {
                    warn!(channel = %channel.name(), error = %e, "channel process failed");
                    idle = true;
                    break;
                }
            }
        }
        if !idle && !self.backlog.contains(&id) {
            trace!(channel = %channel.name(), "process budget spent, backlogged");
            self.backlog.push_back(id);
        }
        self.pump(id);
    }

    fn on_readable(&mut self, token: Token) {
        let Some(&id) = self.tokens.get(&token) else {
            trace!(token = token.0, "readable token without channel");
            return;
        };
        let Some(reg) = self.registrations.get(&id) else {
            self.tokens.remove(&token);
            self.record(InvariantViolation::UnknownChannel {
                channel: format!("<token {}>", token.0),
                id: id.0,
            });
            return;
        };
        if reg.inbox.armed() != Some(token) {
            self.tokens.remove(&token);
            return;
        }
        self.drain(id);
    }

    fn process_dirty(&mut self) {
        while let Some(id) = self.injector.pop_dirty() {
            self.pump(id);
        }
    }

    fn process_backlog(&mut self) {
        let backlog = mem::take(&mut self.backlog);
        for id in backlog {
            self.drain(id);
        }
    }

    fn fire_timers(&mut self, now: Instant) {
        for (timer, action) in self.timers.pop_expired(now) {
            counter!("chanloop_timers_fired_total").increment(1);
            match action {
                TimerAction::Expire(wait) => {
                    trace!(?timer, wait = wait.as_u64(), "timer fired");
                    let resolution = match self.waits.channel_of(wait) {
                        Some(_) => Resolution::Outcome(Outcome::TimedOut),
                        None => Resolution::Elapsed,
                    };
                    self.resolve(wait, resolution);
                }
                TimerAction::PollTick(id) => {
                    let Some(reg) = self.registrations.get_mut(&id) else {
                        continue;
                    };
                    reg.poll_tick = None;
                    self.drain(id);
                    if let Err(e) = self.arm(id) {
                        match e {
                            LoopError::Invariant(v) => self.record(v),
                            other => warn!(error = %other, "failed to watch channel"),
                        }
                    }
                }
            }
        }
    }

    fn has_backlog(&self) -> bool {
        !self.backlog.is_empty()
    }

    pub(crate) fn poll_recv(
        &mut self,
        id: ChannelId,
        timeout: Option<Duration>,
        slot: &mut WaitSlot,
        cx: &mut Context<'_>,
    ) -> Poll<Outcome> {
        match *slot {
            WaitSlot::Waiting(wait) => match self.waits.poll(wait, cx.waker()) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Ok(resolution)) => {
                    *slot = WaitSlot::Done(Some(wait));
                    Poll::Ready(match resolution {
                        Resolution::Outcome(outcome) => outcome,
                        Resolution::Elapsed => Outcome::TimedOut,
                    })
                }
                Poll::Ready(Err(_)) => {
                    *slot = WaitSlot::Done(Some(wait));
                    let violation = self.polled_after_completion(Some(wait), Some(id));
                    self.record(violation);
                    Poll::Pending
                }
            },
            WaitSlot::Done(wait) => {
                let violation = self.polled_after_completion(wait, Some(id));
                self.record(violation);
                Poll::Pending
            }
            WaitSlot::Unregistered => {
                self.pump(id);
                let Some(reg) = self.registrations.get_mut(&id) else {
                    *slot = WaitSlot::Done(None);
                    return Poll::Ready(Outcome::Closed);
                };

                if reg.waiters.is_empty() {
                    if let Some(msg) = reg.buffer.pop_front() {
                        *slot = WaitSlot::Done(None);
                        return Poll::Ready(Outcome::Data(msg));
                    }
                }
                if reg.ended {
                    *slot = WaitSlot::Done(None);
                    return Poll::Ready(Outcome::Closed);
                }

                let wait = self.waits.insert(Some(id), cx.waker().clone());
                // A timeout past the end of the clock never fires.
                if let Some(deadline) = timeout.and_then(|t| Instant::now().checked_add(t)) {
                    let timer = self.timers.schedule(deadline, TimerAction::Expire(wait));
                    self.waits.set_timer(wait, timer);
                }
                reg.waiters.push_back(wait);
                *slot = WaitSlot::Waiting(wait);
                trace!(channel = %reg.name, wait = wait.as_u64(), ?timeout, "recv suspended");
                Poll::Pending
            }
        }
    }

    pub(crate) fn poll_sleep(
        &mut self,
        deadline: Option<Instant>,
        slot: &mut WaitSlot,
        cx: &mut Context<'_>,
    ) -> Poll<()> {
        match *slot {
            WaitSlot::Unregistered => {
                let wait = self.waits.insert(None, cx.waker().clone());
                if let Some(deadline) = deadline {
                    let timer = self.timers.schedule(deadline, TimerAction::Expire(wait));
                    self.waits.set_timer(wait, timer);
                }
                *slot = WaitSlot::Waiting(wait);
                Poll::Pending
            }
            WaitSlot::Waiting(wait) => match self.waits.poll(wait, cx.waker()) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Ok(_)) => {
                    *slot = WaitSlot::Done(Some(wait));
                    Poll::Ready(())
                }
                Poll::Ready(Err(v)) => {
                    *slot = WaitSlot::Done(Some(wait));
                    self.record(v);
                    Poll::Pending
                }
            },
            WaitSlot::Done(wait) => {
                let violation = self.polled_after_completion(wait, None);
                self.record(violation);
                Poll::Pending
            }
        }
    }

    fn polled_after_completion(
        &self,
        wait: Option<WaitId>,
        channel: Option<ChannelId>,
    ) -> InvariantViolation {
        InvariantViolation::WaitPolledAfterCompletion {
            wait: wait.map(WaitId::as_u64),
            channel: channel
                .and_then(|c| self.registrations.get(&c))
                .map(|r| r.name.clone()),
        }
    }

    fn detach_all(&mut self) {
        let ids: Vec<_> = self.registrations.keys().copied().collect();
        for id in ids {
            self.remove_channel(id);
        }
    }
}

pub(crate) struct Inner {
    executor: Executor,
    state: RefCell<LoopState>,
}

/// Cloneable access to a loop, for spawning, sleeping and registering channels.
///
/// Handles are tied to the loop's thread.
#[derive(Clone)]
pub struct Handle {
    inner: Rc<Inner>,
}

impl Handle {
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut LoopState) -> R) -> R {
        f(&mut self.inner.state.borrow_mut())
    }

    /// Runs `f` unless the state is already borrowed, which only happens while the loop
    /// itself is tearing things down.
    fn try_with_state(&self, f: impl FnOnce(&mut LoopState)) {
        match self.inner.state.try_borrow_mut() {
            Ok(mut state) => f(&mut state),
            Err(_) => warn!("loop state busy, skipping cleanup"),
        }
    }

    /// Adds a task. It first runs on the loop's next turn.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let (task, join) = joinable(future);
        self.inner.executor.spawn(task);
        join
    }

    /// Suspends the calling task for `duration`.
    ///
    /// # Arguments
    ///
    /// * `duration` - measured from this call, not from the first poll. A duration that
    ///   overflows the clock never elapses.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use chanloop::Loop;
    ///
    /// let mut lp = Loop::new()?;
    /// let h = lp.handle();
    /// lp.run(async move { h.sleep(Duration::from_millis(5)).await })?;
    /// # Ok::<(), chanloop::LoopError>(())
    /// ```
    pub fn sleep(&self, duration: Duration) -> Sleep {
        Sleep::new(self.clone(), Instant::now().checked_add(duration))
    }

    /// Suspends the calling task until `deadline`. A deadline in the past still yields once.
    pub fn sleep_until(&self, deadline: Instant) -> Sleep {
        Sleep::new(self.clone(), Some(deadline))
    }

    /// Registers a channel with the loop.
    ///
    /// An active channel is watched right away; one that is still closed or opening is
    /// watched once it announces `Active`.
    ///
    /// # Errors
    ///
    /// [`LoopError::Invariant`] with a duplicate-descriptor violation when the channel's
    /// descriptor is already watched for another registration, or [`LoopError::Io`] when the
    /// multiplexer refuses it.
    pub fn channel_add<C>(&self, channel: Rc<C>) -> Result<ChannelAdapter, LoopError>
    where
        C: Channel + 'static,
    {
        let channel: Rc<dyn Channel> = channel;
        let id = self.with_state(|state| state.add_channel(channel.clone(), None))?;
        Ok(ChannelAdapter::new(id, channel, self.clone()))
    }

    /// Deregisters a channel. Outstanding receives resolve with [`Outcome::Closed`].
    pub fn channel_del(&self, adapter: &ChannelAdapter) {
        self.detach_channel(adapter.id());
    }

    /// Waits for the next message on `adapter`; see [`ChannelAdapter::recv`].
    ///
    /// # Arguments
    ///
    /// * `timeout` - `None` waits until data arrives or the channel ends.
    ///
    /// # Returns
    ///
    /// A future resolving to [`Outcome::Data`], [`Outcome::Closed`] or [`Outcome::TimedOut`].
    pub fn recv<'a>(
        &self,
        adapter: &'a ChannelAdapter,
        timeout: Option<Duration>,
    ) -> crate::adapter::Recv<'a> {
        adapter.recv(timeout)
    }

    pub(crate) fn detach_channel(&self, id: ChannelId) {
        self.try_with_state(|state| state.remove_channel(id));
    }

    pub(crate) fn cancel_wait(&self, wait: WaitId) {
        self.try_with_state(|state| state.cancel_wait(wait));
    }

    /// Number of tasks that have not finished yet.
    pub fn task_count(&self) -> usize {
        self.inner.executor.len()
    }
}

/// A single-threaded event loop.
pub struct Loop {
    handle: Handle,
    mux: Multiplexer,
}

impl Loop {
    /// Creates a loop with the default [`LoopConfig`].
    ///
    /// # Errors
    ///
    /// [`LoopError::Io`] when the OS multiplexer cannot be created.
    pub fn new() -> Result<Self, LoopError> {
        Self::with_config(LoopConfig::default())
    }

    /// Creates a loop, installing the metrics exporter first when one is configured.
    pub fn with_config(config: LoopConfig) -> Result<Self, LoopError> {
        if let Some(addr) = config.metrics_listener {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .map_err(|e| LoopError::Metrics(e.to_string()))?;
            info!(%addr, "metrics exporter listening");
        }

        let mux = Multiplexer::new(config.event_capacity)?;
        let injector = Arc::new(Injector::new(mux.waker()?));
        let state = LoopState::new(&config, mux.registrar().clone(), injector.clone());
        let inner = Rc::new(Inner {
            executor: Executor::new(injector),
            state: RefCell::new(state),
        });

        Ok(Self {
            handle: Handle { inner },
            mux,
        })
    }

    /// A handle for spawning tasks and registering channels; usable from inside `run`.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Drives the loop until `root` completes and returns its output.
    ///
    /// Other spawned tasks keep running alongside `root`; the ones still pending when it
    /// completes stay in the loop and continue on the next `run`.
    pub fn run<F>(&mut self, root: F) -> Result<F::Output, LoopError>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let join = self.handle.spawn(root);
        loop {
            self.handle.inner.executor.run_ready();
            self.check()?;
            if let Some(output) = join.try_take() {
                return Ok(output);
            }
            self.turn()?;
            self.check()?;
        }
    }

    fn check(&self) -> Result<(), LoopError> {
        match self.handle.inner.state.borrow_mut().violation.take() {
            Some(v) => Err(v.into()),
            None => Ok(()),
        }
    }

    /// One pass of dispatch: queued notifications, backlog and timers, then a multiplexer
    /// wait bounded by the earliest deadline.
    fn turn(&mut self) -> Result<(), LoopError> {
        let inner = &self.handle.inner;
        let mut state = inner.state.borrow_mut();

        state.process_dirty();
        state.process_backlog();
        state.fire_timers(Instant::now());
        if state.violation.is_some() {
            // Blocking now could wait forever; `run` reports it right away.
            return Ok(());
        }

        let max_wait = if inner.executor.injector().has_work() || state.has_backlog() {
            Some(Duration::ZERO)
        } else {
            state
                .timers
                .peek_earliest()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
        };
        if max_wait.is_none() {
            trace!(waits = state.waits.len(), "blocking without deadline");
        }

        let fired = self
            .mux
            .run_once(max_wait, |token| state.on_readable(token))?;
        debug!(fired, ?max_wait, "multiplexer woke");

        state.fire_timers(Instant::now());
        state.process_dirty();
        Ok(())
    }
}

impl Drop for Loop {
    fn drop(&mut self) {
        // Tasks hold handles back to the loop; dropping them breaks the cycle.
        self.handle.inner.executor.clear();
        self.handle.inner.state.borrow_mut().detach_all();
    }
}
