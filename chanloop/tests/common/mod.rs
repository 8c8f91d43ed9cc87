#![allow(dead_code)]

use std::rc::Rc;
use std::sync::Mutex;

use chanloop::channel::mem::{MemChannel, MemConfig};
use chanloop::channel::{
    Channel, ChildCallback, ChildEvent, DataCallback, Message, SharedChannel, State,
    StateCallback, SubscriptionId,
};
use chanloop::{ChannelAdapter, ChannelError, Handle, PostError};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Opens a mem pair and registers the client end. The server end stays with the caller.
pub fn mem_pair(handle: &Handle, client: MemConfig) -> (MemChannel, ChannelAdapter) {
    let (server, client) = MemChannel::pair(MemConfig::new("server"), client);
    server.open().unwrap();
    client.open().unwrap();
    let adapter = handle.channel_add(Rc::new(client)).unwrap();
    (server, adapter)
}

pub fn seq_and_data(msg: &Message) -> (i64, &[u8]) {
    (msg.seq, msg.data.as_slice())
}

/// A loop-thread channel whose transitions, data and sub-channels are driven by the test.
pub struct ScriptedChannel {
    name: String,
    state: Mutex<State>,
    subscribers: Mutex<Vec<(SubscriptionId, DataCallback, StateCallback)>>,
    watchers: Mutex<Vec<(SubscriptionId, ChildCallback)>>,
    next_id: Mutex<u64>,
}

impl ScriptedChannel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(State::Closed),
            subscribers: Mutex::new(Vec::new()),
            watchers: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Announces a sub-channel, as a listener does for an accepted connection.
    pub fn add_child(&self, child: SharedChannel) {
        self.announce(ChildEvent::Added(child));
    }

    pub fn delete_child(&self, name: &str) {
        self.announce(ChildEvent::Deleted(name.to_string()));
    }

    fn announce(&self, event: ChildEvent) {
        let watchers = self.watchers.lock().unwrap().clone();
        for (_, on_child) in watchers {
            on_child(event.clone());
        }
    }

    pub fn set_state(&self, state: State) {
        *self.state.lock().unwrap() = state;
        let subscribers = self.subscribers.lock().unwrap().clone();
        for (_, _, on_state) in subscribers {
            on_state(state);
        }
    }

    pub fn emit(&self, seq: i64, data: &[u8]) {
        let msg = Message::new(seq, data);
        let subscribers = self.subscribers.lock().unwrap().clone();
        for (_, on_data, _) in subscribers {
            on_data(&msg);
        }
    }
}

impl Channel for ScriptedChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> Result<(), ChannelError> {
        self.set_state(State::Opening);
        self.set_state(State::Active);
        Ok(())
    }

    fn close(&self) {
        self.set_state(State::Closing);
        self.set_state(State::Closed);
    }

    /// Loops the payload back to this channel's own subscribers.
    fn post(&self, data: &[u8], seq: i64) -> Result<(), PostError> {
        let state = self.state();
        if state != State::Active {
            return Err(PostError::NotActive {
                name: self.name.clone(),
                state,
            });
        }
        self.emit(seq, data);
        Ok(())
    }

    fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    fn subscribe(&self, on_data: DataCallback, on_state: StateCallback) -> SubscriptionId {
        let mut next = self.next_id.lock().unwrap();
        let id = SubscriptionId::new(*next);
        *next += 1;
        self.subscribers.lock().unwrap().push((id, on_data, on_state));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().unwrap().retain(|(s, _, _)| *s != id);
        self.watchers.lock().unwrap().retain(|(s, _)| *s != id);
    }

    fn watch_children(&self, id: SubscriptionId, on_child: ChildCallback) {
        self.watchers.lock().unwrap().push((id, on_child));
    }

    fn wants_process(&self) -> bool {
        false
    }
}

pub fn scripted(handle: &Handle, name: &str) -> (Rc<ScriptedChannel>, ChannelAdapter) {
    let channel = Rc::new(ScriptedChannel::new(name));
    let adapter = handle.channel_add(channel.clone()).unwrap();
    (channel, adapter)
}
