//! Channel pair that delivers synchronously: a post on one end runs the peer's data callbacks
//! before returning. There is nothing to wait on and nothing to process.

use std::sync::{Arc, Mutex, PoisonError};

use super::{
    Channel, DataCallback, Message, State, StateCallback, Subscribers, SubscriptionId,
};
use crate::error::{ChannelError, PostError};

struct Endpoint {
    name: String,
    state: Mutex<State>,
    subscribers: Subscribers,
}

impl Endpoint {
    fn new(name: String) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(State::Closed),
            subscribers: Subscribers::default(),
        })
    }

    fn state(&self) -> State {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, state: State) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        self.subscribers.state(state);
    }
}

/// One end of a synchronous channel pair.
#[derive(Clone)]
pub struct DirectChannel {
    local: Arc<Endpoint>,
    peer: Arc<Endpoint>,
}

impl DirectChannel {
    pub fn pair(a: impl Into<String>, b: impl Into<String>) -> (DirectChannel, DirectChannel) {
        let a = Endpoint::new(a.into());
        let b = Endpoint::new(b.into());
        (
            DirectChannel {
                local: a.clone(),
                peer: b.clone(),
            },
            DirectChannel { local: b, peer: a },
        )
    }
}

impl Channel for DirectChannel {
    fn name(&self) -> &str {
        &self.local.name
    }

    fn open(&self) -> Result<(), ChannelError> {
        let state = self.local.state();
        if state != State::Closed {
            return Err(ChannelError::InvalidState {
                name: self.local.name.clone(),
                state,
            });
        }
        self.local.transition(State::Opening);
        self.local.transition(State::Active);
        Ok(())
    }

    fn close(&self) {
        if matches!(self.local.state(), State::Closed | State::Closing) {
            return;
        }
        self.local.transition(State::Closing);
        self.local.transition(State::Closed);
    }

    fn post(&self, data: &[u8], seq: i64) -> Result<(), PostError> {
        let state = self.local.state();
        if state != State::Active {
            return Err(PostError::NotActive {
                name: self.local.name.clone(),
                state,
            });
        }
        if self.peer.state() != State::Active {
            return Err(PostError::PeerClosed {
                name: self.local.name.clone(),
            });
        }
        self.peer.subscribers.data(&Message::new(seq, data));
        Ok(())
    }

    fn state(&self) -> State {
        self.local.state()
    }

    fn subscribe(&self, on_data: DataCallback, on_state: StateCallback) -> SubscriptionId {
        self.local.subscribers.add(on_data, on_state)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.local.subscribers.remove(id);
    }

    fn wants_process(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[test]
    fn post_runs_peer_callbacks_inline() {
        let (a, b) = DirectChannel::pair("a", "b");
        let seen = Arc::new(AtomicI64::new(-1));
        let sink = seen.clone();
        b.subscribe(
            Arc::new(move |m: &Message| sink.store(m.seq, Ordering::SeqCst)),
            Arc::new(|_| {}),
        );
        a.open().unwrap();
        b.open().unwrap();

        a.post(b"x", 7).unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert_eq!(a.readiness(), None);
        assert!(!a.wants_process());
    }

    #[test]
    fn post_to_closed_peer_fails() {
        let (a, b) = DirectChannel::pair("a", "b");
        a.open().unwrap();
        assert_eq!(
            a.post(b"x", 1),
            Err(PostError::PeerClosed { name: "a".into() })
        );
        b.open().unwrap();
        b.close();
        assert_eq!(b.state(), State::Closed);
        assert!(a.post(b"x", 1).is_err());
    }
}
