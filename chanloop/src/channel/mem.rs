//! In-process channel pair with an optional pipe-backed readiness descriptor.
//!
//! Posting on one end buffers the message on the other end. The receiving end delivers its
//! buffer through [`Channel::process`]. With [`MemConfig::fd`] set it also exposes the read end
//! of a non-blocking pipe that carries one byte per buffered message, so the loop can wait on
//! it; without it the loop has to poll.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mio::unix::pipe;
use tracing::trace;

use super::{
    Channel, DataCallback, Message, Progress, State, StateCallback, Subscribers, SubscriptionId,
};
use crate::error::{ChannelError, PostError};

const DEFAULT_SIZE: usize = 1024;

/// Options of one [`MemChannel`] end.
#[derive(Debug, Clone)]
pub struct MemConfig {
    pub name: String,
    /// Receive buffer capacity in payload bytes.
    pub size: usize,
    /// Expose a readiness descriptor.
    pub fd: bool,
    /// Close right after the first delivered message.
    pub autoclose: bool,
}

impl MemConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: DEFAULT_SIZE,
            fd: true,
            autoclose: false,
        }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_fd(mut self, fd: bool) -> Self {
        self.fd = fd;
        self
    }

    pub fn with_autoclose(mut self, autoclose: bool) -> Self {
        self.autoclose = autoclose;
        self
    }
}

struct Endpoint {
    config: MemConfig,
    inner: Mutex<EndpointState>,
    subscribers: Subscribers,
}

struct EndpointState {
    state: State,
    rx: VecDeque<Message>,
    bytes: usize,
    notify: Option<(pipe::Sender, pipe::Receiver)>,
}

impl Endpoint {
    fn new(config: MemConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(EndpointState {
                state: State::Closed,
                rx: VecDeque::new(),
                bytes: 0,
                notify: None,
            }),
            subscribers: Subscribers::default(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, EndpointState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, state: State) {
        self.lock().state = state;
        self.subscribers.state(state);
    }
}

fn drain_pipe(rx: &pipe::Receiver) {
    let mut buf = [0u8; 64];
    loop {
        match (&*rx).read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

/// One end of an in-process channel pair.
#[derive(Clone)]
pub struct MemChannel {
    local: Arc<Endpoint>,
    peer: Arc<Endpoint>,
}

impl MemChannel {
    /// Creates two connected ends. Both start [`State::Closed`].
    pub fn pair(server: MemConfig, client: MemConfig) -> (MemChannel, MemChannel) {
        let a = Endpoint::new(server);
        let b = Endpoint::new(client);
        (
            MemChannel {
                local: a.clone(),
                peer: b.clone(),
            },
            MemChannel { local: b, peer: a },
        )
    }

    /// Messages waiting in this end's buffer.
    pub fn pending(&self) -> usize {
        self.local.lock().rx.len()
    }
}

impl Channel for MemChannel {
    fn name(&self) -> &str {
        &self.local.config.name
    }

    fn open(&self) -> Result<(), ChannelError> {
        let state = self.local.lock().state;
        if state != State::Closed {
            return Err(ChannelError::InvalidState {
                name: self.local.config.name.clone(),
                state,
            });
        }

        self.local.transition(State::Opening);
        if self.local.config.fd {
            match pipe::new() {
                Ok(notify) => self.local.lock().notify = Some(notify),
                Err(e) => {
                    self.local.transition(State::Error);
                    return Err(ChannelError::Io(e));
                }
            }
        }
        self.local.transition(State::Active);
        Ok(())
    }

    fn close(&self) {
        let state = self.local.lock().state;
        if state == State::Closed || state == State::Closing {
            return;
        }

        self.local.transition(State::Closing);
        let notify = {
            let mut inner = self.local.lock();
            inner.rx.clear();
            inner.bytes = 0;
            inner.notify.take()
        };
        // The descriptor is released only after Closing went out.
        drop(notify);
        self.local.transition(State::Closed);
    }

    fn post(&self, data: &[u8], seq: i64) -> Result<(), PostError> {
        let state = self.local.lock().state;
        if state != State::Active {
            return Err(PostError::NotActive {
                name: self.local.config.name.clone(),
                state,
            });
        }

        let mut peer = self.peer.lock();
        if peer.state != State::Active {
            return Err(PostError::PeerClosed {
                name: self.local.config.name.clone(),
            });
        }
        if peer.bytes + data.len() > self.peer.config.size {
            return Err(PostError::Full {
                name: self.peer.config.name.clone(),
                capacity: self.peer.config.size,
            });
        }

        peer.bytes += data.len();
        peer.rx.push_back(Message::new(seq, data));
        if let Some((tx, _)) = &peer.notify {
            // A full pipe is already readable.
            let _ = (&*tx).write(&[1]);
        }
        trace!(from = %self.local.config.name, to = %self.peer.config.name, seq, "mem post");
        Ok(())
    }

    fn state(&self) -> State {
        self.local.lock().state
    }

    fn readiness(&self) -> Option<RawFd> {
        let inner = self.local.lock();
        match (&inner.notify, inner.state) {
            (Some((_, rx)), State::Active) => Some(rx.as_raw_fd()),
            _ => None,
        }
    }

    fn subscribe(&self, on_data: DataCallback, on_state: StateCallback) -> SubscriptionId {
        self.local.subscribers.add(on_data, on_state)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.local.subscribers.remove(id);
    }

    fn process(&self) -> Result<Progress, ChannelError> {
        let msg = {
            let mut inner = self.local.lock();
            if inner.state != State::Active {
                return Ok(Progress::Idle);
            }
            let msg = inner.rx.pop_front();
            if let Some(msg) = &msg {
                inner.bytes -= msg.data.len();
            }
            if inner.rx.is_empty() {
                if let Some((_, rx)) = &inner.notify {
                    drain_pipe(rx);
                }
            }
            msg
        };

        let Some(msg) = msg else {
            return Ok(Progress::Idle);
        };

        self.local.subscribers.data(&msg);
        if self.local.config.autoclose {
            self.close();
        }
        Ok(Progress::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(channel: &MemChannel) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let data_log = log.clone();
        let state_log = log.clone();
        channel.subscribe(
            Arc::new(move |m: &Message| {
                data_log.lock().unwrap().push(format!("data {}", m.seq));
            }),
            Arc::new(move |s: State| {
                state_log.lock().unwrap().push(format!("state {s:?}"));
            }),
        );
        log
    }

    #[test]
    fn open_emits_opening_then_active() {
        let (server, _client) = MemChannel::pair(MemConfig::new("s"), MemConfig::new("c"));
        let log = recorder(&server);

        server.open().unwrap();

        assert_eq!(server.state(), State::Active);
        assert!(server.readiness().is_some());
        assert_eq!(*log.lock().unwrap(), ["state Opening", "state Active"]);
    }

    #[test]
    fn post_buffers_on_peer_until_processed() {
        let (server, client) = MemChannel::pair(MemConfig::new("s"), MemConfig::new("c"));
        server.open().unwrap();
        client.open().unwrap();
        let log = recorder(&client);

        server.post(b"xxx", 100).unwrap();
        server.post(b"zzz", 200).unwrap();
        assert_eq!(client.pending(), 2);

        assert_eq!(client.process().unwrap(), Progress::Busy);
        assert_eq!(client.process().unwrap(), Progress::Busy);
        assert_eq!(client.process().unwrap(), Progress::Idle);
        assert_eq!(*log.lock().unwrap(), ["data 100", "data 200"]);
    }

    #[test]
    fn post_rejects_when_buffer_full() {
        let (server, client) =
            MemChannel::pair(MemConfig::new("s"), MemConfig::new("c").with_size(4));
        server.open().unwrap();
        client.open().unwrap();

        server.post(b"abc", 1).unwrap();
        let err = server.post(b"de", 2).unwrap_err();
        assert_eq!(
            err,
            PostError::Full {
                name: "c".into(),
                capacity: 4
            }
        );
    }

    #[test]
    fn post_requires_both_ends_active() {
        let (server, client) = MemChannel::pair(MemConfig::new("s"), MemConfig::new("c"));
        assert!(matches!(
            server.post(b"x", 1),
            Err(PostError::NotActive { .. })
        ));

        server.open().unwrap();
        assert!(matches!(
            server.post(b"x", 1),
            Err(PostError::PeerClosed { .. })
        ));

        client.open().unwrap();
        assert!(server.post(b"x", 1).is_ok());
    }

    #[test]
    fn without_fd_there_is_no_descriptor() {
        let (server, _client) =
            MemChannel::pair(MemConfig::new("s").with_fd(false), MemConfig::new("c"));
        server.open().unwrap();
        assert_eq!(server.readiness(), None);
    }

    #[test]
    fn autoclose_closes_after_first_message() {
        let (server, client) = MemChannel::pair(
            MemConfig::new("s"),
            MemConfig::new("c").with_autoclose(true),
        );
        server.open().unwrap();
        client.open().unwrap();
        let log = recorder(&client);

        server.post(b"one", 1).unwrap();
        server.post(b"two", 2).unwrap();
        client.process().unwrap();

        assert_eq!(client.state(), State::Closed);
        assert_eq!(client.pending(), 0);
        assert_eq!(
            *log.lock().unwrap(),
            ["data 1", "state Closing", "state Closed"]
        );
    }

    #[test]
    fn unsubscribed_callbacks_stop_firing() {
        let (server, client) = MemChannel::pair(MemConfig::new("s"), MemConfig::new("c"));
        server.open().unwrap();
        client.open().unwrap();
        let kept = recorder(&client);
        let dropped = Arc::new(Mutex::new(0));
        let counter = dropped.clone();
        let id = client.subscribe(
            Arc::new(move |_: &Message| *counter.lock().unwrap() += 1),
            Arc::new(|_: State| {}),
        );
        assert_eq!(client.local.subscribers.len(), 2);

        client.unsubscribe(id);
        client.unsubscribe(id);
        server.post(b"x", 1).unwrap();
        client.process().unwrap();

        assert_eq!(client.local.subscribers.len(), 1);
        assert_eq!(*dropped.lock().unwrap(), 0);
        assert_eq!(*kept.lock().unwrap(), ["data 1"]);
    }

    #[test]
    fn reopen_after_close_is_allowed() {
        let (server, _client) = MemChannel::pair(MemConfig::new("s"), MemConfig::new("c"));
        server.open().unwrap();
        assert!(server.open().is_err());
        server.close();
        assert_eq!(server.readiness(), None);
        server.open().unwrap();
        assert_eq!(server.state(), State::Active);
    }
}
