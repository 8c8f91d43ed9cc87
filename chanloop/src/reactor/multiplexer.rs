use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::counter;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use tracing::{debug, trace};

use crate::error::{InvariantViolation, LoopError};

/// Token reserved for the cross-thread [`mio::Waker`].
pub const WAKE_TOKEN: Token = Token(0);

#[derive(Default)]
struct Entries {
    by_token: HashMap<Token, RawFd>,
    by_fd: HashMap<RawFd, Token>,
}

/// The descriptor registry of a [`Multiplexer`].
///
/// Shared (`Arc`) with channel callbacks so a descriptor can be pulled out of the poll set
/// synchronously, from whatever thread announces that its channel is closing.
///
/// Tokens are never reused. An OS descriptor number can come back after close; its new
/// registration gets a fresh token, so an event still queued for the old one cannot be
/// mistaken for the new one.
pub struct Registrar {
    registry: Registry,
    entries: Mutex<Entries>,
    next_token: AtomicUsize,
}

impl Registrar {
    fn new(registry: Registry) -> Self {
        Self {
            registry,
            entries: Mutex::new(Entries::default()),
            next_token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `fd` to the poll set for readability.
    ///
    /// A descriptor that is already present is an invariant violation, never a silent
    /// re-registration.
    pub fn register(&self, fd: RawFd, channel: &str) -> Result<Token, LoopError> {
        let mut entries = self.lock();
        if entries.by_fd.contains_key(&fd) {
            return Err(InvariantViolation::DuplicateDescriptor {
                channel: channel.to_string(),
                fd,
            }
            .into());
        }

        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        match self
            .registry
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
        {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(InvariantViolation::DuplicateDescriptor {
                    channel: channel.to_string(),
                    fd,
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        }

        entries.by_token.insert(token, fd);
        entries.by_fd.insert(fd, token);
        debug!(channel, fd, token = token.0, "descriptor registered");
        Ok(token)
    }

    /// Removes the descriptor behind `token`. Returns `false` if it was not registered.
    pub fn deregister(&self, token: Token) -> bool {
        let mut entries = self.lock();
        let Some(fd) = entries.by_token.remove(&token) else {
            return false;
        };
        entries.by_fd.remove(&fd);
        if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
            // The kernel already dropped it if the descriptor was closed under us.
            debug!(fd, token = token.0, error = %e, "descriptor deregistration failed");
        } else {
            debug!(fd, token = token.0, "descriptor deregistered");
        }
        true
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.lock().by_token.contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.lock().by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The blocking wait primitive: a `mio` poll plus its [`Registrar`].
pub struct Multiplexer {
    poll: Poll,
    events: Events,
    registrar: Arc<Registrar>,
}

impl Multiplexer {
    pub fn new(event_capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        Ok(Self {
            poll,
            events: Events::with_capacity(event_capacity),
            registrar: Arc::new(Registrar::new(registry)),
        })
    }

    pub fn registrar(&self) -> &Arc<Registrar> {
        &self.registrar
    }

    /// Creates the waker that interrupts [`run_once`](Self::run_once) from another thread.
    pub fn waker(&self) -> io::Result<mio::Waker> {
        mio::Waker::new(self.poll.registry(), WAKE_TOKEN)
    }

    /// Blocks until a registered descriptor is ready or `max_wait` elapses (`None` waits
    /// indefinitely), then calls `on_ready` once per fired token.
    ///
    /// Tokens deregistered before their turn in the batch, including by an earlier
    /// `on_ready` call, are skipped. Returns the number of callbacks invoked.
    pub fn run_once(
        &mut self,
        max_wait: Option<Duration>,
        mut on_ready: impl FnMut(Token),
    ) -> io::Result<usize> {
        if let Err(e) = self.poll.poll(&mut self.events, max_wait) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(e);
        }
        counter!("chanloop_poll_wakeups_total").increment(1);

        let mut fired = 0;
        for event in self.events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                trace!("woken from another thread");
                continue;
            }
            if !self.registrar.is_registered(token) {
                trace!(token = token.0, "dropping event for deregistered descriptor");
                continue;
            }
            on_ready(token);
            fired += 1;
        }
        Ok(fired)
    }
}
