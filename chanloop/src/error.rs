//! Error types for the event loop and its channel collaborators.
//!
//! Environmental failures ([`ChannelError`], [`PostError`]) are returned to the caller and
//! never swallowed. Timeouts and closures are not errors at all; they are
//! [`Outcome`](crate::Outcome) variants. [`InvariantViolation`] marks a bug in the loop's own
//! bookkeeping and aborts [`Loop::run`](crate::Loop::run).

use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

use crate::channel::State;

/// Failure reported by a channel while opening or processing.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel was asked to do something its current state does not allow.
    #[error("channel {name}: invalid state {state:?}")]
    InvalidState {
        /// Channel name.
        name: String,
        /// State at the time of the call.
        state: State,
    },

    /// The underlying descriptor failed.
    #[error("channel io error: {0}")]
    Io(#[from] io::Error),
}

/// Failure of [`Channel::post`](crate::channel::Channel::post).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PostError {
    /// The posting end is not active.
    #[error("channel {name}: post in state {state:?}")]
    NotActive {
        /// Channel name.
        name: String,
        /// State at the time of the post.
        state: State,
    },

    /// The receiving buffer has no room for the payload.
    #[error("channel {name}: buffer full ({capacity} bytes)")]
    Full {
        /// Channel name.
        name: String,
        /// Buffer capacity in bytes.
        capacity: usize,
    },

    /// The other end of the pair is gone or not active.
    #[error("channel {name}: peer closed")]
    PeerClosed {
        /// Channel name.
        name: String,
    },
}

/// A broken internal invariant. Never an environmental condition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvariantViolation {
    /// A descriptor was registered while already present in the poll set.
    #[error("descriptor {fd} of channel {channel} is already registered")]
    DuplicateDescriptor {
        /// Channel that tried to register.
        channel: String,
        /// The offending descriptor.
        fd: RawFd,
    },

    /// A `recv` or `sleep` was polled again after it had completed.
    #[error("wait {wait:?} on {channel:?} polled after completion")]
    WaitPolledAfterCompletion {
        /// Wait id; `None` when the future completed without ever suspending.
        wait: Option<u64>,
        /// Channel the wait belonged to; `None` for sleeps.
        channel: Option<String>,
    },

    /// A loop operation referenced a channel registration that does not exist.
    #[error("no registration for channel {channel} (id {id})")]
    UnknownChannel {
        /// Channel name as known to the caller.
        channel: String,
        /// Registration id.
        id: u64,
    },
}

/// Error returned by [`Loop`](crate::Loop) construction and [`Loop::run`](crate::Loop::run).
#[derive(Debug, Error)]
pub enum LoopError {
    /// The OS poll primitive or a registration failed.
    #[error("event loop io error: {0}")]
    Io(#[from] io::Error),

    /// The loop detected a bug in its own bookkeeping.
    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    /// The metrics exporter could not be installed.
    #[error("metrics exporter: {0}")]
    Metrics(String),
}
