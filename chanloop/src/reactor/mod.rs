//! Readiness multiplexing and timers.
//!
//! The [`Multiplexer`] is the only place the loop blocks. It waits on the descriptors of
//! registered channels (through `mio`, so epoll on Linux and kqueue on the BSDs) for at most
//! the time left until the [`TimerQueue`]'s earliest deadline.

mod multiplexer;
mod timer;

use std::os::fd::RawFd;

pub use multiplexer::{Multiplexer, Registrar, WAKE_TOKEN};
pub use timer::{TimerId, TimerQueue};

use crate::channel::Channel;

/// What a channel offers to wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessHandle {
    /// A pollable OS descriptor.
    Descriptor(RawFd),
    /// Nothing to wait on; the channel has to be polled.
    Unavailable,
}

impl ReadinessHandle {
    pub fn of(channel: &dyn Channel) -> Self {
        match channel.readiness() {
            Some(fd) => ReadinessHandle::Descriptor(fd),
            None => ReadinessHandle::Unavailable,
        }
    }

    pub fn descriptor(self) -> Option<RawFd> {
        match self {
            ReadinessHandle::Descriptor(fd) => Some(fd),
            ReadinessHandle::Unavailable => None,
        }
    }
}
