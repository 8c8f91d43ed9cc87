//! A single-threaded event loop that lets async tasks consume callback-based message channels.
//!
//! Channels implement [`Channel`](channel::Channel): they announce data and state changes
//! through callbacks and may expose a descriptor to wait on. Registering one with a
//! [`Loop`] yields a [`ChannelAdapter`] whose [`recv`](ChannelAdapter::recv) suspends the
//! calling task until a message arrives, the channel closes or a timeout elapses.
//!
//! - [`runtime`]: the loop, its [`Handle`], spawning and the turn structure
//! - [`adapter`]: channel registration and the `recv` future
//! - [`channel`]: the channel contract plus the in-process `mem` and `direct` pairs
//! - [`reactor`]: descriptor multiplexing and timers
//! - [`wait`]: the resolution boxes that suspended tasks wait on
//! - [`time`]: sleeping
//!
//! ```no_run
//! use std::rc::Rc;
//! use std::time::Duration;
//!
//! use chanloop::Loop;
//! use chanloop::channel::Channel;
//! use chanloop::channel::mem::{MemChannel, MemConfig};
//!
//! let mut event_loop = Loop::new()?;
//! let handle = event_loop.handle();
//! let (server, client) = MemChannel::pair(MemConfig::new("server"), MemConfig::new("client"));
//! server.open()?;
//! client.open()?;
//! let client = handle.channel_add(Rc::new(client))?;
//!
//! server.post(b"ping", 1)?;
//! let outcome = event_loop.run(async move { client.recv(Some(Duration::from_secs(1))).await })?;
//! assert_eq!(outcome.into_data().map(|m| m.seq), Some(1));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

extern crate self as chanloop;

pub mod adapter;
pub mod channel;
pub mod config;
pub mod error;
mod executor;
pub mod reactor;
pub mod runtime;
pub mod task;
pub mod time;
pub mod wait;
mod waker;

pub use adapter::{ChannelAdapter, ChannelId, Recv};
pub use config::{LoopConfig, POLL_TICK};
pub use error::{ChannelError, InvariantViolation, LoopError, PostError};
pub use runtime::{Handle, Loop};
pub use task::{JoinHandle, TaskId};
pub use time::Sleep;
pub use wait::{Outcome, WaitId};

pub use chanloop_macros::{main, test};
