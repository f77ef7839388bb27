//! The multiplexed wire protocol spoken with the orchestrating runtime
//!
//! Every frame carries one [Message]: the logical channel it belongs to,
//! a message kind, and a sequence of opaque msgpack arguments that the
//! channel's dispatcher decodes lazily.

pub mod codec;

use rmpv::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One protocol envelope. Serialized as the msgpack array
/// `[channel, kind, args]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub channel: u64,
    pub kind: u64,
    pub args: Vec<Value>,
}

impl Message {
    pub fn new(channel: u64, kind: u64, args: Vec<Value>) -> Self {
        Message {
            channel,
            kind,
            args,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {:?}", self.channel, self.kind, self.args)
    }
}

/// Message kinds accepted by the dispatcher states
pub mod request {
    /// initial state: prepare an image layer
    pub const SPOOL: u64 = 0;
    /// initial state: spawn a process in a prepared image
    pub const SPAWN: u64 = 1;
    /// spool-watch state: cancel the spool in flight
    pub const SPOOL_CANCEL: u64 = 0;
    /// spawn-watch state: kill the spawned process
    pub const SPAWN_KILL: u64 = 0;
}

/// Message kinds emitted downstream
pub mod reply {
    pub const SPOOL_OK: u64 = 0;
    pub const SPOOL_ERROR: u64 = 1;
    /// process output chunk; an empty chunk is the "process started" notice
    pub const SPAWN_WRITE: u64 = 0;
    pub const SPAWN_ERROR: u64 = 1;
    pub const SPAWN_CLOSE: u64 = 2;
}
