//! stockade is the core of an isolation daemon: it speaks a multiplexed
//! binary protocol with an orchestrating runtime and turns spool and
//! spawn requests into cached image layers and running containers on a
//! pluggable isolation backend.
//!
//! A server embeds the crate by building an [engine::Engine] over its
//! [backend::Backend] and [registry::RegistryClient] implementations,
//! then driving every accepted connection through a
//! [session::ConnectionSession] constructed with
//! [dispatch::InitialDispatch::factory].

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod manifest;
pub mod protocol;
pub mod registry;
pub mod session;

pub use crate::{
    config::EngineConfig, dispatch::InitialDispatch, engine::Engine, session::ConnectionSession,
};
