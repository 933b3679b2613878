//! Metadata-server replication core: peer abstraction, gfmd channel,
//! journal sender/receiver, and the mdhost registry, assembled into a
//! running slave-side connection supervisor.
//!
//! This crate is the application layer built on the sans-networking-policy
//! primitives in `gfmd-core` (peer table, mdhost registry, backoff, async
//! multiplexer) and `gfmd-wire` (framing, argument codec, channel, remote
//! peer tunnel).

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod journal;
pub mod supervisor;

/// Development/test helper for structured logging; never called from
/// library code, only from `main.rs` and test setup.
pub mod dev_tracing;
