//! Wire framing, argument encoding, and channel plumbing for the gfmd
//! replication protocol.
//!
//! This crate is sans-threading-policy: it defines how bytes become frames,
//! frames become requests/responses, and requests get relayed through the
//! remote-peer tunnel. It does not decide who connects to whom or when —
//! that belongs to the `gfmd` binary crate, which owns the journal channel
//! and connection supervisor built on top of these primitives.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod args;
pub mod auth;
pub mod channel;
pub mod frame;
pub mod opcode;
pub mod tunnel;

pub mod prelude {
    pub use super::args::{ArgDecoder, ArgEncoder};
    pub use super::auth::{permits_channel_switch, AuthResolver, NullAuthResolver};
    pub use super::channel::{
        decode_switch_request, decode_switch_response, encode_switch_request, encode_switch_response,
        run_reader_loop, spawn_reader_thread, GfmdChannel, InboundRequest,
    };
    pub use super::frame::{read_frame, write_frame, Frame, FrameType};
    pub use super::opcode::Opcode;
    pub use super::tunnel::TunnelRouter;
}
