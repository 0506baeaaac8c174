//! Tunnel wire protocol
//!
//! Defines the framed message stream carried over a hijacked relay
//! connection. Each frame is a one-byte tag, a four-byte big-endian length,
//! and a JSON payload. Three frame kinds exist: Ready (sent once by the
//! tunnel client when it can accept requests), Request (relay to client) and
//! Response (client to relay).

pub mod codec;
pub mod messages;

pub use codec::{
    read_ready, read_request, read_response, write_ready, write_request, write_response,
    FrameError, MAX_FRAME_SIZE, TAG_READY, TAG_REQUEST, TAG_RESPONSE,
};
pub use messages::{Headers, Request, Response};
