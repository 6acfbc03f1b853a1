//! Protocol module - container framing, fragmentation, and command packets.
//!
//! This module implements the wire layer shared by both peer roles:
//! - Container codec with control-frame helpers
//! - MTU-aware splitter
//! - Single-stream assembler
//! - Command packet codec

mod assembler;
mod command;
mod container;
mod splitter;

pub use assembler::{Assembler, FeedResult, DEFAULT_MAX_PAYLOAD};
pub use command::{
    encode_request, encode_response, CommandPacket, CommandType, MAX_CMD_NAME_LEN,
};
pub use container::{
    make_capabilities_request, make_error, make_key_exchange, make_stream_end_c2p,
    make_stream_end_p2c, make_timeout_request, make_timeout_response, Capabilities, Container,
    ContainerKind, ControlCmd, ATT_OVERHEAD, CAPABILITY_FLAG_ENCRYPTION_SUPPORTED,
    ERROR_BUSY, ERROR_RESPONSE_TOO_LARGE, FIRST_HEADER_SIZE, SHORT_HEADER_SIZE,
};
pub use splitter::{first_capacity, split, subsequent_capacity, Split, Splitter, MIN_MTU};
