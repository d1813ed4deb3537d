//! Wire protocol: length-prefixed framing and the JSON-RPC message model.
//!
//! Every frame on the wire is a 4-byte big-endian length followed by exactly
//! that many bytes of UTF-8 JSON. One top-level JSON object per frame; batch
//! arrays are invalid.

pub mod frame;
pub mod message;

/// Protocol version exchanged during the `hello` handshake. Peers must match
/// this string exactly.
pub const PROTOCOL_VERSION: &str = "gaovm.v1.2";

pub use frame::{encode_frame, FrameDecoder, FrameError, MAX_FRAME_LEN};
pub use message::{RpcError, RpcMessage, JSONRPC_VERSION};
