//! Wire protocol shared by the GiraffeCloud edge and client agent.
//!
//! Two transports speak this protocol:
//! - the streaming RPC transport carries every frame type;
//! - the raw-byte transport uses a single `Control::Handshake` frame and
//!   then goes opaque.

pub mod frame;
pub mod io;
pub mod message;

pub use frame::{
    compress, decompress_if_gzip, flags, now_unix_ms, Frame, FrameCodec, MsgType, ProtocolError,
    DEFAULT_MAX_FRAME, HEADER_SIZE,
};
pub use message::{
    ControlMessage, ErrorCode, ErrorPayload, EstablishProto, RequestHead, ResponseHead,
    TunnelState,
};
