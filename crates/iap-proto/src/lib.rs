//! Relay protocol definitions
//!
//! This crate defines the wire-level pieces shared by the tunnel client and the
//! relay: the [`Target`] a session is opened for, the binary frame codec carried
//! inside WebSocket messages, the relay close codes, the connect/reconnect
//! endpoints, and the sequence window used for acknowledgement and resend.
//!
//! # Frame layout
//!
//! ```text
//! ┌──────────┬──────────────────────────────────────────┐
//! │ tag: u16 │ body (tag specific)                      │
//! └──────────┴──────────────────────────────────────────┘
//!   0x0001 CONNECT_SUCCESS_SID    u32 len + session id
//!   0x0002 RECONNECT_SUCCESS_ACK  u64 bytes received by peer
//!   0x0004 DATA                   u32 len + payload (<= 16 KiB)
//!   0x0007 ACK                    u64 bytes received by peer
//!   0x0008 FIN                    (empty)
//! ```

pub mod close_code;
pub mod endpoint;
pub mod frame;
pub mod target;
pub mod window;

pub use close_code::{CloseCode, CloseDisposition};
pub use endpoint::{
    connect_url, reconnect_url, EndpointError, RelayRequest, CONNECT_PATH, RECONNECT_PATH,
    SUBPROTOCOL,
};
pub use frame::{CodecError, Frame, FrameCodec, MAX_DATA_FRAME_SIZE};
pub use target::{Target, TargetParseError, DEFAULT_INTERFACE};
pub use window::{ReceiveCounter, SendWindow, WindowError, ACK_THRESHOLD};
