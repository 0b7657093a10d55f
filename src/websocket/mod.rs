//! WebSocket protocol engine.
//!
//! - `frame`: wire encoding and decoding of single frames
//! - `handshake`: HTTP upgrade for server and client roles
//! - `channel`: framed send/receive with fragment reassembly and
//!   automatic control-frame replies
//! - `tls`: optional TLS transport

pub mod channel;
pub mod frame;
pub mod handshake;
pub mod tls;

pub use channel::{ConnectionChannel, Message};
pub use frame::{Frame, FrameError, OpCode, Role};
pub use handshake::{accept, connect, connect_tcp, connect_tls, HandshakeError};
pub use tls::TlsError;
