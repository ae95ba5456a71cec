//! # Envoy Protocol Library
//!
//! Shared definitions for Envoy daemons and their peers:
//!
//! - **Session model**: [`SessionInfo`], [`SessionStatus`], [`DeviceSession`]
//!   and [`OutputEvent`], the snapshots every layer passes around
//! - **Messages**: the request/response and push messages of the peer protocol
//! - **Device identity**: Ed25519 keys, device ids and handshake signatures
//! - **Frame codec**: length-prefixed framing with optional LZ4 compression
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Application Messages           │  MessagePack-encoded
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  Length-prefixed, LZ4
//! ├─────────────────────────────────────────┤
//! │               TCP                       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ```rust
//! use protocol::{Envelope, Frame, FrameCodec, Message};
//!
//! let envelope = Envelope::new(1, Message::ListSessions);
//! let bytes = envelope.to_msgpack().unwrap();
//!
//! let codec = FrameCodec::new();
//! let wire = codec.encode(&Frame::new(bytes)).unwrap();
//! let (frame, _) = codec.decode(&wire).unwrap();
//! assert_eq!(Envelope::from_msgpack(&frame.payload).unwrap(), envelope);
//! ```

pub mod crypto;
pub mod error;
pub mod framing;
pub mod messages;
pub mod session;

pub use crypto::{
    generate_nonce, DeviceId, DeviceIdentity, PeerIdentity, Signature, DEVICE_ID_LENGTH,
    NONCE_LENGTH,
};
pub use error::{ProtocolError, Result};
pub use framing::{
    Frame, FrameCodec, FrameFlags, COMPRESSION_THRESHOLD, FRAME_HEADER_SIZE, FRAME_MAGIC,
    MAX_FRAME_SIZE,
};
pub use messages::{
    CreateSessionRequest, Envelope, ErrorCode, ErrorMessage, Hello, HelloAck, Message,
    PROTOCOL_VERSION, PUSH_SEQUENCE,
};
pub use session::{
    short_task_id, DeviceSession, OutputEvent, SessionId, SessionInfo, SessionStatus,
};
