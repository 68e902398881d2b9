//! HTTP/3 framing layer for the quay client.
//!
//! This crate holds the wire-level pieces of HTTP/3 that the client engine in
//! `quay-http` builds on. It handles:
//!
//! - QUIC variable-length integers and HTTP/3 frame encoding
//! - Async frame parsing off any [`tokio::io::AsyncRead`] stream
//!   (DATA, HEADERS, SETTINGS, GOAWAY; unknown types are skipped)
//! - SETTINGS encoding/decoding, including the datagram and extended
//!   CONNECT flags
//! - HTTP/3 application error codes
//! - A stateless QPACK header codec (static table only)
//!
//! # Architecture
//!
//! ```text
//!   ┌────────────┐
//!   │ quay-http  │  Client, request coordinator, control-stream monitor
//!   └────┬───────┘
//!        │ read_frame() / Frame::encode() / HeaderCodec
//!   ┌────▼───────┐
//!   │  quay-h3   │  HTTP/3 framing + QPACK
//!   └────┬───────┘
//!        │ AsyncRead / AsyncWrite
//!   ┌────▼───────┐
//!   │ quay-quic  │  QUIC transport capability
//!   └────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use quay_h3::{frame, FrameHead, HeaderCodec, StaticQpack};
//!
//! match frame::read_frame(&mut recv).await? {
//!     Some(FrameHead::Headers { len }) => {
//!         let mut block = vec![0u8; len as usize];
//!         recv.read_exact(&mut block).await?;
//!         let fields = StaticQpack.decode(&block)?;
//!     }
//!     _ => {}
//! }
//! ```

pub mod code;
pub mod error;
pub mod frame;
mod huffman;
pub mod qpack;
pub mod settings;
pub mod stream;

pub use code::ErrorCode;
pub use error::H3Error;
pub use frame::{Frame, FrameHead};
pub use qpack::{HeaderCodec, HeaderField, StaticQpack};
pub use settings::Settings;
pub use stream::StreamType;
