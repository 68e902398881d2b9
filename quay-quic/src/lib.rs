//! quay-quic: the QUIC transport capability consumed by the HTTP/3 client.
//!
//! The client engine never touches a QUIC implementation directly. It is
//! written against the [`Dialer`], [`Connection`], [`SendStream`] and
//! [`RecvStream`] traits defined here, which cover exactly what HTTP/3 needs
//! from its transport: opening and accepting streams, aborting either
//! direction of a stream with an application error code, closing the
//! connection, and observing handshake completion.
//!
//! [`QuinnDialer`] implements the traits on top of
//! [quinn](https://docs.rs/quinn) and rustls.
//!
//! # Example
//!
//! ```rust,ignore
//! use quay_quic::{Connection, Dialer, QuinnDialer, TlsParams, TransportConfig};
//!
//! let conn = QuinnDialer.dial("example.com:443", &tls, &TransportConfig::default()).await?;
//! conn.handshake_complete().await?;
//! let (mut send, mut recv) = conn.open_bi().await?;
//! ```

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;

pub use config::{
    TlsParams, TransportConfig, VERSION_1, VERSION_2, VERSION_DRAFT_29, alpn_for_version,
};
pub use connection::{Connection, Dialer, RecvStream, SendStream, TlsState};
pub use endpoint::{QuinnConnection, QuinnDialer, QuinnRecvStream, QuinnSendStream};
pub use error::TransportError;
