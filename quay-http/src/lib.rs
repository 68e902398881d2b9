//! Async HTTP/3 client engine on top of QUIC.
//!
//! Provides the client side of HTTP/3 (RFC 9114) over any transport that
//! implements the `quay-quic` capability traits, with a quinn-backed default.
//! Framing and QPACK come from `quay-h3`.
//!
//! # Architecture
//!
//! `Client` dials its authority once, on first use. Dialing starts the
//! connection's background tasks: the client's control stream (SETTINGS),
//! the acceptor for the server's unidirectional streams, and the
//! control-stream monitor that publishes the server's SETTINGS and applies
//! GOAWAY. Optional hooks take over server-initiated streams that carry
//! extension types.
//!
//! Each request runs through the coordinator in [`Client::execute`]: it
//! opens a bidirectional stream, registers the stream with the connection's
//! GOAWAY registry, sends HEADERS and streams the body from a spawned task,
//! then reads the response HEADERS. The [`Body`] enforces the declared
//! content length and optionally decodes gzip.
//!
//! Cancellation flows one way: the caller's token or deadline and the
//! server's GOAWAY each record a cause on the request's own token and abort
//! both stream directions. Errors are normalized so the caller sees
//! [`Error::Goaway`], [`Error::Canceled`] or [`Error::Timeout`] rather than
//! the stream reset those produced.
//!
//! # Example
//!
//! ```rust,ignore
//! use quay_http::{Client, ClientConfig};
//!
//! async fn example() -> Result<(), quay_http::Error> {
//!     let client = Client::new("example.com", ClientConfig::default())?;
//!
//!     let resp = client.get("/api/data")
//!         .header("authorization", "Bearer tok")
//!         .send()
//!         .await?;
//!
//!     assert_eq!(resp.status(), 200);
//!     let body = resp.bytes().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Custom requests
//!
//! ```rust,ignore
//! use quay_http::{Client, RequestBody, RequestOptions};
//!
//! let request = http::Request::post("https://example.com/upload")
//!     .body(RequestBody::from_reader(file, Some(len)))?;
//! let options = RequestOptions {
//!     timeout: Some(Duration::from_secs(5)),
//!     check_settings: Some(Arc::new(|s| {
//!         if s.enable_datagram { Ok(()) } else { Err("no datagrams".into()) }
//!     })),
//!     ..Default::default()
//! };
//! let resp = client.execute(request, options).await?;
//! ```

pub mod body;
pub mod cancel;
pub mod client;
pub mod config;
mod connection;
pub mod error;
mod registry;
pub mod request;
pub mod response;
mod stream;

pub use body::{Body, GzipBody, ResponseBody};
pub use cancel::{CancelToken, Cause};
pub use client::Client;
pub use config::{
    ClientConfig, HijackedStream, RequestOptions, SettingsCheck, StreamHijacker,
    UniStreamHijacker,
};
pub use error::Error;
pub use quay_h3::{ErrorCode, Settings};
pub use request::{METHOD_GET_0RTT, METHOD_HEAD_0RTT, Protocol, RequestBody, RequestBuilder};
pub use response::Response;
