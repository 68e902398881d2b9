use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use quay_h3::{HeaderCodec, Settings, StaticQpack};
use quay_quic::{RecvStream, SendStream, TlsParams, TransportConfig};

use crate::cancel::CancelToken;

/// Default cap on the size of a response HEADERS frame: 10 MiB.
pub const DEFAULT_MAX_RESPONSE_HEADER_BYTES: u64 = 10 << 20;

/// Sent when the request carries no `user-agent`.
pub const DEFAULT_USER_AGENT: &str = concat!("quay/", env!("CARGO_PKG_VERSION"));

/// A bidirectional stream opened by the server, handed to the
/// [`StreamHijacker`] after its first frame type was read.
pub struct HijackedStream {
    pub send: Box<dyn SendStream>,
    pub recv: Box<dyn RecvStream>,
}

/// Claims server-initiated bidirectional streams. Receives the first frame
/// type on the stream; returning the stream back declines it, which closes
/// the connection with `H3_FRAME_UNEXPECTED`.
pub type StreamHijacker =
    Arc<dyn Fn(u64, HijackedStream) -> Result<(), HijackedStream> + Send + Sync>;

/// Claims unidirectional streams of unknown type. Receives the stream type;
/// returning the stream back declines it.
pub type UniStreamHijacker =
    Arc<dyn Fn(u64, Box<dyn RecvStream>) -> Result<(), Box<dyn RecvStream>> + Send + Sync>;

/// Validates the server's SETTINGS before a request is sent.
pub type SettingsCheck = Arc<dyn Fn(&Settings) -> Result<(), String> + Send + Sync>;

/// Client-wide configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Never add `accept-encoding: gzip` or decode gzip bodies.
    pub disable_compression: bool,
    /// Announce HTTP datagram support (SETTINGS_H3_DATAGRAM). Requires QUIC
    /// datagrams in the transport configuration.
    pub enable_datagrams: bool,
    /// Largest response HEADERS frame accepted. `0` means
    /// [`DEFAULT_MAX_RESPONSE_HEADER_BYTES`].
    pub max_response_header_bytes: u64,
    /// Extra SETTINGS sent on the control stream.
    pub additional_settings: BTreeMap<u64, u64>,
    /// `user-agent` for requests without one. `None` uses
    /// [`DEFAULT_USER_AGENT`]; an empty string sends none.
    pub user_agent: Option<String>,
    pub stream_hijacker: Option<StreamHijacker>,
    pub uni_stream_hijacker: Option<UniStreamHijacker>,
    /// Transport configuration. `None` uses the defaults with datagrams
    /// following `enable_datagrams`.
    pub transport: Option<TransportConfig>,
    pub tls: TlsParams,
    /// Header block codec shared by all requests.
    pub header_codec: Arc<dyn HeaderCodec>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            disable_compression: false,
            enable_datagrams: false,
            max_response_header_bytes: 0,
            additional_settings: BTreeMap::new(),
            user_agent: None,
            stream_hijacker: None,
            uni_stream_hijacker: None,
            transport: None,
            tls: TlsParams::default(),
            header_codec: Arc::new(StaticQpack),
        }
    }
}

impl ClientConfig {
    pub(crate) fn max_header_bytes(&self) -> u64 {
        match self.max_response_header_bytes {
            0 => DEFAULT_MAX_RESPONSE_HEADER_BYTES,
            n => n,
        }
    }

    /// The SETTINGS this client announces.
    pub(crate) fn settings(&self) -> Settings {
        Settings {
            enable_datagram: self.enable_datagrams,
            other: self.additional_settings.clone(),
            ..Settings::default()
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("disable_compression", &self.disable_compression)
            .field("enable_datagrams", &self.enable_datagrams)
            .field("max_response_header_bytes", &self.max_response_header_bytes)
            .field("additional_settings", &self.additional_settings)
            .field("user_agent", &self.user_agent)
            .field("stream_hijacker", &self.stream_hijacker.is_some())
            .field("uni_stream_hijacker", &self.uni_stream_hijacker.is_some())
            .field("transport", &self.transport)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

/// Per-request options.
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Wait for the server's SETTINGS and validate them before opening the
    /// request stream.
    pub check_settings: Option<SettingsCheck>,
    /// Leave the request stream's send side open after the body is sent.
    /// It is finished when the response body is closed.
    pub dont_close_request_stream: bool,
    /// Cancels the request, including a response body still being read.
    pub cancel: Option<CancelToken>,
    /// Deadline for the whole exchange, body included.
    pub timeout: Option<Duration>,
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("check_settings", &self.check_settings.is_some())
            .field("dont_close_request_stream", &self.dont_close_request_stream)
            .field("cancel", &self.cancel)
            .field("timeout", &self.timeout)
            .finish()
    }
}
