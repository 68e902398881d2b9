use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// QUIC version 1 (RFC 9000).
pub const VERSION_1: u32 = 0x0000_0001;
/// QUIC version 2 (RFC 9369).
pub const VERSION_2: u32 = 0x6b33_43cf;
/// draft-ietf-quic-transport-29, still spoken by some deployed servers.
pub const VERSION_DRAFT_29: u32 = 0xff00_001d;

/// The ALPN token HTTP/3 uses over the given QUIC version.
pub fn alpn_for_version(version: u32) -> &'static [u8] {
    if version == VERSION_DRAFT_29 {
        b"h3-29"
    } else {
        b"h3"
    }
}

/// Transport-level knobs for a dialed connection.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// QUIC versions to offer. An HTTP/3 client dials with exactly one.
    pub versions: Vec<u32>,
    /// Negotiate QUIC DATAGRAM frames (RFC 9221).
    pub enable_datagrams: bool,
    /// Interval between keep-alive PINGs. Default: 10s.
    pub keep_alive_interval: Option<Duration>,
    /// Idle timeout proposed to the peer. Default: 30s.
    pub max_idle_timeout: Option<Duration>,
    /// Bidirectional streams the peer may open. Default: 0.
    pub max_incoming_bidi_streams: u32,
    /// Unidirectional streams the peer may open. Default: 100.
    pub max_incoming_uni_streams: u32,
    /// Local UDP address to bind. Default: unspecified address matching the
    /// peer's address family.
    pub local_addr: Option<SocketAddr>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            versions: vec![VERSION_1],
            enable_datagrams: false,
            keep_alive_interval: Some(Duration::from_secs(10)),
            max_idle_timeout: Some(Duration::from_secs(30)),
            max_incoming_bidi_streams: 0,
            max_incoming_uni_streams: 100,
            local_addr: None,
        }
    }
}

/// TLS parameters for dialing.
#[derive(Debug, Clone, Default)]
pub struct TlsParams {
    /// Base rustls configuration. When `None`, the webpki root store is used
    /// with no client authentication.
    pub client_config: Option<Arc<rustls::ClientConfig>>,
    /// Server name for SNI and certificate verification.
    pub server_name: Option<String>,
    /// ALPN protocols to offer; overrides whatever `client_config` carries.
    pub alpn_protocols: Vec<Vec<u8>>,
    /// Attempt 0-RTT when a resumable session is cached.
    pub enable_early_data: bool,
}

impl TlsParams {
    /// Build the rustls configuration to dial with.
    pub fn rustls_config(&self) -> rustls::ClientConfig {
        let mut tls = match &self.client_config {
            Some(base) => (**base).clone(),
            None => {
                let mut roots = rustls::RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            }
        };
        if !self.alpn_protocols.is_empty() {
            tls.alpn_protocols = self.alpn_protocols.clone();
        }
        if self.enable_early_data {
            tls.enable_early_data = true;
        }
        tls
    }
}
