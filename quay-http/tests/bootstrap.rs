//! Dialing, the client's control stream, and the handling of
//! server-initiated streams.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{DialPlan, MockDialer};
use quay_h3::{ErrorCode, Frame, Settings, StreamType};
use quay_http::{Client, ClientConfig, Error, HijackedStream, RequestOptions};
use quay_quic::{
    RecvStream, SendStream, TransportConfig, TransportError, VERSION_1, VERSION_DRAFT_29,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

#[test]
fn rejects_multiple_versions() {
    let (dialer, _servers) = MockDialer::new(DialPlan::default());
    let config = ClientConfig {
        transport: Some(TransportConfig {
            versions: vec![VERSION_1, VERSION_DRAFT_29],
            ..Default::default()
        }),
        ..Default::default()
    };
    let err = Client::with_dialer("example.com", config, dialer).err().unwrap();
    assert!(matches!(err, Error::Config(_)), "{err}");
}

#[test]
fn rejects_http_datagrams_without_quic_datagrams() {
    let (dialer, _servers) = MockDialer::new(DialPlan::default());
    let config = ClientConfig {
        enable_datagrams: true,
        transport: Some(TransportConfig::default()),
        ..Default::default()
    };
    let err = Client::with_dialer("example.com", config, dialer).err().unwrap();
    assert_eq!(
        err,
        Error::Config("HTTP datagrams enabled, but QUIC datagrams disabled".into())
    );
}

#[tokio::test]
async fn dial_parameters_follow_version_and_host() {
    let (dialer, mut servers) = MockDialer::new(DialPlan::default());
    let config = ClientConfig {
        transport: Some(TransportConfig {
            versions: vec![VERSION_DRAFT_29],
            ..Default::default()
        }),
        ..Default::default()
    };
    let client = Client::with_dialer("example.com", config, dialer.clone()).unwrap();
    assert_eq!(client.authority(), "example.com:443");

    let request = tokio::spawn({
        let client = client.clone();
        async move { client.get("/").send().await }
    });
    let server = servers.recv().await.unwrap();
    let mut req = server.accept_request().await;
    req.respond(200, &[]).await;
    req.finish().await;
    request.await.unwrap().unwrap();

    let (authority, tls, transport) = dialer.last_dial().unwrap();
    assert_eq!(authority, "example.com:443");
    assert_eq!(tls.server_name.as_deref(), Some("example.com"));
    assert_eq!(tls.alpn_protocols, vec![b"h3-29".to_vec()]);
    assert_eq!(transport.versions, vec![VERSION_DRAFT_29]);
}

#[tokio::test]
async fn concurrent_requests_share_one_dial() {
    let plan = DialPlan {
        delay: Some(Duration::from_millis(30)),
        ..Default::default()
    };
    let (client, dialer, mut servers) = common::client_with(ClientConfig::default(), plan);

    let requests: Vec<_> = (0..5)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.get("/").send().await })
        })
        .collect();

    let server = servers.recv().await.unwrap();
    for _ in 0..5 {
        let mut req = server.accept_request().await;
        req.respond(200, &[]).await;
        req.finish().await;
    }
    for request in requests {
        assert_eq!(request.await.unwrap().unwrap().status(), 200);
    }
    assert_eq!(dialer.dials(), 1);
    assert!(servers.try_recv().is_err());
}

#[tokio::test]
async fn dial_failure_is_cached() {
    let plan = DialPlan {
        fail: Some(TransportError::Resolve("example.com:443".into())),
        ..Default::default()
    };
    let (client, dialer, _servers) = common::client_with(ClientConfig::default(), plan);

    let first = client.get("/").send().await.unwrap_err();
    let second = client.get("/other").send().await.unwrap_err();
    assert_eq!(
        first,
        Error::Dial(TransportError::Resolve("example.com:443".into()))
    );
    assert_eq!(first, second);
    assert_eq!(dialer.dials(), 1);
}

#[tokio::test]
async fn client_announces_settings_on_its_control_stream() {
    let mut config = ClientConfig {
        enable_datagrams: true,
        ..Default::default()
    };
    config.additional_settings.insert(0x1337, 7);
    let (client, _dialer, mut servers) = common::client(config);

    let request = tokio::spawn({
        let client = client.clone();
        async move { client.get("/").send().await }
    });
    let server = servers.recv().await.unwrap();
    let settings = server.accept_client_settings().await;
    assert!(settings.enable_datagram);
    assert_eq!(settings.other.get(&0x1337), Some(&7));

    let mut req = server.accept_request().await;
    req.respond(200, &[]).await;
    req.finish().await;
    request.await.unwrap().unwrap();
}

fn check(accept: bool) -> RequestOptions {
    RequestOptions {
        check_settings: Some(Arc::new(move |settings: &Settings| -> Result<(), String> {
            if settings.enable_datagram && accept {
                Ok(())
            } else {
                Err("server does not support datagrams".into())
            }
        })),
        ..Default::default()
    }
}

#[tokio::test]
async fn settings_check_waits_for_server_settings() {
    let (client, _dialer, mut servers) = common::client(ClientConfig::default());

    let request = tokio::spawn({
        let client = client.clone();
        async move { client.get("/").options(check(true)).send().await }
    });
    let server = servers.recv().await.unwrap();
    assert!(client.settings().is_none());

    let _control = server
        .open_control(Settings {
            enable_datagram: true,
            ..Default::default()
        })
        .await;
    let mut req = server.accept_request().await;
    req.respond(200, &[]).await;
    req.finish().await;
    assert_eq!(request.await.unwrap().unwrap().status(), 200);
    assert!(client.settings().unwrap().enable_datagram);
}

#[tokio::test]
async fn settings_check_can_refuse_the_request() {
    let (client, _dialer, mut servers) = common::client(ClientConfig::default());

    let request = tokio::spawn({
        let client = client.clone();
        async move { client.get("/").options(check(false)).send().await }
    });
    let server = servers.recv().await.unwrap();
    let _control = server.open_control(Settings::default()).await;

    let err = request.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        Error::SettingsRejected("server does not support datagrams".into())
    );
}

#[tokio::test]
async fn settings_check_fails_when_connection_closes_first() {
    let (client, _dialer, mut servers) = common::client(ClientConfig::default());

    let request = tokio::spawn({
        let client = client.clone();
        async move { client.get("/").options(check(true)).send().await }
    });
    let server = servers.recv().await.unwrap();
    server.close(0x100, "bye");

    let err = request.await.unwrap().unwrap_err();
    assert!(
        matches!(err, Error::Connection { code: 0x100, remote: true, .. }),
        "{err}"
    );
}

async fn dialed() -> (Client<MockDialer>, common::MockServer) {
    dialed_with(ClientConfig::default()).await
}

async fn dialed_with(config: ClientConfig) -> (Client<MockDialer>, common::MockServer) {
    let (client, _dialer, mut servers) = common::client(config);
    let request = tokio::spawn({
        let client = client.clone();
        async move { client.get("/").send().await }
    });
    let server = servers.recv().await.unwrap();
    let mut req = server.accept_request().await;
    req.respond(200, &[]).await;
    req.finish().await;
    request.await.unwrap().unwrap();
    (client, server)
}

#[tokio::test]
async fn control_stream_must_start_with_settings() {
    let (_client, server) = dialed().await;
    let mut send = server.open_uni_typed(StreamType::CONTROL).await;
    let mut buf = Vec::new();
    Frame::GoAway { stream_id: 0 }.encode(&mut buf);
    send.write_all(&buf).await.unwrap();
    assert_eq!(
        server.closed_by_client().await,
        ErrorCode::MissingSettings.value()
    );
}

#[tokio::test]
async fn second_settings_frame_is_unexpected() {
    let (_client, server) = dialed().await;
    let mut control = server.open_control(Settings::default()).await;
    control.frame(Frame::Settings(Settings::default())).await;
    assert_eq!(
        server.closed_by_client().await,
        ErrorCode::FrameUnexpected.value()
    );
}

#[tokio::test]
async fn closing_the_control_stream_is_fatal() {
    let (_client, server) = dialed().await;
    let mut control = server.open_control(Settings::default()).await;
    control.send.shutdown().await.unwrap();
    assert_eq!(
        server.closed_by_client().await,
        ErrorCode::ClosedCriticalStream.value()
    );
}

#[tokio::test]
async fn duplicate_control_stream_is_rejected() {
    let (client, server) = dialed().await;
    let _first = server.open_control(Settings::default()).await;
    // Let the first one be claimed before the second arrives.
    while client.settings().is_none() {
        tokio::task::yield_now().await;
    }
    let _second = server.open_control(Settings::default()).await;
    assert_eq!(
        server.closed_by_client().await,
        ErrorCode::StreamCreationError.value()
    );
}

#[tokio::test]
async fn push_streams_are_an_id_error() {
    let (_client, server) = dialed().await;
    let _push = server.open_uni_typed(StreamType::PUSH).await;
    assert_eq!(server.closed_by_client().await, ErrorCode::IdError.value());
}

#[tokio::test]
async fn unknown_uni_stream_is_stopped_without_hijacker() {
    let (_client, server) = dialed().await;
    let send = server.open_uni_typed(0x54).await;
    assert_eq!(send.stopped().await, ErrorCode::StreamCreationError.value());
}

#[tokio::test]
async fn uni_hijacker_takes_extension_streams() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = ClientConfig {
        uni_stream_hijacker: Some(Arc::new(
            move |stream_type: u64,
                  recv: Box<dyn RecvStream>|
                  -> Result<(), Box<dyn RecvStream>> {
                if stream_type == 0x54 {
                    let _ = tx.send(recv);
                    Ok(())
                } else {
                    Err(recv)
                }
            },
        )),
        ..Default::default()
    };
    let (_client, server) = dialed_with(config).await;

    let mut taken = server.open_uni_typed(0x54).await;
    taken.write_all(b"webtransport").await.unwrap();
    taken.shutdown().await.unwrap();
    let mut recv = rx.recv().await.unwrap();
    let mut payload = Vec::new();
    recv.read_to_end(&mut payload).await.unwrap();
    assert_eq!(payload, b"webtransport");

    let declined = server.open_uni_typed(0x55).await;
    assert_eq!(
        declined.stopped().await,
        ErrorCode::StreamCreationError.value()
    );
}

fn bidi_hijacker() -> (ClientConfig, mpsc::UnboundedReceiver<(u64, HijackedStream)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let config = ClientConfig {
        stream_hijacker: Some(Arc::new(
            move |frame_type: u64, stream: HijackedStream| -> Result<(), HijackedStream> {
                if frame_type == 0x41 {
                    let _ = tx.send((frame_type, stream));
                    Ok(())
                } else {
                    Err(stream)
                }
            },
        )),
        ..Default::default()
    };
    (config, rx)
}

#[tokio::test]
async fn bidi_hijacker_takes_extension_frames() {
    let (config, mut rx) = bidi_hijacker();
    let (_client, server) = dialed_with(config).await;

    let (mut send, _recv) = quay_quic::Connection::open_bi(&server.conn).await.unwrap();
    send.write_all(&[0x40, 0x41, b'h', b'i']).await.unwrap();
    send.shutdown().await.unwrap();

    let (frame_type, mut stream) = rx.recv().await.unwrap();
    assert_eq!(frame_type, 0x41);
    assert_eq!(stream.recv.id(), send.id());
    let mut payload = Vec::new();
    stream.recv.read_to_end(&mut payload).await.unwrap();
    assert_eq!(payload, b"hi");
}

#[tokio::test]
async fn declined_bidi_stream_closes_connection() {
    let (config, _rx) = bidi_hijacker();
    let (_client, server) = dialed_with(config).await;

    let (mut send, _recv) = quay_quic::Connection::open_bi(&server.conn).await.unwrap();
    send.write_all(&[0x40, 0x42]).await.unwrap();
    assert_eq!(
        server.closed_by_client().await,
        ErrorCode::FrameUnexpected.value()
    );
}

#[tokio::test]
async fn server_request_frames_on_bidi_streams_close_connection() {
    let (config, _rx) = bidi_hijacker();
    let (_client, server) = dialed_with(config).await;

    let (mut send, _recv) = quay_quic::Connection::open_bi(&server.conn).await.unwrap();
    send.write_all(&common::headers_frame(&[(":status", "200")]))
        .await
        .unwrap();
    assert_eq!(
        server.closed_by_client().await,
        ErrorCode::FrameUnexpected.value()
    );
}
