use bytes::Bytes;
use http::header::{self, HeaderName};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use quay_h3::HeaderField;
use quay_quic::TlsState;

use crate::body::Body;
use crate::error::Error;

/// HTTP response.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    content_length: i64,
    uncompressed: bool,
    tls: TlsState,
    stream_id: u64,
    body: Body,
}

/// Everything but the body; carried in the extensions of
/// [`Response::into_http`].
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub content_length: i64,
    pub uncompressed: bool,
    pub tls: TlsState,
    pub stream_id: u64,
}

impl Response {
    pub(crate) fn new(head: ResponseHead, meta: ResponseMeta, body: Body) -> Self {
        Self {
            status: head.status,
            headers: head.headers,
            content_length: meta.content_length,
            uncompressed: meta.uncompressed,
            tls: meta.tls,
            stream_id: meta.stream_id,
            body,
        }
    }

    /// HTTP status code (e.g. 200, 404).
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get the first header value matching `name`, if it is valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    /// Body length in bytes, or -1 when unknown (read until the stream
    /// ends).
    pub fn content_length(&self) -> i64 {
        self.content_length
    }

    /// The body was gzip-encoded on the wire and is decoded transparently.
    pub fn is_uncompressed(&self) -> bool {
        self.uncompressed
    }

    pub fn tls_state(&self) -> &TlsState {
        &self.tls
    }

    /// QUIC id of the request stream.
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    pub fn into_body(self) -> Body {
        self.body
    }

    /// Read the whole body.
    pub async fn bytes(mut self) -> Result<Bytes, Error> {
        self.body.bytes().await
    }

    /// Read the whole body as UTF-8 text.
    pub async fn text(self) -> Result<String, Error> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::Body(e.to_string()))
    }

    /// Convert into an [`http::Response`], with a [`ResponseMeta`] in its
    /// extensions.
    pub fn into_http(self) -> http::Response<Body> {
        let mut response = http::Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response.extensions_mut().insert(ResponseMeta {
            content_length: self.content_length,
            uncompressed: self.uncompressed,
            tls: self.tls,
            stream_id: self.stream_id,
        });
        response
    }
}

/// Status and headers decoded from a response HEADERS frame.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    /// Value of `content-length`, if present.
    pub(crate) declared_length: Option<u64>,
}

/// Build a header map from regular (non-pseudo) fields.
pub(crate) fn header_map(fields: Vec<HeaderField>) -> Result<HeaderMap, String> {
    let mut headers = HeaderMap::with_capacity(fields.len());
    for field in fields {
        let (name, value) = regular_field(&field)?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn regular_field(field: &HeaderField) -> Result<(HeaderName, HeaderValue), String> {
    if field.name.iter().any(u8::is_ascii_uppercase) {
        return Err(format!(
            "header field is not lower-case: {:?}",
            String::from_utf8_lossy(&field.name)
        ));
    }
    let name = HeaderName::from_bytes(&field.name).map_err(|_| {
        format!(
            "invalid header field name: {:?}",
            String::from_utf8_lossy(&field.name)
        )
    })?;
    let value = HeaderValue::from_bytes(&field.value)
        .map_err(|_| format!("invalid value for header field {name}"))?;
    Ok((name, value))
}

/// Validate and split a decoded response header list.
///
/// Pseudo headers must precede regular ones, `:status` must appear exactly
/// once, and repeated `content-length` values must agree.
pub(crate) fn parse_response_head(fields: Vec<HeaderField>) -> Result<ResponseHead, String> {
    let mut status = None;
    let mut seen_regular = false;
    let mut declared_length: Option<u64> = None;
    let mut headers = HeaderMap::with_capacity(fields.len());

    for field in &fields {
        if field.is_pseudo() {
            if seen_regular {
                return Err("received pseudo header after a regular header".into());
            }
            if field.name != b":status" {
                return Err(format!(
                    "invalid response pseudo header: {:?}",
                    String::from_utf8_lossy(&field.name)
                ));
            }
            if status.is_some() {
                return Err("duplicate :status pseudo header".into());
            }
            status = Some(parse_status(&field.value)?);
            continue;
        }
        seen_regular = true;

        let (name, value) = regular_field(field)?;
        if name == header::CONTENT_LENGTH {
            let length = std::str::from_utf8(&field.value)
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or_else(|| {
                    format!(
                        "invalid content-length: {:?}",
                        String::from_utf8_lossy(&field.value)
                    )
                })?;
            match declared_length {
                Some(previous) if previous != length => {
                    return Err("contradicting content lengths".into());
                }
                Some(_) => continue,
                None => declared_length = Some(length),
            }
        }
        headers.append(name, value);
    }

    let status = status.ok_or("missing :status pseudo header")?;
    Ok(ResponseHead {
        status,
        headers,
        declared_length,
    })
}

fn parse_status(value: &[u8]) -> Result<StatusCode, String> {
    if value.len() != 3 {
        return Err(format!(
            "invalid status code: {:?}",
            String::from_utf8_lossy(value)
        ));
    }
    StatusCode::from_bytes(value)
        .map_err(|_| format!("invalid status code: {:?}", String::from_utf8_lossy(value)))
}

/// The content length reported on the response (RFC 9110 Section 8.6).
///
/// Unknown (-1) for informational, 204 and successful CONNECT responses, and
/// for any response carrying `transfer-encoding`; otherwise the declared
/// length, or -1 without one.
pub(crate) fn reported_content_length(
    method: &Method,
    status: StatusCode,
    headers: &HeaderMap,
    declared: Option<u64>,
) -> i64 {
    let exempt = headers.contains_key(header::TRANSFER_ENCODING)
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || (*method == Method::CONNECT && status.is_success());
    if exempt {
        return -1;
    }
    declared
        .and_then(|n| i64::try_from(n).ok())
        .unwrap_or(-1)
}

/// Whether this client should decode the body: it asked for gzip and the
/// server answered with it.
pub(crate) fn is_gzip_response(requested_gzip: bool, headers: &HeaderMap) -> bool {
    requested_gzip
        && headers
            .get(header::CONTENT_ENCODING)
            .is_some_and(|v| v.as_bytes() == b"gzip")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(list: &[(&str, &str)]) -> Vec<HeaderField> {
        list.iter().map(|(n, v)| HeaderField::new(*n, *v)).collect()
    }

    #[test]
    fn parses_status_and_headers() {
        let head = parse_response_head(fields(&[
            (":status", "200"),
            ("content-type", "text/plain"),
            ("content-length", "12"),
            ("set-cookie", "a=1"),
            ("set-cookie", "b=2"),
        ]))
        .unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.declared_length, Some(12));
        assert_eq!(head.headers.get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn malformed_heads_are_rejected() {
        let cases: &[&[(&str, &str)]] = &[
            &[("content-type", "x")],
            &[(":status", "200"), (":status", "200")],
            &[(":status", "20")],
            &[(":status", "abc")],
            &[(":method", "GET"), (":status", "200")],
            &[(":status", "200"), ("x", "1"), (":path", "/")],
            &[(":status", "200"), ("content-length", "1"), ("content-length", "2")],
            &[(":status", "200"), ("content-length", "-5")],
            &[(":status", "200"), ("X-Upper", "1")],
        ];
        for case in cases {
            assert!(parse_response_head(fields(case)).is_err(), "{case:?}");
        }
    }

    #[test]
    fn repeated_equal_content_length_is_kept_once() {
        let head = parse_response_head(fields(&[
            (":status", "200"),
            ("content-length", "7"),
            ("content-length", "7"),
        ]))
        .unwrap();
        assert_eq!(head.declared_length, Some(7));
        assert_eq!(head.headers.get_all("content-length").iter().count(), 1);
    }

    #[test]
    fn content_length_exemptions() {
        let plain = HeaderMap::new();
        let get = Method::GET;
        assert_eq!(reported_content_length(&get, StatusCode::OK, &plain, Some(5)), 5);
        assert_eq!(reported_content_length(&get, StatusCode::OK, &plain, None), -1);
        assert_eq!(
            reported_content_length(&get, StatusCode::NO_CONTENT, &plain, Some(5)),
            -1
        );
        assert_eq!(
            reported_content_length(&get, StatusCode::CONTINUE, &plain, Some(5)),
            -1
        );
        assert_eq!(
            reported_content_length(&Method::CONNECT, StatusCode::OK, &plain, Some(5)),
            -1
        );
        assert_eq!(
            reported_content_length(&Method::CONNECT, StatusCode::FORBIDDEN, &plain, Some(5)),
            5
        );

        let mut chunked = HeaderMap::new();
        chunked.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        assert_eq!(reported_content_length(&get, StatusCode::OK, &chunked, Some(5)), -1);
    }

    #[test]
    fn gzip_only_when_requested() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        assert!(is_gzip_response(true, &headers));
        assert!(!is_gzip_response(false, &headers));
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("br"));
        assert!(!is_gzip_response(true, &headers));
    }
}
