//! # Handshake
//!
//! The HTTP/1.1 opening handshake from
//! [RFC 6455 Section 4.2](https://datatracker.ietf.org/doc/html/rfc6455#section-4.2).
//!
//! Parsing is deliberately permissive: the request line and each `name: value` header line are
//! matched independently and anything that does not match is ignored. Whether the result is a
//! valid upgrade request is decided afterwards by [`validate_handshake`] (or
//! [`HandshakePolicy::validate`]), which reports the first failed check as an error.
use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use nom::{
    bytes::complete::{tag, take_till1, take_while1},
    character::complete::{char, space0},
    combinator::rest,
    sequence::{preceded, separated_pair, terminated},
    IResult, Parser,
};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{options::HandshakePolicy, Result, WebSocketError, WS_GUID};

/// Parsed HTTP request line and header block.
///
/// Header names are case-sensitive keys; if a name repeats, the last value wins. Values are
/// trimmed. A missing or malformed request line leaves `method`, `uri` and `http_version`
/// empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHeader {
    pub method: String,
    pub uri: String,
    pub http_version: String,
    pub headers: HashMap<String, String>,
}

fn request_line(input: &str) -> IResult<&str, (&str, &str, &str)> {
    (
        terminated(take_while1(|c: char| c.is_ascii_uppercase()), char(' ')),
        terminated(take_till1(|c: char| c == ' '), char(' ')),
        preceded(
            tag("HTTP/"),
            take_while1(|c: char| c.is_ascii_digit() || c == '.'),
        ),
    )
        .parse(input)
}

fn header_line(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-'),
        (char(':'), space0),
        rest,
    )
    .parse(input)
}

impl RequestHeader {
    /// Parses a request head from raw bytes.
    ///
    /// Parsing stops at the first empty line; a body, if any, is not inspected. Invalid UTF-8
    /// is replaced rather than rejected.
    pub fn parse(bytes: &[u8]) -> Self {
        let text = String::from_utf8_lossy(bytes);
        let mut lines = text
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .take_while(|line| !line.is_empty())
            .peekable();

        let mut request = Self::default();

        if let Some(Ok((_, (method, uri, version)))) = lines.peek().map(|line| request_line(line))
        {
            request.method = method.to_owned();
            request.uri = uri.to_owned();
            request.http_version = version.to_owned();
            lines.next();
        }

        for line in lines {
            if let Ok((_, (name, value))) = header_line(line) {
                request
                    .headers
                    .insert(name.to_owned(), value.trim().to_owned());
            }
        }

        request
    }

    /// Returns the value of the header `name`, matched exactly.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Returns the value of the header `name`, ignoring ASCII case.
    ///
    /// When several spellings of the same name are present, an exact match is preferred.
    pub fn header_ignore_case(&self, name: &str) -> Option<&str> {
        self.header(name).or_else(|| {
            self.headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str())
        })
    }
}

impl HandshakePolicy {
    /// Checks that `request` is a WebSocket upgrade request.
    ///
    /// Checks run in a fixed order and stop at the first failure:
    /// 1. the method is `GET`
    /// 2. `Host` is present
    /// 3. `Upgrade` is `websocket`
    /// 4. `Connection` is `Upgrade`
    /// 5. `Sec-WebSocket-Key` is present
    /// 6. `Sec-WebSocket-Version` is `13`
    ///
    /// Under [`HandshakePolicy::Strict`] names and values must match exactly. Under
    /// [`HandshakePolicy::Lenient`] header names and the `Upgrade` value ignore case, and
    /// `Connection` may be a comma-separated list containing an `upgrade` token.
    pub fn validate(&self, request: &RequestHeader) -> Result<()> {
        if request.method != "GET" {
            return Err(WebSocketError::InvalidMethod(request.method.clone()));
        }

        let strict = *self == HandshakePolicy::Strict;
        let get = |name: &str| {
            if strict {
                request.header(name)
            } else {
                request.header_ignore_case(name)
            }
        };

        if get("Host").is_none() {
            return Err(WebSocketError::MissingHost);
        }

        let upgrade_ok = get("Upgrade").is_some_and(|value| {
            if strict {
                value == "websocket"
            } else {
                value.eq_ignore_ascii_case("websocket")
            }
        });
        if !upgrade_ok {
            return Err(WebSocketError::InvalidUpgradeHeader);
        }

        let connection_ok = get("Connection").is_some_and(|value| {
            if strict {
                value == "Upgrade"
            } else {
                value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
            }
        });
        if !connection_ok {
            return Err(WebSocketError::InvalidConnectionHeader);
        }

        if get("Sec-WebSocket-Key").is_none() {
            return Err(WebSocketError::MissingSecWebSocketKey);
        }

        if get("Sec-WebSocket-Version") != Some("13") {
            return Err(WebSocketError::InvalidSecWebsocketVersion);
        }

        Ok(())
    }
}

/// Checks `request` with the exact-match rules of [`HandshakePolicy::Strict`].
pub fn validate_handshake(request: &RequestHeader) -> Result<()> {
    HandshakePolicy::Strict.validate(request)
}

/// Computes `Sec-WebSocket-Accept`: base64(SHA-1(key + GUID)).
pub fn sec_websocket_accept(key: &[u8]) -> String {
    use base64::prelude::*;
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(WS_GUID.as_bytes());
    let result = sha1.finalize();
    BASE64_STANDARD.encode(&result[..])
}

/// Builds the `101 Switching Protocols` reply for a validated request.
///
/// Must only be called after validation succeeded. The one precondition that would make the
/// reply meaningless, a missing `Sec-WebSocket-Key`, is reported as
/// [`WebSocketError::MissingSecWebSocketKey`].
pub fn build_handshake_response(request: &RequestHeader) -> Result<Bytes> {
    let key = request
        .header_ignore_case("Sec-WebSocket-Key")
        .ok_or(WebSocketError::MissingSecWebSocketKey)?;

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        sec_websocket_accept(key.as_bytes())
    );

    Ok(Bytes::from(response))
}

/// Position just past the blank line terminating a request head, if present.
///
/// Accepts bare `\n` line endings as [`RequestHeader::parse`] does, so both `\r\n\r\n` and
/// `\n\n` end the head.
fn head_end(buf: &[u8]) -> Option<usize> {
    buf.iter().enumerate().find_map(|(at, &byte)| {
        if byte != b'\n' {
            return None;
        }
        match &buf[at + 1..] {
            [b'\n', ..] => Some(at + 2),
            [b'\r', b'\n', ..] => Some(at + 3),
            _ => None,
        }
    })
}

/// Reads from `stream` until `buf` holds a complete request head.
///
/// Returns the length of the head within `buf`. Anything read past it stays in `buf`, since a
/// client may send its first frame right behind the request. A head longer than `max_size` is
/// rejected even when it arrives in a single read.
pub(crate) async fn read_request_head<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    max_size: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    let mut scanned: usize = 0;
    loop {
        // re-scan the last 3 bytes in case the terminator straddles two reads
        let from = scanned.saturating_sub(3);
        if let Some(end) = head_end(&buf[from..]) {
            let end = from + end;
            if end > max_size {
                return Err(WebSocketError::HandshakeTooLarge(max_size));
            }
            return Ok(end);
        }
        if buf.len() >= max_size {
            return Err(WebSocketError::HandshakeTooLarge(max_size));
        }
        scanned = buf.len();

        if stream.read_buf(buf).await? == 0 {
            return Err(WebSocketError::ConnectionClosed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &str = "GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Origin: http://example.com\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    fn without(name: &str) -> RequestHeader {
        let mut request = RequestHeader::parse(REQUEST.as_bytes());
        request.headers.remove(name);
        request
    }

    fn with(name: &str, value: &str) -> RequestHeader {
        let mut request = RequestHeader::parse(REQUEST.as_bytes());
        request.headers.insert(name.to_owned(), value.to_owned());
        request
    }

    #[test]
    fn test_parse_request() {
        let request = RequestHeader::parse(REQUEST.as_bytes());

        assert_eq!(request.method, "GET");
        assert_eq!(request.uri, "/chat");
        assert_eq!(request.http_version, "1.1");
        assert_eq!(request.headers.len(), 6);
        assert_eq!(request.header("Host"), Some("server.example.com"));
        assert_eq!(request.header("Origin"), Some("http://example.com"));
        assert_eq!(request.header("host"), None);
        assert_eq!(request.header_ignore_case("host"), Some("server.example.com"));
    }

    #[test]
    fn test_parse_is_permissive() {
        let request = RequestHeader::parse(b"garbage\r\nHost:   a.b  \r\n: nope\r\nno colon here\r\n");

        assert_eq!(request.method, "");
        assert_eq!(request.uri, "");
        assert_eq!(request.http_version, "");
        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.header("Host"), Some("a.b"));

        assert_eq!(RequestHeader::parse(b""), RequestHeader::default());
    }

    #[test]
    fn test_parse_keeps_empty_header_values() {
        let request = RequestHeader::parse(
            REQUEST
                .replace("Host: server.example.com", "Host: ")
                .as_bytes(),
        );

        assert_eq!(request.header("Host"), Some(""));
        assert!(validate_handshake(&request).is_ok());
    }

    #[test]
    fn test_parse_last_header_wins() {
        let request = RequestHeader::parse(b"GET / HTTP/1.1\nX-Id: 1\nX-Id:2\n\n");
        assert_eq!(request.header("X-Id"), Some("2"));
    }

    #[test]
    fn test_parse_stops_at_body() {
        let request = RequestHeader::parse(b"POST /form HTTP/1.0\r\nHost: h\r\n\r\nKey: body\r\n");

        assert_eq!(request.method, "POST");
        assert_eq!(request.http_version, "1.0");
        assert_eq!(request.header("Key"), None);
    }

    #[test]
    fn test_validate_accepts_upgrade() {
        let request = RequestHeader::parse(REQUEST.as_bytes());
        assert!(validate_handshake(&request).is_ok());
        assert!(HandshakePolicy::Lenient.validate(&request).is_ok());
    }

    #[test]
    fn test_validate_rejections() {
        let mut post = RequestHeader::parse(REQUEST.as_bytes());
        post.method = "POST".to_owned();
        assert!(matches!(
            validate_handshake(&post),
            Err(WebSocketError::InvalidMethod(method)) if method == "POST"
        ));

        assert!(matches!(
            validate_handshake(&without("Host")),
            Err(WebSocketError::MissingHost)
        ));
        assert!(matches!(
            validate_handshake(&without("Upgrade")),
            Err(WebSocketError::InvalidUpgradeHeader)
        ));
        assert!(matches!(
            validate_handshake(&with("Upgrade", "h2c")),
            Err(WebSocketError::InvalidUpgradeHeader)
        ));
        assert!(matches!(
            validate_handshake(&without("Connection")),
            Err(WebSocketError::InvalidConnectionHeader)
        ));
        assert!(matches!(
            validate_handshake(&without("Sec-WebSocket-Key")),
            Err(WebSocketError::MissingSecWebSocketKey)
        ));
        assert!(matches!(
            validate_handshake(&without("Sec-WebSocket-Version")),
            Err(WebSocketError::InvalidSecWebsocketVersion)
        ));
        assert!(matches!(
            validate_handshake(&with("Sec-WebSocket-Version", "8")),
            Err(WebSocketError::InvalidSecWebsocketVersion)
        ));
    }

    #[test]
    fn test_validate_checks_in_order() {
        let request = RequestHeader::parse(b"GET / HTTP/1.1\r\nConnection: Upgrade\r\n\r\n");
        assert!(matches!(
            validate_handshake(&request),
            Err(WebSocketError::MissingHost)
        ));
    }

    #[test]
    fn test_strict_rejects_what_lenient_accepts() {
        let cases = [
            ("Upgrade", "WebSocket"),
            ("Connection", "keep-alive, Upgrade"),
            ("Connection", "upgrade"),
        ];

        for (name, value) in cases {
            let request = with(name, value);
            assert!(validate_handshake(&request).is_err(), "{}: {}", name, value);
            assert!(
                HandshakePolicy::Lenient.validate(&request).is_ok(),
                "{}: {}",
                name,
                value
            );
        }

        let lowercase = RequestHeader::parse(
            REQUEST
                .replace("Sec-WebSocket-Key", "sec-websocket-key")
                .as_bytes(),
        );
        assert!(matches!(
            validate_handshake(&lowercase),
            Err(WebSocketError::MissingSecWebSocketKey)
        ));
        assert!(HandshakePolicy::Lenient.validate(&lowercase).is_ok());
        assert!(build_handshake_response(&lowercase).is_ok());

        assert!(HandshakePolicy::Lenient
            .validate(&with("Connection", "keep-alive"))
            .is_err());
    }

    #[test]
    fn test_sec_websocket_accept_rfc_example() {
        assert_eq!(
            sec_websocket_accept(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_build_handshake_response() {
        let request = RequestHeader::parse(REQUEST.as_bytes());
        let response = build_handshake_response(&request).unwrap();

        assert_eq!(
            &response[..],
            b"HTTP/1.1 101 Switching Protocols\r\n\
              Connection: Upgrade\r\n\
              Upgrade: websocket\r\n\
              Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
              \r\n"
        );

        assert!(matches!(
            build_handshake_response(&without("Sec-WebSocket-Key")),
            Err(WebSocketError::MissingSecWebSocketKey)
        ));
    }

    #[tokio::test]
    async fn test_read_request_head_keeps_trailing_bytes() {
        let mut input = REQUEST.as_bytes().to_vec();
        input.extend_from_slice(&[0x81, 0x80]);
        let (mut client, mut server) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            // dribble the request so the terminator straddles reads
            for chunk in input.chunks(7) {
                client.write_all(chunk).await.unwrap();
            }
            client
        });

        let mut buf = BytesMut::new();
        let head = read_request_head(&mut server, &mut buf, 1024).await.unwrap();
        let _client = writer.await.unwrap();

        assert_eq!(head, REQUEST.len());
        assert_eq!(&buf[..head], REQUEST.as_bytes());
        // the trailing frame bytes may still be in flight, but never inside the head
        assert!(buf.len() >= head);
    }

    #[tokio::test]
    async fn test_read_request_head_limits() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        {
            use tokio::io::AsyncWriteExt;
            client.write_all(&[b'a'; 100]).await.unwrap();
        }
        let mut buf = BytesMut::new();
        assert!(matches!(
            read_request_head(&mut server, &mut buf, 64).await,
            Err(WebSocketError::HandshakeTooLarge(64))
        ));

        drop(client);
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);
        let mut buf = BytesMut::new();
        assert!(matches!(
            read_request_head(&mut server, &mut buf, 64).await,
            Err(WebSocketError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_read_request_head_rejects_oversized_single_read() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        {
            use tokio::io::AsyncWriteExt;
            client.write_all(REQUEST.as_bytes()).await.unwrap();
        }
        assert!(REQUEST.len() > 64);

        let mut buf = BytesMut::new();
        assert!(matches!(
            read_request_head(&mut server, &mut buf, 64).await,
            Err(WebSocketError::HandshakeTooLarge(64))
        ));

        let mut buf = BytesMut::from(REQUEST.as_bytes());
        let (_client, mut server) = tokio::io::duplex(1024);
        assert_eq!(
            read_request_head(&mut server, &mut buf, REQUEST.len())
                .await
                .unwrap(),
            REQUEST.len()
        );
    }

    #[tokio::test]
    async fn test_read_request_head_accepts_bare_newlines() {
        let head = REQUEST.replace("\r\n", "\n");
        let (mut client, mut server) = tokio::io::duplex(1024);
        {
            use tokio::io::AsyncWriteExt;
            client.write_all(head.as_bytes()).await.unwrap();
            client.write_all(b"rest").await.unwrap();
        }

        let mut buf = BytesMut::new();
        let len = read_request_head(&mut server, &mut buf, 1024).await.unwrap();
        assert_eq!(len, head.len());
        assert!(validate_handshake(&RequestHeader::parse(&buf[..len])).is_ok());
    }

    #[test]
    fn test_head_end() {
        assert_eq!(head_end(b"GET / HTTP/1.1\r\n\r\nxy"), Some(18));
        assert_eq!(head_end(b"GET / HTTP/1.1\n\nxy"), Some(16));
        assert_eq!(head_end(b"GET / HTTP/1.1\r\nHost: a\r\n"), None);
        assert_eq!(head_end(b""), None);
    }
}
