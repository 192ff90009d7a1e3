//! Upgrade handshake
//!
//! Parses the HTTP request head of a connection that looked HTTP-shaped,
//! derives the `Sec-WebSocket-Accept` token and builds the fixed responses.

use base64::{engine::general_purpose::STANDARD, Engine};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::HandshakeError;

/// GUID appended to the client key before hashing (RFC 6455)
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the request line plus headers
pub const MAX_HEAD_LEN: usize = 8 * 1024;

/// Derive the accept token for a client-supplied key
///
/// base64(SHA-1(key ++ GUID))
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Parsed request line and headers
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Request path without the query string
    pub fn route(&self) -> &str {
        self.path.split('?').next().unwrap_or("")
    }

    /// Validate the upgrade headers and return the client key
    pub fn upgrade_key(&self) -> Result<&str, HandshakeError> {
        if self.method != "GET" {
            return Err(HandshakeError::MethodNotAllowed(self.method.clone()));
        }
        let upgrade = self
            .header("Upgrade")
            .ok_or(HandshakeError::MissingHeader("Upgrade"))?;
        if !has_token(upgrade, "websocket") {
            return Err(HandshakeError::MissingHeader("Upgrade"));
        }
        let connection = self
            .header("Connection")
            .ok_or(HandshakeError::MissingHeader("Connection"))?;
        if !has_token(connection, "upgrade") {
            return Err(HandshakeError::MissingHeader("Connection"));
        }
        match self.header("Sec-WebSocket-Key").map(str::trim) {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err(HandshakeError::MissingHeader("Sec-WebSocket-Key")),
        }
    }
}

fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// Read a request head up to and including the blank line
///
/// Bytes after the blank line stay in `reader`. The request line is
/// checked as soon as it arrives, and no read goes past `MAX_HEAD_LEN`.
pub async fn read_request_head<R>(reader: &mut R) -> Result<RequestHead, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut total = 0usize;
    let mut request: Option<(String, String)> = None;
    let mut headers = Vec::new();
    let mut raw = Vec::new();

    loop {
        raw.clear();
        let budget = (MAX_HEAD_LEN - total + 1) as u64;
        let n = (&mut *reader).take(budget).read_until(b'\n', &mut raw).await?;
        total += n;
        if total > MAX_HEAD_LEN {
            return Err(HandshakeError::HeadTooLarge);
        }
        if !raw.ends_with(b"\n") {
            return Err(HandshakeError::Malformed("connection closed mid-request"));
        }

        let line = String::from_utf8_lossy(&raw);
        let line = line.trim_end_matches(['\r', '\n']);
        if request.is_none() {
            request = Some(parse_request_line(line)?);
        } else if line.is_empty() {
            break;
        } else {
            let (k, v) = line
                .split_once(':')
                .ok_or(HandshakeError::Malformed("bad header line"))?;
            headers.push((k.trim().to_string(), v.trim().to_string()));
        }
    }

    let (method, path) = request.ok_or(HandshakeError::Malformed("empty request"))?;
    Ok(RequestHead {
        method,
        path,
        headers,
    })
}

/// Split `METHOD /path HTTP/x.y` into method and path
fn parse_request_line(line: &str) -> Result<(String, String), HandshakeError> {
    if line.is_empty() {
        return Err(HandshakeError::Malformed("empty request"));
    }
    let mut parts = line.split_whitespace();
    let (method, path, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(p), Some(v)) if parts.next().is_none() => (m, p, v),
        _ => return Err(HandshakeError::Malformed("bad request line")),
    };
    if !version.starts_with("HTTP/") || !path.starts_with('/') {
        return Err(HandshakeError::Malformed("bad request line"));
    }
    Ok((method.to_string(), path.to_string()))
}

/// `101 Switching Protocols` carrying the accept token
pub fn switching_protocols(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    )
}

/// Rejection response for a failed handshake
pub fn rejection(err: &HandshakeError) -> String {
    plain_response(err.status(), "text/plain; charset=utf-8", &format!("{err}\n"))
}

/// Complete response with a body, closing the connection afterwards
pub fn plain_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    )
}
