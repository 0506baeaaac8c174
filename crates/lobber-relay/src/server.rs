//! Public-facing relay server
//!
//! A raw TCP accept loop that speaks HTTP/1.1 just long enough to route each
//! connection: `/health` and the `/_lobber/connect` handshake are handled
//! here, everything else is proxied through the tunnel session registered
//! for the request's hostname. The handshake keeps the socket (the relay
//! owns the listener, so no hijack escape-hatch is needed) and hands it to a
//! new `TunnelSession`.

use crate::config::RelayConfig;
use crate::registry::TunnelRegistry;
use crate::session::{DispatchError, SessionState, TunnelSession};
use bytes::BytesMut;
use lobber_auth::TokenValidator;
use lobber_proto::{Headers, Request, Response};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};
use uuid::Uuid;

/// Handshake endpoint path.
pub const CONNECT_PATH: &str = "/_lobber/connect";

/// Maximum number of headers to parse.
const MAX_HEADERS: usize = 100;

/// Maximum size of a request head (request line + headers).
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Maximum public request body buffered into a Request frame. Leaves room
/// for base64 expansion inside the frame size limit.
const MAX_REQUEST_BODY: usize = 10 * 1024 * 1024;

/// Relay server errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("request head too large")]
    HeadTooLarge,
}

/// The public relay: accepts tunnel handshakes and proxies inbound HTTP
/// requests to the matching session.
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<TunnelRegistry>,
    validator: Option<Arc<dyn TokenValidator>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            registry: Arc::new(TunnelRegistry::new()),
            validator: None,
        }
    }

    /// Install a token validator. Without one the relay runs in development
    /// mode: any non-empty bearer token is accepted as user `anonymous`.
    pub fn with_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn registry(&self) -> Arc<TunnelRegistry> {
        self.registry.clone()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Bind the public listener.
    pub async fn bind(address: &str) -> Result<TcpListener, RelayError> {
        TcpListener::bind(address)
            .await
            .map_err(|e| RelayError::Bind {
                address: address.to_string(),
                reason: e.to_string(),
            })
    }

    /// Accept public connections forever.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<(), RelayError> {
        info!(addr = %listener.local_addr()?, "relay listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer).await {
                    debug!(%peer, "connection error: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), RelayError> {
        let mut buf = BytesMut::with_capacity(4096);
        let head = match read_head(&mut stream, &mut buf).await {
            Ok(head) => head,
            Err(RelayError::HeadTooLarge) => {
                return respond_text(&mut stream, 431, "request header fields too large").await;
            }
            Err(RelayError::BadRequest(reason)) => {
                debug!(%peer, "rejecting malformed request: {reason}");
                return respond_text(&mut stream, 400, "bad request").await;
            }
            Err(e) => return Err(e),
        };
        // Bytes read past the head belong to the body (or, after a
        // handshake, to the tunnel's frame stream).
        let leftover = buf.split_off(head.header_len);

        if head.path == "/health" {
            let body = serde_json::json!({"status": "ok"}).to_string();
            return respond_json(&mut stream, 200, &body).await;
        }

        if head.path == CONNECT_PATH {
            if head.method != "POST" {
                return respond_text(&mut stream, 405, "method not allowed").await;
            }
            return self.handle_connect(stream, head, leftover).await;
        }

        self.handle_proxy(&mut stream, head, leftover).await
    }

    /// Tunnel handshake: authenticate, take over the socket, emit the 200
    /// preamble and hand the byte stream to a new session. Failures after the
    /// preamble can only close the connection.
    async fn handle_connect(
        &self,
        mut stream: TcpStream,
        head: ParsedHead,
        leftover: BytesMut,
    ) -> Result<(), RelayError> {
        let domain = match head.header("x-lobber-domain") {
            Some(domain) if !domain.is_empty() => domain.to_string(),
            _ => {
                return respond_text(&mut stream, 400, "missing X-Lobber-Domain header").await;
            }
        };

        let token = match head
            .header("authorization")
            .and_then(|auth| auth.strip_prefix("Bearer "))
        {
            Some(token) if !token.is_empty() => token.to_string(),
            _ => {
                return respond_text(&mut stream, 401, "missing or invalid Authorization header")
                    .await;
            }
        };

        let user_id = match &self.validator {
            Some(validator) => match validator.validate(&token).await {
                Ok(user_id) => user_id,
                Err(e) => {
                    debug!(%domain, "rejected tunnel handshake: {e}");
                    return respond_text(&mut stream, 401, "invalid token").await;
                }
            },
            None => "anonymous".to_string(),
        };

        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\n\r\n")
            .await?;
        stream.flush().await?;

        let (read_half, write_half) = stream.into_split();
        // Frame bytes the head parser over-read belong to the tunnel stream.
        let reader = Cursor::new(leftover.freeze()).chain(read_half);

        let registry = self.registry.clone();
        let session = TunnelSession::new(
            domain.clone(),
            user_id.clone(),
            &self.config,
            Some(Box::new(move |session: &TunnelSession| {
                registry.unregister_session(session);
            })),
        );
        // Register before the I/O tasks exist: requests can start queueing
        // and the session cannot close itself while still unreachable.
        self.registry.register(session.clone());
        session.start(reader, write_half);

        info!(%domain, %user_id, "tunnel connected");
        Ok(())
    }

    /// Proxy one public request through the session registered for its host.
    async fn handle_proxy(
        &self,
        stream: &mut TcpStream,
        head: ParsedHead,
        leftover: BytesMut,
    ) -> Result<(), RelayError> {
        let host = strip_port(head.header("host").unwrap_or_default()).to_string();

        let Some(session) = self.registry.lookup(&host) else {
            if is_primary_host(&host, self.config.base_domain.as_deref()) {
                // The static site collaborator would serve this host.
                return respond_text(stream, 404, "not found").await;
            }
            return respond_text(stream, 502, "tunnel not found").await;
        };

        if session.state() == SessionState::Closed {
            return respond_text(stream, 502, "tunnel closed").await;
        }

        if head
            .header("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
        {
            return respond_text(stream, 411, "length required").await;
        }
        if head.content_length > MAX_REQUEST_BODY {
            return respond_text(stream, 413, "request body too large").await;
        }
        let body = read_body(stream, leftover, head.content_length).await?;

        let id = head
            .header("x-request-id")
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut headers = Headers::new();
        for (name, value) in &head.headers {
            headers
                .entry(name.clone())
                .or_default()
                .push(value.clone());
        }

        let request = Request {
            id,
            method: head.method.clone(),
            path: head.path.clone(),
            headers,
            body,
        };
        debug!(%host, method = %request.method, path = %request.path, id = %request.id, "proxying request");

        match session.dispatch(request).await {
            Ok(response) => write_tunnel_response(stream, &response).await,
            Err(DispatchError::Overloaded) => {
                respond_text_with_headers(
                    stream,
                    503,
                    "tunnel not ready, queue full",
                    &[("Retry-After", "1")],
                )
                .await
            }
            Err(DispatchError::Closed) => respond_text(stream, 502, "tunnel closed").await,
            Err(DispatchError::ResponseTimeout) => {
                respond_text(stream, 504, "tunnel response timeout").await
            }
        }
    }
}

/// One parsed HTTP/1.1 request head.
struct ParsedHead {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    header_len: usize,
    content_length: usize,
}

impl ParsedHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Read from the stream until a complete request head is buffered. `buf`
/// retains everything read, including bytes past the head.
async fn read_head(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<ParsedHead, RelayError> {
    loop {
        if let Some(head) = parse_head(buf)? {
            return Ok(head);
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(RelayError::HeadTooLarge);
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(RelayError::BadRequest(
                "connection closed before request head".to_string(),
            ));
        }
    }
}

fn parse_head(buffer: &[u8]) -> Result<Option<ParsedHead>, RelayError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buffer) {
        Ok(httparse::Status::Complete(header_len)) => {
            let method = req.method.unwrap_or("").to_string();
            let path = req.path.unwrap_or("").to_string();

            let mut parsed_headers = Vec::new();
            let mut content_length = 0usize;
            for header in req.headers.iter() {
                let name = header.name.to_string();
                let value = String::from_utf8_lossy(header.value).to_string();
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
                parsed_headers.push((name, value));
            }

            Ok(Some(ParsedHead {
                method,
                path,
                headers: parsed_headers,
                header_len,
                content_length,
            }))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(RelayError::BadRequest(e.to_string())),
    }
}

/// Read the request body: `leftover` first, then the stream.
async fn read_body(
    stream: &mut TcpStream,
    mut leftover: BytesMut,
    content_length: usize,
) -> Result<Vec<u8>, RelayError> {
    if leftover.len() >= content_length {
        return Ok(leftover.split_to(content_length).to_vec());
    }

    let mut body = Vec::with_capacity(content_length);
    body.extend_from_slice(&leftover);
    while body.len() < content_length {
        let mut chunk = vec![0u8; (content_length - body.len()).min(64 * 1024)];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(RelayError::BadRequest(
                "connection closed mid-body".to_string(),
            ));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Ok(body)
}

/// Render a tunneled response back to the public caller. Multi-valued
/// headers are written once per value; framing headers are regenerated since
/// the relay buffers the whole body.
async fn write_tunnel_response(
    stream: &mut TcpStream,
    response: &Response,
) -> Result<(), RelayError> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        response.status_code,
        reason_phrase(response.status_code)
    );
    for (name, values) in &response.headers {
        if is_framing_header(name) {
            continue;
        }
        for value in values {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
    }
    head.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        response.body.len()
    ));

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&response.body).await?;
    stream.flush().await?;
    Ok(())
}

async fn respond_text(stream: &mut TcpStream, status: u16, body: &str) -> Result<(), RelayError> {
    respond_text_with_headers(stream, status, body, &[]).await
}

async fn respond_text_with_headers(
    stream: &mut TcpStream,
    status: u16,
    body: &str,
    extra_headers: &[(&str, &str)],
) -> Result<(), RelayError> {
    write_simple_response(stream, status, "text/plain; charset=utf-8", body, extra_headers).await
}

async fn respond_json(stream: &mut TcpStream, status: u16, body: &str) -> Result<(), RelayError> {
    write_simple_response(stream, status, "application/json", body, &[]).await
}

async fn write_simple_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &str,
    extra_headers: &[(&str, &str)],
) -> Result<(), RelayError> {
    let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status));
    head.push_str(&format!("Content-Type: {content_type}\r\n"));
    for (name, value) in extra_headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    ));

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

fn is_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("keep-alive")
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        411 => "Length Required",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// Strip the port suffix from a Host header value.
fn strip_port(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

/// The relay's own host: the configured base domain or a loopback variant.
fn is_primary_host(host: &str, base_domain: Option<&str>) -> bool {
    if let Some(base) = base_domain {
        let base = base.trim();
        if !base.is_empty() && host == base {
            return true;
        }
    }
    host.is_empty() || host == "localhost" || host.starts_with("127.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("localhost:80"), "localhost");
    }

    #[test]
    fn test_is_primary_host() {
        assert!(is_primary_host("lobber.dev", Some("lobber.dev")));
        assert!(!is_primary_host("tunnel.lobber.dev", Some("lobber.dev")));
        assert!(is_primary_host("localhost", None));
        assert!(is_primary_host("127.0.0.1", None));
        assert!(is_primary_host("", None));
        assert!(!is_primary_host("example.com", None));
        assert!(!is_primary_host("example.com", Some("")));
    }

    #[test]
    fn test_parse_head_complete() {
        let raw = b"POST /api?x=1 HTTP/1.1\r\nHost: a.example.com\r\nContent-Length: 4\r\nX-Multi: 1\r\nX-Multi: 2\r\n\r\nbody";
        let head = parse_head(raw).unwrap().unwrap();

        assert_eq!(head.method, "POST");
        assert_eq!(head.path, "/api?x=1");
        assert_eq!(head.content_length, 4);
        assert_eq!(head.header("host"), Some("a.example.com"));
        assert_eq!(head.header("HOST"), Some("a.example.com"));
        // header_len excludes the body bytes
        assert_eq!(&raw[head.header_len..], b"body");

        let multi: Vec<&str> = head
            .headers
            .iter()
            .filter(|(n, _)| n == "X-Multi")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(multi, vec!["1", "2"]);
    }

    #[test]
    fn test_parse_head_partial() {
        let raw = b"GET / HTTP/1.1\r\nHost: exam";
        assert!(parse_head(raw).unwrap().is_none());
    }

    #[test]
    fn test_parse_head_malformed() {
        let raw = b"completely wrong\x00\r\n\r\n";
        assert!(parse_head(raw).is_err());
    }

    #[test]
    fn test_framing_headers_filtered() {
        assert!(is_framing_header("Content-Length"));
        assert!(is_framing_header("connection"));
        assert!(is_framing_header("Transfer-Encoding"));
        assert!(!is_framing_header("Content-Type"));
        assert!(!is_framing_header("X-Request-ID"));
    }
}
