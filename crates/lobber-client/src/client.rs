//! Relay connection and request serving

use bytes::{Bytes, BytesMut};
use lobber_proto::{codec, FrameError, Headers, Request, Response};
use std::io::Cursor;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

const CONNECT_PATH: &str = "/_lobber/connect";

/// Timeout for each request against the local server.
const LOCAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunnel client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("handshake rejected: {status} {body}")]
    HandshakeRejected { status: u16, body: String },

    #[error("malformed handshake response: {0}")]
    MalformedHandshake(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid method {0:?} in tunneled request")]
    InvalidMethod(String),
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the local server requests are replayed against,
    /// e.g. `http://127.0.0.1:3000`.
    pub local_url: String,
    /// Relay address, `host:port`.
    pub relay_addr: String,
    /// Bearer token presented during the handshake.
    pub token: String,
    /// Hostname to register with the relay.
    pub domain: String,
}

/// An established tunnel connection, ready for `serve`.
pub struct TunnelConnection {
    stream: TcpStream,
    leftover: Bytes,
}

/// Tunnel client for one domain.
pub struct TunnelClient {
    config: ClientConfig,
    http: reqwest::Client,
    on_ready: Option<Box<dyn Fn() + Send + Sync>>,
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(LOCAL_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            config,
            http,
            on_ready: None,
        })
    }

    /// Install a hook invoked once the Ready frame has been sent.
    pub fn set_on_ready(&mut self, hook: impl Fn() + Send + Sync + 'static) {
        self.on_ready = Some(Box::new(hook));
    }

    /// Perform the handshake. On success the relay has registered the domain
    /// and requests may already be queueing for it.
    pub async fn connect(&self) -> Result<TunnelConnection, ClientError> {
        let mut stream = TcpStream::connect(&self.config.relay_addr).await?;
        debug!(relay = %self.config.relay_addr, domain = %self.config.domain, "connecting to relay");

        let handshake = format!(
            "POST {CONNECT_PATH} HTTP/1.1\r\n\
             Host: {}\r\n\
             Authorization: Bearer {}\r\n\
             X-Lobber-Domain: {}\r\n\
             Connection: Upgrade\r\n\
             \r\n",
            self.config.relay_addr, self.config.token, self.config.domain,
        );
        stream.write_all(handshake.as_bytes()).await?;
        stream.flush().await?;

        let mut buf = BytesMut::with_capacity(1024);
        let (status, header_len) = loop {
            if let Some(parsed) = parse_response_head(&buf)? {
                break parsed;
            }
            let n = stream.read_buf(&mut buf).await?;
            if n == 0 {
                return Err(ClientError::MalformedHandshake(
                    "connection closed during handshake".to_string(),
                ));
            }
        };
        // Anything past the response head already belongs to the frame stream.
        let leftover = buf.split_off(header_len).freeze();

        if status != 200 {
            let body = String::from_utf8_lossy(&leftover).trim().to_string();
            return Err(ClientError::HandshakeRejected { status, body });
        }

        Ok(TunnelConnection { stream, leftover })
    }

    /// Connect and serve tunneled requests until the connection dies.
    pub async fn run(&self) -> Result<(), ClientError> {
        let connection = self.connect().await?;
        self.serve(connection).await
    }

    /// Send the Ready frame, then loop: read a Request, replay it against
    /// the local server, answer with the matching Response. Every request
    /// frame gets exactly one response frame; local failures become a
    /// synthetic 502.
    pub async fn serve(&self, connection: TunnelConnection) -> Result<(), ClientError> {
        let TunnelConnection { stream, leftover } = connection;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(Cursor::new(leftover).chain(read_half));
        let mut writer = BufWriter::new(write_half);

        codec::write_ready(&mut writer).await?;
        if let Some(on_ready) = &self.on_ready {
            on_ready();
        }
        info!(domain = %self.config.domain, "tunnel ready, serving requests");

        loop {
            let request = codec::read_request(&mut reader).await?;
            debug!(
                id = %request.id,
                method = %request.method,
                path = %request.path,
                "handling tunneled request"
            );

            let response = match self.forward(&request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(id = %request.id, "local forward failed: {e}");
                    Response::synthetic(&request.id, 502, &format!("local forward error: {e}"))
                }
            };

            codec::write_response(&mut writer, &response).await?;
        }
    }

    /// Replay one tunneled request against the local server.
    async fn forward(&self, request: &Request) -> Result<Response, ClientError> {
        let url = build_local_url(&self.config.local_url, &request.path);
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ClientError::InvalidMethod(request.method.clone()))?;

        let mut builder = self.http.request(method, &url);
        for (name, values) in &request.headers {
            if is_hop_header(name) {
                continue;
            }
            for value in values {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }

        let local_response = builder.body(request.body.clone()).send().await?;

        let status_code = local_response.status().as_u16();
        let mut headers = Headers::new();
        for (name, value) in local_response.headers() {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).to_string());
        }
        let body = local_response.bytes().await?.to_vec();

        Ok(Response {
            id: request.id.clone(),
            status_code,
            headers,
            body,
        })
    }
}

fn parse_response_head(buffer: &[u8]) -> Result<Option<(u16, usize)>, ClientError> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(buffer) {
        Ok(httparse::Status::Complete(header_len)) => {
            let status = response.code.unwrap_or(0);
            Ok(Some((status, header_len)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(ClientError::MalformedHandshake(e.to_string())),
    }
}

fn build_local_url(local_url: &str, path: &str) -> String {
    format!("{}{}", local_url.trim_end_matches('/'), path)
}

/// Headers the local HTTP client regenerates itself.
fn is_hop_header(name: &str) -> bool {
    const HOP_HEADERS: &[&str] = &[
        "host",
        "content-length",
        "connection",
        "transfer-encoding",
        "keep-alive",
        "upgrade",
        "proxy-connection",
        "te",
        "trailer",
    ];
    HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
}
