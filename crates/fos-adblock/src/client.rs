//! HTTP client for filter-list downloads
//!
//! Uses hyper with tokio for async HTTP/1.1.
//! Features:
//! - Automatic HTTPS with rustls (memory-safe TLS, webpki roots)
//! - Redirect following with a hop limit
//! - Connect and request timeouts
//! - Response size cap
//!
//! The updater only depends on the [`ListFetcher`] trait, so tests and hosts
//! can plug in their own transport.

use async_trait::async_trait;
use http_body_util::{BodyExt, Empty, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{ACCEPT, CONTENT_TYPE, HOST, HeaderMap, LOCATION, USER_AGENT};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};
use url::{Position, Url};

/// Download errors
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Request timeout")]
    Timeout,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Body read error: {0}")]
    Body(String),

    #[error("Too many redirects from {0}")]
    TooManyRedirects(String),
}

/// Source of filter-list bodies
#[async_trait]
pub trait ListFetcher: Send + Sync {
    /// Download a list body as text
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Timeout for one request/response exchange
    pub timeout: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// User-Agent string
    pub user_agent: String,
    /// Maximum response body size
    pub max_body_size: usize,
    /// Redirect hops before giving up
    pub max_redirects: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: "fOS-WB/0.1 (filter list updater)".to_string(),
            max_body_size: 32 * 1024 * 1024, // 32 MB
            max_redirects: 5,
        }
    }
}

/// HTTP response
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Time to first byte of the last hop
    pub ttfb: Duration,
    /// Total time including redirects
    pub total_time: Duration,
    /// Final URL (after redirects)
    pub final_url: String,
}

impl Response {
    /// Check if response was successful (2xx)
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Body as text, invalid UTF-8 replaced
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Get Content-Type header
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE)?.to_str().ok()
    }
}

/// Client statistics
#[derive(Debug, Default)]
pub struct ClientStats {
    pub requests_made: AtomicU64,
    pub requests_failed: AtomicU64,
    pub bytes_downloaded: AtomicU64,
}

/// Minimal HTTP/1.1 client
pub struct HttpClient {
    config: HttpClientConfig,
    tls: TlsConnector,
    stats: ClientStats,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(config: HttpClientConfig) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        info!(
            "HTTP client initialized (timeout: {:?}, max redirects: {})",
            config.timeout, config.max_redirects
        );

        Self {
            config,
            tls: TlsConnector::from(Arc::new(tls_config)),
            stats: ClientStats::default(),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(HttpClientConfig::default())
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    /// GET a URL, following redirects. Non-2xx final responses are errors.
    pub async fn get(&self, url: &str) -> Result<Response, FetchError> {
        let start = Instant::now();
        self.stats.requests_made.fetch_add(1, Ordering::Relaxed);

        let result = self.follow(url, start).await;
        if result.is_err() {
            self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn follow(&self, url: &str, start: Instant) -> Result<Response, FetchError> {
        let mut current =
            Url::parse(url).map_err(|e| FetchError::InvalidUrl(format!("{}: {}", url, e)))?;

        for _ in 0..=self.config.max_redirects {
            let response = tokio::time::timeout(self.config.timeout, self.send(&current))
                .await
                .map_err(|_| FetchError::Timeout)??;

            if response.status.is_redirection() {
                if let Some(location) = response.headers.get(LOCATION).and_then(|v| v.to_str().ok()) {
                    let next = current
                        .join(location)
                        .map_err(|e| FetchError::InvalidUrl(format!("{}: {}", location, e)))?;
                    debug!("Redirect {} -> {}", current, next);
                    current = next;
                    continue;
                }
            }

            if !response.is_success() {
                return Err(FetchError::Status {
                    status: response.status.as_u16(),
                    url: current.to_string(),
                });
            }

            return Ok(Response {
                total_time: start.elapsed(),
                final_url: current.to_string(),
                ..response
            });
        }

        Err(FetchError::TooManyRedirects(url.to_string()))
    }

    /// One request/response exchange on a fresh connection
    async fn send(&self, url: &Url) -> Result<Response, FetchError> {
        let is_https = match url.scheme() {
            "https" => true,
            "http" => false,
            other => return Err(FetchError::InvalidUrl(format!("unsupported scheme '{}'", other))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| FetchError::InvalidUrl("No host in URL".to_string()))?;
        let connect_host = host.trim_start_matches('[').trim_end_matches(']');
        let port = url.port_or_known_default().unwrap_or(if is_https { 443 } else { 80 });
        let host_header = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let request = Request::builder()
            .method(Method::GET)
            .uri(&url[Position::BeforePath..])
            .header(HOST, host_header)
            .header(USER_AGENT, &self.config.user_agent)
            .header(ACCEPT, "text/plain, */*")
            .body(Empty::<Bytes>::new())
            .map_err(|e| FetchError::Http(e.to_string()))?;

        let ttfb_start = Instant::now();
        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((connect_host, port)),
        )
        .await
        .map_err(|_| FetchError::Timeout)?
        .map_err(|e| FetchError::Connection(e.to_string()))?;

        let response = if is_https {
            let server_name = rustls::pki_types::ServerName::try_from(connect_host.to_string())
                .map_err(|_| FetchError::Tls("Invalid server name".to_string()))?;
            let tls_stream = self
                .tls
                .connect(server_name, stream)
                .await
                .map_err(|e| FetchError::Tls(e.to_string()))?;
            exchange(tls_stream, request).await?
        } else {
            exchange(stream, request).await?
        };
        let ttfb = ttfb_start.elapsed();

        let status = response.status();
        let headers = response.headers().clone();
        let body = Limited::new(response.into_body(), self.config.max_body_size)
            .collect()
            .await
            .map_err(|e| FetchError::Body(e.to_string()))?
            .to_bytes();

        self.stats
            .bytes_downloaded
            .fetch_add(body.len() as u64, Ordering::Relaxed);

        debug!(
            "HTTP GET {} -> {} ({} bytes, {:?} TTFB)",
            url, status, body.len(), ttfb
        );

        Ok(Response {
            status,
            headers,
            body,
            ttfb,
            total_time: ttfb,
            final_url: url.to_string(),
        })
    }

    /// Get client statistics: (requests, failures, bytes downloaded)
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.requests_made.load(Ordering::Relaxed),
            self.stats.requests_failed.load(Ordering::Relaxed),
            self.stats.bytes_downloaded.load(Ordering::Relaxed),
        )
    }
}

/// HTTP/1.1 handshake and single request over any stream
async fn exchange<S>(
    stream: S,
    request: Request<Empty<Bytes>>,
) -> Result<hyper::Response<Incoming>, FetchError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| FetchError::Http(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Connection closed: {}", e);
        }
    });

    sender
        .send_request(request)
        .await
        .map_err(|e| FetchError::Http(e.to_string()))
}

#[async_trait]
impl ListFetcher for HttpClient {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let response = self.get(url).await?;
        debug!(
            "Fetched {} in {:?} ({:?} TTFB, content type {})",
            response.final_url,
            response.total_time,
            response.ttfb,
            response.content_type().unwrap_or("unknown")
        );
        Ok(response.text())
    }
}
