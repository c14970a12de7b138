//! Outbound HTTP GET with SSRF protection
//!
//! - HTTP/HTTPS only
//! - The target host is checked before the request is sent
//! - The client's DNS resolver re-runs the check on the exact addresses
//!   about to be dialed, so a rebinding answer between check and connect
//!   is caught
//! - Redirects are followed by hand, at most [`MAX_REDIRECTS`] hops, each
//!   target validated like the initial URL
//! - The body is truncated at [`MAX_BODY_BYTES`]

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::{header, redirect, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::ssrf::{SafetyChecker, SafetyError};

/// Maximum redirect hops followed per fetch
pub const MAX_REDIRECTS: usize = 5;

/// Maximum body bytes captured (128 KiB)
pub const MAX_BODY_BYTES: usize = 128 * 1024;

/// Overall deadline for one fetch, redirects included
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for connecting, TLS handshake included
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("bad url: {0}")]
    BadUrl(String),

    #[error("host not allowed: {0}")]
    ForbiddenHost(#[from] SafetyError),

    #[error("redirect target not allowed: {0}")]
    ForbiddenRedirect(String),

    #[error("too many redirects (max {0})")]
    TooManyRedirects(usize),

    #[error("upstream timed out after {0:?}")]
    UpstreamTimeout(Duration),

    #[error("upstream error: {0}")]
    Upstream(String),
}

/// What `GET /proxy` returns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResult {
    /// Upstream HTTP status, passed through as-is
    pub status: u16,
    /// Bytes actually captured
    pub size: usize,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub max_body_bytes: usize,
    pub max_redirects: usize,
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: MAX_BODY_BYTES,
            max_redirects: MAX_REDIRECTS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// DNS resolver handed to reqwest. Only addresses that pass the safety
/// check are returned, so the connector can never dial a blocked one.
struct GuardedResolver {
    checker: Arc<SafetyChecker>,
}

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let checker = self.checker.clone();
        Box::pin(async move {
            let ips = checker.check_host(name.as_str()).await?;
            tracing::debug!(host = name.as_str(), ?ips, "Connect-time host check passed");
            // Port 0 is replaced by the URL's port when dialing
            let addrs: Addrs = Box::new(ips.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok::<_, Box<dyn StdError + Send + Sync>>(addrs)
        })
    }
}

pub struct Fetcher {
    client: reqwest::Client,
    checker: Arc<SafetyChecker>,
    config: FetchConfig,
}

impl Fetcher {
    pub fn new(checker: Arc<SafetyChecker>, config: FetchConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .dns_resolver(Arc::new(GuardedResolver {
                checker: checker.clone(),
            }))
            // A proxy from the environment would be dialed instead of the
            // checked address
            .no_proxy()
            .connect_timeout(config.handshake_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| FetchError::Upstream(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            checker,
            config,
        })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// GET `raw_url` and capture at most `max_body_bytes` of the body.
    ///
    /// Non-2xx statuses are returned, not raised. Dropping the returned
    /// future cancels the request.
    pub async fn fetch(&self, raw_url: &str) -> Result<FetchResult, FetchError> {
        let deadline = self.config.request_timeout;
        match tokio::time::timeout(deadline, self.fetch_following_redirects(raw_url)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::UpstreamTimeout(deadline)),
        }
    }

    async fn fetch_following_redirects(&self, raw_url: &str) -> Result<FetchResult, FetchError> {
        let mut url = parse_target(raw_url)?;
        let mut hops = 0;

        loop {
            let host = target_host(&url)?;
            self.checker.check_host(&host).await?;

            let response = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| self.classify(e))?;

            let status = response.status();
            let location = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            match location {
                Some(location) if is_followed_redirect(status) => {
                    if hops >= self.config.max_redirects {
                        return Err(FetchError::TooManyRedirects(self.config.max_redirects));
                    }
                    hops += 1;

                    let next = url
                        .join(&location)
                        .map_err(|_| FetchError::ForbiddenRedirect(location.clone()))?;
                    if !matches!(next.scheme(), "http" | "https") {
                        return Err(FetchError::ForbiddenRedirect(location));
                    }
                    tracing::debug!(from = %url, to = %next, hop = hops, "Following redirect");
                    url = next;
                }
                _ => return self.read_capped(response).await,
            }
        }
    }

    async fn read_capped(&self, mut response: reqwest::Response) -> Result<FetchResult, FetchError> {
        let status = response.status().as_u16();
        let max = self.config.max_body_bytes;
        let mut body = Vec::new();

        while body.len() < max {
            match response.chunk().await.map_err(|e| self.classify(e))? {
                Some(chunk) => {
                    let take = chunk.len().min(max - body.len());
                    body.extend_from_slice(&chunk[..take]);
                }
                None => break,
            }
        }

        Ok(FetchResult {
            status,
            size: body.len(),
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if let Some(blocked) = find_safety_error(&err) {
            return FetchError::ForbiddenHost(blocked);
        }
        if err.is_timeout() {
            return FetchError::UpstreamTimeout(self.config.request_timeout);
        }
        FetchError::Upstream(err.to_string())
    }
}

/// Parse a caller-supplied URL, requiring http(s) and a host
pub fn parse_target(raw: &str) -> Result<Url, FetchError> {
    let url = Url::parse(raw).map_err(|e| FetchError::BadUrl(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(FetchError::BadUrl(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }
    target_host(&url)?;
    Ok(url)
}

fn target_host(url: &Url) -> Result<String, FetchError> {
    url.host_str()
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .ok_or_else(|| FetchError::BadUrl("URL has no host".to_string()))
}

fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Dig the resolver's rejection out of reqwest's error chain
fn find_safety_error(err: &reqwest::Error) -> Option<SafetyError> {
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(e) = source {
        if let Some(safety) = e.downcast_ref::<SafetyError>() {
            return Some(safety.clone());
        }
        source = e.source();
    }
    None
}
