//! Resilient HTTP fetch layer.
//!
//! Every request follows 301/302 redirects through a bounded loop, every
//! response body is read under an inactivity timer that resets on each
//! chunk, and `fetch`-style calls retry the whole request with exponential
//! backoff. Redirects are followed manually so the hop bound and the
//! relative-`Location` resolution stay under our control.

pub mod content_server;
pub mod propagation;

use crate::error::{Result, SyncError};
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, LOCATION};
use reqwest::redirect::Policy;
use reqwest::{Body, Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::{sleep, timeout};
use tokio_util::io::ReaderStream;
use tracing::{debug, trace};

use crate::cli::{
    DEFAULT_BACKOFF_FACTOR, DEFAULT_FETCH_RETRIES, DEFAULT_INACTIVITY_TIMEOUT_MS,
    DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_MAX_BACKOFF_MS, DEFAULT_MAX_REDIRECTS,
};

/// Fetch layer configuration.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
    /// Longest gap between body chunks before the response is abandoned.
    pub inactivity_timeout: Duration,
    pub max_redirects: usize,
    pub connect_timeout: Duration,
    /// Upper bound on waiting for response headers.
    pub response_timeout: Duration,
    /// Peers serve self-signed certificates.
    pub accept_invalid_certs: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_FETCH_RETRIES,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            inactivity_timeout: Duration::from_millis(DEFAULT_INACTIVITY_TIMEOUT_MS),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(30),
            accept_invalid_certs: true,
        }
    }
}

impl FetchConfig {
    /// Delay before retry number `attempt` (0-based), capped at `max_backoff`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial_backoff.as_secs_f64()
            * self.backoff_factor.powi(attempt.min(64) as i32);
        Duration::from_secs_f64(scaled.min(self.max_backoff.as_secs_f64()))
    }
}

/// Result of a HEAD probe. Non-2xx/3xx statuses are reported, not raised.
#[derive(Debug, Clone, Default)]
pub struct HeadResponse {
    pub success: bool,
    pub status: u16,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
}

impl HeadResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// True when the header is present with the literal value `"true"`.
    pub fn flag(&self, name: &str) -> bool {
        self.header(name) == Some("true")
    }
}

/// Request body. File payloads are streamed from disk, reopened on every
/// redirect hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Bytes(Bytes),
    File(PathBuf),
}

impl Payload {
    async fn attach(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        match self {
            Payload::Bytes(bytes) => Ok(request.body(bytes.clone())),
            Payload::File(path) => {
                let file = tokio::fs::File::open(path).await?;
                let len = file.metadata().await?.len();
                Ok(request
                    .header(CONTENT_LENGTH, len)
                    .body(Body::wrap_stream(ReaderStream::new(file))))
            }
        }
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<PathBuf> for Payload {
    fn from(path: PathBuf) -> Self {
        Payload::File(path)
    }
}

#[derive(Debug, Clone)]
pub struct ResilientFetcher {
    client: Client,
    config: FetchConfig,
}

impl ResilientFetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .redirect(Policy::none())
            .connect_timeout(config.connect_timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .no_proxy()
            .build()
            .map_err(|err| SyncError::network("client", err))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// GET `url` and return the full body.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.retrying(url, || self.fetch_once(url)).await
    }

    /// GET `url` and decode the body as JSON.
    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let body = self.fetch(url).await?;
        serde_json::from_slice(&body).map_err(|err| SyncError::parse(url, err))
    }

    /// GET `url` streaming into `dest`. The body lands in a sibling partial
    /// file that is renamed over `dest` only after the stream completes.
    pub async fn fetch_to_file(&self, url: &str, dest: &Path) -> Result<u64> {
        self.retrying(url, || self.fetch_to_file_once(url, dest)).await
    }

    /// HEAD `url`, following redirects but never retrying.
    pub async fn head(&self, url: &str) -> Result<HeadResponse> {
        let response = self.send(Method::HEAD, url, None).await?;
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect();
        Ok(HeadResponse {
            success: status.is_success() || status.is_redirection(),
            status: status.as_u16(),
            headers,
        })
    }

    /// POST with an optional body; no retries. Returns the response body.
    pub async fn post(&self, url: &str, body: Option<Bytes>) -> Result<Vec<u8>> {
        let body = body.map(Payload::Bytes);
        self.send_expect_success(Method::POST, url, body.as_ref()).await
    }

    /// PUT `body` to `url`; no retries.
    pub async fn put(&self, url: &str, body: Payload) -> Result<()> {
        self.send_expect_success(Method::PUT, url, Some(&body))
            .await
            .map(|_| ())
    }

    async fn retrying<T, F, Fut>(&self, url: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.backoff_delay(attempt);
                    debug!(
                        url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "fetch failed; retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<u8>> {
        let mut response = self.send_checked(Method::GET, url, None).await?;
        let mut body = Vec::new();
        while let Some(chunk) = self.next_chunk(&mut response, url).await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    async fn fetch_to_file_once(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut response = self.send_checked(Method::GET, url, None).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(dest);
        let written = match self.stream_into(&mut response, url, &partial).await {
            Ok(written) => written,
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(err);
            }
        };
        tokio::fs::rename(&partial, dest).await?;
        trace!(url, dest = %dest.display(), bytes = written, "download complete");
        Ok(written)
    }

    async fn stream_into(&self, response: &mut Response, url: &str, path: &Path) -> Result<u64> {
        let mut file = tokio::fs::File::create(path).await?;
        let mut written = 0u64;
        while let Some(chunk) = self.next_chunk(response, url).await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    /// Next body chunk, failing if none arrives within the inactivity window.
    /// On timeout the caller drops the response, which closes the connection.
    async fn next_chunk(&self, response: &mut Response, url: &str) -> Result<Option<Bytes>> {
        match timeout(self.config.inactivity_timeout, response.chunk()).await {
            Ok(Ok(chunk)) => Ok(chunk),
            Ok(Err(err)) => Err(SyncError::network(url, err)),
            Err(_) => Err(SyncError::timeout(
                format!("body of {url}"),
                self.config.inactivity_timeout,
            )),
        }
    }

    async fn send_expect_success(
        &self,
        method: Method,
        url: &str,
        body: Option<&Payload>,
    ) -> Result<Vec<u8>> {
        let mut response = self.send_checked(method, url, body).await?;
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk(&mut response, url).await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    async fn send_checked(
        &self,
        method: Method,
        url: &str,
        body: Option<&Payload>,
    ) -> Result<Response> {
        let response = self.send(method, url, body).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::status(response.url().as_str(), status.as_u16()));
        }
        Ok(response)
    }

    /// Issue a request, following at most `max_redirects` 301/302 hops.
    async fn send(&self, method: Method, url: &str, body: Option<&Payload>) -> Result<Response> {
        let mut current =
            Url::parse(url).map_err(|err| SyncError::parse(format!("url {url}"), err))?;
        let mut remaining = self.config.max_redirects;
        loop {
            let mut request = self.client.request(method.clone(), current.clone());
            if let Some(payload) = body {
                request = payload.attach(request).await?;
            }
            let response = match timeout(self.config.response_timeout, request.send()).await {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => return Err(SyncError::network(current.as_str(), err)),
                Err(_) => {
                    return Err(SyncError::timeout(
                        format!("{method} {current}"),
                        self.config.response_timeout,
                    ))
                }
            };

            let Some(target) = redirect_target(&current, &response)? else {
                return Ok(response);
            };
            if remaining == 0 {
                return Err(SyncError::RedirectLimitExceeded {
                    url: url.to_string(),
                    limit: self.config.max_redirects,
                });
            }
            remaining -= 1;
            trace!(from = %current, to = %target, remaining, "following redirect");
            current = target;
        }
    }
}

/// Resolved `Location` of a 301/302 response, relative to the request URL.
fn redirect_target(current: &Url, response: &Response) -> Result<Option<Url>> {
    let status = response.status();
    if status != StatusCode::MOVED_PERMANENTLY && status != StatusCode::FOUND {
        return Ok(None);
    }
    let Some(location) = response.headers().get(LOCATION) else {
        return Ok(None);
    };
    let location = location
        .to_str()
        .map_err(|err| SyncError::parse("redirect location", err))?;
    current
        .join(location)
        .map(Some)
        .map_err(|err| SyncError::parse(format!("redirect location {location}"), err))
}

/// Maps a peer address to the base URLs of its servers.
pub trait PeerEndpoints: Send + Sync {
    fn content_url(&self, ip: IpAddr) -> String;
    fn propagation_url(&self, ip: IpAddr) -> String;
}

/// `https://{ip}:{port}` for both servers.
#[derive(Debug, Clone, Copy)]
pub struct HttpsEndpoints {
    pub content_port: u16,
    pub propagation_port: u16,
}

impl PeerEndpoints for HttpsEndpoints {
    fn content_url(&self, ip: IpAddr) -> String {
        https_base_url(ip, self.content_port)
    }

    fn propagation_url(&self, ip: IpAddr) -> String {
        https_base_url(ip, self.propagation_port)
    }
}

pub fn https_base_url(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("https://{v4}:{port}"),
        IpAddr::V6(v6) => format!("https://[{v6}]:{port}"),
    }
}

/// Sibling path a download streams into before it is renamed over `dest`.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}
