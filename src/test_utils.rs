use crate::chain::{
    ChainPeer, ChainState, IntegrityVerifier, PeerConnector, PeerSampler, RootHistoryItem,
    StoreInfo, StoreSync,
};
use crate::error::{Result, SyncError};
use crate::http::{https_base_url, FetchConfig, PeerEndpoints};
use crate::peers::{ReachabilityProbe, Resolver};
use crate::storage::{data_file_relative_path, RootDescriptor};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub fn temp_dir(prefix: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time moves forward")
        .as_nanos();
    let suffix = COUNTER.fetch_add(1, Ordering::SeqCst);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "store-sync-{prefix}-test-{now}-{}-{suffix}",
        std::process::id()
    ));
    path
}

/// Fetch settings with millisecond backoff for tests.
pub fn fast_fetch_config() -> FetchConfig {
    FetchConfig {
        max_retries: 1,
        initial_backoff: Duration::from_millis(10),
        backoff_factor: 1.5,
        max_backoff: Duration::from_millis(50),
        inactivity_timeout: Duration::from_secs(1),
        max_redirects: 5,
        connect_timeout: Duration::from_secs(2),
        response_timeout: Duration::from_secs(5),
        accept_invalid_certs: true,
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

// ---------------------------------------------------------------------------
// Scripted HTTP server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    stall_after: Option<usize>,
}

impl MockResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
            stall_after: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Self::ok(Vec::new())
        }
    }

    pub fn redirect(status: u16, location: &str) -> Self {
        Self::status(status).with_header("location", location)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Send headers and the first `bytes` of the body, then go silent.
    pub fn stalling_after(mut self, bytes: usize) -> Self {
        self.stall_after = Some(bytes);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    /// Request target, including any query string.
    pub path: String,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct Route {
    responses: Vec<MockResponse>,
    served: usize,
}

impl Route {
    fn next(&mut self) -> Option<MockResponse> {
        let index = self.served.min(self.responses.len().checked_sub(1)?);
        self.served += 1;
        self.responses.get(index).cloned()
    }
}

#[derive(Default)]
struct ServerState {
    routes: HashMap<String, Route>,
    prefix_routes: Vec<(String, String, MockResponse)>,
    requests: Vec<RecordedRequest>,
    /// Paths of stalled responses whose client hung up.
    closed: Vec<String>,
}

impl ServerState {
    fn respond(&mut self, method: &str, path: &str) -> MockResponse {
        if let Some(response) = self
            .routes
            .get_mut(&route_key(method, path))
            .and_then(Route::next)
        {
            return response;
        }
        self.prefix_routes
            .iter()
            .filter(|(m, prefix, _)| m == method && path.starts_with(prefix.as_str()))
            .max_by_key(|(_, prefix, _)| prefix.len())
            .map(|(_, _, response)| response.clone())
            .unwrap_or_else(|| MockResponse::status(404))
    }
}

fn route_key(method: &str, path: &str) -> String {
    format!("{method} {path}")
}

/// Plain-HTTP server on loopback answering from scripted routes. Every
/// response closes its connection. Unknown routes get 404.
pub struct MockHttpServer {
    addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
    task: JoinHandle<()>,
}

impl MockHttpServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(Mutex::new(ServerState::default()));
        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = serve_connection(stream, state).await;
                });
            }
        });
        Self { addr, state, task }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Replace the route for `method path` with a single repeating response.
    pub fn route(&self, method: &str, path: &str, response: MockResponse) {
        self.route_sequence(method, path, vec![response]);
    }

    /// Serve `responses` in order; the last one repeats.
    pub fn route_sequence(&self, method: &str, path: &str, responses: Vec<MockResponse>) {
        self.state.lock().routes.insert(
            route_key(method, path),
            Route {
                responses,
                served: 0,
            },
        );
    }

    /// Answer any `method` request whose target starts with `prefix`.
    pub fn route_prefix(&self, method: &str, prefix: &str, response: MockResponse) {
        let mut state = self.state.lock();
        state
            .prefix_routes
            .retain(|(m, p, _)| !(m == method && p == prefix));
        state
            .prefix_routes
            .push((method.to_string(), prefix.to_string(), response));
    }

    pub fn request_count(&self, method: &str, path: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }

    /// Stalled responses on `path` abandoned by the client.
    pub fn closed_count(&self, path: &str) -> usize {
        self.state.lock().closed.iter().filter(|p| *p == path).count()
    }

    pub fn requests_with_prefix(&self, method: &str, prefix: &str) -> Vec<RecordedRequest> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.method == method && r.path.starts_with(prefix))
            .cloned()
            .collect()
    }
}

impl Drop for MockHttpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_connection(mut stream: TcpStream, state: Arc<Mutex<ServerState>>) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if read_more(&mut stream, &mut buf).await? == 0 {
            return Ok(());
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    let header = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value.as_str())
    };
    let chunked = header("transfer-encoding").is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
    let content_length = header("content-length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);

    buf.drain(..header_end + 4);
    let body = if chunked {
        read_chunked(&mut stream, buf).await?
    } else {
        while buf.len() < content_length {
            if read_more(&mut stream, &mut buf).await? == 0 {
                break;
            }
        }
        buf.truncate(content_length);
        buf
    };

    let response = {
        let mut state = state.lock();
        state.requests.push(RecordedRequest {
            method: method.clone(),
            path: path.clone(),
            body,
        });
        state.respond(&method, &path)
    };

    let mut out = format!(
        "HTTP/1.1 {} {}\r\ncontent-length: {}\r\nconnection: close\r\n",
        response.status,
        reason(response.status),
        response.body.len()
    );
    for (name, value) in &response.headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    stream.write_all(out.as_bytes()).await?;

    if method != "HEAD" {
        match response.stall_after {
            Some(sent) => {
                let sent = sent.min(response.body.len());
                stream.write_all(&response.body[..sent]).await?;
                stream.flush().await?;
                // Hold the body open until the client hangs up.
                if timeout(Duration::from_secs(60), wait_for_close(&mut stream))
                    .await
                    .is_ok()
                {
                    state.lock().closed.push(path);
                }
                return Ok(());
            }
            None => stream.write_all(&response.body).await?,
        }
    }
    stream.flush().await?;
    stream.shutdown().await
}

async fn read_more(stream: &mut TcpStream, buf: &mut Vec<u8>) -> std::io::Result<usize> {
    let mut chunk = [0u8; 4096];
    let n = stream.read(&mut chunk).await?;
    buf.extend_from_slice(&chunk[..n]);
    Ok(n)
}

/// Decode a chunked request body; `buf` holds bytes already read past the
/// headers.
async fn read_chunked(stream: &mut TcpStream, mut buf: Vec<u8>) -> std::io::Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let line_end = loop {
            if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
                break pos;
            }
            if read_more(stream, &mut buf).await? == 0 {
                return Ok(body);
            }
        };
        let size_line = String::from_utf8_lossy(&buf[..line_end]).to_string();
        let size_hex = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_hex, 16).unwrap_or(0);
        buf.drain(..line_end + 2);
        if size == 0 {
            return Ok(body);
        }
        while buf.len() < size + 2 {
            if read_more(stream, &mut buf).await? == 0 {
                return Ok(body);
            }
        }
        body.extend_from_slice(&buf[..size]);
        buf.drain(..size + 2);
    }
}

async fn wait_for_close(stream: &mut TcpStream) {
    let mut scratch = [0u8; 256];
    loop {
        match stream.read(&mut scratch).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        301 => "Moved Permanently",
        302 => "Found",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    }
}

// ---------------------------------------------------------------------------
// Chain collaborators
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockChainPeerInner {
    height: u64,
    header_hashes: Mutex<HashMap<u64, String>>,
    stall_header_hash: AtomicBool,
    stall_header_hash_once: AtomicBool,
    stall_sync_store: AtomicBool,
    fail_sync_store: AtomicBool,
    fail_transport: AtomicBool,
    sync_calls: AtomicUsize,
}

/// Scripted chain peer. Clones share state.
#[derive(Clone, Default)]
pub struct MockChainPeer {
    inner: Arc<MockChainPeerInner>,
}

impl MockChainPeer {
    pub fn at_height(height: u64) -> Self {
        Self {
            inner: Arc::new(MockChainPeerInner {
                height,
                ..MockChainPeerInner::default()
            }),
        }
    }

    pub fn with_header_hash(self, height: u64, hash: &str) -> Self {
        self.inner
            .header_hashes
            .lock()
            .insert(height, hash.to_string());
        self
    }

    pub fn stall_header_hash(&self) {
        self.inner.stall_header_hash.store(true, Ordering::SeqCst);
    }

    /// Only the next `header_hash` call stalls.
    pub fn stall_header_hash_once(&self) {
        self.inner.stall_header_hash_once.store(true, Ordering::SeqCst);
    }

    pub fn stall_sync_store(&self) {
        self.inner.stall_sync_store.store(true, Ordering::SeqCst);
    }

    pub fn fail_sync_store(&self) {
        self.inner.fail_sync_store.store(true, Ordering::SeqCst);
    }

    /// Every call except `peak_height` fails with a transport error.
    pub fn fail_transport(&self) {
        self.inner.fail_transport.store(true, Ordering::SeqCst);
    }

    pub fn sync_calls(&self) -> usize {
        self.inner.sync_calls.load(Ordering::SeqCst)
    }

    fn transport_check(&self) -> Result<()> {
        if self.inner.fail_transport.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("connection reset".into()));
        }
        Ok(())
    }

    fn hash_at(&self, height: u64) -> String {
        self.inner
            .header_hashes
            .lock()
            .get(&height)
            .cloned()
            .unwrap_or_else(|| format!("hash-{height}"))
    }
}

#[async_trait]
impl ChainPeer for MockChainPeer {
    async fn peak_height(&self) -> Result<u64> {
        Ok(self.inner.height)
    }

    async fn header_hash(&self, height: u64) -> Result<String> {
        if self.inner.stall_header_hash.load(Ordering::SeqCst)
            || self.inner.stall_header_hash_once.swap(false, Ordering::SeqCst)
        {
            std::future::pending::<()>().await;
        }
        self.transport_check()?;
        Ok(self.hash_at(height))
    }

    async fn is_coin_spent(&self, _coin_id: &str, _last_height: u64, _last_hash: &str) -> Result<bool> {
        self.transport_check()?;
        Ok(false)
    }

    async fn sync_store(
        &self,
        store: &StoreInfo,
        _last_height: Option<u64>,
        _last_hash: Option<&str>,
    ) -> Result<StoreSync> {
        self.inner.sync_calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.stall_sync_store.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.transport_check()?;
        if self.inner.fail_sync_store.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("sync_store refused".into()));
        }
        Ok(StoreSync {
            store: store.clone(),
            latest_height: self.inner.height,
            latest_hash: self.hash_at(self.inner.height),
        })
    }
}

#[derive(Default)]
pub struct MockConnector {
    peers: HashMap<SocketAddr, MockChainPeer>,
    refuse_after: HashMap<SocketAddr, usize>,
    connects: Mutex<HashMap<SocketAddr, usize>>,
}

impl MockConnector {
    pub fn with_peer(mut self, addr: SocketAddr, peer: MockChainPeer) -> Self {
        self.peers.insert(addr, peer);
        self
    }

    /// Refuse connections to `addr` once `limit` have succeeded.
    pub fn refuse_after(mut self, addr: SocketAddr, limit: usize) -> Self {
        self.refuse_after.insert(addr, limit);
        self
    }

    pub fn connects(&self, addr: SocketAddr) -> usize {
        self.connects.lock().get(&addr).copied().unwrap_or(0)
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(&self, addr: SocketAddr) -> Result<Arc<dyn ChainPeer>> {
        let attempt = {
            let mut connects = self.connects.lock();
            let count = connects.entry(addr).or_default();
            *count += 1;
            *count
        };
        let refused = self
            .refuse_after
            .get(&addr)
            .is_some_and(|limit| attempt > *limit);
        match self.peers.get(&addr) {
            Some(peer) if !refused => Ok(Arc::new(peer.clone())),
            _ => Err(SyncError::Transport(format!("connection refused by {addr}"))),
        }
    }
}

#[derive(Default)]
pub struct MockResolver {
    hosts: HashMap<String, Vec<SocketAddr>>,
    lookups: Mutex<HashMap<String, usize>>,
}

impl MockResolver {
    pub fn with_host(mut self, host: &str, addrs: Vec<SocketAddr>) -> Self {
        self.hosts.insert(host.to_string(), addrs);
        self
    }

    pub fn lookups(&self, host: &str) -> usize {
        self.lookups.lock().get(host).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Resolver for MockResolver {
    async fn resolve(&self, host: &str, _port: u16) -> Result<Vec<SocketAddr>> {
        *self.lookups.lock().entry(host.to_string()).or_default() += 1;
        self.hosts
            .get(host)
            .cloned()
            .ok_or_else(|| SyncError::network(host, "unknown host"))
    }
}

#[derive(Default)]
pub struct MockProbe {
    reachable: HashSet<SocketAddr>,
    probed: Mutex<Vec<SocketAddr>>,
}

impl MockProbe {
    pub fn reachable(addrs: &[SocketAddr]) -> Self {
        Self {
            reachable: addrs.iter().copied().collect(),
            probed: Mutex::new(Vec::new()),
        }
    }

    pub fn probed(&self) -> Vec<SocketAddr> {
        self.probed.lock().clone()
    }
}

#[async_trait]
impl ReachabilityProbe for MockProbe {
    async fn is_reachable(&self, addr: SocketAddr) -> bool {
        self.probed.lock().push(addr);
        self.reachable.contains(&addr)
    }
}

/// Returns configured peers minus the exclusion set, recording each call's
/// exclusions.
pub struct MockSampler {
    peers: Vec<IpAddr>,
    one_per_call: bool,
    calls: Mutex<Vec<HashSet<IpAddr>>>,
}

impl MockSampler {
    pub fn new(peers: Vec<IpAddr>) -> Self {
        Self {
            peers,
            one_per_call: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn one_per_call(mut self) -> Self {
        self.one_per_call = true;
        self
    }

    pub fn calls(&self) -> Vec<HashSet<IpAddr>> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl PeerSampler for MockSampler {
    async fn sample_peers(&self, count: usize, exclude: &HashSet<IpAddr>) -> Result<Vec<IpAddr>> {
        self.calls.lock().push(exclude.clone());
        let limit = if self.one_per_call { 1 } else { count };
        Ok(self
            .peers
            .iter()
            .filter(|ip| !exclude.contains(ip))
            .take(limit)
            .copied()
            .collect())
    }
}

#[derive(Default)]
pub struct MockChainState {
    histories: HashMap<String, Vec<RootHistoryItem>>,
}

impl MockChainState {
    pub fn with_history(mut self, store_id: &str, history: Vec<RootHistoryItem>) -> Self {
        self.histories.insert(store_id.to_string(), history);
        self
    }
}

#[async_trait]
impl ChainState for MockChainState {
    async fn root_history(&self, store_id: &str) -> Result<Vec<RootHistoryItem>> {
        Ok(self.histories.get(store_id).cloned().unwrap_or_default())
    }
}

/// Passes when the data file's sha256 matches the declared hash.
pub struct Sha256Verifier;

#[async_trait]
impl IntegrityVerifier for Sha256Verifier {
    async fn verify(
        &self,
        _key: &str,
        sha256: &str,
        _descriptor: &RootDescriptor,
        _root_hash: &str,
        data_dir: &Path,
    ) -> Result<bool> {
        let path = data_dir.join(data_file_relative_path(sha256)?);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(sha256_hex(&bytes) == sha256),
            Err(_) => Ok(false),
        }
    }
}

/// Verifier whose backing check is unavailable.
pub struct UnavailableVerifier;

#[async_trait]
impl IntegrityVerifier for UnavailableVerifier {
    async fn verify(
        &self,
        _key: &str,
        _sha256: &str,
        _descriptor: &RootDescriptor,
        _root_hash: &str,
        _data_dir: &Path,
    ) -> Result<bool> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "verifier unavailable").into())
    }
}

/// Endpoints pointing selected peers at local mock servers.
#[derive(Default)]
pub struct MapEndpoints {
    content: HashMap<IpAddr, String>,
    propagation: HashMap<IpAddr, String>,
}

impl MapEndpoints {
    pub fn with_content(mut self, ip: IpAddr, url: String) -> Self {
        self.content.insert(ip, url);
        self
    }

    pub fn with_propagation(mut self, ip: IpAddr, url: String) -> Self {
        self.propagation.insert(ip, url);
        self
    }
}

impl PeerEndpoints for MapEndpoints {
    fn content_url(&self, ip: IpAddr) -> String {
        self.content
            .get(&ip)
            .cloned()
            .unwrap_or_else(|| https_base_url(ip, 1))
    }

    fn propagation_url(&self, ip: IpAddr) -> String {
        self.propagation
            .get(&ip)
            .cloned()
            .unwrap_or_else(|| https_base_url(ip, 1))
    }
}
