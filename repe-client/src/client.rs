//! Multiplexing client.
//!
//! One background reader task owns the read half of the socket and
//! dispatches responses by id; callers share the write half under the
//! write lock. Three mutual-exclusion domains, never nested except for
//! pending-map cleanup under the state lock during disconnect:
//! `state` (connection lifecycle), `pending` (id -> delivery slot),
//! `writer` (socket output).

use crate::error::ClientError;
use bytes::Bytes;
use repe_protocol::{
    BodyCodecs, BodyFormat, DecodedBody, Header, Message, QueryFormat, HEADER_SIZE,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server hostname or address literal.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Default request timeout; overridable per request.
    pub timeout: Duration,
    /// Disable Nagle's algorithm on the connection.
    pub nodelay: bool,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            nodelay: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

/// Per-request overrides.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub query_format: QueryFormat,
    pub body_format: BodyFormat,
    /// Overrides the client default when set.
    pub timeout: Option<Duration>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            query_format: QueryFormat::JsonPointer,
            body_format: BodyFormat::Json,
            timeout: None,
        }
    }
}

impl RequestOptions {
    pub fn with_body_format(mut self, format: BodyFormat) -> Self {
        self.body_format = format;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

type PendingSlot = oneshot::Sender<Result<DecodedBody, ClientError>>;

struct ClientInner {
    config: ClientConfig,
    codecs: BodyCodecs,
    /// Visible connection state bit, toggled on open/close.
    connected: AtomicBool,
    /// Guards the connection lifecycle (reader task handle).
    state: Mutex<Option<JoinHandle<()>>>,
    /// Guards socket output; held for the full serialized message.
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Guards the pending-request map.
    pending: Mutex<HashMap<u64, PendingSlot>>,
    /// Monotonic request id source.
    next_id: AtomicU64,
}

/// A multiplexing REPE client.
///
/// Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Creates a new client (not yet connected).
    pub fn new(config: ClientConfig) -> Self {
        Self::with_codecs(config, BodyCodecs::new())
    }

    /// Creates a client with a custom body codec set.
    pub fn with_codecs(config: ClientConfig, codecs: BodyCodecs) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                codecs,
                connected: AtomicBool::new(false),
                state: Mutex::new(None),
                writer: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Connects to the server and spawns the reader task.
    ///
    /// A no-op when already connected.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut state = self.inner.state.lock().await;
        if self.inner.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let stream = self.dial().await?;
        stream.set_nodelay(self.inner.config.nodelay).ok();
        tracing::debug!(
            host = %self.inner.config.host,
            port = self.inner.config.port,
            "connected"
        );

        let (read_half, write_half) = stream.into_split();
        *self.inner.writer.lock().await = Some(write_half);
        self.inner.connected.store(true, Ordering::SeqCst);

        let inner = self.inner.clone();
        *state = Some(tokio::spawn(async move {
            ClientInner::read_loop(inner, read_half).await;
        }));
        Ok(())
    }

    /// Resolves the configured host and connects to the first reachable
    /// address, preferring IPv6, then IPv4, then whatever resolution
    /// returned.
    async fn dial(&self) -> Result<TcpStream, ClientError> {
        let host = self.inner.config.host.as_str();
        let port = self.inner.config.port;
        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|_| ClientError::Resolve(host.to_owned()))?
            .collect();
        if addrs.is_empty() {
            return Err(ClientError::Resolve(host.to_owned()));
        }

        let mut ordered: Vec<SocketAddr> = Vec::with_capacity(addrs.len());
        ordered.extend(addrs.iter().filter(|a| matches!(a.ip(), IpAddr::V6(_))).copied());
        ordered.extend(addrs.iter().filter(|a| matches!(a.ip(), IpAddr::V4(_))).copied());

        let mut last_err = None;
        for addr in ordered {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.map(ClientError::Io).unwrap_or(ClientError::Resolve(host.to_owned())))
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Closes the connection, cancelling the reader and failing any
    /// in-flight requests with a connection-closed error.
    pub async fn close(&self) -> Result<(), ClientError> {
        let mut state = self.inner.state.lock().await;
        self.inner.connected.store(false, Ordering::SeqCst);

        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        // Pending cleanup nests under the state lock on this path only.
        self.inner.pending.lock().await.clear();

        if let Some(handle) = state.take() {
            handle.abort();
        }
        tracing::debug!("connection closed");
        Ok(())
    }

    /// Sends a request with default formats and waits for the correlated
    /// response body.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<DecodedBody, ClientError> {
        self.send_request_with(method, params, RequestOptions::default())
            .await
    }

    /// Sends a request and decodes the response body into `T`.
    pub async fn send_request_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        let body = self.send_request(method, params).await?;
        let value = body.into_value()?;
        serde_json::from_value(value).map_err(|e| ClientError::Protocol(e.into()))
    }

    /// Sends a request with explicit options.
    pub async fn send_request_with(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<DecodedBody, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let mut msg =
            Message::request(id, method.to_owned()).with_query_format(options.query_format);
        if let Some(params) = params {
            msg = msg.with_value(&params, options.body_format, &self.inner.codecs)?;
        }

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        if let Err(e) = self.write_message(&msg).await {
            self.inner.pending.lock().await.remove(&id);
            return Err(e);
        }

        let timeout = options.timeout.unwrap_or(self.inner.config.timeout);
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                // Unregister before reporting so a late response is
                // dropped silently by the reader.
                self.inner.pending.lock().await.remove(&id);
                tracing::debug!(id, "request timed out");
                Err(ClientError::Timeout)
            }
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Ok(Ok(outcome)) => outcome,
        }
    }

    /// Sends a notification: no pending entry, no response awaited.
    pub async fn send_notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        self.send_notify_with(method, params, RequestOptions::default())
            .await
    }

    pub async fn send_notify_with(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let mut msg =
            Message::notify(id, method.to_owned()).with_query_format(options.query_format);
        if let Some(params) = params {
            msg = msg.with_value(&params, options.body_format, &self.inner.codecs)?;
        }
        self.write_message(&msg).await
    }

    /// Schedules a request on the runtime; the handle resolves to the
    /// same outcome `send_request` would return.
    pub fn send_request_async(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> JoinHandle<Result<DecodedBody, ClientError>> {
        let client = self.clone();
        let method = method.into();
        tokio::spawn(async move { client.send_request(&method, params).await })
    }

    /// Submits a batch of requests concurrently, one handle per request.
    pub fn batch(
        &self,
        requests: Vec<(String, Option<Value>)>,
    ) -> Vec<JoinHandle<Result<DecodedBody, ClientError>>> {
        requests
            .into_iter()
            .map(|(method, params)| self.send_request_async(method, params))
            .collect()
    }

    /// Collects batch results in submission order.
    pub async fn await_batch(
        handles: Vec<JoinHandle<Result<DecodedBody, ClientError>>>,
    ) -> Vec<Result<DecodedBody, ClientError>> {
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(
                handle
                    .await
                    .unwrap_or(Err(ClientError::ConnectionClosed)),
            );
        }
        results
    }

    /// Number of requests currently awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    async fn write_message(&self, msg: &Message) -> Result<(), ClientError> {
        let buf = msg.encode();
        let mut writer = self.inner.writer.lock().await;
        let writer = writer.as_mut().ok_or(ClientError::NotConnected)?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl ClientInner {
    /// Reader task: reads framed responses and routes them to waiting
    /// slots by id. Exits on EOF or read error, then fails any still-open
    /// slots by dropping them.
    async fn read_loop(inner: Arc<ClientInner>, mut read_half: OwnedReadHalf) {
        let mut header_buf = [0u8; HEADER_SIZE];

        loop {
            if let Err(e) = read_half.read_exact(&mut header_buf).await {
                if inner.connected.load(Ordering::SeqCst) {
                    tracing::debug!(error = %e, "read loop ended");
                }
                break;
            }

            let header = match Header::decode(&header_buf) {
                Ok(header) => header,
                Err(e) => {
                    if !inner.connected.load(Ordering::SeqCst) {
                        break;
                    }
                    tracing::warn!(error = %e, "dropping unparseable response header");
                    continue;
                }
            };

            let section_len = (header.query_length + header.body_length) as usize;
            let mut sections = vec![0u8; section_len];
            if section_len > 0 {
                if let Err(e) = read_half.read_exact(&mut sections).await {
                    tracing::debug!(error = %e, "read loop ended mid-message");
                    break;
                }
            }
            let query_len = header.query_length as usize;
            let msg = Message {
                header,
                query: Bytes::copy_from_slice(&sections[..query_len]),
                body: Bytes::copy_from_slice(&sections[query_len..]),
            };

            let slot = inner.pending.lock().await.remove(&header.id);
            let Some(slot) = slot else {
                tracing::debug!(id = header.id, "no pending request; response dropped");
                continue;
            };

            let outcome = if header.ec.is_ok() {
                msg.parse_body(&inner.codecs).map_err(ClientError::from)
            } else {
                let text = std::str::from_utf8(&msg.body)
                    .ok()
                    .filter(|s| !s.is_empty())
                    .unwrap_or("Unknown error")
                    .to_owned();
                Err(ClientError::Rpc {
                    code: header.ec,
                    message: text,
                })
            };
            let _ = slot.send(outcome);
        }

        inner.connected.store(false, Ordering::SeqCst);
        // Dropping the senders wakes waiters with a closed-channel error.
        inner.pending.lock().await.clear();
    }
}
