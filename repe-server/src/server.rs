//! TCP server implementation.

use crate::error::ServerError;
use crate::handler::{Handler, HandlerError, HandlerReply, Middleware, MiddlewareAction};
use bytes::Bytes;
use repe_protocol::{
    BodyCodecs, BodyFormat, DecodedBody, ErrorCode, Header, Message, DEFAULT_PORT, HEADER_SIZE,
};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen host. `""`, `"*"`, and `"0.0.0.0"` mean all IPv4
    /// interfaces; `"::"` means all IPv6 interfaces; anything else is
    /// resolved by name (IPv4 preferred, then IPv6).
    pub host: String,
    /// Listen port; 0 picks an ephemeral port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// State shared with connection tasks.
struct ServerShared {
    codecs: BodyCodecs,
    handlers: RwLock<HashMap<String, Handler>>,
    middleware: RwLock<Vec<Middleware>>,
    stats: ServerStats,
}

/// A REPE TCP server.
pub struct Server {
    config: ServerConfig,
    shared: Arc<ServerShared>,
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: broadcast::Sender<()>,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_codecs(config, BodyCodecs::new())
    }

    /// Creates a server with a custom body codec set.
    pub fn with_codecs(config: ServerConfig, codecs: BodyCodecs) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            shared: Arc::new(ServerShared {
                codecs,
                handlers: RwLock::new(HashMap::new()),
                middleware: RwLock::new(Vec::new()),
                stats: ServerStats::default(),
            }),
            running: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            shutdown,
        }
    }

    /// Binds a handler to a method name, replacing any previous binding.
    pub fn on<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(DecodedBody, &Message) -> Result<HandlerReply, HandlerError> + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .write()
            .unwrap()
            .insert(method.into(), Arc::new(handler));
    }

    /// Appends a middleware; middleware run in registration order before
    /// dispatch.
    pub fn middleware<F>(&self, middleware: F)
    where
        F: Fn(&Message) -> MiddlewareAction + Send + Sync + 'static,
    {
        self.shared
            .middleware
            .write()
            .unwrap()
            .push(Arc::new(middleware));
    }

    /// Runs the accept loop until [`Server::stop`] is called.
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = Self::resolve_bind(&self.config.host, self.config.port).await?;
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        *self.local_addr.lock().unwrap() = Some(bound);
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("server listening on {bound}");

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            self.shared.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.shared.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let shared = self.shared.clone();
                            let mut conn_shutdown = self.shutdown.subscribe();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    handle_connection(stream, peer, &shared, &mut conn_shutdown).await
                                {
                                    tracing::debug!(%peer, error = %e, "connection error");
                                    shared.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }
                                shared.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                tracing::info!("client disconnected: {peer}");
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Initiates shutdown: the accept loop exits and in-flight
    /// connection tasks drain naturally.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(());
    }

    /// Returns whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The bound listen address, available once `run` has bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn stats(&self) -> &ServerStats {
        &self.shared.stats
    }

    /// The body codec set this server decodes with.
    pub fn codecs(&self) -> BodyCodecs {
        self.shared.codecs.clone()
    }

    async fn resolve_bind(host: &str, port: u16) -> Result<SocketAddr, ServerError> {
        match host {
            "" | "*" | "0.0.0.0" => Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))),
            "::" => Ok(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))),
            host => {
                let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
                addrs
                    .iter()
                    .find(|a| matches!(a.ip(), IpAddr::V4(_)))
                    .or_else(|| addrs.iter().find(|a| matches!(a.ip(), IpAddr::V6(_))))
                    .copied()
                    .ok_or_else(|| ServerError::Resolve(host.to_owned()))
            }
        }
    }
}

/// Per-connection read loop: exact-framed header, then sections, then
/// middleware and dispatch. Returns on EOF, read error, or shutdown.
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    shared: &Arc<ServerShared>,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    tracing::info!("client connected: {peer}");
    let mut header_buf = [0u8; HEADER_SIZE];

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                tracing::debug!(%peer, "connection closing on shutdown");
                return Ok(());
            }

            result = stream.read_exact(&mut header_buf) => {
                match result {
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let request = match read_sections(&mut stream, &header_buf).await {
            Ok(msg) => msg,
            Err(ServerError::Protocol(e)) => {
                // Framing is unrecoverable; answer once and drop the
                // connection.
                tracing::warn!(%peer, error = %e, "rejecting invalid frame");
                let placeholder = Message::request(0, Bytes::new());
                let resp = Message::error_response_to(&placeholder, e.code(), e.to_string());
                let _ = stream.write_all(&resp.encode()).await;
                let _ = stream.flush().await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        shared.stats.requests_total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            %peer,
            id = request.header.id,
            query = %request.parse_query().unwrap_or("<binary>"),
            "request"
        );

        let response = dispatch(shared, &request);

        if request.is_notify() {
            tracing::debug!(%peer, id = request.header.id, "notification, no response");
            continue;
        }

        let buf = response.encode();
        stream.write_all(&buf).await?;
        stream.flush().await?;
    }
}

/// Reads the query/body sections for an already-read header and
/// reassembles the full message.
async fn read_sections(
    stream: &mut TcpStream,
    header_buf: &[u8; HEADER_SIZE],
) -> Result<Message, ServerError> {
    let header = Header::decode(header_buf).map_err(ServerError::Protocol)?;

    let section_len = (header.query_length + header.body_length) as usize;
    let mut sections = vec![0u8; section_len];
    if section_len > 0 {
        stream.read_exact(&mut sections).await?;
    }

    let query_len = header.query_length as usize;
    let query = Bytes::copy_from_slice(&sections[..query_len]);
    let body = Bytes::copy_from_slice(&sections[query_len..]);
    Message::from_parts(header, query, body).map_err(ServerError::Protocol)
}

/// Runs the middleware chain and dispatches to the bound handler,
/// producing the response message for `request`.
fn dispatch(shared: &ServerShared, request: &Message) -> Message {
    let middleware: Vec<Middleware> = shared.middleware.read().unwrap().clone();
    for mw in middleware {
        match mw(request) {
            MiddlewareAction::Continue => {}
            MiddlewareAction::Respond(msg) => return msg,
            MiddlewareAction::Reject(ec) => {
                return Message::error_response_to(request, ec, ec.message())
            }
        }
    }

    let method = match request.parse_query() {
        Ok(method) => method.to_owned(),
        Err(e) => return Message::error_response_to(request, e.code(), e.to_string()),
    };

    let handler = shared.handlers.read().unwrap().get(&method).cloned();
    let Some(handler) = handler else {
        return Message::error_response_to(
            request,
            ErrorCode::MethodNotFound,
            ErrorCode::MethodNotFound.message(),
        );
    };

    let body = match request.parse_body(&shared.codecs) {
        Ok(body) => body,
        Err(e) => return Message::error_response_to(request, e.code(), e.to_string()),
    };

    match handler(body, request) {
        Ok(HandlerReply::Raw(msg)) => msg,
        Ok(HandlerReply::Value(value)) => {
            match Message::response_to(request).with_value(&value, BodyFormat::Json, &shared.codecs)
            {
                Ok(msg) => msg,
                Err(e) => Message::error_response_to(request, ErrorCode::ParseError, e.to_string()),
            }
        }
        Err(HandlerError { code, message }) => {
            Message::error_response_to(request, code, message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repe_client::{Client, ClientConfig, ClientError};
    use serde_json::json;
    use std::time::Duration;

    async fn start(server: Arc<Server>) -> SocketAddr {
        let runner = server.clone();
        tokio::spawn(async move {
            runner.run().await.unwrap();
        });
        for _ in 0..200 {
            if let Some(addr) = server.local_addr() {
                return addr;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("server did not bind");
    }

    fn math_server() -> Arc<Server> {
        let server = Arc::new(Server::new(ServerConfig::new("127.0.0.1", 0)));
        server.on("/add", |body, _msg| {
            let value = body.into_value()?;
            let a = value["a"].as_f64().ok_or_else(|| HandlerError::parse("missing a"))?;
            let b = value["b"].as_f64().ok_or_else(|| HandlerError::parse("missing b"))?;
            Ok(HandlerReply::Value(json!({"result": a + b})))
        });
        server
    }

    async fn connect(addr: SocketAddr) -> Client {
        let client = Client::new(
            ClientConfig::new("127.0.0.1", addr.port()).with_timeout(Duration::from_secs(2)),
        );
        client.connect().await.unwrap();
        client
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_add_roundtrip() {
        let server = math_server();
        let addr = start(server).await;
        let client = connect(addr).await;

        let result = client
            .send_request("/add", Some(json!({"a": 5, "b": 3})))
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(result, json!({"result": 8.0}));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_method_not_found() {
        let server = math_server();
        let addr = start(server).await;
        let client = connect(addr).await;

        let err = client.send_request("/b", None).await.unwrap_err();
        match err {
            ClientError::Rpc { code, ref message } => {
                assert_eq!(code, repe_protocol::ErrorCode::MethodNotFound);
                assert!(message.contains("Method not found"));
            }
            other => panic!("expected RPC error, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_notify_runs_handler_without_response() {
        let hits = Arc::new(AtomicU64::new(0));
        let server = math_server();
        {
            let hits = hits.clone();
            server.on("/log", move |_body, _msg| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerReply::Value(serde_json::Value::Null))
            });
        }
        let addr = start(server).await;
        let client = connect(addr).await;

        client
            .send_notify("/log", Some(json!({"line": "hello"})))
            .await
            .unwrap();

        // The connection stays usable for the next request.
        let result = client
            .send_request("/add", Some(json!({"a": 1, "b": 2})))
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(result, json!({"result": 3.0}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn test_timeout_removes_pending_and_drops_late_response() {
        let server = math_server();
        server.on("/slow", |_body, _msg| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(HandlerReply::Value(json!({"done": true})))
        });
        let addr = start(server).await;
        let client = connect(addr).await;

        let err = client
            .send_request_with(
                "/slow",
                None,
                repe_client::RequestOptions::default().with_timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
        assert_eq!(client.pending_count().await, 0);

        // Let the late response arrive; it must be discarded silently and
        // the connection must remain usable.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let result = client
            .send_request("/add", Some(json!({"a": 2, "b": 2})))
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(result, json!({"result": 4.0}));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_middleware_reject_and_respond() {
        let server = math_server();
        server.middleware(|msg| {
            if msg.parse_query().map(|q| q == "/blocked").unwrap_or(false) {
                MiddlewareAction::Reject(ErrorCode::InvalidQuery)
            } else {
                MiddlewareAction::Continue
            }
        });
        server.middleware(|msg| {
            if msg.parse_query().map(|q| q == "/canned").unwrap_or(false) {
                let resp = Message::response_to(msg)
                    .with_body(&b"\"short-circuit\""[..], BodyFormat::Json);
                MiddlewareAction::Respond(resp)
            } else {
                MiddlewareAction::Continue
            }
        });
        let addr = start(server).await;
        let client = connect(addr).await;

        let err = client.send_request("/blocked", None).await.unwrap_err();
        assert_eq!(
            err.rpc_code(),
            Some(repe_protocol::ErrorCode::InvalidQuery)
        );

        let value = client
            .send_request("/canned", None)
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(value, json!("short-circuit"));

        // Unmatched methods still dispatch normally.
        let result = client
            .send_request("/add", Some(json!({"a": 1, "b": 1})))
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(result, json!({"result": 2.0}));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_request_ids_strictly_increasing() {
        let server = math_server();
        server.on("/id", |_body, msg| {
            Ok(HandlerReply::Value(json!({"id": msg.header.id})))
        });
        let addr = start(server).await;
        let client = connect(addr).await;

        let mut ids = Vec::new();
        for _ in 0..10 {
            let value = client
                .send_request("/id", None)
                .await
                .unwrap()
                .into_value()
                .unwrap();
            ids.push(value["id"].as_u64().unwrap());
        }
        for pair in ids.windows(2) {
            assert!(pair[1] > pair[0], "ids not strictly increasing: {ids:?}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn test_batch_results_in_order() {
        let server = math_server();
        let addr = start(server).await;
        let client = connect(addr).await;

        let requests = (0..8)
            .map(|i| ("/add".to_owned(), Some(json!({"a": i, "b": 1}))))
            .collect();
        let handles = client.batch(requests);
        let results = Client::await_batch(handles).await;
        for (i, result) in results.into_iter().enumerate() {
            let value = result.unwrap().into_value().unwrap();
            assert_eq!(value["result"].as_f64().unwrap() as i64, i as i64 + 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handler_error_becomes_error_response() {
        let server = math_server();
        server.on("/divide", |body, _msg| {
            let value = body.into_value()?;
            let n = value["numerator"].as_f64().unwrap_or(0.0);
            let d = value["denominator"].as_f64().unwrap_or(0.0);
            if d == 0.0 {
                return Err(HandlerError::new(
                    ErrorCode::InvalidBody,
                    "Division by zero",
                ));
            }
            Ok(HandlerReply::Value(json!({"result": n / d})))
        });
        let addr = start(server).await;
        let client = connect(addr).await;

        let err = client
            .send_request("/divide", Some(json!({"numerator": 1, "denominator": 0})))
            .await
            .unwrap_err();
        match err {
            ClientError::Rpc { code, message } => {
                assert_eq!(code, ErrorCode::InvalidBody);
                assert!(message.contains("Division by zero"));
            }
            other => panic!("expected RPC error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_bind_specials() {
        let v4 = Server::resolve_bind("", 0).await.unwrap();
        assert!(v4.ip().is_unspecified() && v4.is_ipv4());
        let v4 = Server::resolve_bind("*", 0).await.unwrap();
        assert!(v4.is_ipv4());
        let v6 = Server::resolve_bind("::", 0).await.unwrap();
        assert!(v6.is_ipv6());
        let local = Server::resolve_bind("localhost", 0).await.unwrap();
        assert!(local.ip().is_loopback());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_ends_accept_loop() {
        let server = math_server();
        let addr = start(server.clone()).await;
        assert!(server.is_running());
        server.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!server.is_running());
        drop(addr);
    }
}
