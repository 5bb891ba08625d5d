//! Fire-and-forget UniUDP server: receive, reassemble, dispatch.

use crate::error::UniUdpError;
use crate::reassembly::{CompletionReason, MessageReport, Reassembler, ReceiveOptions};
use repe_protocol::{BodyCodecs, DecodedBody, Message};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::{ToSocketAddrs, UdpSocket};

/// A UniUDP method handler. Returning a value for a request (not a
/// notification) routes it to the configured response callback.
pub type UdpHandler =
    Arc<dyn Fn(DecodedBody, &Message) -> Result<Option<Value>, UniUdpError> + Send + Sync>;

/// Sink for request results: `(method, result, request)`.
pub type ResponseCallback =
    Arc<dyn Fn(&str, &Value, &Message) -> Result<(), UniUdpError> + Send + Sync>;

/// UniUDP server configuration.
#[derive(Debug, Clone)]
pub struct UniUdpServerConfig {
    /// Per-packet wait inside a receive pass.
    pub inactivity_timeout: Duration,
    /// Bound on one receive pass.
    pub overall_timeout: Duration,
}

impl Default for UniUdpServerConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(2),
            overall_timeout: Duration::from_secs(30),
        }
    }
}

impl UniUdpServerConfig {
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub fn with_overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = timeout;
        self
    }
}

/// A UniUDP server: reassembles messages, decodes them as REPE, and
/// dispatches by method. One-way transport: request results go to the
/// response callback rather than back over the wire.
pub struct UniUdpServer {
    socket: UdpSocket,
    reassembler: Reassembler,
    codecs: BodyCodecs,
    config: UniUdpServerConfig,
    handlers: RwLock<HashMap<String, UdpHandler>>,
    response_callback: RwLock<Option<ResponseCallback>>,
    running: AtomicBool,
}

impl UniUdpServer {
    /// Binds a server socket.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        config: UniUdpServerConfig,
    ) -> Result<Self, UniUdpError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            reassembler: Reassembler::new(),
            codecs: BodyCodecs::new(),
            config,
            handlers: RwLock::new(HashMap::new()),
            response_callback: RwLock::new(None),
            running: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, UniUdpError> {
        Ok(self.socket.local_addr()?)
    }

    /// Binds a handler to a method name.
    pub fn on<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(DecodedBody, &Message) -> Result<Option<Value>, UniUdpError> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap()
            .insert(method.into(), Arc::new(handler));
    }

    /// Installs the result sink for request handlers.
    pub fn on_response<F>(&self, callback: F)
    where
        F: Fn(&str, &Value, &Message) -> Result<(), UniUdpError> + Send + Sync + 'static,
    {
        *self.response_callback.write().unwrap() = Some(Arc::new(callback));
    }

    /// Serve loop: receive, reassemble, dispatch. Runs until
    /// [`UniUdpServer::stop`]; the flag is checked between receive
    /// passes, so stopping takes effect within one overall timeout.
    pub async fn run(&self) -> Result<(), UniUdpError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("UniUDP server listening on {}", self.local_addr()?);

        while self.running.load(Ordering::SeqCst) {
            let options = ReceiveOptions {
                message_id: None,
                inactivity_timeout: self.config.inactivity_timeout,
                overall_timeout: self.config.overall_timeout,
            };
            match self.reassembler.receive_message(&self.socket, &options).await {
                Ok(report) => {
                    if report.completion_reason != CompletionReason::Completed
                        || !report.lost_chunks.is_empty()
                    {
                        tracing::warn!(
                            message_id = report.message_id,
                            lost = report.lost_chunks.len(),
                            "discarding incomplete message"
                        );
                        continue;
                    }
                    self.dispatch(&report);
                }
                Err(UniUdpError::Timeout) => continue,
                Err(UniUdpError::Io(e)) => {
                    tracing::error!(error = %e, "receive failed");
                    return Err(e.into());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "receive error, continuing");
                }
            }
        }
        tracing::info!("UniUDP server stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Test support: drops all reassembly and dedup state.
    pub fn clear_caches(&self) {
        self.reassembler.clear();
    }

    fn dispatch(&self, report: &MessageReport) {
        let msg = match Message::decode(&report.payload) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(
                    message_id = report.message_id,
                    error = %e,
                    "payload is not a REPE message"
                );
                return;
            }
        };
        let method = match msg.parse_query() {
            Ok(method) => method.to_owned(),
            Err(e) => {
                tracing::warn!(id = msg.header.id, error = %e, "bad query");
                return;
            }
        };

        let handler = self.handlers.read().unwrap().get(&method).cloned();
        let Some(handler) = handler else {
            tracing::warn!(%method, "no handler bound");
            return;
        };

        let body = match msg.parse_body(&self.codecs) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(%method, error = %e, "body decode failed");
                return;
            }
        };

        match handler(body, &msg) {
            Ok(Some(result)) if !msg.is_notify() => {
                let callback = self.response_callback.read().unwrap().clone();
                if let Some(callback) = callback {
                    // Callback failures are logged, never fatal to the
                    // serve loop.
                    if let Err(e) = callback(&method, &result, &msg) {
                        tracing::error!(%method, error = %e, "response callback failed");
                    }
                }
            }
            Ok(_) => {} // notification, or a handler with nothing to report
            Err(e) => {
                tracing::warn!(%method, error = %e, "handler failed");
            }
        }
    }
}
