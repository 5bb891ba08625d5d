//! The fleet: named nodes, parallel fan-out, retries, health checks.

use crate::error::FleetError;
use repe_client::{Client, ClientConfig, ClientError, RequestOptions};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// Retry policy for per-node calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(100),
        }
    }
}

/// Per-node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub tags: HashSet<String>,
    /// Per-node request timeout; zero means the fleet default applies.
    pub timeout: Duration,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            tags: HashSet::new(),
            timeout: Duration::ZERO,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Fleet-wide options.
#[derive(Debug, Clone)]
pub struct FleetOptions {
    pub default_timeout: Duration,
    pub retry: RetryPolicy,
    pub health_endpoint: String,
    pub health_timeout: Duration,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            health_endpoint: "/status".to_owned(),
            health_timeout: Duration::from_secs(5),
        }
    }
}

/// Per-node outcome of a fleet call. Errors are captured, not thrown.
#[derive(Debug)]
pub struct RemoteResult {
    pub node: String,
    pub value: Option<Value>,
    pub error: Option<FleetError>,
    pub elapsed: Duration,
}

impl RemoteResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    /// The value, or the stored error.
    pub fn value(&self) -> Result<&Value, &FleetError> {
        match &self.error {
            Some(error) => Err(error),
            None => Ok(self.value.as_ref().unwrap_or(&Value::Null)),
        }
    }

    pub fn into_value(self) -> Result<Value, FleetError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.value.unwrap_or(Value::Null)),
        }
    }
}

/// Per-node health outcome. Never an error at the call level.
#[derive(Debug)]
pub struct NodeHealth {
    pub healthy: bool,
    pub latency: Option<Duration>,
    pub error: Option<String>,
}

/// Lists of nodes a parallel lifecycle operation succeeded or failed on.
#[derive(Debug, Default)]
pub struct ConnectReport {
    pub connected: Vec<String>,
    pub failed: Vec<(String, FleetError)>,
}

struct Node {
    config: NodeConfig,
    client: Client,
}

struct FleetInner {
    /// Guards the node map; broadcasts snapshot under the lock and
    /// release it before any I/O.
    nodes: Mutex<HashMap<String, Arc<Node>>>,
    options: FleetOptions,
}

/// A named collection of REPE clients.
#[derive(Clone)]
pub struct Fleet {
    inner: Arc<FleetInner>,
}

impl std::fmt::Debug for Fleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fleet").finish_non_exhaustive()
    }
}

impl Fleet {
    /// Builds a fleet with default options. Node names are deduplicated
    /// pre-flight; duplicates are rejected before any client exists.
    pub fn new(configs: Vec<NodeConfig>) -> Result<Self, FleetError> {
        Self::with_options(configs, FleetOptions::default())
    }

    pub fn with_options(
        configs: Vec<NodeConfig>,
        options: FleetOptions,
    ) -> Result<Self, FleetError> {
        let mut seen = HashSet::new();
        for config in &configs {
            if !seen.insert(config.name.clone()) {
                return Err(FleetError::DuplicateNode(config.name.clone()));
            }
        }

        let mut nodes = HashMap::new();
        for config in configs {
            let client = Client::new(ClientConfig::new(config.host.clone(), config.port));
            nodes.insert(
                config.name.clone(),
                Arc::new(Node { config, client }),
            );
        }
        Ok(Self {
            inner: Arc::new(FleetInner {
                nodes: Mutex::new(nodes),
                options,
            }),
        })
    }

    pub fn node_names(&self) -> Vec<String> {
        self.inner.nodes.lock().unwrap().keys().cloned().collect()
    }

    fn snapshot(&self, tags: &[String]) -> Vec<Arc<Node>> {
        let nodes = self.inner.nodes.lock().unwrap();
        nodes
            .values()
            .filter(|node| tags.iter().all(|tag| node.config.tags.contains(tag)))
            .cloned()
            .collect()
    }

    fn lookup(&self, name: &str) -> Option<Arc<Node>> {
        self.inner.nodes.lock().unwrap().get(name).cloned()
    }

    /// Connects every node in parallel.
    pub async fn connect_all(&self) -> ConnectReport {
        self.lifecycle(|node| async move {
            node.client.connect().await.map_err(FleetError::from)
        })
        .await
    }

    /// Disconnects every node in parallel.
    pub async fn disconnect_all(&self) -> ConnectReport {
        self.lifecycle(|node| async move {
            node.client.close().await.map_err(FleetError::from)
        })
        .await
    }

    /// Closes and re-opens every node in parallel.
    pub async fn reconnect_all(&self) -> ConnectReport {
        self.lifecycle(|node| async move {
            node.client.close().await.map_err(FleetError::from)?;
            node.client.connect().await.map_err(FleetError::from)
        })
        .await
    }

    async fn lifecycle<F, Fut>(&self, op: F) -> ConnectReport
    where
        F: Fn(Arc<Node>) -> Fut,
        Fut: std::future::Future<Output = Result<(), FleetError>> + Send + 'static,
    {
        let targets = self.snapshot(&[]);
        let mut set = JoinSet::new();
        for node in targets {
            let name = node.config.name.clone();
            let fut = op(node);
            set.spawn(async move { (name, fut.await) });
        }

        let mut report = ConnectReport::default();
        while let Some(joined) = set.join_next().await {
            if let Ok((name, outcome)) = joined {
                match outcome {
                    Ok(()) => report.connected.push(name),
                    Err(e) => report.failed.push((name, e)),
                }
            }
        }
        report.connected.sort();
        report.failed.sort_by(|a, b| a.0.cmp(&b.0));
        report
    }

    /// Calls one node through the retry policy.
    pub async fn call(&self, node_name: &str, method: &str, params: Option<Value>) -> RemoteResult {
        let Some(node) = self.lookup(node_name) else {
            return RemoteResult {
                node: node_name.to_owned(),
                value: None,
                error: Some(FleetError::UnknownNode(node_name.to_owned())),
                elapsed: Duration::ZERO,
            };
        };
        call_with_retry(node, method.to_owned(), params, self.inner.options.clone()).await
    }

    /// Broadcasts to every node whose tag set contains all of `tags`;
    /// calls run in parallel and every matching node gets exactly one
    /// entry in the result map.
    pub async fn broadcast(
        &self,
        method: &str,
        params: Option<Value>,
        tags: &[String],
    ) -> HashMap<String, RemoteResult> {
        let targets = self.snapshot(tags);
        let options = self.inner.options.clone();

        let mut set = JoinSet::new();
        for node in targets {
            let method = method.to_owned();
            let params = params.clone();
            let options = options.clone();
            set.spawn(async move { call_with_retry(node, method, params, options).await });
        }

        let mut results = HashMap::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(result) = joined {
                results.insert(result.node.clone(), result);
            }
        }
        results
    }

    /// Broadcasts, then reduces the successful values.
    pub async fn map_reduce<R>(
        &self,
        method: &str,
        params: Option<Value>,
        tags: &[String],
        reduce: impl FnOnce(Vec<Value>) -> R,
    ) -> R {
        let results = self.broadcast(method, params, tags).await;
        let values = results
            .into_values()
            .filter_map(|result| result.value)
            .collect();
        reduce(values)
    }

    /// Probes every node against the health endpoint with the health
    /// timeout. Per-node failures become unhealthy entries, never errors.
    pub async fn health_check(&self) -> HashMap<String, NodeHealth> {
        let targets = self.snapshot(&[]);
        let endpoint = self.inner.options.health_endpoint.clone();
        let timeout = self.inner.options.health_timeout;

        let mut set = JoinSet::new();
        for node in targets {
            let endpoint = endpoint.clone();
            set.spawn(async move {
                let start = Instant::now();
                let outcome = probe(&node, &endpoint, timeout).await;
                let name = node.config.name.clone();
                match outcome {
                    Ok(()) => (
                        name,
                        NodeHealth {
                            healthy: true,
                            latency: Some(start.elapsed()),
                            error: None,
                        },
                    ),
                    Err(e) => (
                        name,
                        NodeHealth {
                            healthy: false,
                            latency: None,
                            error: Some(e.to_string()),
                        },
                    ),
                }
            });
        }

        let mut results = HashMap::new();
        while let Some(joined) = set.join_next().await {
            if let Ok((name, health)) = joined {
                results.insert(name, health);
            }
        }
        results
    }
}

async fn probe(node: &Node, endpoint: &str, timeout: Duration) -> Result<(), ClientError> {
    if !node.client.is_connected() {
        node.client.connect().await?;
    }
    node.client
        .send_request_with(
            endpoint,
            None,
            RequestOptions::default().with_timeout(timeout),
        )
        .await?;
    Ok(())
}

async fn call_with_retry(
    node: Arc<Node>,
    method: String,
    params: Option<Value>,
    options: FleetOptions,
) -> RemoteResult {
    let start = Instant::now();
    let attempts = options.retry.max_attempts.max(1);
    let mut last_error: Option<FleetError> = None;

    for attempt in 1..=attempts {
        if attempt > 1 {
            tokio::time::sleep(options.retry.delay).await;
        }

        if !node.client.is_connected() {
            if let Err(e) = node.client.connect().await {
                tracing::debug!(node = %node.config.name, attempt, error = %e, "connect failed");
                last_error = Some(e.into());
                continue;
            }
        }

        let timeout = if node.config.timeout.is_zero() {
            options.default_timeout
        } else {
            node.config.timeout
        };

        match node
            .client
            .send_request_with(
                &method,
                params.clone(),
                RequestOptions::default().with_timeout(timeout),
            )
            .await
        {
            Ok(body) => match body.into_value() {
                Ok(value) => {
                    return RemoteResult {
                        node: node.config.name.clone(),
                        value: Some(value),
                        error: None,
                        elapsed: start.elapsed(),
                    }
                }
                Err(e) => {
                    last_error = Some(FleetError::Client(ClientError::Protocol(e)));
                }
            },
            Err(e) => {
                tracing::debug!(node = %node.config.name, attempt, error = %e, "call failed");
                last_error = Some(e.into());
            }
        }
    }

    RemoteResult {
        node: node.config.name.clone(),
        value: None,
        error: last_error,
        elapsed: start.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repe_server::{HandlerReply, Server, ServerConfig};
    use serde_json::json;
    use std::net::SocketAddr;

    async fn start_math_server() -> SocketAddr {
        let server = Arc::new(Server::new(ServerConfig::new("127.0.0.1", 0)));
        server.on("/add", |body, _msg| {
            let value = body.into_value()?;
            let a = value["a"].as_f64().unwrap_or(0.0);
            let b = value["b"].as_f64().unwrap_or(0.0);
            Ok(HandlerReply::Value(json!({"result": a + b})))
        });
        server.on("/status", |_body, _msg| {
            Ok(HandlerReply::Value(json!({"status": "online"})))
        });

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

    fn tagged_fleet(addr: SocketAddr) -> Fleet {
        Fleet::new(vec![
            NodeConfig::new("a", "127.0.0.1", addr.port()).with_tags(["compute"]),
            NodeConfig::new("b", "127.0.0.1", addr.port()).with_tags(["compute", "primary"]),
            NodeConfig::new("c", "127.0.0.1", addr.port()).with_tags(["storage"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = Fleet::new(vec![
            NodeConfig::new("x", "127.0.0.1", 1),
            NodeConfig::new("x", "127.0.0.1", 2),
        ])
        .unwrap_err();
        assert!(matches!(err, FleetError::DuplicateNode(name) if name == "x"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_all_and_broadcast() {
        let addr = start_math_server().await;
        let fleet = tagged_fleet(addr);

        let report = fleet.connect_all().await;
        assert_eq!(report.connected, vec!["a", "b", "c"]);
        assert!(report.failed.is_empty());

        let results = fleet
            .broadcast("/add", Some(json!({"a": 2, "b": 3})), &[])
            .await;
        assert_eq!(results.len(), 3);
        for result in results.values() {
            assert!(result.succeeded());
            assert_eq!(result.value().unwrap()["result"], json!(5.0));
        }

        fleet.disconnect_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tag_filters() {
        let addr = start_math_server().await;
        let fleet = tagged_fleet(addr);
        fleet.connect_all().await;

        let results = fleet
            .broadcast("/add", Some(json!({"a": 1, "b": 1})), &["primary".to_owned()])
            .await;
        assert_eq!(results.len(), 1);
        assert!(results.contains_key("b"));

        let results = fleet
            .broadcast("/add", Some(json!({"a": 1, "b": 1})), &["compute".to_owned()])
            .await;
        assert_eq!(results.len(), 2);
        assert!(results.contains_key("a") && results.contains_key("b"));

        let results = fleet
            .broadcast("/add", Some(json!({"a": 1, "b": 1})), &["none".to_owned()])
            .await;
        assert!(results.is_empty());

        fleet.disconnect_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_call_retries_and_captures_error() {
        // Nothing listens on port 9; attempts are exhausted and the error
        // lands in the result instead of being thrown.
        let fleet = Fleet::with_options(
            vec![NodeConfig::new("dead", "127.0.0.1", 9)],
            FleetOptions {
                retry: RetryPolicy {
                    max_attempts: 2,
                    delay: Duration::from_millis(20),
                },
                ..Default::default()
            },
        )
        .unwrap();

        let result = fleet.call("dead", "/add", None).await;
        assert!(result.failed());
        assert!(result.value().is_err());
        assert!(result.elapsed >= Duration::from_millis(20));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_node() {
        let addr = start_math_server().await;
        let fleet = tagged_fleet(addr);
        let result = fleet.call("ghost", "/add", None).await;
        assert!(matches!(result.error, Some(FleetError::UnknownNode(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_map_reduce_sums_results() {
        let addr = start_math_server().await;
        let fleet = tagged_fleet(addr);
        fleet.connect_all().await;

        let total = fleet
            .map_reduce("/add", Some(json!({"a": 1, "b": 2})), &[], |values| {
                values
                    .iter()
                    .filter_map(|v| v["result"].as_f64())
                    .sum::<f64>()
            })
            .await;
        assert_eq!(total, 9.0);

        fleet.disconnect_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_health_check() {
        let addr = start_math_server().await;
        let fleet = Fleet::new(vec![
            NodeConfig::new("up", "127.0.0.1", addr.port()),
            NodeConfig::new("down", "127.0.0.1", 9),
        ])
        .unwrap();

        let health = fleet.health_check().await;
        assert!(health["up"].healthy);
        assert!(health["up"].latency.is_some());
        assert!(!health["down"].healthy);
        assert!(health["down"].error.is_some());
    }
}
