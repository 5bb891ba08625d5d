//! UniUDP fleet: parallel fire-and-forget fan-out to named nodes.

use crate::client::{UniUdpClient, UniUdpClientConfig};
use crate::error::UniUdpError;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// Per-node fleet configuration.
#[derive(Debug, Clone)]
pub struct UniUdpNodeConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub tags: HashSet<String>,
    pub redundancy: u16,
    pub chunk_size: u16,
    pub fec_group_size: u16,
}

impl UniUdpNodeConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            tags: HashSet::new(),
            redundancy: 1,
            chunk_size: 1024,
            fec_group_size: 1,
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

    pub fn with_redundancy(mut self, redundancy: u16) -> Self {
        self.redundancy = redundancy;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u16) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_fec_group_size(mut self, fec_group_size: u16) -> Self {
        self.fec_group_size = fec_group_size;
        self
    }
}

/// Per-node outcome of a fleet send. A success means the send syscall
/// returned, not that the message was delivered.
#[derive(Debug)]
pub struct SendResult {
    pub node: String,
    /// The REPE message id when the send went out.
    pub message_id: Option<u64>,
    pub error: Option<UniUdpError>,
    pub elapsed: Duration,
}

impl SendResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

struct UniUdpNode {
    name: String,
    tags: HashSet<String>,
    client: UniUdpClient,
}

/// A named collection of UniUDP clients with tag-filtered parallel
/// broadcast.
pub struct UniUdpFleet {
    nodes: Mutex<HashMap<String, Arc<UniUdpNode>>>,
}

impl std::fmt::Debug for UniUdpFleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniUdpFleet").finish_non_exhaustive()
    }
}

impl UniUdpFleet {
    /// Materializes one client per node. Node names must be unique.
    pub async fn new(configs: Vec<UniUdpNodeConfig>) -> Result<Self, UniUdpError> {
        let mut seen = HashSet::new();
        for config in &configs {
            if !seen.insert(config.name.clone()) {
                return Err(UniUdpError::InvalidArgument(format!(
                    "duplicate node name: {}",
                    config.name
                )));
            }
        }

        let mut nodes = HashMap::new();
        for config in configs {
            let client_config = UniUdpClientConfig::new(config.host.clone(), config.port)
                .with_redundancy(config.redundancy)
                .with_chunk_size(config.chunk_size)
                .with_fec_group_size(config.fec_group_size);
            let client = UniUdpClient::connect(client_config).await?;
            nodes.insert(
                config.name.clone(),
                Arc::new(UniUdpNode {
                    name: config.name,
                    tags: config.tags,
                    client,
                }),
            );
        }
        Ok(Self {
            nodes: Mutex::new(nodes),
        })
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.lock().unwrap().keys().cloned().collect()
    }

    /// Sends a request to every node whose tag set contains all of
    /// `tags`, in parallel; one result per matching node.
    pub async fn broadcast(
        &self,
        method: &str,
        params: Option<Value>,
        tags: &[String],
    ) -> HashMap<String, SendResult> {
        self.fan_out(method, params, tags, false).await
    }

    /// Like [`UniUdpFleet::broadcast`], but sends notifications.
    pub async fn broadcast_notify(
        &self,
        method: &str,
        params: Option<Value>,
        tags: &[String],
    ) -> HashMap<String, SendResult> {
        self.fan_out(method, params, tags, true).await
    }

    async fn fan_out(
        &self,
        method: &str,
        params: Option<Value>,
        tags: &[String],
        notify: bool,
    ) -> HashMap<String, SendResult> {
        // Snapshot under the lock, release before any I/O.
        let targets: Vec<Arc<UniUdpNode>> = {
            let nodes = self.nodes.lock().unwrap();
            nodes
                .values()
                .filter(|node| tags.iter().all(|tag| node.tags.contains(tag)))
                .cloned()
                .collect()
        };

        let mut set = JoinSet::new();
        for node in targets {
            let method = method.to_owned();
            let params = params.clone();
            set.spawn(async move {
                let start = Instant::now();
                let outcome = if notify {
                    node.client.send_notify(&method, params).await
                } else {
                    node.client.send_request(&method, params).await
                };
                match outcome {
                    Ok(message_id) => SendResult {
                        node: node.name.clone(),
                        message_id: Some(message_id),
                        error: None,
                        elapsed: start.elapsed(),
                    },
                    Err(e) => {
                        tracing::debug!(node = %node.name, error = %e, "fleet send failed");
                        SendResult {
                            node: node.name.clone(),
                            message_id: None,
                            error: Some(e),
                            elapsed: start.elapsed(),
                        }
                    }
                }
            });
        }

        let mut results = HashMap::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(result) = joined {
                results.insert(result.node.clone(), result);
            }
        }
        results
    }
}
