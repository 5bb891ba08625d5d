//! Server integration: route REPE requests into a registry.

use crate::registry::Registry;
use bytes::Bytes;
use repe_server::{MiddlewareAction, Server};
use std::sync::Arc;

/// Installs a middleware on `server` that routes requests through
/// `registry`.
///
/// With a non-empty `path_prefix`, only queries under the prefix are
/// intercepted; the prefix is stripped before dispatch. With an empty
/// prefix every request is routed to the registry.
pub fn serve(server: &Server, registry: Arc<Registry>, path_prefix: impl Into<String>) {
    let prefix = path_prefix.into();
    let codecs = server.codecs();

    server.middleware(move |msg| {
        let Ok(query) = msg.parse_query() else {
            return MiddlewareAction::Continue;
        };

        let rewritten = if prefix.is_empty() {
            query.to_owned()
        } else if let Some(rest) = query.strip_prefix(prefix.as_str()) {
            rest.to_owned()
        } else {
            return MiddlewareAction::Continue;
        };

        let request = msg.clone().with_query(Bytes::from(rewritten.into_bytes()));
        MiddlewareAction::Respond(registry.handle_request(&request, &codecs))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistryError;
    use repe_client::{Client, ClientConfig};
    use repe_server::ServerConfig;
    use serde_json::{json, Value};
    use std::net::SocketAddr;
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

    fn counter_registry() -> Arc<Registry> {
        let registry = Arc::new(Registry::new());
        registry.register_value("/counter", json!(0)).unwrap();
        registry
            .register_fn("/add", |args| {
                let a = args["a"].as_f64();
                let b = args["b"].as_f64();
                match (a, b) {
                    (Some(a), Some(b)) => Ok(json!(a + b)),
                    _ => Err(RegistryError::Call("add expects a and b".into())),
                }
            })
            .unwrap();
        registry
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_registry_over_tcp() {
        let server = Arc::new(Server::new(ServerConfig::new("127.0.0.1", 0)));
        serve(&server, counter_registry(), "");
        let addr = start(server).await;

        let client = Client::new(
            ClientConfig::new("127.0.0.1", addr.port()).with_timeout(Duration::from_secs(2)),
        );
        client.connect().await.unwrap();

        // GET /counter
        let value = client
            .send_request("/counter", None)
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(value, json!(0));

        // POST /counter 42
        client
            .send_request("/counter", Some(json!(42)))
            .await
            .unwrap();

        // GET /counter again
        let value = client
            .send_request("/counter", None)
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(value, json!(42));

        // Calling /add with keyword-style arguments.
        let value = client
            .send_request("/add", Some(json!({"a": 10, "b": 20})))
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(value, json!(30.0));

        client.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_prefix_strip_and_fallthrough() {
        let server = Arc::new(Server::new(ServerConfig::new("127.0.0.1", 0)));
        serve(&server, counter_registry(), "/registry");
        server.on("/direct", |_body, _msg| {
            Ok(repe_server::HandlerReply::Value(json!("handled")))
        });
        let addr = start(server).await;

        let client = Client::new(
            ClientConfig::new("127.0.0.1", addr.port()).with_timeout(Duration::from_secs(2)),
        );
        client.connect().await.unwrap();

        // Prefixed queries route to the registry with the prefix removed.
        let value = client
            .send_request("/registry/counter", None)
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(value, json!(0));

        // Unprefixed queries fall through to ordinary handlers.
        let value = client
            .send_request("/direct", None)
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(value, Value::String("handled".into()));

        client.close().await.unwrap();
    }
}
