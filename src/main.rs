//! reped - REPE RPC demo daemon.
//!
//! Serves a small math service over the REPE protocol on TCP.

mod config;

use config::Config;
use repe_protocol::ErrorCode;
use repe_registry::Registry;
use repe_server::{HandlerError, HandlerReply, Server, ServerConfig};
use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::load() {
        Ok(config) => {
            if let Ok(path) = std::env::var("REPED_CONFIG") {
                tracing::info!("Loaded config from {path}");
            }
            config
        }
        Err(e) => {
            tracing::error!("Failed to load config: {e}");
            return Err(e.into());
        }
    };

    tracing::info!("Starting reped");
    tracing::info!("  Listen host: {:?}", config.network.host);
    tracing::info!("  Listen port: {}", config.network.port);

    let server = Arc::new(Server::new(ServerConfig::new(
        config.network.host.clone(),
        config.network.port,
    )));
    register_math_service(&server);

    // A small registry mounted under its own prefix; everything else
    // falls through to the math handlers.
    let registry = Arc::new(Registry::new());
    registry.register_value("/counter", json!(0))?;
    registry.register_value("/info", json!({"name": "reped", "version": env!("CARGO_PKG_VERSION")}))?;
    repe_registry::serve(&server, registry, "/registry");

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.stop();
    });

    server.run().await?;
    tracing::info!("Server stopped");
    Ok(())
}

/// Binds the demo math handlers.
fn register_math_service(server: &Server) {
    server.on("/add", |body, _msg| {
        let value = body.into_value()?;
        let a = number(&value, "a")?;
        let b = number(&value, "b")?;
        Ok(HandlerReply::Value(json!({"result": a + b})))
    });

    server.on("/multiply", |body, _msg| {
        let value = body.into_value()?;
        let x = number(&value, "x")?;
        let y = number(&value, "y")?;
        Ok(HandlerReply::Value(json!({"result": x * y})))
    });

    server.on("/divide", |body, _msg| {
        let value = body.into_value()?;
        let numerator = number(&value, "numerator")?;
        let denominator = number(&value, "denominator")?;
        if denominator == 0.0 {
            return Err(HandlerError::new(ErrorCode::InvalidBody, "Division by zero"));
        }
        Ok(HandlerReply::Value(json!({"result": numerator / denominator})))
    });

    server.on("/echo", |body, _msg| {
        let value = body.into_value()?;
        let message = value["message"]
            .as_str()
            .ok_or_else(|| HandlerError::parse("Invalid parameters for echo"))?;
        Ok(HandlerReply::Value(json!({"result": format!("Echo: {message}")})))
    });

    server.on("/status", |_body, _msg| {
        Ok(HandlerReply::Value(json!({
            "status": "online",
            "version": env!("CARGO_PKG_VERSION"),
        })))
    });
}

fn number(value: &serde_json::Value, key: &str) -> Result<f64, HandlerError> {
    value[key]
        .as_f64()
        .ok_or_else(|| HandlerError::parse(format!("Invalid parameter {key:?}")))
}
