use crate::command::{Envelope, MethodCall};
use crate::config::BridgeConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{BridgeError, ErrorEnvelope};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task;
use tracing::info;

/// Host-facing seam: one method call in, one envelope out.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(&self, call: MethodCall) -> Envelope;

    /// Decode a raw transport message and handle it. Malformed messages are
    /// answered with a `BadParam` envelope.
    async fn handle_json(&self, message: JsonValue) -> JsonValue {
        match serde_json::from_value::<MethodCall>(message) {
            Ok(call) => self.handle(call).await.to_json(),
            Err(err) => Envelope::Error(ErrorEnvelope::from(BridgeError::bad_param(format!(
                "malformed method call: {err}"
            ))))
            .to_json(),
        }
    }
}

/// SQLite service exposed to the host runtime.
pub struct SqliteService {
    config: BridgeConfig,
    dispatcher: Arc<Dispatcher>,
    running: AtomicBool,
}

impl SqliteService {
    /// Create a new SQLite service with the given config
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(config.clone())),
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn start(&self) -> Result<()> {
        if let Some(path) = &self.config.databases_path {
            std::fs::create_dir_all(path)
                .with_context(|| format!("creating databases path {}", path.display()))?;
        }
        info!(
            databases_path = ?self.config.databases_path,
            log_level = ?self.config.log_level,
            "starting sqlite service"
        );
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        let dispatcher = Arc::clone(&self.dispatcher);
        task::spawn_blocking(move || dispatcher.close_all())
            .await
            .context("closing open databases")?;
        info!("sqlite service stopped");
        Ok(())
    }
}

#[async_trait]
impl MethodHandler for SqliteService {
    async fn handle(&self, call: MethodCall) -> Envelope {
        if !self.is_running() {
            return Envelope::Error(ErrorEnvelope::from(BridgeError::IllegalState(
                "sqlite service is not running".to_string(),
            )));
        }
        // Handle locks and SQLite I/O block.
        let dispatcher = Arc::clone(&self.dispatcher);
        match task::spawn_blocking(move || dispatcher.dispatch(&call)).await {
            Ok(envelope) => envelope,
            Err(err) => Envelope::Error(ErrorEnvelope::from(BridgeError::IllegalState(format!(
                "dispatch task failed: {err}"
            )))),
        }
    }
}
