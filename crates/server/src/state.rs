//! Shared application state injected into Axum handlers.

use std::sync::Arc;

use model_store::Engine;
use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::services::transfer_manager::TransferManager;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    config: AppConfig,
    engine: Arc<Engine>,
    transfers: TransferManager,
    event_tx: broadcast::Sender<String>,
}

impl AppState {
    pub fn new(config: AppConfig, engine: Arc<Engine>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let transfers = TransferManager::new(
            Arc::clone(&engine),
            config.max_concurrent_transfers,
            event_tx.clone(),
        );
        Self {
            inner: Arc::new(Inner {
                config,
                engine,
                transfers,
                event_tx,
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.inner.engine
    }

    pub fn transfers(&self) -> &TransferManager {
        &self.inner.transfers
    }

    /// Broadcast an event to all connected WebSocket clients.
    pub fn broadcast_event(&self, event_type: &str, data: serde_json::Value) {
        // Ignore send errors (no subscribers)
        let _ = self.inner.event_tx.send(event_message(event_type, data));
    }

    /// Subscribe to the event broadcast channel.
    pub fn subscribe_events(&self) -> broadcast::Receiver<String> {
        self.inner.event_tx.subscribe()
    }
}

/// Wire format of every WebSocket event.
pub fn event_message(event_type: &str, data: serde_json::Value) -> String {
    serde_json::json!({
        "type": event_type,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "data": data,
    })
    .to_string()
}
