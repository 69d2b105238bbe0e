//! Background transfer runner for the HTTP API.
//!
//! - Imports/exports are accepted immediately and run on the blocking pool
//! - At most `max_concurrent` transfers hold a `Semaphore` permit at once
//! - Progress and completion are broadcast as JSON events
//! - Finished transfers are kept in a bounded history for status queries

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use model_store::{
    Engine, ImportRequest, MessageKey, SessionId, Stage, StoreError, TransferKind,
    TransferSession, TransferSnapshot, TransferState,
};
use serde::Serialize;
use tokio::sync::{Semaphore, broadcast};
use tracing::{error, info};

use crate::state::event_message;

const HISTORY_LEN: usize = 100;

//  Types

/// Status of one transfer, running or finished.
#[derive(Debug, Clone, Serialize)]
pub struct TransferReport {
    #[serde(flatten)]
    pub snapshot: TransferSnapshot,
    /// Set once the transfer has finished.
    pub message_key: Option<MessageKey>,
    pub error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TransferReport {
    fn running(snapshot: TransferSnapshot) -> Self {
        Self {
            snapshot,
            message_key: None,
            error: None,
            finished_at: None,
        }
    }
}

//  TransferManager

#[derive(Clone)]
pub struct TransferManager {
    engine: Arc<Engine>,
    permits: Arc<Semaphore>,
    event_tx: broadcast::Sender<String>,
    history: Arc<Mutex<VecDeque<TransferReport>>>,
}

impl TransferManager {
    pub fn new(engine: Arc<Engine>, max_concurrent: usize, event_tx: broadcast::Sender<String>) -> Self {
        Self {
            engine,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            event_tx,
            history: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Queue an import; returns as soon as the session is registered.
    pub fn start_import(&self, req: ImportRequest) -> SessionId {
        let session = self.engine.begin(TransferKind::Import, req.label());
        let id = session.id();
        self.spawn(session, move |engine, session, sink| {
            engine
                .import_with(session, &req, sink)
                .map(|record| serde_json::json!({ "model": record.name.short(), "id": record.id }))
        });
        id
    }

    /// Queue an export of `name` to `target`.
    pub fn start_export(&self, name: String, target: PathBuf) -> SessionId {
        let session = self.engine.begin(TransferKind::Export, name.clone());
        let id = session.id();
        self.spawn(session, move |engine, session, sink| {
            engine
                .export_with(session, &name, &target, sink)
                .map(|bytes| serde_json::json!({ "path": target, "bytes": bytes }))
        });
        id
    }

    fn spawn<F>(&self, session: Arc<TransferSession>, job: F)
    where
        F: FnOnce(&Engine, &TransferSession, &dyn model_store::ProgressSink) -> Result<serde_json::Value, StoreError>
            + Send
            + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = Arc::clone(&this.permits).acquire_owned().await else {
                return;
            };

            let engine = Arc::clone(&this.engine);
            let tx = this.event_tx.clone();
            let worker = Arc::clone(&session);
            let id = session.id();
            let joined = tokio::task::spawn_blocking(move || {
                let sink = move |processed: u64, total: u64| {
                    let _ = tx.send(event_message(
                        "transfer.progress",
                        serde_json::json!({ "id": id, "processed": processed, "total": total }),
                    ));
                };
                job(&*engine, &*worker, &sink)
            })
            .await;

            let result = joined.unwrap_or_else(|e| {
                error!(session = %id, error = %e, "transfer task panicked");
                // The engine never finished this session; retire it here.
                let stage = match session.state() {
                    TransferState::Verifying => Stage::Verifying,
                    TransferState::Committing => Stage::Committing,
                    _ => Stage::Staging,
                };
                session.set_state(TransferState::Failed);
                this.engine.sessions().remove(id);
                this.engine.manifests().release_blobs(&session.take_staged());
                let source = Box::new(StoreError::io(
                    PathBuf::new(),
                    std::io::Error::other(format!("transfer task failed: {e}")),
                ));
                let name = session.label().to_string();
                Err(match session.kind() {
                    TransferKind::Import => StoreError::ImportFailed { name, stage, source },
                    TransferKind::Export => StoreError::ExportFailed { name, source },
                })
            });
            this.finish(&session, result);
        });
    }

    fn finish(&self, session: &TransferSession, result: Result<serde_json::Value, StoreError>) {
        let (message_key, error, output) = match result {
            Ok(output) => (MessageKey::Success, None, Some(output)),
            Err(e) => (e.message_key(), Some(e.to_string()), None),
        };
        let report = TransferReport {
            snapshot: session.snapshot(),
            message_key: Some(message_key),
            error,
            finished_at: Some(Utc::now()),
        };
        info!(
            session = %report.snapshot.id,
            state = ?report.snapshot.state,
            message_key = message_key.as_str(),
            "transfer finished"
        );

        let _ = self.event_tx.send(event_message(
            "transfer.finished",
            serde_json::json!({ "report": &report, "output": output }),
        ));

        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        if history.len() == HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(report);
    }

    pub fn cancel(&self, id: SessionId) -> bool {
        self.engine.cancel(id)
    }

    /// A running session's live status, else its finished report.
    pub fn get(&self, id: SessionId) -> Option<TransferReport> {
        if let Some(session) = self.engine.sessions().get(id) {
            return Some(TransferReport::running(session.snapshot()));
        }
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .find(|r| r.snapshot.id == id)
            .cloned()
    }

    /// Running transfers first, then finished ones, newest last.
    pub fn list(&self) -> Vec<TransferReport> {
        let mut out: Vec<_> = self
            .engine
            .sessions()
            .snapshots()
            .into_iter()
            .map(TransferReport::running)
            .collect();
        out.extend(
            self.history
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .cloned(),
        );
        out
    }
}
