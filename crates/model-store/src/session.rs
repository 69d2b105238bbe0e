//! Transfer sessions: per-operation state for one import or export.
//!
//! A session moves `Staging → Verifying → Committing → Done`; any of the
//! first three can end in `Failed` or `Cancelled`. Cancellation is a flag
//! the engine polls between blob operations.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::digest::Digest;
use crate::error::{Result, StoreError};

//  Types

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Import,
    Export,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Staging,
    Verifying,
    Committing,
    Done,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Done | TransferState::Failed | TransferState::Cancelled
        )
    }
}

/// Receives `(processed_bytes, total_bytes)` updates.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, processed: u64, total: u64);
}

impl<F> ProgressSink for F
where
    F: Fn(u64, u64) + Send + Sync,
{
    fn progress(&self, processed: u64, total: u64) {
        self(processed, total)
    }
}

/// Serialisable point-in-time view of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSnapshot {
    pub id: SessionId,
    pub kind: TransferKind,
    pub label: String,
    pub state: TransferState,
    pub processed: u64,
    pub total: u64,
    pub started_at: DateTime<Utc>,
}

//  TransferSession

pub struct TransferSession {
    id: SessionId,
    kind: TransferKind,
    label: String,
    started_at: DateTime<Utc>,
    state: RwLock<TransferState>,
    cancel: AtomicBool,
    processed: AtomicU64,
    total: AtomicU64,
    staged: Mutex<Vec<Digest>>,
}

impl TransferSession {
    pub fn new(kind: TransferKind, label: impl Into<String>) -> Self {
        Self {
            id: SessionId::new(),
            kind,
            label: label.into(),
            started_at: Utc::now(),
            state: RwLock::new(TransferState::Staging),
            cancel: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            total: AtomicU64::new(0),
            staged: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> TransferState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `next`. Terminal states are absorbing.
    pub fn set_state(&self, next: TransferState) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if !state.is_terminal() {
            *state = next;
        }
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation has been requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(StoreError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
    }

    /// Add `bytes` to the processed counter and notify `sink` if it moved.
    pub fn advance(&self, bytes: u64, sink: &dyn ProgressSink) {
        if bytes == 0 {
            return;
        }
        let processed = self.processed.fetch_add(bytes, Ordering::SeqCst) + bytes;
        sink.progress(processed, self.total.load(Ordering::SeqCst));
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    fn staged(&self) -> MutexGuard<'_, Vec<Digest>> {
        self.staged.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a blob reference taken on behalf of this session.
    pub fn stage(&self, digest: Digest) {
        self.staged().push(digest);
    }

    /// Hand over every staged reference (to a manifest, or to cleanup).
    pub fn take_staged(&self) -> Vec<Digest> {
        std::mem::take(&mut *self.staged())
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            id: self.id,
            kind: self.kind,
            label: self.label.clone(),
            state: self.state(),
            processed: self.processed(),
            total: self.total.load(Ordering::SeqCst),
            started_at: self.started_at,
        }
    }
}

//  SessionRegistry

/// Running sessions, reachable by id for cancellation and status.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<TransferSession>>>,
}

impl SessionRegistry {
    pub fn insert(&self, session: Arc<TransferSession>) {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session.id(), session);
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<TransferSession>> {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<TransferSession>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// Request cancellation. Returns `false` if no such session is running.
    pub fn cancel(&self, id: SessionId) -> bool {
        match self.get(id) {
            Some(session) => {
                session.cancel();
                true
            }
            None => false,
        }
    }

    pub fn snapshots(&self) -> Vec<TransferSnapshot> {
        let mut out: Vec<_> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|s| s.snapshot())
            .collect();
        out.sort_by_key(|s| s.started_at);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_only_moves_forward() {
        let seen = Mutex::new(Vec::new());
        let sink = |p: u64, t: u64| seen.lock().unwrap().push((p, t));
        let s = TransferSession::new(TransferKind::Import, "demo");
        s.set_total(10);
        s.advance(4, &sink);
        s.advance(0, &sink);
        s.advance(6, &sink);
        assert_eq!(*seen.lock().unwrap(), vec![(4, 10), (10, 10)]);
    }

    #[test]
    fn terminal_state_is_absorbing() {
        let s = TransferSession::new(TransferKind::Export, "demo");
        s.set_state(TransferState::Verifying);
        s.set_state(TransferState::Cancelled);
        s.set_state(TransferState::Done);
        assert_eq!(s.state(), TransferState::Cancelled);
    }

    #[test]
    fn registry_cancel_reaches_session() {
        let reg = SessionRegistry::default();
        let s = Arc::new(TransferSession::new(TransferKind::Import, "demo"));
        reg.insert(Arc::clone(&s));
        assert!(s.checkpoint().is_ok());
        assert!(reg.cancel(s.id()));
        assert!(matches!(s.checkpoint(), Err(StoreError::Cancelled)));

        reg.remove(s.id());
        assert!(!reg.cancel(s.id()));
        assert!(reg.snapshots().is_empty());
    }

    #[test]
    fn session_ids_round_trip_through_strings() {
        let id = SessionId::new();
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
    }
}
