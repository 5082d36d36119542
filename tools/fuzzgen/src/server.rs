//! Protocol server: sessions, the shared execution tree, and one value engine
//! per session.
//!
//! [`ProtocolServer::handle`] is transport agnostic; it takes the parts of one
//! request and always produces a response. Requests of one session are
//! serialized by that session's mutex; distinct sessions only meet inside the
//! tree, which locks per node.

use crate::codec::LogWriter;
use crate::config::{AppConfig, EngineConfig, ServerConfig};
use crate::engine::ValueEngine;
use crate::errors::FuzzError;
use crate::log_retention::enforce_total_budget;
use crate::logging::{JsonlLogger, LogEvent};
use crate::protocol::{parse_request, Request, Response, SessionId, Status};
use crate::registry::CapabilityRegistry;
use crate::session::{Session, SessionPhase};
use crate::tree::{Claim, DecisionSignature, ExecutionTree, Node};
use crate::tree_store::TreeStore;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

type SessionHandle = Arc<Mutex<Session>>;

pub struct ProtocolServer {
    tree: Arc<ExecutionTree>,
    registry: Arc<CapabilityRegistry>,
    engine_config: EngineConfig,
    config: ServerConfig,
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    store: Option<TreeStore>,
    events: Option<JsonlLogger>,
    opened: AtomicU64,
    terminations: AtomicU64,
}

fn guard<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Seed of a session's sampling stream: the first 8 bytes of
/// `sha256(server_seed LE || session id)`.
pub fn session_seed(server_seed: u64, session: &SessionId) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(server_seed.to_le_bytes());
    hasher.update(session.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

impl ProtocolServer {
    pub fn new(
        tree: Arc<ExecutionTree>,
        registry: Arc<CapabilityRegistry>,
        engine_config: &EngineConfig,
        config: &ServerConfig,
    ) -> Self {
        Self {
            tree,
            registry,
            engine_config: engine_config.clone(),
            config: config.clone(),
            sessions: Mutex::new(HashMap::new()),
            store: None,
            events: None,
            opened: AtomicU64::new(0),
            terminations: AtomicU64::new(0),
        }
    }

    /// Builds a server from a loaded config. With a tree store configured the
    /// stored tree is loaded and snapshots go back to the same file.
    pub fn from_config(
        config: &AppConfig,
        registry: Arc<CapabilityRegistry>,
    ) -> Result<Self, FuzzError> {
        let (tree, store) = match &config.tree.store_path {
            Some(path) => {
                let store = TreeStore::open(path)?;
                let tree = store.load()?;
                info!(
                    store = %path.display(),
                    nodes = tree.node_count(),
                    "loaded execution tree"
                );
                (tree, Some(store))
            }
            None => (ExecutionTree::new(), None),
        };
        let mut server = Self::new(Arc::new(tree), registry, &config.engine, &config.server);
        server.store = store;
        server.events = config.logging.events_path.as_ref().map(JsonlLogger::new);
        Ok(server)
    }

    pub fn with_store(mut self, store: TreeStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_events(mut self, events: JsonlLogger) -> Self {
        self.events = Some(events);
        self
    }

    pub fn tree(&self) -> &Arc<ExecutionTree> {
        &self.tree
    }

    pub fn session_count(&self) -> usize {
        guard(&self.sessions).len()
    }

    pub fn terminations(&self) -> u64 {
        self.terminations.load(Ordering::Relaxed)
    }

    /// Current tree position of a live session.
    pub fn cursor_of(&self, session: &SessionId) -> Option<Arc<Node>> {
        let handle = guard(&self.sessions).get(session).cloned()?;
        let cursor = Arc::clone(guard(&handle).cursor());
        Some(cursor)
    }

    pub fn phase_of(&self, session: &SessionId) -> Option<SessionPhase> {
        let handle = guard(&self.sessions).get(session).cloned()?;
        let phase = guard(&handle).phase();
        Some(phase)
    }

    pub fn handle(&self, parts: &[Vec<u8>]) -> Response {
        let request = match parse_request(parts) {
            Ok(request) => request,
            Err(err) => {
                debug!(status = %err.status(), reason = %err, "rejected request");
                return Response::error(err.status());
            }
        };
        match request {
            Request::Terminate { session, success } => self.terminate(session, success),
            Request::Value { session, decision } => self.serve_value(session, decision),
        }
    }

    fn serve_value(&self, id: SessionId, decision: DecisionSignature) -> Response {
        let handle = match self.session(&id) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(session = %id, error = %err, "could not open session");
                return Response::error(Status::ErrInternal);
            }
        };
        let mut session = guard(&handle);
        if session.phase() != SessionPhase::Active {
            return Response::error(Status::ErrWrongValueId);
        }

        let cursor = Arc::clone(session.cursor());
        let claim = self
            .tree
            .claim_decision(&cursor, decision, self.config.strict_decisions);
        if let Claim::Conflict { recorded } = claim {
            warn!(
                session = %id,
                depth = cursor.depth(),
                recorded = recorded.decision_id,
                requested = decision.decision_id,
                "decision diverges from recorded path, aborting session"
            );
            if let Err(err) = session.transition(SessionPhase::Aborted) {
                warn!(session = %id, error = %err, "abort failed");
            }
            self.emit(LogEvent::warn(
                "session_aborted",
                json!({
                    "session": id.to_string(),
                    "depth": cursor.depth(),
                    "recorded_decision_id": recorded.decision_id,
                    "requested_decision_id": decision.decision_id,
                    "last_served_decision_id": session.last_decision().map(|d| d.decision_id),
                }),
            ));
            return Response::error(Status::ErrWrongValueId);
        }

        let value = match session.engine_mut().between_scalar(
            decision.lo.to_scalar(),
            decision.hi.to_scalar(),
            decision.decision_id,
        ) {
            Ok(value) => value.to_raw(),
            Err(err) => {
                warn!(session = %id, error = %err, "value generation failed");
                if claim == Claim::Recorded {
                    self.tree.release_claim(&cursor, decision);
                }
                return Response::error(Status::ErrInternal);
            }
        };
        let child = self.tree.advance(&cursor, decision.decision_id, value);
        session.advance_to(child, decision);
        Response::value(value)
    }

    fn terminate(&self, id: SessionId, success: bool) -> Response {
        let handle = guard(&self.sessions).remove(&id);
        let Some(handle) = handle else {
            // Never asked for a value, so it ended at the root.
            self.tree.mark_outcome(&self.tree.root(), success);
            self.after_termination(&id, success, 0, 0, true, None);
            return Response::terminal(success);
        };

        let session = match Arc::try_unwrap(handle) {
            Ok(mutex) => mutex.into_inner().unwrap_or_else(PoisonError::into_inner),
            Err(shared) => {
                // A request of the same session is still in flight; wait for it.
                let mut session = guard(&shared);
                return self.terminate_in_place(&mut session, success);
            }
        };
        self.finish_session(session, success)
    }

    fn terminate_in_place(&self, session: &mut Session, success: bool) -> Response {
        let labelled = self.label(session, success);
        if let Err(err) = session.transition(SessionPhase::Terminated) {
            warn!(session = %session.id(), error = %err, "terminate failed");
        }
        self.after_termination(
            session.id(),
            success,
            session.values_served(),
            session.cursor().depth(),
            labelled,
            session.log_path().cloned(),
        );
        Response::terminal(success)
    }

    fn finish_session(&self, mut session: Session, success: bool) -> Response {
        let labelled = self.label(&session, success);
        if let Err(err) = session.transition(SessionPhase::Terminated) {
            warn!(session = %session.id(), error = %err, "terminate failed");
        }
        let id = session.id().clone();
        let values = session.values_served();
        let depth = session.cursor().depth();
        let log_path = session.log_path().cloned();
        if let Err(err) = session.close() {
            warn!(session = %id, error = %err, "closing session log failed");
        }
        self.after_termination(&id, success, values, depth, labelled, log_path);
        Response::terminal(success)
    }

    /// Writes the outcome unless the session was aborted. Returns whether the
    /// tree was labelled.
    fn label(&self, session: &Session, success: bool) -> bool {
        if session.phase() == SessionPhase::Aborted {
            debug!(session = %session.id(), "aborted session terminated without labelling");
            return false;
        }
        self.tree.mark_outcome(session.cursor(), success);
        true
    }

    fn after_termination(
        &self,
        id: &SessionId,
        success: bool,
        values: u64,
        depth: usize,
        labelled: bool,
        log_path: Option<PathBuf>,
    ) {
        let count = self.terminations.fetch_add(1, Ordering::Relaxed) + 1;
        info!(session = %id, success, values, depth, labelled, "session terminated");
        self.emit(LogEvent::info(
            "session_terminated",
            json!({
                "session": id.to_string(),
                "success": success,
                "values": values,
                "depth": depth,
                "labelled": labelled,
                "log": log_path.as_ref().map(|p| p.display().to_string()),
            }),
        ));

        if let Some(dir) = &self.config.session_log_dir {
            match enforce_total_budget(dir, self.config.session_log_budget_bytes, None) {
                Ok(deleted) if !deleted.is_empty() => {
                    debug!(deleted = deleted.len(), "pruned session logs");
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "session log retention failed"),
            }
        }

        if self.config.snapshot_every > 0 && count % self.config.snapshot_every == 0 {
            if let Err(err) = self.snapshot() {
                warn!(error = %err, "tree snapshot failed");
            }
        }
    }

    /// Saves the tree to the configured store. Returns the number of nodes
    /// written, or `None` without a store.
    pub fn snapshot(&self) -> Result<Option<usize>, FuzzError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let nodes = store.save(&self.tree)?;
        info!(nodes, store = %store.db_path().display(), "tree snapshot written");
        self.emit(LogEvent::info(
            "tree_snapshot",
            json!({ "nodes": nodes, "longest_path": self.tree.longest_path() }),
        ));
        Ok(Some(nodes))
    }

    /// Finds the session, starting a fresh one at the root if needed.
    /// The session log is opened outside the table lock; if another request
    /// for the same id got there first, the fresh session is discarded.
    fn session(&self, id: &SessionId) -> Result<SessionHandle, FuzzError> {
        if let Some(handle) = guard(&self.sessions).get(id) {
            return Ok(Arc::clone(handle));
        }
        let fresh = Arc::new(Mutex::new(self.open_session(id)?));
        let handle = Arc::clone(
            guard(&self.sessions)
                .entry(id.clone())
                .or_insert_with(|| Arc::clone(&fresh)),
        );
        if !Arc::ptr_eq(&handle, &fresh) {
            self.discard_session(fresh);
        }
        Ok(handle)
    }

    fn discard_session(&self, fresh: SessionHandle) {
        let session = match Arc::try_unwrap(fresh) {
            Ok(mutex) => mutex.into_inner().unwrap_or_else(PoisonError::into_inner),
            Err(_) => return,
        };
        let id = session.id().clone();
        let log_path = session.log_path().cloned();
        if let Err(err) = session.close() {
            warn!(session = %id, error = %err, "closing discarded session failed");
        }
        if let Some(path) = log_path {
            if let Err(err) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %err, "could not remove unused session log");
            }
        }
    }

    fn open_session(&self, id: &SessionId) -> Result<Session, FuzzError> {
        let seq = self.opened.fetch_add(1, Ordering::Relaxed);
        let (log, log_path) = match &self.config.session_log_dir {
            Some(dir) => {
                let path = dir.join(format!("{seq:06}-{}.log", hex(id.as_bytes())));
                (LogWriter::create(&path)?.boxed(), Some(path))
            }
            None => {
                let sink: Box<dyn Write + Send> = Box::new(std::io::sink());
                (LogWriter::new(sink, "discard"), None)
            }
        };
        let config = EngineConfig {
            seed: Some(session_seed(self.config.seed, id)),
            ..self.engine_config.clone()
        };
        let engine = ValueEngine::generate(&config, Arc::clone(&self.registry), log);
        debug!(session = %id, "session opened");
        Ok(Session::new(id.clone(), self.tree.root(), engine, log_path))
    }

    fn emit(&self, event: LogEvent<'_>) {
        if let Some(events) = &self.events {
            if let Err(err) = events.append(&event) {
                warn!(error = %err, "could not append run event");
            }
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
