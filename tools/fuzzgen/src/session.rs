//! Per-session state held by the protocol server.

use crate::engine::ValueEngine;
use crate::errors::FuzzError;
use crate::protocol::SessionId;
use crate::tree::{DecisionSignature, Node};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Active,
    /// Diverged from the recorded path. Still answers requests but never
    /// advances the cursor or labels the tree again.
    Aborted,
    Terminated,
}

pub fn validate_transition(from: SessionPhase, to: SessionPhase) -> Result<(), FuzzError> {
    use SessionPhase as P;

    let allowed = match from {
        P::Active => matches!(to, P::Aborted | P::Terminated),
        P::Aborted => matches!(to, P::Terminated),
        P::Terminated => false,
    };

    if !allowed {
        return Err(FuzzError::Protocol(format!(
            "illegal transition: {from:?} -> {to:?}"
        )));
    }
    Ok(())
}

pub struct Session {
    id: SessionId,
    phase: SessionPhase,
    cursor: Arc<Node>,
    engine: ValueEngine,
    values: u64,
    log_path: Option<PathBuf>,
    last_decision: Option<DecisionSignature>,
}

impl Session {
    pub fn new(
        id: SessionId,
        root: Arc<Node>,
        engine: ValueEngine,
        log_path: Option<PathBuf>,
    ) -> Self {
        Self {
            id,
            phase: SessionPhase::Active,
            cursor: root,
            engine,
            values: 0,
            log_path,
            last_decision: None,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn cursor(&self) -> &Arc<Node> {
        &self.cursor
    }

    pub fn values_served(&self) -> u64 {
        self.values
    }

    pub fn log_path(&self) -> Option<&PathBuf> {
        self.log_path.as_ref()
    }

    pub fn last_decision(&self) -> Option<DecisionSignature> {
        self.last_decision
    }

    pub fn engine_mut(&mut self) -> &mut ValueEngine {
        &mut self.engine
    }

    pub fn transition(&mut self, next: SessionPhase) -> Result<(), FuzzError> {
        validate_transition(self.phase, next)?;
        self.phase = next;
        Ok(())
    }

    /// Moves the cursor to `child` after serving `decision`.
    pub fn advance_to(&mut self, child: Arc<Node>, decision: DecisionSignature) {
        self.cursor = child;
        self.values += 1;
        self.last_decision = Some(decision);
    }

    /// Flushes the session's value log and releases it.
    pub fn close(self) -> Result<u64, FuzzError> {
        let stats = self.engine.finish()?;
        Ok(stats.decisions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_validator_rejects_leaving_terminated() {
        validate_transition(SessionPhase::Active, SessionPhase::Aborted).expect("abort");
        validate_transition(SessionPhase::Aborted, SessionPhase::Terminated).expect("end");
        let err = validate_transition(SessionPhase::Terminated, SessionPhase::Active)
            .expect_err("must reject");
        assert!(matches!(err, FuzzError::Protocol(message) if message.contains("illegal transition")));
        assert!(validate_transition(SessionPhase::Aborted, SessionPhase::Active).is_err());
    }
}
