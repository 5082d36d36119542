use thiserror::Error;

#[derive(Debug, Error)]
pub enum FuzzError {
    #[error("io error: {0}")]
    Io(String),
    #[error("file access error on {path}: {reason}")]
    FileAccess { path: String, reason: String },
    #[error("replay type tag mismatch at offset {offset}: expected {expected}, found {found}")]
    TagMismatch { expected: u8, found: u8, offset: u64 },
    #[error("log truncated mid-record at offset {offset}")]
    TruncatedLog { offset: u64 },
    #[error("unknown type tag {0}")]
    UnknownTag(u8),
    #[error("replayed {what} {value} outside the allowed range 0..={max}")]
    ReplayOutOfRange { what: &'static str, value: u64, max: u64 },
    #[error("depth limit {limit} exceeded while constructing {type_name}")]
    DepthLimit { type_name: String, limit: u32 },
    #[error("spin count {spins} for {type_name} exceeds spin limit {limit}")]
    SpinLimit {
        type_name: String,
        spins: u64,
        limit: u32,
    },
    #[error("no capability table registered for type {0}")]
    UnknownType(String),
    #[error("type {0} has no constructor invokers")]
    NoConstructor(String),
    #[error("invalid bounds: {0}")]
    InvalidBounds(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("database error: {0}")]
    Database(String),
}

impl FuzzError {
    pub fn file_access(path: impl AsRef<std::path::Path>, err: impl std::fmt::Display) -> Self {
        Self::FileAccess {
            path: path.as_ref().display().to_string(),
            reason: err.to_string(),
        }
    }

    /// Replay-integrity failures abort the session that hit them.
    pub fn is_replay_integrity(&self) -> bool {
        matches!(
            self,
            Self::TagMismatch { .. }
                | Self::TruncatedLog { .. }
                | Self::UnknownTag(_)
                | Self::ReplayOutOfRange { .. }
        )
    }

    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, Self::DepthLimit { .. } | Self::SpinLimit { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::FuzzError;

    #[test]
    fn taxonomy_helpers_classify_variants() {
        let mismatch = FuzzError::TagMismatch {
            expected: 4,
            found: 1,
            offset: 0,
        };
        assert!(mismatch.is_replay_integrity());
        assert!(!mismatch.is_resource_exhaustion());

        let depth = FuzzError::DepthLimit {
            type_name: "Node".to_string(),
            limit: 20,
        };
        assert!(depth.is_resource_exhaustion());
        assert!(!depth.is_replay_integrity());
    }

    #[test]
    fn file_access_error_names_the_path() {
        let err = FuzzError::file_access("/tmp/missing.log", "no such file");
        assert_eq!(
            err.to_string(),
            "file access error on /tmp/missing.log: no such file"
        );
    }
}
