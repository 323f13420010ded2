use thiserror::Error;

/// Boxed cause for failures raised by user-supplied delegate or script code.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// Core error type for engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The operation is not applicable to the token/instance in its current
    /// runtime state (ended, locked, suspended, join not satisfied, ...).
    #[error("Invalid state: {0}")]
    State(String),

    /// The process graph or a request against it is malformed (ambiguous
    /// signal, unmatched decision result, missing node or transition).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// User-supplied code failed; the original error is preserved as cause.
    #[error("Delegation error in {context}: {source}")]
    Delegation {
        context: String,
        #[source]
        source: BoxedError,
    },

    /// Optimistic version check failed: another transaction won the race.
    #[error("Stale {entity} {id}: concurrent update detected")]
    Conflict { entity: &'static str, id: String },

    #[error("Not found: {entity} {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict { .. })
    }

    /// Store-level failures force rollback of the whole unit of work;
    /// everything else is a business failure captured on the job.
    pub fn is_storage_related(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict { .. } | EngineError::NotFound { .. } | EngineError::Storage(_)
        )
    }

    pub fn delegation(context: impl Into<String>, source: impl Into<BoxedError>) -> Self {
        EngineError::Delegation {
            context: context.into(),
            source: source.into(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Configuration(format!("JSON error: {}", e))
    }
}

/// Result type alias using EngineError.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Render an error and its cause chain into one text block, the form
/// recorded on a failed job row.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut cause = err.source();
    while let Some(c) = cause {
        out.push_str("\ncaused by: ");
        out.push_str(&c.to_string());
        cause = c.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delegation_preserves_cause() {
        let cause: BoxedError = "disk on fire".into();
        let err = EngineError::delegation("action 'notify'", cause);
        let rendered = error_chain(&err);
        assert!(rendered.contains("action 'notify'"));
        assert!(rendered.contains("caused by: disk on fire"));
    }

    #[test]
    fn test_storage_classification() {
        assert!(EngineError::Conflict {
            entity: "job",
            id: "42".into()
        }
        .is_storage_related());
        assert!(EngineError::Storage("io".into()).is_storage_related());
        assert!(!EngineError::State("ended".into()).is_storage_related());
        assert!(!EngineError::Configuration("bad".into()).is_conflict());
    }
}
