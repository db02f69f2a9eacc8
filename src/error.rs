use thiserror::Error;

/// Engine-wide error taxonomy.
///
/// Per-request failures (`BrokerRejected`, `Timeout`, `DataQuality`) are
/// handled locally by the stage that issued the request. `Transport` demotes
/// the connection supervisor; `Store` failures on the open-position path do
/// the same. `Invariant` violations terminate the process.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("broker rejected request {req_id} (code {code}): {message}")]
    BrokerRejected {
        req_id: u64,
        code: i32,
        message: String,
    },

    #[error("request {0} timed out")]
    Timeout(u64),

    #[error("data quality: {0}")]
    DataQuality(String),

    #[error("ticker extractor failure: {0}")]
    Extractor(String),

    #[error("trade store failure: {0}")]
    Store(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("request cancelled")]
    Cancelled,
}

impl EngineError {
    /// Process exit code for a fatal error surfacing out of the engine.
    ///
    /// 0 is reserved for a normal shutdown, 1 for configuration errors,
    /// 2 for unrecoverable broker failures, 3 for trade-store failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Config(_) => 1,
            EngineError::Store(_) => 3,
            _ => 2,
        }
    }

    /// Whether the error is expected to clear on reconnect.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transport(_) | EngineError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(EngineError::Config("bad yaml".into()).exit_code(), 1);
        assert_eq!(EngineError::Store("write failed".into()).exit_code(), 3);
        assert_eq!(EngineError::Transport("gone".into()).exit_code(), 2);
        assert_eq!(EngineError::Invariant("dup position".into()).exit_code(), 2);
        assert_eq!(
            EngineError::BrokerRejected {
                req_id: 7,
                code: 200,
                message: "no security definition".into(),
            }
            .exit_code(),
            2
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::Transport("lost".into()).is_transient());
        assert!(EngineError::Timeout(7).is_transient());
        assert!(!EngineError::Config("x".into()).is_transient());
        assert!(!EngineError::Store("x".into()).is_transient());
    }

    #[test]
    fn test_display_carries_request_context() {
        let err = EngineError::BrokerRejected {
            req_id: 104,
            code: 321,
            message: "invalid news source".into(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("104"));
        assert!(rendered.contains("321"));
    }
}
