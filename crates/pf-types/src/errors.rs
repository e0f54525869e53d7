use thiserror::Error;

/// Main error type for the ParamForge system
#[derive(Error, Debug)]
pub enum PfError {
    #[error("Invalid parameter spec: {0}")]
    InvalidParameterSpec(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Persistence-related errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Study not found: {name}")]
    UnknownStudy { name: String },

    #[error("Study record corrupt: {message}")]
    Corrupt { message: String },

    #[error(
        "Study '{name}' was created with direction {stored}, cannot resume with {requested}"
    )]
    DirectionMismatch {
        name: String,
        stored: String,
        requested: String,
    },

    #[error("Store IO failure: {message}")]
    Io { message: String },

    #[error("Trial serialization failed: {message}")]
    Serialization { message: String },
}

/// Error raised by an objective during a single trial.
///
/// Neither variant ever escapes a study run: `Pruned` becomes a PRUNED trial
/// record, everything else becomes a FAILED record with a direction-aware
/// sentinel score.
#[derive(Error, Debug)]
pub enum ObjectiveError {
    #[error("trial pruned at step {step}")]
    Pruned { step: u64 },

    #[error("{0}")]
    Failed(String),
}

impl ObjectiveError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<String> for ObjectiveError {
    fn from(message: String) -> Self {
        Self::Failed(message)
    }
}

impl From<&str> for ObjectiveError {
    fn from(message: &str) -> Self {
        Self::Failed(message.to_string())
    }
}

/// Result type alias for ParamForge operations
pub type PfResult<T> = Result<T, PfError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = StoreError::DirectionMismatch {
            name: "momentum_sweep".to_string(),
            stored: "maximize".to_string(),
            requested: "minimize".to_string(),
        };

        assert!(error.to_string().contains("momentum_sweep"));
        assert!(error.to_string().contains("maximize"));
        assert!(error.to_string().contains("minimize"));
    }

    #[test]
    fn test_error_conversion() {
        let store_error = StoreError::UnknownStudy {
            name: "missing".to_string(),
        };
        let pf_error: PfError = store_error.into();

        match pf_error {
            PfError::Store(_) => (),
            _ => panic!("Expected Store error"),
        }
    }

    #[test]
    fn objective_error_from_str() {
        let err: ObjectiveError = "backtest blew up".into();
        assert!(matches!(err, ObjectiveError::Failed(_)));
        assert_eq!(err.to_string(), "backtest blew up");
    }
}
