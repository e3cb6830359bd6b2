use thiserror::Error;

use crate::operations::RequestId;

/// Main error type for the Searchlight system
#[derive(Error, Debug)]
pub enum SlError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Searcher error: {0}")]
    Searcher(#[from] SearcherError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Search space error: {0}")]
    Space(#[from] SpaceError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Configuration errors, raised before a search method is constructed
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no searcher type specified")]
    NoSearcherVariant,

    #[error("exactly one searcher type must be specified, found: {}", variants.join(", "))]
    MultipleSearcherVariants { variants: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("grid divisions missing for hyperparameter: {name}")]
    MissingGridDivisions { name: String },
}

/// Errors raised while a search method handles lifecycle events
#[derive(Error, Debug)]
pub enum SearcherError {
    #[error("unknown request id: {request_id}")]
    UnknownRequest { request_id: RequestId },

    #[error("request {request_id} was already closed")]
    AlreadyClosed { request_id: RequestId },

    #[error("request {request_id} already reported a validation at rung {rung}")]
    DuplicateValidation { request_id: RequestId, rung: usize },

    #[error("metric not found in validation results: {metric}")]
    MetricNotFound { metric: String },

    #[error("metric {metric} is not a finite number: {value}")]
    InvalidMetric { metric: String, value: f64 },

    #[error("initial operations were already requested")]
    AlreadyInitialized,

    #[error("search already shut down; no further events accepted")]
    AlreadyShutdown,
}

/// Snapshot and restore errors
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("unsupported snapshot version for {method}: found {found}, expected {expected}")]
    UnsupportedVersion {
        method: String,
        found: u32,
        expected: u32,
    },

    #[error("snapshot method mismatch: expected {expected}, found {found}")]
    MethodMismatch { expected: String, found: String },

    #[error("missing snapshot state for {method}")]
    MissingState { method: String },

    #[error("{method} is stateless and cannot restore a snapshot")]
    UnexpectedState { method: String },
}

/// Search space errors
#[derive(Error, Debug)]
pub enum SpaceError {
    #[error("invalid range for {name}: low {low} is greater than high {high}")]
    InvalidRange { name: String, low: f64, high: f64 },

    #[error("invalid log-uniform range for {name}: bounds must be positive")]
    InvalidLogRange { name: String },

    #[error("categorical hyperparameter {name} has no choices")]
    EmptyChoices { name: String },

    #[error("duplicate hyperparameter name: {name}")]
    DuplicateName { name: String },
}

/// Result type alias for Searchlight operations
pub type SlResult<T> = Result<T, SlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = SnapshotError::UnsupportedVersion {
            method: "asha".to_string(),
            found: 7,
            expected: 1,
        };

        assert!(error.to_string().contains("unsupported snapshot version"));
        assert!(error.to_string().contains("asha"));
        assert!(error.to_string().contains('7'));
    }

    #[test]
    fn test_multiple_variants_lists_names() {
        let error = ConfigError::MultipleSearcherVariants {
            variants: vec!["random".to_string(), "grid".to_string()],
        };
        assert!(error.to_string().contains("random, grid"));
    }

    #[test]
    fn test_error_conversion() {
        let searcher_error = SearcherError::MetricNotFound {
            metric: "loss".to_string(),
        };
        let sl_error: SlError = searcher_error.into();

        match sl_error {
            SlError::Searcher(_) => (),
            _ => panic!("Expected Searcher error"),
        }
    }
}
