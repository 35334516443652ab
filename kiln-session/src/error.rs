use thiserror::Error;

/// Error types for kiln-session domain operations.
/// These are used by both the library and binary crates.
#[derive(Error, Debug)]
pub enum KilnError {
    #[error("Invalid {kind} value: '{value}'")]
    InvalidValue { kind: &'static str, value: String },

    #[error("Invalid {entity} transition: cannot go from '{from}' to '{to}'")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Feature '{0}' not found")]
    FeatureNotFound(String),

    #[error("Task {0} not found")]
    TaskNotFound(i64),

    #[error("Config file not found at {0}")]
    ConfigNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, KilnError>;

impl KilnError {
    pub(crate) fn invalid(kind: &'static str, value: &str) -> Self {
        KilnError::InvalidValue {
            kind,
            value: value.to_string(),
        }
    }
}
