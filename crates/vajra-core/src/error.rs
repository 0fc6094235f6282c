use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum VajraError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Resource limit exceeded: {0}")]
    Resource(String),

    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("Task execution error: {0}")]
    TaskExecution(String),

    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("Duplicate task type registration: {0}")]
    DuplicateRegistration(String),

    #[error("Test not found: {0}")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Serialize for VajraError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
