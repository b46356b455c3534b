use thiserror::Error;

#[derive(Error, Debug)]
pub enum AntError {
    /// The caller's cancellation token fired before a result was available.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("{0}")]
    AlreadyStopped(String),

    #[error("failed to execute command '{command}' exit-code={exit_code}")]
    CommandFailed { command: String, exit_code: i32 },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Docker error: {0}")]
    Docker(String),

    #[error("Kubernetes error: {0}")]
    Kubernetes(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{}", .0.join("; "))]
    Multiple(Vec<String>),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl AntError {
    /// True when the operation never finished because it was cancelled or timed out.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, AntError::DeadlineExceeded)
    }

    /// Transient backend conditions that callers may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        let msg = self.to_string();
        msg.contains("try again") || msg.contains("volume is in use")
    }

    /// Collapses a list of teardown errors into one, or `Ok` when empty.
    pub fn aggregate(mut errors: Vec<AntError>) -> Result<(), AntError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(AntError::Multiple(
                errors.iter().map(|e| e.to_string()).collect(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_distinct() {
        assert!(AntError::DeadlineExceeded.is_cancellation());
        assert!(!AntError::CommandFailed {
            command: "ls".into(),
            exit_code: 2
        }
        .is_cancellation());
    }

    #[test]
    fn test_command_failed_message() {
        let err = AntError::CommandFailed {
            command: "blah".into(),
            exit_code: 127,
        };
        assert_eq!(err.to_string(), "failed to execute command 'blah' exit-code=127");
    }

    #[test]
    fn test_aggregate() {
        assert!(AntError::aggregate(vec![]).is_ok());
        let err = AntError::aggregate(vec![
            AntError::Docker("stop failed".into()),
            AntError::Docker("volume is in use".into()),
        ])
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Docker error: stop failed; Docker error: volume is in use"
        );
        assert!(err.is_retryable());
    }
}
