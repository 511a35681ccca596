use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("failed to execute `{operation}`: {source}")]
    CommandExecution {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("`{operation}` failed: {stderr}")]
    CommandFailed {
        operation: &'static str,
        stderr: String,
    },

    #[error("`{operation}` timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },

    #[error("service already exists: {name}")]
    AlreadyExists { name: String },

    #[error("port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("not found: {id}")]
    NotFound { id: String },

    #[error("node unreachable: {node}: {reason}")]
    NodeUnreachable { node: String, reason: String },
}

impl Error {
    #[must_use]
    pub fn command_execution(operation: &'static str, source: std::io::Error) -> Self {
        Self::CommandExecution { operation, source }
    }

    #[must_use]
    pub fn command_failed(operation: &'static str, stderr: impl Into<String>) -> Self {
        Self::CommandFailed {
            operation,
            stderr: stderr.into(),
        }
    }

    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    #[must_use]
    pub fn node_unreachable(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NodeUnreachable {
            node: node.into(),
            reason: reason.into(),
        }
    }

    /// Conditions a caller may retry with fresh inputs (e.g. new ports).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PortInUse { .. } | Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
