use {codehost_common::FromMessage, thiserror::Error};

#[derive(Debug, Error)]
pub enum Error {
    /// A required operational setting is missing. Never retried.
    #[error("missing required configuration key `{key}`")]
    Configuration { key: &'static str },

    #[error(transparent)]
    Swarm(#[from] codehost_swarm::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("failed to hash code host password: {0}")]
    PasswordHash(#[from] bcrypt::BcryptError),

    #[error("invalid username: {username:?}")]
    InvalidUsername { username: String },

    #[error("no free port left in {start}..={end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error("service {service_id} is missing label `{key}`")]
    MalformedService { service_id: String, key: String },

    /// Creation failed. The detail is logged; callers show the generic text.
    #[error("failed to start code host")]
    StartFailed {
        username: String,
        #[source]
        source: Box<Error>,
    },

    #[error("code host startup timed out")]
    StartupTimedOut { username: String, timeout_secs: u64 },

    /// The slugged service name belongs to another user's host.
    #[error("code host name {service_name} is taken by another user")]
    NameTaken {
        service_name: String,
        owner: Option<i64>,
    },

    #[error("code host not found: {key}")]
    NotFound { key: String },

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn configuration(key: &'static str) -> Self {
        Self::Configuration { key }
    }

    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    #[must_use]
    pub fn start_failed(username: impl Into<String>, source: Error) -> Self {
        Self::StartFailed {
            username: username.into(),
            source: Box::new(source),
        }
    }

    #[must_use]
    pub fn name_taken(service_name: impl Into<String>, owner: Option<i64>) -> Self {
        Self::NameTaken {
            service_name: service_name.into(),
            owner,
        }
    }

    /// The orchestrator no longer knows the service.
    #[must_use]
    pub fn is_service_gone(&self) -> bool {
        matches!(self, Self::Swarm(codehost_swarm::Error::NotFound { .. }))
    }

    #[must_use]
    pub fn malformed_service(service_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self::MalformedService {
            service_id: service_id.into(),
            key: key.into(),
        }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

codehost_common::impl_context!();

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_facing_messages_hide_the_cause() {
        let err = Error::start_failed("alice", Error::configuration("hosts.network"));
        assert_eq!(err.to_string(), "failed to start code host");
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("hosts.network"));

        let err = Error::StartupTimedOut {
            username: "alice".into(),
            timeout_secs: 60,
        };
        assert_eq!(err.to_string(), "code host startup timed out");
    }

    #[test]
    fn only_orchestrator_not_found_means_gone() {
        assert!(Error::from(codehost_swarm::Error::not_found("svc1")).is_service_gone());
        assert!(!Error::not_found("alice").is_service_gone());
        assert!(!Error::configuration("hosts.network").is_service_gone());
    }

    #[test]
    fn context_wraps_foreign_errors() {
        let res: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::other("disk on fire"));
        let err = res.context("reading workspace").unwrap_err();
        assert_eq!(err.to_string(), "reading workspace: disk on fire");
    }
}
