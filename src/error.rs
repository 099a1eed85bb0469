use std::path::PathBuf;

/// Errors arising from config discovery, parsing, merging, and context
/// resolution. Each variant is a matchable sentinel; handlers map them to
/// stable envelope codes.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("unsupported config format: {path} (expected .json, .yaml, or .yml)")]
    UnsupportedFormat { path: PathBuf },

    #[error("config defines no contexts")]
    NoContexts,

    #[error("config defines no clients")]
    NoClients,

    #[error("context '{id}' not found")]
    ContextNotFound { id: String },

    #[error("search template '{name}' not found")]
    UnknownSearch { name: String },

    #[error("client '{name}' not found")]
    UnknownClient { name: String },

    #[error("unknown client type '{client_type}'")]
    UnknownClientType { client_type: String },

    #[error("missing required variable '{name}': {description}")]
    MissingRequiredVariable { name: String, description: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors in the shape of a request, caught before any backend is touched.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("invalid search: {0}")]
    InvalidSearch(String),

    #[error("invalid page token '{0}'")]
    InvalidPageToken(String),
}

/// Errors surfaced by a backend adapter. The engine never retries these;
/// callers decide. CloudWatch throttling is retried internally before it
/// becomes `Timeout`.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend timed out: {0}")]
    Timeout(String),

    #[error("backend rejected the request (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("backend error: {0}")]
    Internal(String),

    #[error("canceled")]
    Canceled,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Search(#[from] SearchError),
}

impl BackendError {
    /// Classify a reqwest failure into the taxonomy.
    pub fn from_http(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout(err.to_string())
        } else if err.is_connect() {
            BackendError::Unavailable(err.to_string())
        } else {
            BackendError::Internal(err.to_string())
        }
    }

    /// Classify an HTTP response status: 4xx is a rejection, 5xx internal.
    pub fn from_status(status: u16, body: String) -> Self {
        if (400..500).contains(&status) {
            BackendError::Rejected { status, body }
        } else {
            BackendError::Internal(format!("status {status}: {body}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        match BackendError::from_status(404, "missing".into()) {
            BackendError::Rejected { status, .. } => assert_eq!(status, 404),
            other => panic!("expected Rejected, got {other:?}"),
        }
        match BackendError::from_status(502, "bad gateway".into()) {
            BackendError::Internal(msg) => assert!(msg.contains("502")),
            other => panic!("expected Internal, got {other:?}"),
        }
    }

    #[test]
    fn sentinel_messages_carry_identifiers() {
        let err = ConfigError::ContextNotFound { id: "prod-api".into() };
        assert!(err.to_string().contains("prod-api"));

        let err = ConfigError::MissingRequiredVariable {
            name: "sessionId".into(),
            description: "the session to inspect".into(),
        };
        assert!(err.to_string().contains("sessionId"));
    }
}
