use thiserror::Error;

/// Central error type surfaced at the binary boundary. Crate-local error
/// enums (`DiscoveryError`, `OAuthError`, `CoordinationError`,
/// `TransportError`) convert into this one via `#[from]`, preserving the
/// inner error's `Display` text rather than re-wording it.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("metadata discovery failed: {source}")]
    DiscoveryFailure {
        #[source]
        source: Box<Error>,
    },

    #[error("remote has no registration_endpoint and no stored client_info")]
    RegistrationUnsupported,

    #[error("http error: {status} {body}")]
    Http { status: u16, body: String },

    #[error("malformed OAuth-related JSON: {0}")]
    OAuthParse(String),

    #[error("authorization wait timed out after 5 minutes")]
    AuthTimeout,

    #[error("file lock on {path} could not be acquired within {timeout_ms}ms")]
    LockTimeout { path: String, timeout_ms: u64 },

    #[error("operation requires a prior connect")]
    NotConnected,

    #[error("peer closed the session")]
    SessionTerminated,

    #[error("operation cancelled")]
    Cancelled,

    #[error("a follower instance attempted an owner-only operation")]
    UnexpectedFollowerCall,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http transport error: {0}")]
    Reqwest(#[from] reqwest::Error),
}

impl Error {
    pub fn discovery(source: Error) -> Self {
        Error::DiscoveryFailure {
            source: Box::new(source),
        }
    }

    /// True for errors that the proxy's single automatic reauth-and-retry
    /// policy should treat as "not retryable again".
    pub fn is_fatal_transport(&self) -> bool {
        matches!(
            self,
            Error::SessionTerminated | Error::NotConnected | Error::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
