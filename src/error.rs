// ===============================
// src/error.rs
// ===============================
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("malformed header line: {0}")]
    BadHeader(String),
    #[error("invalid escape sequence in header")]
    BadEscape,
    #[error("missing NUL terminator")]
    Unterminated,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("socket error: {0}")]
    Socket(String),
    #[error("broker error: {message}")]
    Broker { message: String, details: String },
    #[error("no heart-beat from broker for {0} ms")]
    HeartbeatTimeout(u64),
    #[error("transport closed before handshake completed")]
    ClosedDuringHandshake,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no credential available")]
    MissingCredential,
    #[error("credential rejected (HTTP {0})")]
    Unauthorized(u16),
    #[error("Failed to fetch portfolio analytics (HTTP {0})")]
    Status(u16),
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("bad url: {0}")]
    Url(#[from] url::ParseError),
}

impl FetchError {
    /// Errors that mean the local credential is unusable.
    pub fn is_auth(&self) -> bool {
        matches!(self, FetchError::MissingCredential | FetchError::Unauthorized(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}: invalid url: {source}")]
    Url { key: &'static str, source: url::ParseError },
    #[error("{key}: expected a number, got {value:?}")]
    Number { key: &'static str, value: String },
    #[error("missing portfolio id (set PORTFOLIO_ID or pass --portfolio-id)")]
    MissingPortfolio,
}
