// ===============================
// src/token.rs
// ===============================
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, warn};

/// Supplies the bearer credential on demand. Read at fetch time and at every
/// channel (re)connect, never cached by callers.
pub trait TokenSource: Send + Sync {
    fn current(&self) -> Option<String>;
    /// Forget the credential after the server rejected it.
    fn discard(&self);
}

/// In-memory credential (from `AUTH_TOKEN` or tests).
#[derive(Debug, Default)]
pub struct StaticTokenSource {
    token: RwLock<Option<String>>,
}

impl StaticTokenSource {
    pub fn new(token: Option<String>) -> Self {
        Self { token: RwLock::new(token.filter(|t| !t.trim().is_empty())) }
    }

    pub fn set(&self, token: Option<String>) {
        if let Ok(mut g) = self.token.write() {
            *g = token;
        }
    }
}

impl TokenSource for StaticTokenSource {
    fn current(&self) -> Option<String> {
        self.token.read().ok().and_then(|g| g.clone())
    }

    fn discard(&self) {
        self.set(None);
    }
}

/// Credential kept in a file written by the login flow. Re-read on every call
/// so a fresh login is picked up at the next reconnect.
#[derive(Debug, Clone)]
pub struct FileTokenSource {
    path: PathBuf,
}

impl FileTokenSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenSource for FileTokenSource {
    fn current(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(s) => Some(s.trim().to_string()).filter(|t| !t.is_empty()),
            Err(e) => {
                debug!(?e, path = %self.path.display(), "no token file");
                None
            }
        }
    }

    fn discard(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(?e, path = %self.path.display(), "failed to remove token file");
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

/// User identity from an unverified JWT payload: `email`, else `sub`.
/// Only used to address the private notification queue.
pub fn identity_from_jwt(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    claims.email.or(claims.sub).filter(|s| !s.is_empty())
}
