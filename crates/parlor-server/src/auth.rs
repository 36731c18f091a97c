//! Credential verification.
//!
//! The platform's account service owns credentials; the messaging server only
//! needs "token in, user id out". [`Authenticator`] is that seam. The
//! in-process [`StaticTokens`] implementation serves development and tests;
//! a production deployment plugs in a verifier backed by the account
//! service.

use std::collections::HashMap;

/// Errors from credential verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Token is unknown, malformed, or expired.
    #[error("invalid credential token")]
    InvalidToken,

    /// The verifier backend could not be reached.
    #[error("credential backend unavailable: {0}")]
    Unavailable(String),
}

/// Verifies credential tokens presented during the handshake.
///
/// Called once per connection from the gateway task, so implementations must
/// be cheap or internally async-friendly (the trait stays synchronous; a
/// remote verifier would cache).
pub trait Authenticator: Send + Sync + 'static {
    /// Verify a token, returning the platform user id it belongs to.
    fn verify(&self, token: &str) -> Result<u64, AuthError>;
}

/// One parsed credential line: token, user id, display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Opaque bearer token the client presents in `Hello`.
    pub token: String,
    /// Platform user id the token authenticates.
    pub user_id: u64,
    /// Display name registered for the user.
    pub username: String,
}

/// Parses a credential file.
///
/// One credential per line as `token:user_id:username`. Blank lines and
/// lines starting with `#` are skipped.
///
/// # Errors
///
/// Returns a message naming the first malformed line.
pub fn parse_credentials(text: &str) -> Result<Vec<Credential>, String> {
    let mut credentials = Vec::new();

    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.splitn(3, ':');
        let (Some(token), Some(user_id), Some(username)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(format!("line {}: expected token:user_id:username", line_no + 1));
        };

        let user_id: u64 = user_id
            .parse()
            .map_err(|_| format!("line {}: user id {user_id:?} is not a number", line_no + 1))?;
        if token.is_empty() || username.is_empty() {
            return Err(format!("line {}: empty token or username", line_no + 1));
        }

        credentials.push(Credential {
            token: token.to_string(),
            user_id,
            username: username.to_string(),
        });
    }

    Ok(credentials)
}

/// Static token table for development and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticTokens {
    by_token: HashMap<String, u64>,
}

impl StaticTokens {
    /// Empty table; every verification fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table built from parsed credentials.
    pub fn from_credentials(credentials: &[Credential]) -> Self {
        let by_token = credentials
            .iter()
            .map(|credential| (credential.token.clone(), credential.user_id))
            .collect();
        Self { by_token }
    }

    /// Registers one token. Later registrations of the same token win.
    pub fn insert(&mut self, token: impl Into<String>, user_id: u64) {
        self.by_token.insert(token.into(), user_id);
    }

    /// Number of registered tokens.
    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    /// Whether no tokens are registered.
    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }
}

impl Authenticator for StaticTokens {
    fn verify(&self, token: &str) -> Result<u64, AuthError> {
        self.by_token.get(token).copied().ok_or(AuthError::InvalidToken)
    }
}
