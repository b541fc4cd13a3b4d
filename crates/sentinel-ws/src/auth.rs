//! Auth tokens for private channels.
//!
//! Tokens are held in zeroizing buffers and never appear in `Debug`
//! output or logs.

use crate::error::{WsError, WsResult};
use futures_util::future::BoxFuture;
use std::fmt;
use zeroize::Zeroizing;

pub struct AuthToken(Zeroizing<String>);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Zeroizing::new(token.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken([redacted])")
    }
}

/// Supplies a token each time a private session (re)connects.
///
/// Implementations typically call the exchange's REST token endpoint.
pub trait AuthTokenSource: Send + Sync {
    fn token(&self) -> BoxFuture<'_, WsResult<AuthToken>>;
}

/// A token provisioned out of band.
pub struct StaticTokenSource {
    token: Zeroizing<String>,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Zeroizing::new(token.into()),
        }
    }

    /// Read the token from an environment variable; `None` if unset or empty.
    pub fn from_env(var: &str) -> Option<Self> {
        std::env::var(var)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .map(Self::new)
    }
}

impl fmt::Debug for StaticTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenSource")
            .field("token", &"[redacted]")
            .finish()
    }
}

impl AuthTokenSource for StaticTokenSource {
    fn token(&self) -> BoxFuture<'_, WsResult<AuthToken>> {
        Box::pin(async move {
            if self.token.is_empty() {
                return Err(WsError::Authentication("empty token".to_string()));
            }
            Ok(AuthToken::new(self.token.as_str()))
        })
    }
}
