use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::AuthError;

/// Bearer token plus the moment it stops being accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct Claims {
    exp: i64,
}

impl AuthToken {
    pub fn new(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    /// Reads the `exp` claim. The signature is not checked; the server does that.
    pub fn from_jwt(value: &str) -> Result<Self, AuthError> {
        let value = value.trim();
        let payload = value
            .split('.')
            .nth(1)
            .ok_or_else(|| AuthError::MalformedToken("expected three dot-separated segments".into()))?;
        let decoded = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| AuthError::MalformedToken(format!("payload is not base64url: {}", e)))?;
        let claims: Claims = serde_json::from_slice(&decoded)
            .map_err(|e| AuthError::MalformedToken(format!("payload has no usable exp claim: {}", e)))?;
        let expires_at = DateTime::from_timestamp(claims.exp, 0)
            .ok_or_else(|| AuthError::MalformedToken(format!("exp out of range: {}", claims.exp)))?;

        Ok(Self::new(value, expires_at))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn expires_within(&self, now: DateTime<Utc>, window: std::time::Duration) -> bool {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        self.expires_at - now <= window
    }
}

/// Where the current access token lives between checks.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Option<AuthToken>;
    fn save(&self, token: &AuthToken) -> anyhow::Result<()>;
    fn clear(&self);
}

#[derive(Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<AuthToken>>,
}

impl MemoryTokenStore {
    pub fn new(token: Option<AuthToken>) -> Self {
        Self {
            token: Mutex::new(token),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Option<AuthToken> {
        self.token.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn save(&self, token: &AuthToken) -> anyhow::Result<()> {
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());
        Ok(())
    }

    fn clear(&self) {
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Keeps the raw JWT in a file so a restart does not force a new login.
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Option<AuthToken> {
        let raw = fs::read_to_string(&self.path).ok()?;
        match AuthToken::from_jwt(&raw) {
            Ok(token) => Some(token),
            Err(e) => {
                log::warn!("Ignoring stored token in {}: {}", self.path.display(), e);
                None
            }
        }
    }

    fn save(&self, token: &AuthToken) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(&self.path, &token.value)
            .with_context(|| format!("writing token to {}", self.path.display()))
    }

    fn clear(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall time that advances with tokio's clock, so paused-time tests can
/// move it forward.
pub struct MonotonicClock {
    base: DateTime<Utc>,
    start: tokio::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(base: DateTime<Utc>) -> Self {
        Self {
            base,
            start: tokio::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.start.elapsed()).unwrap_or_default();
        self.base + elapsed
    }
}

#[cfg(test)]
pub(crate) fn jwt_expiring_at(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"learner@example.com","exp":{}}}"#, exp));
    format!("{}.{}.signature", header, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn exp_claim_sets_expiry() {
        let token = AuthToken::from_jwt(&jwt_expiring_at(1_700_000_000)).unwrap();
        assert_eq!(token.expires_at.timestamp(), 1_700_000_000);

        let before = DateTime::from_timestamp(1_699_999_000, 0).unwrap();
        assert!(!token.is_expired(before));
        assert!(token.expires_within(before, Duration::from_secs(1000)));
        assert!(!token.expires_within(before, Duration::from_secs(999)));
        assert!(token.is_expired(token.expires_at));
    }

    #[test]
    fn rejects_tokens_without_exp() {
        assert!(matches!(AuthToken::from_jwt("opaque"), Err(AuthError::MalformedToken(_))));
        assert!(matches!(AuthToken::from_jwt("a.!!!.c"), Err(AuthError::MalformedToken(_))));
        let no_exp = format!("h.{}.s", URL_SAFE_NO_PAD.encode(br#"{"sub":"x"}"#));
        assert!(matches!(AuthToken::from_jwt(&no_exp), Err(AuthError::MalformedToken(_))));
    }

    #[test]
    fn file_store_survives_reload() {
        let path = std::env::temp_dir().join(format!("malangee-token-{}.jwt", uuid::Uuid::new_v4()));
        let store = FileTokenStore::new(&path);
        assert!(store.load().is_none());

        let token = AuthToken::from_jwt(&jwt_expiring_at(2_000_000_000)).unwrap();
        store.save(&token).unwrap();
        assert_eq!(FileTokenStore::new(&path).load(), Some(token));

        store.clear();
        assert!(store.load().is_none());
        store.clear();
    }

    #[tokio::test(start_paused = true)]
    async fn monotonic_clock_follows_tokio_time() {
        let base = DateTime::from_timestamp(1_000, 0).unwrap();
        let clock = MonotonicClock::starting_at(base);
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(clock.now().timestamp(), 1_090);
    }
}
