//! Rotating OAuth token cache.
//!
//! The current token lives in memory and is handed to the client
//! synchronously; durability is the job of a dedicated writer task that
//! coalesces save signals into single upserts of the `state` row. The writer
//! intercepts its own cancellation to perform one final drain write, so a
//! refresh that lands just before shutdown is not lost.

use crate::SpotifyError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use radiodb_core::{Database, StateKey};
use rspotify::Token;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The JSON shape persisted in `state[spotify_auth]` and carried by the
/// operator's base64 `auth_seed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix timestamp.
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl From<&Token> for StoredToken {
    fn from(token: &Token) -> Self {
        Self {
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
            expires_at: token.expires_at.map(|at| at.timestamp()),
            scopes: token.scopes.iter().cloned().collect(),
        }
    }
}

impl From<StoredToken> for Token {
    fn from(stored: StoredToken) -> Self {
        Self {
            access_token: stored.access_token,
            refresh_token: stored.refresh_token,
            expires_at: stored
                .expires_at
                .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0)),
            expires_in: chrono::TimeDelta::zero(),
            scopes: stored.scopes.into_iter().collect(),
        }
    }
}

/// In-memory token with a save signal for the writer task.
#[derive(Debug)]
pub struct TokenStore {
    token: Mutex<Option<Token>>,
    dirty: AtomicBool,
    changed: Notify,
}

impl TokenStore {
    fn new(token: Token, needs_save: bool) -> Self {
        let store = Self {
            token: Mutex::new(Some(token)),
            dirty: AtomicBool::new(needs_save),
            changed: Notify::new(),
        };
        if needs_save {
            store.changed.notify_one();
        }
        store
    }

    /// Seed the store: prefer the token persisted in the database, fall back
    /// to the operator-supplied base64 seed (which is then marked for
    /// persistence).
    ///
    /// # Errors
    ///
    /// Fails if neither source yields a token, or either fails to decode.
    pub async fn load(db: &Database, auth_seed: &str) -> Result<Arc<Self>, SpotifyError> {
        if let Some(json) = db.state(StateKey::SpotifyAuth).await? {
            let stored: StoredToken = serde_json::from_str(&json)?;
            debug!("Loaded Spotify token from database");
            return Ok(Arc::new(Self::new(stored.into(), false)));
        }

        if auth_seed.trim().is_empty() {
            return Err(SpotifyError::AuthFailed {
                reason: "no stored token and spotify.auth_seed is empty; \
                         run `radiodb authorise` to obtain one"
                    .to_string(),
            });
        }
        let raw = BASE64.decode(auth_seed.trim())?;
        let stored: StoredToken = serde_json::from_slice(&raw)?;
        info!("Adopted Spotify token from the configured auth seed");
        Ok(Arc::new(Self::new(stored.into(), true)))
    }

    /// The current token. Called synchronously by the client.
    #[must_use]
    pub fn current(&self) -> Option<Token> {
        self.token.lock().map(|guard| guard.clone()).unwrap_or(None)
    }

    /// Replace the current token and signal the writer. Called synchronously
    /// by the client after a refresh.
    pub fn store(&self, token: Token) {
        if let Ok(mut guard) = self.token.lock() {
            *guard = Some(token);
        }
        self.dirty.store(true, Ordering::SeqCst);
        self.changed.notify_one();
    }

    /// Persist tokens until cancelled, then drain.
    ///
    /// Each wake writes at most once, so bursts of refreshes coalesce. A
    /// failed write re-arms the dirty flag and is retried on the next signal
    /// or on the drain; the in-memory token stays usable throughout.
    pub async fn run_writer(&self, db: &Database, cancel: CancellationToken) {
        debug!("Token writer started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.changed.notified() => self.flush(db).await,
            }
        }
        // Drain path: one final write covers a refresh that raced shutdown.
        self.flush(db).await;
        debug!("Token writer stopped");
    }

    async fn flush(&self, db: &Database) {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(token) = self.current() else {
            return;
        };
        let json = match serde_json::to_string(&StoredToken::from(&token)) {
            Ok(json) => json,
            Err(err) => {
                warn!("Failed to serialise Spotify token: {err}");
                return;
            }
        };
        match db.put_state(StateKey::SpotifyAuth, json).await {
            Ok(()) => debug!("Persisted Spotify token"),
            Err(err) => {
                warn!("Failed to persist Spotify token, will retry: {err}");
                self.dirty.store(true, Ordering::SeqCst);
                self.changed.notify_one();
            }
        }
    }
}

/// Encode a token the way `spotify.auth_seed` expects it.
///
/// # Errors
///
/// Returns an error if the token fails to serialise.
pub fn encode_seed(token: &Token) -> Result<String, SpotifyError> {
    let json = serde_json::to_string(&StoredToken::from(token))?;
    Ok(BASE64.encode(json))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};

    fn token(access: &str) -> Token {
        Token {
            access_token: access.to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_at: Some(Utc::now() + TimeDelta::hours(1)),
            expires_in: TimeDelta::zero(),
            scopes: std::collections::HashSet::new(),
        }
    }

    #[test]
    fn stored_token_round_trips() {
        let original = token("abc");
        let stored = StoredToken::from(&original);
        let json = serde_json::to_string(&stored).unwrap();
        let back: Token = serde_json::from_str::<StoredToken>(&json).unwrap().into();
        assert_eq!(back.access_token, "abc");
        assert_eq!(back.refresh_token.as_deref(), Some("refresh"));
        assert_eq!(
            back.expires_at.map(|at| at.timestamp()),
            original.expires_at.map(|at| at.timestamp())
        );
    }

    #[test]
    fn seed_encoding_round_trips() {
        let seed = encode_seed(&token("seeded")).unwrap();
        let raw = BASE64.decode(seed).unwrap();
        let stored: StoredToken = serde_json::from_slice(&raw).unwrap();
        assert_eq!(stored.access_token, "seeded");
    }

    #[tokio::test]
    async fn load_prefers_database_over_seed() {
        let db = Database::open_in_memory().await.unwrap();
        let json = serde_json::to_string(&StoredToken::from(&token("from-db"))).unwrap();
        db.put_state(StateKey::SpotifyAuth, json).await.unwrap();

        let seed = encode_seed(&token("from-seed")).unwrap();
        let store = TokenStore::load(&db, &seed).await.unwrap();
        assert_eq!(store.current().unwrap().access_token, "from-db");
    }

    #[tokio::test]
    async fn seed_adoption_is_persisted_by_the_writer() {
        let db = Database::open_in_memory().await.unwrap();
        let seed = encode_seed(&token("from-seed")).unwrap();
        let store = TokenStore::load(&db, &seed).await.unwrap();

        // Seeding marks the token dirty; the writer persists it without any
        // further store() call.
        let cancel = CancellationToken::new();
        cancel.cancel();
        store.run_writer(&db, cancel).await;

        let json = db.state(StateKey::SpotifyAuth).await.unwrap().unwrap();
        let stored: StoredToken = serde_json::from_str(&json).unwrap();
        assert_eq!(stored.access_token, "from-seed");
    }

    #[tokio::test]
    async fn missing_token_and_empty_seed_fails() {
        let db = Database::open_in_memory().await.unwrap();
        let err = TokenStore::load(&db, "  ").await.unwrap_err();
        assert!(matches!(err, SpotifyError::AuthFailed { .. }));
    }

    #[tokio::test]
    async fn writer_persists_latest_token_and_drains_on_cancel() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let seed = encode_seed(&token("first")).unwrap();
        let store = TokenStore::load(&db, &seed).await.unwrap();

        let cancel = CancellationToken::new();
        let writer = {
            let store = Arc::clone(&store);
            let db = Arc::clone(&db);
            let cancel = cancel.clone();
            tokio::spawn(async move { store.run_writer(&db, cancel).await })
        };

        // A refresh arrives while the writer is running.
        store.store(token("second"));
        cancel.cancel();
        writer.await.unwrap();

        let json = db.state(StateKey::SpotifyAuth).await.unwrap().unwrap();
        let stored: StoredToken = serde_json::from_str(&json).unwrap();
        assert_eq!(stored.access_token, "second");
    }

    #[tokio::test]
    async fn store_after_last_wake_is_covered_by_the_drain() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let json = serde_json::to_string(&StoredToken::from(&token("old"))).unwrap();
        db.put_state(StateKey::SpotifyAuth, json).await.unwrap();
        let store = TokenStore::load(&db, "").await.unwrap();

        let cancel = CancellationToken::new();
        // Cancel before the writer ever runs; only the drain write remains.
        store.store(token("last-moment"));
        cancel.cancel();
        store.run_writer(&db, cancel).await;

        let json = db.state(StateKey::SpotifyAuth).await.unwrap().unwrap();
        let stored: StoredToken = serde_json::from_str(&json).unwrap();
        assert_eq!(stored.access_token, "last-moment");
    }
}
