//! Spotify catalog client.
//!
//! A thin wrapper over [`rspotify::AuthCodeSpotify`] that keeps the OAuth
//! token under the database-backed [`auth::TokenStore`] rather than
//! rspotify's own file cache: automatic refreshing is disabled and every
//! refresh is pushed back into the store, where the writer task persists it.

pub mod auth;
pub mod authorise;

use crate::auth::TokenStore;
use async_trait::async_trait;
use radiodb_core::SpotifyConfig;
use rspotify::model::{PlayableId, PlaylistId, SearchResult, SearchType, TrackId};
use rspotify::prelude::{BaseClient, Id, OAuthClient};
use rspotify::{scopes, AuthCodeSpotify, ClientCredsSpotify, Config, Credentials, OAuth, Token};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Refresh the token proactively when it expires within this many seconds.
const PROACTIVE_REFRESH_THRESHOLD_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum SpotifyError {
    #[error("Spotify API error: {0}")]
    Api(#[from] rspotify::ClientError),

    #[error("Invalid Spotify id: {0}")]
    Id(#[from] rspotify::model::IdError),

    #[error("Spotify authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("Token encoding error: {0}")]
    TokenEncoding(#[from] serde_json::Error),

    #[error("Invalid auth seed: {0}")]
    Seed(#[from] base64::DecodeError),

    #[error(transparent)]
    Core(#[from] radiodb_core::CoreError),
}

/// A track as resolved by the catalog search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTrack {
    pub artist: String,
    pub title: String,
    pub uri: String,
}

/// The seam the pending worker resolves unknown songs through.
#[async_trait]
pub trait TrackSearch: Send + Sync {
    /// Search the catalog and return the first matching track, if any.
    async fn search_track(&self, query: &str) -> Result<Option<ResolvedTrack>, SpotifyError>;
}

pub struct SpotifyClient {
    client: AuthCodeSpotify,
    tokens: Arc<TokenStore>,
}

impl SpotifyClient {
    /// Build a client from application credentials and a seeded token store.
    ///
    /// # Errors
    ///
    /// Fails if the store holds no token.
    pub async fn new(config: &SpotifyConfig, tokens: Arc<TokenStore>) -> Result<Self, SpotifyError> {
        let creds = Credentials::new(&config.client_id, &config.client_secret);
        let oauth = OAuth {
            redirect_uri: config.redirect_uri.clone(),
            scopes: playlist_scopes(),
            ..Default::default()
        };
        let client = AuthCodeSpotify::with_config(
            creds,
            oauth,
            Config {
                token_refreshing: false,
                token_cached: false,
                ..Default::default()
            },
        );

        let token = tokens.current().ok_or_else(|| SpotifyError::AuthFailed {
            reason: "no OAuth token available; run `radiodb authorise` and set spotify.auth_seed"
                .to_string(),
        })?;

        let spotify = Self { client, tokens };
        *spotify.lock_token().await? = Some(token);
        Ok(spotify)
    }

    async fn lock_token(
        &self,
    ) -> Result<futures::lock::MutexGuard<'_, Option<Token>>, SpotifyError> {
        self.client
            .token
            .lock()
            .await
            .map_err(|_| SpotifyError::AuthFailed {
                reason: "Failed to acquire token lock".to_string(),
            })
    }

    /// Refresh the access token if it is missing an expiry or expires soon,
    /// mirroring any new token into the store for persistence.
    ///
    /// # Errors
    ///
    /// Returns an error if the refresh round-trip fails.
    pub async fn ensure_token_fresh(&self) -> Result<(), SpotifyError> {
        let needs_refresh = {
            let guard = self.lock_token().await?;
            guard.as_ref().is_none_or(needs_refresh)
        };
        if needs_refresh {
            self.refresh_token().await?;
        }
        Ok(())
    }

    async fn refresh_token(&self) -> Result<(), SpotifyError> {
        info!("Refreshing Spotify access token");
        self.client.refresh_token().await?;
        let refreshed = self.lock_token().await?.clone();
        if let Some(token) = refreshed {
            self.tokens.store(token);
        }
        Ok(())
    }

    /// Create a private playlist for the current user and return its URI.
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails.
    pub async fn create_playlist(&self, name: &str, description: &str) -> Result<String, SpotifyError> {
        self.ensure_token_fresh().await?;
        let user = self.client.current_user().await?;
        debug!("Creating playlist {name:?} for user {}", user.id.id());
        let playlist = self
            .client
            .user_playlist_create(user.id, name, Some(false), None, Some(description))
            .await?;
        Ok(playlist.id.uri())
    }

    /// Replace the playlist's contents with `track_uris`, in order. This is
    /// the single authoritative write of a reconciliation run.
    ///
    /// # Errors
    ///
    /// Returns an error if a URI does not parse or the API call fails.
    pub async fn replace_playlist_items(
        &self,
        playlist_uri: &str,
        track_uris: &[String],
    ) -> Result<(), SpotifyError> {
        self.ensure_token_fresh().await?;
        let playlist_id = PlaylistId::from_uri(playlist_uri)?;
        let items = track_uris
            .iter()
            .map(|uri| TrackId::from_uri(uri).map(PlayableId::Track))
            .collect::<Result<Vec<_>, _>>()?;
        self.client.playlist_replace_items(playlist_id, items).await?;
        Ok(())
    }
}

/// Catalog search over the client-credentials flow. The pending worker only
/// searches, which needs no user consent, so it runs on an application token
/// that rspotify renews by itself.
pub struct SearchClient {
    client: ClientCredsSpotify,
}

impl SearchClient {
    /// Obtain an application token and return the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the token request fails.
    pub async fn new(config: &SpotifyConfig) -> Result<Self, SpotifyError> {
        let client =
            ClientCredsSpotify::new(Credentials::new(&config.client_id, &config.client_secret));
        client.request_token().await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TrackSearch for SearchClient {
    async fn search_track(&self, query: &str) -> Result<Option<ResolvedTrack>, SpotifyError> {
        let result = self
            .client
            .search(query, SearchType::Track, None, None, Some(1), None)
            .await?;
        let SearchResult::Tracks(page) = result else {
            return Ok(None);
        };
        Ok(page.items.into_iter().next().and_then(|track| {
            let uri = track.id.as_ref().map(Id::uri)?;
            let artist = track.artists.first().map(|a| a.name.clone())?;
            Some(ResolvedTrack {
                artist,
                title: track.name,
                uri,
            })
        }))
    }
}

pub(crate) fn playlist_scopes() -> std::collections::HashSet<String> {
    scopes!("playlist-modify-private", "playlist-modify-public")
}

fn needs_refresh(token: &Token) -> bool {
    let Some(expires_at) = token.expires_at else {
        return true;
    };
    let remaining = (expires_at - chrono::Utc::now()).num_seconds();
    if remaining <= PROACTIVE_REFRESH_THRESHOLD_SECS {
        debug!("Token expires in {remaining}s, refreshing proactively");
        true
    } else {
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};

    fn token_expiring_in(secs: i64) -> Token {
        Token {
            access_token: "access".to_string(),
            expires_in: TimeDelta::zero(),
            expires_at: Some(Utc::now() + TimeDelta::seconds(secs)),
            refresh_token: Some("refresh".to_string()),
            scopes: playlist_scopes(),
        }
    }

    #[test]
    fn fresh_token_is_not_refreshed() {
        assert!(!needs_refresh(&token_expiring_in(3600)));
    }

    #[test]
    fn near_expiry_token_is_refreshed() {
        assert!(needs_refresh(&token_expiring_in(30)));
        assert!(needs_refresh(&token_expiring_in(-10)));
    }

    #[test]
    fn token_without_expiry_is_refreshed() {
        let mut token = token_expiring_in(3600);
        token.expires_at = None;
        assert!(needs_refresh(&token));
    }
}
