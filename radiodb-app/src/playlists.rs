//! Playlist reconciliation.
//!
//! Recomputes each station's top-played aggregate and replaces the remote
//! playlist's contents in a single authoritative write. The run is paired
//! with the token writer task: the reconciler's token refreshes land in the
//! store, and cancelling the writer afterwards forces its drain write so the
//! last refresh is durable before the process exits.

use anyhow::{anyhow, Context, Result};
use chrono::{TimeDelta, Utc};
use radiodb_core::{Config, Database, PlaylistConfig, Station, StationConfig};
use radiodb_spotify::auth::TokenStore;
use radiodb_spotify::SpotifyClient;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Remote playlists never exceed this many items, whatever the configured
/// limit says.
const MAX_PLAYLIST_ITEMS: u32 = 100;

/// Reconcile every configured playlist, or only those of `station_key`.
pub async fn run(db: &Arc<Database>, config: &Config, station_key: Option<&str>) -> Result<()> {
    let tokens = TokenStore::load(db, &config.spotify.auth_seed).await?;
    let spotify = SpotifyClient::new(&config.spotify, Arc::clone(&tokens)).await?;

    let cancel = CancellationToken::new();
    let writer = {
        let tokens = Arc::clone(&tokens);
        let db = Arc::clone(db);
        let cancel = cancel.clone();
        tokio::spawn(async move { tokens.run_writer(&db, cancel).await })
    };

    let result = reconcile_stations(db, &spotify, config, station_key).await;

    // Stop the writer and wait for its drain write before reporting.
    cancel.cancel();
    writer.await.context("Token writer aborted")?;
    result
}

async fn reconcile_stations(
    db: &Database,
    spotify: &SpotifyClient,
    config: &Config,
    station_key: Option<&str>,
) -> Result<()> {
    let stations: Vec<&StationConfig> = match station_key {
        Some(key) => vec![config
            .station(key)
            .ok_or_else(|| anyhow!("unknown station key {key:?}"))?],
        None => config.stations.iter().collect(),
    };

    for station_config in stations {
        if station_config.playlists.is_empty() {
            continue;
        }
        let station = db
            .upsert_station(&station_config.key, &station_config.name, &station_config.url)
            .await?;
        for playlist_config in &station_config.playlists {
            reconcile(db, spotify, &station, playlist_config)
                .await
                .with_context(|| {
                    format!("Failed to reconcile {} playlist", station_config.key)
                })?;
        }
    }
    Ok(())
}

async fn reconcile(
    db: &Database,
    spotify: &SpotifyClient,
    station: &Station,
    playlist_config: &PlaylistConfig,
) -> Result<()> {
    let playlist = db
        .ensure_playlist(station.id, playlist_config.kind.as_str())
        .await?;

    // Create the remote playlist only while no URI is stored; the URI is
    // monotonic and never overwritten.
    let playlist_uri = match playlist.spotify_uri {
        Some(uri) => uri,
        None => {
            let uri = spotify
                .create_playlist(
                    &playlist_name(station),
                    &playlist_description(station, playlist_config),
                )
                .await?;
            if db.set_playlist_uri_if_unset(playlist.id, &uri).await? {
                uri
            } else {
                // Someone else created it between our read and write; theirs
                // wins and ours is left orphaned on the remote side.
                warn!("Playlist for {} was created concurrently", station.key);
                db.ensure_playlist(station.id, playlist_config.kind.as_str())
                    .await?
                    .spotify_uri
                    .ok_or_else(|| anyhow!("playlist row lost its URI"))?
            }
        }
    };

    let since = Utc::now() - TimeDelta::days(i64::from(playlist_config.days));
    let limit = playlist_config.limit.min(MAX_PLAYLIST_ITEMS);
    let top = db.top_songs(station.id, since, limit).await?;
    let uris: Vec<String> = top.into_iter().filter_map(|song| song.spotify_uri).collect();

    info!(
        "Replacing {} items on {} ({})",
        uris.len(),
        playlist_uri,
        station.name
    );
    spotify.replace_playlist_items(&playlist_uri, &uris).await?;
    Ok(())
}

fn playlist_name(station: &Station) -> String {
    format!("{} most played", station.name)
}

fn playlist_description(station: &Station, playlist_config: &PlaylistConfig) -> String {
    format!(
        "The most played songs on {} for the last {} days. Not official. Might have mistakes.",
        station.name, playlist_config.days
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn station() -> Station {
        Station {
            id: 1,
            key: "georgefm".into(),
            name: "George FM".into(),
            url: "http://x".into(),
        }
    }

    #[test]
    fn remote_playlist_naming() {
        let config = PlaylistConfig::default();
        assert_eq!(playlist_name(&station()), "George FM most played");
        assert_eq!(
            playlist_description(&station(), &config),
            "The most played songs on George FM for the last 7 days. \
             Not official. Might have mistakes."
        );
    }

    #[test]
    fn limit_is_hard_capped() {
        let config = PlaylistConfig {
            limit: 500,
            ..Default::default()
        };
        assert_eq!(config.limit.min(MAX_PLAYLIST_ITEMS), 100);
        let config = PlaylistConfig {
            limit: 25,
            ..Default::default()
        };
        assert_eq!(config.limit.min(MAX_PLAYLIST_ITEMS), 25);
    }
}
