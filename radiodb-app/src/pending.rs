//! The pending worker.
//!
//! A lease-based single-consumer queue over the `pending` table. Rows are
//! claimed by stamping `picked_at` with a null-safe compare-and-set, so the
//! protocol stays correct even if an operator accidentally runs a second
//! process: exactly one worker wins each row, and an abandoned claim becomes
//! pickable again once its lease ages out.

use anyhow::{anyhow, Result};
use chrono::{TimeDelta, Utc};
use radiodb_core::{canonical, Config, Database, Pending};
use radiodb_spotify::TrackSearch;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long a claim lasts before another pick may take the row over.
const LEASE_MINUTES: i64 = 5;

/// How long to sleep when the queue is empty.
const IDLE_SLEEP: Duration = Duration::from_secs(180);

/// Process pending rows until cancelled.
///
/// Failures while resolving a single row are logged and the row is left to
/// its lease; only database failures on the pick/claim path abort the
/// worker.
pub async fn run(
    db: &Database,
    search: &dyn TrackSearch,
    config: &Config,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let now = Utc::now();
        let stale_before = now - TimeDelta::minutes(LEASE_MINUTES);
        let Some(pending) = db.next_pending(stale_before).await? else {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = sleep(IDLE_SLEEP) => continue,
            }
        };

        if !db.claim_pending(pending.id, pending.picked_at, now).await? {
            // Another worker stamped the row first.
            debug!("Lost the claim race for pending {}", pending.id);
            continue;
        }

        if let Err(err) = resolve(db, search, config, &pending).await {
            warn!(
                "Failed to resolve {:?} - {:?} (pending {}), leaving it to its lease: {err}",
                pending.artist, pending.title, pending.id
            );
        }
    }
}

/// Resolve one claimed row: canonicalise, find or create the song, and
/// commit the play. The pending row is deleted in every successful outcome,
/// including filter drops and search misses.
async fn resolve(
    db: &Database,
    search: &dyn TrackSearch,
    config: &Config,
    pending: &Pending,
) -> Result<()> {
    let station = db
        .station_by_id(pending.station)
        .await?
        .ok_or_else(|| anyhow!("pending {} references unknown station", pending.id))?;
    let filters = config
        .station(&station.key)
        .and_then(|station_config| station_config.filters.as_ref());

    let normalised = canonical::normalise(&pending.artist, &pending.title, None);
    if let Some(ignore) = filters.and_then(|f| f.ignore.as_ref()) {
        if ignore.is_match(&normalised) {
            debug!("Dropping {normalised:?}: matches the station's ignore filter");
            db.delete_pending(pending.id).await?;
            return Ok(());
        }
    }
    let normalised = match filters.and_then(|f| f.blank.as_ref()) {
        Some(blank) => blank.replace_all(&normalised, "").into_owned(),
        None => normalised,
    };

    // Exact identity match first.
    let key = canonical::song_key(&normalised);
    let mut song = db.song_by_key(key).await?;

    // Failing that, ask the catalog; a previous resolution may already have
    // canonicalised the same track under a different key, so check the URI
    // before inserting.
    if song.is_none() {
        if let Some(track) = search.search_track(&normalised).await? {
            song = db.song_by_uri(&track.uri).await?;
            if song.is_none() {
                song = Some(
                    db.insert_song(key, &track.artist, &track.title, &track.uri)
                        .await?,
                );
            }
        }
    }

    if song.is_none() {
        warn!("{normalised} was not found on spotify");
    }

    db.commit_play(
        pending.id,
        song.map(|song| (pending.station, song.id, pending.seen_at)),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use radiodb_core::{DatabaseConfig, FilterConfig, SpotifyConfig, StationConfig};
    use radiodb_spotify::{ResolvedTrack, SpotifyError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubSearch {
        result: Option<ResolvedTrack>,
        calls: AtomicUsize,
    }

    impl StubSearch {
        fn returning(result: Option<ResolvedTrack>) -> Self {
            Self {
                result,
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TrackSearch for StubSearch {
        async fn search_track(
            &self,
            _query: &str,
        ) -> Result<Option<ResolvedTrack>, SpotifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.result.clone())
        }
    }

    fn config_for(key: &str, filters: Option<FilterConfig>) -> Config {
        Config {
            stations: vec![StationConfig {
                key: key.to_string(),
                name: key.to_uppercase(),
                url: format!("http://{key}"),
                filters,
                playlists: Vec::new(),
            }],
            database: DatabaseConfig::default(),
            spotify: SpotifyConfig::default(),
        }
    }

    fn track(artist: &str, title: &str, uri: &str) -> ResolvedTrack {
        ResolvedTrack {
            artist: artist.to_string(),
            title: title.to_string(),
            uri: uri.to_string(),
        }
    }

    async fn claimed_pending(db: &Database, station: i64, artist: &str, title: &str) -> Pending {
        let now = Utc::now();
        db.insert_pending(station, artist, title, now).await.unwrap();
        let pending = db.next_pending(now).await.unwrap().unwrap();
        assert!(db.claim_pending(pending.id, pending.picked_at, now).await.unwrap());
        pending
    }

    #[tokio::test]
    async fn unknown_song_is_resolved_and_played() {
        let db = Database::open_in_memory().await.unwrap();
        let station = db.upsert_station("s", "S", "http://s").await.unwrap();
        let config = config_for("s", None);
        let search = StubSearch::returning(Some(track("A", "T", "spotify:track:t")));

        let pending = claimed_pending(&db, station.id, "A", "T").await;
        resolve(&db, &search, &config, &pending).await.unwrap();

        assert_eq!(search.call_count(), 1);
        let song = db.song_by_uri("spotify:track:t").await.unwrap().unwrap();
        assert_eq!(song.key, canonical::song_key("a t"));
        assert_eq!(db.play_count(station.id).await.unwrap(), 1);
        assert!(db.next_pending(Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn known_key_skips_the_catalog() {
        let db = Database::open_in_memory().await.unwrap();
        let station = db.upsert_station("s", "S", "http://s").await.unwrap();
        let config = config_for("s", None);
        let key = canonical::song_key(&canonical::normalise("A", "T", None));
        db.insert_song(key, "A", "T", "spotify:track:t").await.unwrap();
        let search = StubSearch::returning(None);

        let pending = claimed_pending(&db, station.id, "A", "T").await;
        resolve(&db, &search, &config, &pending).await.unwrap();

        assert_eq!(search.call_count(), 0);
        assert_eq!(db.play_count(station.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn uri_hit_reuses_the_existing_identity() {
        let db = Database::open_in_memory().await.unwrap();
        let station = db.upsert_station("s", "S", "http://s").await.unwrap();
        let config = config_for("s", None);
        // Resolved earlier from a differently spelled observation.
        let existing = db
            .insert_song(1234, "A", "T", "spotify:track:t")
            .await
            .unwrap();
        let search = StubSearch::returning(Some(track("A", "T", "spotify:track:t")));

        let pending = claimed_pending(&db, station.id, "A feat. B", "T").await;
        resolve(&db, &search, &config, &pending).await.unwrap();

        // No second song row; the play references the original identity.
        assert!(db
            .song_by_key(canonical::song_key(&canonical::normalise("A feat. B", "T", None)))
            .await
            .unwrap()
            .is_none());
        let top = db
            .top_songs(station.id, Utc::now() - TimeDelta::days(1), 10)
            .await
            .unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].song, existing.id);
    }

    #[tokio::test]
    async fn ignore_filter_drops_the_row_without_a_play() {
        let db = Database::open_in_memory().await.unwrap();
        let station = db.upsert_station("s", "S", "http://s").await.unwrap();
        let filters = FilterConfig {
            ignore: Some(regex::Regex::new("^news ").unwrap()),
            ..Default::default()
        };
        let config = config_for("s", Some(filters));
        let search = StubSearch::returning(Some(track("x", "x", "spotify:track:x")));

        let pending = claimed_pending(&db, station.id, "news", "6pm").await;
        resolve(&db, &search, &config, &pending).await.unwrap();

        assert_eq!(search.call_count(), 0);
        assert_eq!(db.play_count(station.id).await.unwrap(), 0);
        assert!(db.next_pending(Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn blank_filter_shapes_the_fingerprint_and_query() {
        let db = Database::open_in_memory().await.unwrap();
        let station = db.upsert_station("s", "S", "http://s").await.unwrap();
        let filters = FilterConfig {
            blank: Some(regex::Regex::new(r" \(live\)").unwrap()),
            ..Default::default()
        };
        let config = config_for("s", Some(filters));
        let search = StubSearch::returning(Some(track("A", "T", "spotify:track:t")));

        let pending = claimed_pending(&db, station.id, "A", "T (live)").await;
        resolve(&db, &search, &config, &pending).await.unwrap();

        let song = db.song_by_uri("spotify:track:t").await.unwrap().unwrap();
        assert_eq!(song.key, canonical::song_key("a t"));
    }

    #[tokio::test]
    async fn search_miss_still_clears_the_row() {
        let db = Database::open_in_memory().await.unwrap();
        let station = db.upsert_station("s", "S", "http://s").await.unwrap();
        let config = config_for("s", None);
        let search = StubSearch::returning(None);

        let pending = claimed_pending(&db, station.id, "Obscure", "B-side").await;
        resolve(&db, &search, &config, &pending).await.unwrap();

        assert_eq!(search.call_count(), 1);
        assert_eq!(db.play_count(station.id).await.unwrap(), 0);
        assert!(db.next_pending(Utc::now()).await.unwrap().is_none());
    }
}
