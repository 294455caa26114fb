//! Datastore adapter.
//!
//! All persistent state lives in a single SQLite database. Every query runs
//! as a closure on the connection's dedicated worker thread, which serialises
//! statements process-wide; multi-statement operations run inside one closure
//! under an immediate transaction, so they commit or roll back as a unit.

use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS station (
    id   INTEGER PRIMARY KEY,
    key  TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    url  TEXT NOT NULL
);

-- Raw observations awaiting resolution. Inserted by the station monitors,
-- deleted by the pending worker once a play is committed.
CREATE TABLE IF NOT EXISTS pending (
    id        INTEGER PRIMARY KEY,
    station   INTEGER NOT NULL REFERENCES station(id),
    artist    TEXT NOT NULL,
    title     TEXT NOT NULL,
    seen_at   INTEGER NOT NULL,
    picked_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_pending_seen_at ON pending(seen_at);

-- key is the first 64 bits of SHA-256 over the normalised artist and title.
CREATE TABLE IF NOT EXISTS song (
    id          INTEGER PRIMARY KEY,
    key         INTEGER NOT NULL UNIQUE,
    artist      TEXT NOT NULL,
    title       TEXT NOT NULL,
    spotify_uri TEXT UNIQUE
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_song_artist_title ON song(artist, title);

CREATE TABLE IF NOT EXISTS play (
    id      INTEGER PRIMARY KEY,
    station INTEGER NOT NULL REFERENCES station(id),
    song    INTEGER NOT NULL REFERENCES song(id),
    at      INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_play_station_at ON play(station, at);

CREATE TABLE IF NOT EXISTS playlist (
    id          INTEGER PRIMARY KEY,
    station     INTEGER NOT NULL REFERENCES station(id),
    kind        TEXT NOT NULL,
    spotify_uri TEXT UNIQUE,
    UNIQUE(station, kind)
);

CREATE TABLE IF NOT EXISTS state (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

#[derive(Debug, Clone)]
pub struct Station {
    pub id: i64,
    pub key: String,
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct Pending {
    pub id: i64,
    pub station: i64,
    pub artist: String,
    pub title: String,
    pub seen_at: DateTime<Utc>,
    pub picked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Song {
    pub id: i64,
    pub key: i64,
    pub artist: String,
    pub title: String,
    pub spotify_uri: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Playlist {
    pub id: i64,
    pub station: i64,
    pub kind: String,
    pub spotify_uri: Option<String>,
}

/// One row of the per-station top-played aggregate.
#[derive(Debug, Clone)]
pub struct TopSong {
    pub song: i64,
    pub artist: String,
    pub title: String,
    pub spotify_uri: Option<String>,
    pub play_count: i64,
    pub last_played: DateTime<Utc>,
}

/// Keys of the singleton `state` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKey {
    SpotifyAuth,
}

impl StateKey {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SpotifyAuth => "spotify_auth",
        }
    }
}

fn to_ts(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

fn from_ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
}

/// Handle to the radio database.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (creating if needed) the database at `path` and bootstrap the
    /// schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialised.
    pub async fn connect(path: &str) -> Result<Self> {
        info!("Opening radio database at {path}");
        let conn = Connection::open(path).await?;
        Self::init(conn).await
    }

    /// Open a throwaway in-memory database. Used by tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialised.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA_SQL)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            Ok(())
        })
        .await?;
        debug!("Schema initialised");
        Ok(Self { conn })
    }

    /// Insert the station, or overwrite its name and url if the key is
    /// already present. Returns the stored row.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn upsert_station(&self, key: &str, name: &str, url: &str) -> Result<Station> {
        let key = key.to_string();
        let name = name.to_string();
        let url = url.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    r"
                    INSERT INTO station (key, name, url) VALUES (?1, ?2, ?3)
                    ON CONFLICT(key) DO UPDATE SET name = excluded.name, url = excluded.url
                    ",
                    rusqlite::params![key, name, url],
                )?;
                let station = conn.query_row(
                    "SELECT id, key, name, url FROM station WHERE key = ?1",
                    rusqlite::params![key],
                    |row| {
                        Ok(Station {
                            id: row.get(0)?,
                            key: row.get(1)?,
                            name: row.get(2)?,
                            url: row.get(3)?,
                        })
                    },
                )?;
                Ok(station)
            })
            .await
            .map_err(Into::into)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn station_by_id(&self, id: i64) -> Result<Option<Station>> {
        self.conn
            .call(move |conn| {
                let station = conn
                    .query_row(
                        "SELECT id, key, name, url FROM station WHERE id = ?1",
                        rusqlite::params![id],
                        |row| {
                            Ok(Station {
                                id: row.get(0)?,
                                key: row.get(1)?,
                                name: row.get(2)?,
                                url: row.get(3)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(station)
            })
            .await
            .map_err(Into::into)
    }

    /// Record a raw observation for later resolution.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn insert_pending(
        &self,
        station: i64,
        artist: &str,
        title: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        let artist = artist.to_string();
        let title = title.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    r"
                    INSERT INTO pending (station, artist, title, seen_at, picked_at)
                    VALUES (?1, ?2, ?3, ?4, NULL)
                    ",
                    rusqlite::params![station, artist, title, to_ts(seen_at)],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    /// The oldest pending row that is unleased, or whose lease was stamped at
    /// or before `stale_before`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn next_pending(&self, stale_before: DateTime<Utc>) -> Result<Option<Pending>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    r"
                    SELECT id, station, artist, title, seen_at, picked_at FROM pending
                    WHERE picked_at IS NULL OR picked_at <= ?1
                    ORDER BY seen_at ASC
                    LIMIT 1
                    ",
                )?;
                let pending = stmt
                    .query_row(rusqlite::params![to_ts(stale_before)], |row| {
                        Ok(Pending {
                            id: row.get(0)?,
                            station: row.get(1)?,
                            artist: row.get(2)?,
                            title: row.get(3)?,
                            seen_at: from_ts(row.get(4)?),
                            picked_at: row.get::<_, Option<i64>>(5)?.map(from_ts),
                        })
                    })
                    .optional()?;
                Ok(pending)
            })
            .await
            .map_err(Into::into)
    }

    /// Stamp the lease on a pending row, but only if its `picked_at` still
    /// matches what the caller observed (null-safe compare). Returns whether
    /// the claim won; a `false` means another worker raced us to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn claim_pending(
        &self,
        id: i64,
        observed_picked_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE pending SET picked_at = ?1 WHERE id = ?2 AND picked_at IS ?3",
                    rusqlite::params![to_ts(now), id, observed_picked_at.map(to_ts)],
                )?;
                Ok(changed == 1)
            })
            .await
            .map_err(Into::into)
    }

    /// Drop a pending row without recording anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn delete_pending(&self, id: i64) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM pending WHERE id = ?1", rusqlite::params![id])?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    /// Commit the outcome of resolving a pending row: insert the play (when a
    /// song was resolved) and delete the pending row, atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails; nothing is written in that
    /// case.
    pub async fn commit_play(
        &self,
        pending_id: i64,
        play: Option<(i64, i64, DateTime<Utc>)>,
    ) -> Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                if let Some((station, song, at)) = play {
                    tx.execute(
                        "INSERT INTO play (station, song, at) VALUES (?1, ?2, ?3)",
                        rusqlite::params![station, song, to_ts(at)],
                    )?;
                }
                tx.execute("DELETE FROM pending WHERE id = ?1", rusqlite::params![pending_id])?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn song_by_key(&self, key: i64) -> Result<Option<Song>> {
        self.conn
            .call(move |conn| {
                let song = conn
                    .query_row(
                        "SELECT id, key, artist, title, spotify_uri FROM song WHERE key = ?1",
                        rusqlite::params![key],
                        row_to_song,
                    )
                    .optional()?;
                Ok(song)
            })
            .await
            .map_err(Into::into)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn song_by_uri(&self, uri: &str) -> Result<Option<Song>> {
        let uri = uri.to_string();
        self.conn
            .call(move |conn| {
                let song = conn
                    .query_row(
                        "SELECT id, key, artist, title, spotify_uri FROM song WHERE spotify_uri = ?1",
                        rusqlite::params![uri],
                        row_to_song,
                    )
                    .optional()?;
                Ok(song)
            })
            .await
            .map_err(Into::into)
    }

    /// Insert a freshly resolved song. Identities are immutable once written;
    /// later resolutions never update this row.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails (including uniqueness violations
    /// on key, uri or artist+title).
    pub async fn insert_song(
        &self,
        key: i64,
        artist: &str,
        title: &str,
        spotify_uri: &str,
    ) -> Result<Song> {
        let artist = artist.to_string();
        let title = title.to_string();
        let spotify_uri = spotify_uri.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                tx.execute(
                    "INSERT INTO song (key, artist, title, spotify_uri) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![key, artist, title, spotify_uri],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;
                Ok(Song {
                    id,
                    key,
                    artist,
                    title,
                    spotify_uri: Some(spotify_uri),
                })
            })
            .await
            .map_err(Into::into)
    }

    /// Number of plays recorded for a station.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn play_count(&self, station: i64) -> Result<i64> {
        self.conn
            .call(move |conn| {
                let count = conn.query_row(
                    "SELECT COUNT(*) FROM play WHERE station = ?1",
                    rusqlite::params![station],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
            .map_err(Into::into)
    }

    /// The station's most played songs since `since`, ordered by play count
    /// and then by most recent play, capped at `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn top_songs(
        &self,
        station: i64,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<TopSong>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    r"
                    SELECT s.id, s.artist, s.title, s.spotify_uri,
                           COUNT(p.id) AS play_count, MAX(p.at) AS last_played
                    FROM play p
                    JOIN song s ON s.id = p.song
                    WHERE p.at > ?1 AND p.station = ?2
                    GROUP BY s.id
                    ORDER BY play_count DESC, last_played DESC
                    LIMIT ?3
                    ",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![to_ts(since), station, limit], |row| {
                        Ok(TopSong {
                            song: row.get(0)?,
                            artist: row.get(1)?,
                            title: row.get(2)?,
                            spotify_uri: row.get(3)?,
                            play_count: row.get(4)?,
                            last_played: from_ts(row.get(5)?),
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(Into::into)
    }

    /// Fetch or create the playlist row for `(station, kind)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn ensure_playlist(&self, station: i64, kind: &str) -> Result<Playlist> {
        let kind = kind.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO playlist (station, kind, spotify_uri) VALUES (?1, ?2, NULL)",
                    rusqlite::params![station, kind],
                )?;
                let playlist = conn.query_row(
                    "SELECT id, station, kind, spotify_uri FROM playlist WHERE station = ?1 AND kind = ?2",
                    rusqlite::params![station, kind],
                    |row| {
                        Ok(Playlist {
                            id: row.get(0)?,
                            station: row.get(1)?,
                            kind: row.get(2)?,
                            spotify_uri: row.get(3)?,
                        })
                    },
                )?;
                Ok(playlist)
            })
            .await
            .map_err(Into::into)
    }

    /// Store the remote playlist URI, but only while it is still null. The
    /// URI is monotonic: once set it is never changed or cleared. Returns
    /// whether this call set it.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn set_playlist_uri_if_unset(&self, id: i64, uri: &str) -> Result<bool> {
        let uri = uri.to_string();
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE playlist SET spotify_uri = ?1 WHERE id = ?2 AND spotify_uri IS NULL",
                    rusqlite::params![uri, id],
                )?;
                Ok(changed == 1)
            })
            .await
            .map_err(Into::into)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn state(&self, key: StateKey) -> Result<Option<String>> {
        self.conn
            .call(move |conn| {
                let value = conn
                    .query_row(
                        "SELECT value FROM state WHERE key = ?1",
                        rusqlite::params![key.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await
            .map_err(Into::into)
    }

    /// Upsert a state value under an exclusive transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn put_state(&self, key: StateKey, value: String) -> Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                tx.execute(
                    r"
                    INSERT INTO state (key, value) VALUES (?1, ?2)
                    ON CONFLICT(key) DO UPDATE SET value = excluded.value
                    ",
                    rusqlite::params![key.as_str(), value],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }
}

fn row_to_song(row: &rusqlite::Row<'_>) -> std::result::Result<Song, rusqlite::Error> {
    Ok(Song {
        id: row.get(0)?,
        key: row.get(1)?,
        artist: row.get(2)?,
        title: row.get(3)?,
        spotify_uri: row.get(4)?,
    })
}
