//! Configuration loading.
//!
//! A single YAML document describes the stations to monitor, the database
//! location and the Spotify application credentials. Database and Spotify
//! fields can be overridden through `RDB_DATABASE_*` / `RDB_SPOTIFY_*`
//! environment variables. Filter regexes are compiled once, at load time.

use crate::error::{CoreError, Result};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::Path;
use tracing::warn;

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub stations: Vec<StationConfig>,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub spotify: SpotifyConfig,
}

/// One monitored radio station.
#[derive(Debug, Clone, Deserialize)]
pub struct StationConfig {
    /// Stable short identifier; the `station` row is keyed on this.
    pub key: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub filters: Option<FilterConfig>,
    #[serde(default)]
    pub playlists: Vec<PlaylistConfig>,
}

/// Per-station observation filters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterConfig {
    /// Matches are substituted out of the normalised form before
    /// fingerprinting and searching.
    #[serde(default, deserialize_with = "regex_opt")]
    pub blank: Option<Regex>,
    /// Observations whose normalised form matches are dropped entirely.
    #[serde(default, deserialize_with = "regex_opt")]
    pub ignore: Option<Regex>,
}

/// A playlist to maintain on the remote catalog for a station.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistConfig {
    #[serde(rename = "type", default)]
    pub kind: PlaylistKind,
    #[serde(default = "default_days")]
    pub days: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

const fn default_days() -> u32 {
    7
}

const fn default_limit() -> u32 {
    100
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            kind: PlaylistKind::Top,
            days: default_days(),
            limit: default_limit(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaylistKind {
    #[default]
    Top,
}

impl PlaylistKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Top => "top",
        }
    }
}

/// Database location.
///
/// `connection_string` is a SQLite file path, `:memory:`, or a
/// `sqlite://<path>` URL. The legacy host/username/password/name quartet is
/// still accepted; only `name` is meaningful with the embedded backend.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub connection_string: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl DatabaseConfig {
    /// Resolve the configured location to a SQLite path.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConfigInvalid` if neither a connection string nor
    /// a legacy database name is configured.
    pub fn connection_path(&self) -> Result<String> {
        if let Some(ref raw) = self.connection_string {
            let path = raw.strip_prefix("sqlite://").unwrap_or(raw);
            return Ok(path.to_string());
        }
        if let Some(ref name) = self.name {
            if self.host.is_some() || self.username.is_some() || self.password.is_some() {
                warn!(
                    "database host/username/password are ignored with the embedded backend; \
                     using local file {name}.db"
                );
            }
            return Ok(format!("{name}.db"));
        }
        Err(CoreError::ConfigInvalid {
            message: "database.connection_string is required".into(),
        })
    }
}

/// Spotify application credentials and the operator-supplied token seed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpotifyConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Base64 of a JSON OAuth token, as printed by `radiodb authorise`.
    /// Only consulted when the database holds no token yet.
    #[serde(default)]
    pub auth_seed: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
}

fn default_redirect_uri() -> String {
    "http://localhost:8888/callback".to_string()
}

impl Config {
    /// Load the configuration from a YAML file and apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, fails to parse, or fails
    /// validation.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CoreError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }
        let content = fs::read_to_string(path)?;
        let mut config: Self = serde_yaml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("RDB_DATABASE_CONNECTION_STRING") {
            self.database.connection_string = Some(val);
        }
        if let Ok(val) = std::env::var("RDB_DATABASE_HOST") {
            self.database.host = Some(val);
        }
        if let Ok(val) = std::env::var("RDB_DATABASE_USERNAME") {
            self.database.username = Some(val);
        }
        if let Ok(val) = std::env::var("RDB_DATABASE_PASSWORD") {
            self.database.password = Some(val);
        }
        if let Ok(val) = std::env::var("RDB_DATABASE_NAME") {
            self.database.name = Some(val);
        }
        if let Ok(val) = std::env::var("RDB_SPOTIFY_CLIENT_ID") {
            self.spotify.client_id = val;
        }
        if let Ok(val) = std::env::var("RDB_SPOTIFY_CLIENT_SECRET") {
            self.spotify.client_secret = val;
        }
        if let Ok(val) = std::env::var("RDB_SPOTIFY_AUTH_SEED") {
            self.spotify.auth_seed = val;
        }
        if let Ok(val) = std::env::var("RDB_SPOTIFY_REDIRECT_URI") {
            self.spotify.redirect_uri = val;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.stations.is_empty() {
            return Err(CoreError::ConfigInvalid {
                message: "at least one station must be configured".into(),
            });
        }
        let mut keys: Vec<&str> = self.stations.iter().map(|s| s.key.as_str()).collect();
        keys.sort_unstable();
        keys.dedup();
        if keys.len() != self.stations.len() {
            return Err(CoreError::ConfigInvalid {
                message: "station keys must be unique".into(),
            });
        }
        Ok(())
    }

    /// Find a station's configuration by its stable key.
    #[must_use]
    pub fn station(&self, key: &str) -> Option<&StationConfig> {
        self.stations.iter().find(|s| s.key == key)
    }
}

fn regex_opt<'de, D>(deserializer: D) -> std::result::Result<Option<Regex>, D::Error>
where
    D: Deserializer<'de>,
{
    let pattern: Option<String> = Option::deserialize(deserializer)?;
    pattern
        .map(|p| Regex::new(&p).map_err(serde::de::Error::custom))
        .transpose()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
stations:
  - key: georgefm
    name: George FM
    url: https://ais.example.com/nz_009/playlist.m3u8
    filters:
      ignore: "^news "
      blank: " \\(radio edit\\)"
    playlists:
      - type: top
        days: 14
  - key: hauraki
    name: Radio Hauraki
    url: https://radio-api.example.com/station/hauraki
database:
  connection_string: radio.db
spotify:
  client_id: abc
  client_secret: def
"#;

    #[test]
    fn parses_full_document() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.stations.len(), 2);

        let george = &config.stations[0];
        assert_eq!(george.key, "georgefm");
        let filters = george.filters.as_ref().unwrap();
        assert!(filters.ignore.as_ref().unwrap().is_match("news 6pm"));
        assert_eq!(
            filters.blank.as_ref().unwrap().replace_all("song (radio edit)", ""),
            "song"
        );
        assert_eq!(george.playlists[0].days, 14);
        assert_eq!(george.playlists[0].limit, 100);
        assert_eq!(george.playlists[0].kind, PlaylistKind::Top);

        assert!(config.stations[1].filters.is_none());
        assert!(config.stations[1].playlists.is_empty());
    }

    #[test]
    fn playlist_defaults() {
        let playlist = PlaylistConfig::default();
        assert_eq!(playlist.kind, PlaylistKind::Top);
        assert_eq!(playlist.days, 7);
        assert_eq!(playlist.limit, 100);
    }

    #[test]
    fn invalid_filter_regex_is_a_parse_error() {
        let doc = r#"
stations:
  - key: a
    name: A
    url: http://a
    filters:
      ignore: "("
"#;
        assert!(serde_yaml::from_str::<Config>(doc).is_err());
    }

    #[test]
    fn duplicate_station_keys_rejected() {
        let doc = r"
stations:
  - { key: a, name: A, url: http://a }
  - { key: a, name: B, url: http://b }
";
        let config: Config = serde_yaml::from_str(doc).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn connection_path_strips_sqlite_scheme() {
        let db = DatabaseConfig {
            connection_string: Some("sqlite:///var/lib/radio.db".into()),
            ..Default::default()
        };
        assert_eq!(db.connection_path().unwrap(), "/var/lib/radio.db");
    }

    #[test]
    fn legacy_quartet_degrades_to_local_file() {
        let db = DatabaseConfig {
            host: Some("db.example.com".into()),
            username: Some("radio".into()),
            password: Some("secret".into()),
            name: Some("radio".into()),
            ..Default::default()
        };
        assert_eq!(db.connection_path().unwrap(), "radio.db");
    }

    #[test]
    fn missing_database_location_is_invalid() {
        assert!(DatabaseConfig::default().connection_path().is_err());
    }

    #[test]
    fn station_lookup_by_key() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.station("hauraki").unwrap().name, "Radio Hauraki");
        assert!(config.station("nope").is_none());
    }
}
