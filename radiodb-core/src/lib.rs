pub mod canonical;
pub mod config;
pub mod db;
pub mod error;

pub use canonical::{normalise, song_key};
pub use config::{
    Config, DatabaseConfig, FilterConfig, PlaylistConfig, PlaylistKind, SpotifyConfig,
    StationConfig,
};
pub use db::{Database, Pending, Playlist, Song, StateKey, Station, TopSong};
pub use error::CoreError;
