//! Station monitors and the long-running supervisor.

use crate::pending;
use anyhow::{Context, Result};
use chrono::Utc;
use futures::{Stream, StreamExt};
use radiodb_core::{Config, Database, StationConfig};
use radiodb_spotify::SearchClient;
use radiodb_stream::{SongInfo, StreamError};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Run one monitor task per configured station plus the single pending
/// worker, until killed or until the first task fails.
pub async fn run(db: Arc<Database>, config: Config) -> Result<()> {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down");
                cancel.cancel();
            }
        });
    }

    let search = Arc::new(
        SearchClient::new(&config.spotify)
            .await
            .context("Failed to obtain a Spotify application token")?,
    );
    let http = reqwest::Client::new();
    let config = Arc::new(config);

    let mut tasks = JoinSet::new();
    for station in config.stations.clone() {
        let db = Arc::clone(&db);
        let http = http.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { monitor_station(&db, &http, &station, cancel).await });
    }
    {
        let db = Arc::clone(&db);
        let config = Arc::clone(&config);
        let cancel = cancel.clone();
        tasks.spawn(async move { pending::run(&db, search.as_ref(), &config, cancel).await });
    }

    // Propagate the first failure; dropping the set aborts the survivors.
    while let Some(joined) = tasks.join_next().await {
        joined.context("Task aborted")??;
    }
    Ok(())
}

/// Reconcile the station row from config, then feed its observation stream
/// into the pending table.
async fn monitor_station(
    db: &Database,
    http: &reqwest::Client,
    station_config: &StationConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let station = db
        .upsert_station(&station_config.key, &station_config.name, &station_config.url)
        .await?;
    info!("Monitoring {} ({})", station.name, station.url);

    let stream = radiodb_stream::read_song_info(http, &station_config.url);
    watch(db, station.id, stream, cancel).await
}

/// Insert a pending row whenever the observed `(artist, title)` changes.
/// Observations missing either field are ignored.
async fn watch(
    db: &Database,
    station_id: i64,
    stream: impl Stream<Item = Result<SongInfo, StreamError>> + Unpin,
    cancel: CancellationToken,
) -> Result<()> {
    let mut stream = stream;
    let mut last_artist = String::new();
    let mut last_title = String::new();
    loop {
        let item = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            item = stream.next() => item,
        };
        let Some(item) = item else {
            return Ok(());
        };
        let info = item?;
        let (Some(artist), Some(title)) = (info.artist, info.title) else {
            continue;
        };
        if artist != last_artist || title != last_title {
            info!("Station {station_id} now playing: {artist} - {title}");
            db.insert_pending(station_id, &artist, &title, Utc::now()).await?;
            last_artist = artist;
            last_title = title;
        }
    }
}
