//! JSON now-playing API parser.
//!
//! Some broadcasters expose a JSON endpoint whose `nowPlaying` array leads
//! with the song currently on air. Polled every two minutes, emitting only
//! on change.

use crate::{SongInfo, SongInfoStream, SongSource, StreamError};
use async_stream::try_stream;
use serde::Deserialize;
use tokio::time::{sleep, Duration};
use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_secs(120);

pub struct NowPlayingApi {
    client: reqwest::Client,
    url: String,
}

impl NowPlayingApi {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

impl SongSource for NowPlayingApi {
    fn name(&self) -> &'static str {
        "now-playing-api"
    }

    fn read_song_info(&self) -> SongInfoStream {
        let client = self.client.clone();
        let url = self.url.clone();
        Box::pin(try_stream! {
            let mut previous: Option<SongInfo> = None;
            // A format rejection may only escape on the first probe; a
            // briefly empty or malformed feed on a later poll is a skipped
            // tick, not a format change.
            let mut accepted = false;
            loop {
                let body = client.get(&url).send().await?.text().await?;
                match parse_feed(&body) {
                    Ok(info) => {
                        accepted = true;
                        if previous.as_ref() != Some(&info) {
                            previous = Some(info.clone());
                            yield info;
                        }
                    }
                    Err(err) if err.is_format() && accepted => {
                        warn!("Transient malformed now-playing feed from {url}, skipping tick: {err}");
                    }
                    Err(err) => Err(err)?,
                }
                sleep(POLL_INTERVAL).await;
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct Feed {
    #[serde(rename = "nowPlaying")]
    now_playing: Vec<FeedEntry>,
}

#[derive(Debug, Deserialize)]
struct FeedEntry {
    name: String,
    artist: String,
}

fn parse_feed(body: &str) -> Result<SongInfo, StreamError> {
    let feed: Feed = serde_json::from_str(body)
        .map_err(|_| StreamError::Format("Not a now-playing feed".into()))?;
    let entry = feed
        .now_playing
        .into_iter()
        .next()
        .ok_or_else(|| StreamError::Format("Now-playing feed is empty".into()))?;
    Ok(SongInfo {
        artist: Some(entry.artist),
        title: Some(entry.name),
        file: None,
    })
}
