//! ICY metadata parser.
//!
//! Shoutcast-style streams carry the current song in the `StreamTitle` tag,
//! which `ffprobe` can extract without us decoding any audio. The probe runs
//! as a subprocess every two minutes; an observation is emitted only when
//! the title changes.

use crate::{SongInfo, SongInfoStream, SongSource, StreamError};
use async_stream::try_stream;
use serde::Deserialize;
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::{sleep, Duration};
use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_secs(120);

pub struct IcyStream {
    url: String,
}

impl IcyStream {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl SongSource for IcyStream {
    fn name(&self) -> &'static str {
        "icy"
    }

    fn read_song_info(&self) -> SongInfoStream {
        let url = self.url.clone();
        Box::pin(try_stream! {
            let mut previous: Option<SongInfo> = None;
            // A format rejection may only escape on the first probe; once
            // the stream has produced one well-formed title, a tag-less
            // probe is a skipped tick, not a format change.
            let mut accepted = false;
            loop {
                match probe_stream_title(&url).await {
                    Ok(title) => {
                        accepted = true;
                        let info = split_stream_title(&title);
                        if previous.as_ref() != Some(&info) {
                            previous = Some(info.clone());
                            yield info;
                        }
                    }
                    Err(err) if err.is_format() && accepted => {
                        warn!("Transient malformed probe output from {url}, skipping tick: {err}");
                    }
                    Err(err) => Err(err)?,
                }
                sleep(POLL_INTERVAL).await;
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    tags: ProbeTags,
}

#[derive(Debug, Deserialize)]
struct ProbeTags {
    #[serde(rename = "StreamTitle")]
    stream_title: String,
}

/// Run `ffprobe` against the stream and return the `StreamTitle` tag.
///
/// A missing binary or spawn failure propagates as an IO error; output that
/// does not carry the expected shape is a format mismatch, which the poll
/// loop treats as a rejection on the first probe and a skipped tick after.
async fn probe_stream_title(url: &str) -> Result<String, StreamError> {
    let output = Command::new("ffprobe")
        .args(["-v", "error", "-show_format", "-of", "json"])
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        warn!(
            "ffprobe exited with {} for {url}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    parse_probe_output(&output.stdout)
}

fn parse_probe_output(stdout: &[u8]) -> Result<String, StreamError> {
    serde_json::from_slice::<ProbeOutput>(stdout)
        .map(|probe| probe.format.tags.stream_title)
        .map_err(|_| StreamError::Format("Not an ICY stream".into()))
}

/// Split a `StreamTitle` on the first `" - "` into artist and title. With no
/// separator the whole string is the title and the artist is unknown.
fn split_stream_title(stream_title: &str) -> SongInfo {
    match stream_title.split_once(" - ") {
        Some((artist, title)) => SongInfo {
            artist: Some(artist.to_string()),
            title: Some(title.to_string()),
            file: None,
        },
        None => SongInfo {
            artist: None,
            title: Some(stream_title.to_string()),
            file: None,
        },
    }
}
