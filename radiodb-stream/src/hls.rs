//! HLS playlist parser.
//!
//! Polls an `#EXTM3U` playlist and emits one observation per new segment,
//! following `#EXT-X-STREAM-INF` variant playlists recursively. Pacing
//! adapts to the playlist's declared durations so a poll lands roughly once
//! per segment.

use crate::{SongInfo, SongInfoStream, SongSource, StreamError};
use async_stream::try_stream;
use futures::StreamExt;
use std::collections::VecDeque;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{trace, warn};

const M3U8_MAGIC: &str = "#EXTM3U";
const INITIAL_TARGET_DURATION: f64 = 5.0;
const DEDUP_WINDOW: usize = 20;

pub struct HlsStream {
    client: reqwest::Client,
    url: String,
}

impl HlsStream {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

impl SongSource for HlsStream {
    fn name(&self) -> &'static str {
        "hls"
    }

    fn read_song_info(&self) -> SongInfoStream {
        song_info(self.client.clone(), self.url.clone())
    }
}

/// One playlist line pair the parser acts on.
#[derive(Debug, Clone, PartialEq)]
enum Entry {
    /// `#EXT-X-STREAM-INF` followed by the variant playlist URI.
    Variant { url: String },
    /// `#EXT-X-TARGETDURATION:<n>`.
    TargetDuration(i64),
    /// `#EXTINF` followed by the segment URI.
    Segment { info: SongInfo, duration: Option<f64> },
}

/// Parse a playlist body into entries.
///
/// The first bytes must be the `#EXTM3U` magic; anything else rejects the
/// stream. Tags are walked with a two-line lookahead (tag line + URI line),
/// stopping at the first blank line.
fn parse_playlist(body: &str) -> Result<Vec<Entry>, StreamError> {
    if !body.starts_with(M3U8_MAGIC) {
        return Err(StreamError::Format("Not an m3u8 stream".into()));
    }

    let mut entries = Vec::new();
    // Skip the header line itself.
    let mut lines = body.lines().skip(1).map(str::trim);
    let mut lookahead = lines.next().unwrap_or("").to_string();
    loop {
        let line = lookahead;
        lookahead = lines.next().unwrap_or("").to_string();
        if line.is_empty() {
            break;
        }
        let (tag, value) = line.split_once(':').unwrap_or((line.as_str(), ""));
        match tag {
            "#EXT-X-STREAM-INF" => entries.push(Entry::Variant {
                url: lookahead.clone(),
            }),
            "#EXT-X-TARGETDURATION" => {
                if let Ok(n) = value.trim().parse::<i64>() {
                    entries.push(Entry::TargetDuration(n));
                } else {
                    trace!("Ignoring malformed target duration {value:?}");
                }
            }
            "#EXTINF" => {
                let (duration, tags) = parse_inf(value);
                let lookup = |key: &str| {
                    tags.iter()
                        .find(|(k, _)| k == key)
                        .map(|(_, v)| v.clone())
                };
                entries.push(Entry::Segment {
                    info: SongInfo {
                        artist: lookup("artist"),
                        title: lookup("title"),
                        file: Some(lookahead.clone()),
                    },
                    duration,
                });
            }
            _ => {}
        }
    }
    Ok(entries)
}

/// Parse an `#EXTINF` value: a leading duration up to the first comma, then
/// a comma-separated `key=value` list where values may be double-quoted with
/// backslash escapes. Unquoted value characters are discarded.
fn parse_inf(value: &str) -> (Option<f64>, Vec<(String, String)>) {
    let mut chars = value.chars();
    let leading: String = chars.by_ref().take_while(|c| *c != ',').collect();
    let duration = leading.trim().parse::<f64>().ok();

    let mut tags = Vec::new();
    let mut eol = false;
    while !eol {
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        let mut tag_value = String::new();
        let mut escape = false;
        let mut quote = false;
        loop {
            let Some(c) = chars.next() else {
                eol = true;
                break;
            };
            if escape {
                tag_value.push(c);
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if quote {
                if c == '"' {
                    quote = false;
                } else {
                    tag_value.push(c);
                }
            } else if c == '"' {
                quote = true;
            } else if c == ',' {
                break;
            }
        }
        if !key.is_empty() {
            tags.push((key, tag_value));
        }
    }
    (duration, tags)
}

/// Sliding window over the last segment URIs seen on this parser instance.
struct RecentWindow {
    seen: VecDeque<String>,
    capacity: usize,
}

impl RecentWindow {
    fn new(capacity: usize) -> Self {
        Self {
            seen: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `file` and report whether it was absent from the window.
    fn admit(&mut self, file: &str) -> bool {
        let fresh = !self.seen.iter().any(|seen| seen == file);
        self.seen.push_back(file.to_string());
        if self.seen.len() > self.capacity {
            self.seen.pop_front();
        }
        fresh
    }
}

/// Fetch a playlist body, checking the magic against the first bytes before
/// reading the rest. A station URL can be a live audio stream that never
/// ends; probing the head means such URLs are rejected instead of read
/// forever.
async fn fetch_playlist(client: &reqwest::Client, url: &str) -> Result<String, StreamError> {
    let mut response = client.get(url).send().await?;
    let magic = M3U8_MAGIC.as_bytes();
    let mut body: Vec<u8> = Vec::new();
    while body.len() < magic.len() {
        match response.chunk().await? {
            Some(chunk) => body.extend_from_slice(&chunk),
            None => break,
        }
    }
    if !body.starts_with(magic) {
        return Err(StreamError::Format("Not an m3u8 stream".into()));
    }
    while let Some(chunk) = response.chunk().await? {
        body.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

fn song_info(client: reqwest::Client, url: String) -> SongInfoStream {
    Box::pin(try_stream! {
        let mut recent = RecentWindow::new(DEDUP_WINDOW);
        // A format rejection may only escape on the first probe. Once the
        // magic has matched, a malformed body is a glitch to poll past, not
        // a format change.
        let mut accepted = false;
        loop {
            let mut target_duration = INITIAL_TARGET_DURATION;
            let entries = match fetch_playlist(&client, &url)
                .await
                .and_then(|body| parse_playlist(&body))
            {
                Ok(entries) => entries,
                Err(err) if err.is_format() && accepted => {
                    warn!("Transient non-playlist response from {url}, skipping poll: {err}");
                    sleep(Duration::from_secs_f64(INITIAL_TARGET_DURATION)).await;
                    continue;
                }
                Err(err) => Err(err)?,
            };
            accepted = true;
            for entry in entries {
                match entry {
                    Entry::Variant { url: variant } => {
                        let mut inner = song_info(client.clone(), variant);
                        while let Some(item) = inner.next().await {
                            let item = match item {
                                Ok(item) => item,
                                Err(err) if err.is_format() => {
                                    // The enclosing playlist is HLS, so a
                                    // rejecting variant is retried on the
                                    // next poll rather than surfaced.
                                    warn!("Variant playlist under {url} rejected: {err}");
                                    break;
                                }
                                Err(err) => Err(err)?,
                            };
                            let fresh = match item.file.as_deref() {
                                Some(file) => recent.admit(file),
                                None => true,
                            };
                            if fresh {
                                yield item;
                            }
                        }
                    }
                    Entry::TargetDuration(n) => {
                        #[allow(clippy::cast_precision_loss)]
                        let declared = n.max(1) as f64;
                        target_duration = target_duration.min(declared);
                    }
                    Entry::Segment { info, duration } => {
                        let segment = duration.unwrap_or(target_duration);
                        target_duration = (target_duration.min(segment) - 1.0).max(0.0);
                        let fresh = match info.file.as_deref() {
                            Some(file) => recent.admit(file),
                            None => true,
                        };
                        if fresh {
                            // Debit the time the consumer spends on the item
                            // from the wait before the next poll.
                            let start = Instant::now();
                            yield info;
                            target_duration =
                                (target_duration - start.elapsed().as_secs_f64()).max(0.0);
                        }
                    }
                }
            }
            sleep(Duration::from_secs_f64(target_duration)).await;
        }
    })
}
