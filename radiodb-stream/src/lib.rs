//! Now-playing stream parsers.
//!
//! A station URL can speak one of several incompatible formats: an HLS
//! playlist with inline segment metadata, an ICY stream probed through
//! `ffprobe`, or a JSON now-playing API. Each parser turns a URL into an
//! infinite stream of [`SongInfo`] observations; the dispatcher probes them
//! in a fixed order and forwards the first one that recognises the stream.

pub mod api;
pub mod hls;
pub mod icy;

use async_stream::try_stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;
use tracing::debug;

/// The lowest-common-denominator record a parser can emit. The station
/// monitor only acts on observations carrying both an artist and a title;
/// `file` is the segment URI used by the HLS parser for deduplication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SongInfo {
    pub artist: Option<String>,
    pub title: Option<String>,
    pub file: Option<String>,
}

#[derive(Debug, Error)]
pub enum StreamError {
    /// The parser does not recognise this stream. Raised on the first probe
    /// only; the dispatcher treats it as a skip signal.
    #[error("Unrecognised stream format: {0}")]
    Format(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    #[must_use]
    pub const fn is_format(&self) -> bool {
        matches!(self, Self::Format(_))
    }
}

pub type SongInfoStream = BoxStream<'static, Result<SongInfo, StreamError>>;

/// A parser for one stream format.
pub trait SongSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// An infinite stream of observations, or a [`StreamError::Format`]
    /// rejection on the first probe. Once a stream has been accepted, later
    /// shape anomalies are logged and polled past by the parser itself;
    /// only network and IO failures surface mid-stream.
    fn read_song_info(&self) -> SongInfoStream;
}

/// Probe `url` with every known parser in order and forward the stream of
/// the first one that accepts it.
#[must_use]
pub fn read_song_info(client: &reqwest::Client, url: &str) -> SongInfoStream {
    let sources: Vec<Box<dyn SongSource>> = vec![
        Box::new(hls::HlsStream::new(client.clone(), url)),
        Box::new(icy::IcyStream::new(url)),
        Box::new(api::NowPlayingApi::new(client.clone(), url)),
    ];
    dispatch(sources, url.to_string())
}

fn dispatch(sources: Vec<Box<dyn SongSource>>, url: String) -> SongInfoStream {
    Box::pin(try_stream! {
        for source in sources {
            let mut stream = source.read_song_info();
            match stream.next().await {
                Some(Ok(first)) => {
                    debug!("{} accepted {url}", source.name());
                    yield first;
                    // Accepted: forward transparently, errors and all.
                    while let Some(item) = stream.next().await {
                        yield item?;
                    }
                    return;
                }
                Some(Err(err)) if err.is_format() => {
                    debug!("{} rejected {url}: {err}", source.name());
                }
                Some(Err(err)) => {
                    Err(err)?;
                }
                None => return,
            }
        }
        Err(StreamError::Format(format!("No compatible parser found for {url}")))?;
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct StubSource {
        name: &'static str,
        items: Mutex<Option<Vec<Result<SongInfo, StreamError>>>>,
    }

    impl StubSource {
        fn new(name: &'static str, items: Vec<Result<SongInfo, StreamError>>) -> Box<Self> {
            Box::new(Self {
                name,
                items: Mutex::new(Some(items)),
            })
        }
    }

    impl SongSource for StubSource {
        fn name(&self) -> &'static str {
            self.name
        }

        fn read_song_info(&self) -> SongInfoStream {
            let items = self.items.lock().unwrap().take().unwrap_or_default();
            Box::pin(futures::stream::iter(items))
        }
    }

    fn info(title: &str) -> SongInfo {
        SongInfo {
            title: Some(title.to_string()),
            ..Default::default()
        }
    }

    fn reject() -> Result<SongInfo, StreamError> {
        Err(StreamError::Format("nope".into()))
    }

    #[tokio::test]
    async fn falls_back_past_format_rejections() {
        let sources: Vec<Box<dyn SongSource>> = vec![
            StubSource::new("first", vec![reject()]),
            StubSource::new("second", vec![Ok(info("a")), Ok(info("b"))]),
        ];
        let items: Vec<_> = dispatch(sources, "http://x".into()).collect().await;
        let items: Vec<_> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(items, vec![info("a"), info("b")]);
    }

    #[tokio::test]
    async fn exhaustion_is_a_format_error() {
        let sources: Vec<Box<dyn SongSource>> = vec![
            StubSource::new("first", vec![reject()]),
            StubSource::new("second", vec![reject()]),
        ];
        let mut stream = dispatch(sources, "http://x".into());
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.is_format());
        assert!(err.to_string().contains("No compatible parser found"));
    }

    #[tokio::test]
    async fn non_format_probe_errors_propagate() {
        let io_err = || Err(StreamError::Io(std::io::Error::other("boom")));
        let sources: Vec<Box<dyn SongSource>> = vec![
            StubSource::new("first", vec![io_err()]),
            StubSource::new("second", vec![Ok(info("never"))]),
        ];
        let mut stream = dispatch(sources, "http://x".into());
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(!err.is_format());
        // The second source must not have been probed.
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn mid_stream_errors_are_forwarded_not_swallowed() {
        let sources: Vec<Box<dyn SongSource>> = vec![StubSource::new(
            "only",
            vec![
                Ok(info("a")),
                Err(StreamError::Io(std::io::Error::other("connection reset"))),
            ],
        )];
        let mut stream = dispatch(sources, "http://x".into());
        assert_eq!(stream.next().await.unwrap().unwrap(), info("a"));
        assert!(stream.next().await.unwrap().is_err());
    }
}
