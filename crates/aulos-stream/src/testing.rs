//! In-memory collaborators for tests: a scriptable loader and a sink
//! backed by a plain range set.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use aulos_core::{
    BufferedRanges, ByteRange, ContentLocator, Representation, Segment, StaticSegmentIndex,
    TaggedRange,
};
use aulos_net::{NetError, NetResult};
use bytes::Bytes;
use parking_lot::Mutex;
use url::Url;

use crate::{error::MediaError, fetcher::SegmentLoader, sink::SegmentSink};

/// Route traces to the test output, honoring `RUST_LOG`. Safe to call
/// from every test; only the first call installs a subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

type ErrorFactory = Box<dyn Fn() -> NetError + Send + Sync>;

struct Script {
    remaining_failures: u32,
    make_error: Option<ErrorFactory>,
    data: Option<Bytes>,
    calls: u32,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            remaining_failures: 0,
            make_error: None,
            data: None,
            calls: 0,
        }
    }
}

/// Loader whose responses are scripted per URL.
#[derive(Default)]
pub struct FakeLoader {
    scripts: Mutex<HashMap<String, Script>>,
    delay: Mutex<Option<std::time::Duration>>,
}

impl FakeLoader {
    /// Delay every response, so tests can interleave with in-flight
    /// requests under paused time.
    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Serve `data` for every request to `url` once scripted failures
    /// are exhausted.
    pub fn serve(&self, url: &str, data: impl Into<Bytes>) {
        self.scripts.lock().entry(url.to_string()).or_default().data = Some(data.into());
    }

    /// Fail the next `count` requests to `url` with errors from `make`.
    pub fn fail_times(
        &self,
        url: &str,
        count: u32,
        make: impl Fn() -> NetError + Send + Sync + 'static,
    ) {
        let mut scripts = self.scripts.lock();
        let script = scripts.entry(url.to_string()).or_default();
        script.remaining_failures = count;
        script.make_error = Some(Box::new(make));
    }

    /// How many times `url` was requested.
    pub fn calls(&self, url: &str) -> u32 {
        self.scripts.lock().get(url).map_or(0, |s| s.calls)
    }
}

#[async_trait]
impl SegmentLoader for FakeLoader {
    async fn load(&self, url: Url, _byte_range: Option<ByteRange>) -> NetResult<Bytes> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut scripts = self.scripts.lock();
        let Some(script) = scripts.get_mut(url.as_str()) else {
            return Err(NetError::http_status(404, url));
        };
        script.calls += 1;
        if script.remaining_failures > 0 {
            script.remaining_failures = script.remaining_failures.saturating_sub(1);
            if let Some(make) = &script.make_error {
                return Err(make());
            }
        }
        match &script.data {
            Some(data) => Ok(data.clone()),
            None => Err(NetError::http_status(404, url)),
        }
    }
}

#[derive(Debug, Default)]
struct FakeSinkState {
    buffered: BufferedRanges,
    init_declared: Vec<String>,
    pushed: Vec<ContentLocator>,
    flushes: u32,
}

/// Sink over an in-memory range set.
///
/// An optional quota (total buffered seconds) makes pushes fail with
/// `BufferFull`, which is how the degradation ladder is exercised.
#[derive(Debug, Default)]
pub struct FakeSink {
    state: Mutex<FakeSinkState>,
    quota_seconds: Mutex<Option<f64>>,
}

impl FakeSink {
    pub fn with_quota(seconds: f64) -> Self {
        let sink = Self::default();
        *sink.quota_seconds.lock() = Some(seconds);
        sink
    }

    pub fn pushed(&self) -> Vec<ContentLocator> {
        self.state.lock().pushed.clone()
    }

    pub fn init_declared(&self) -> Vec<String> {
        self.state.lock().init_declared.clone()
    }

    pub fn flushes(&self) -> u32 {
        self.state.lock().flushes
    }

    fn total_buffered(state: &FakeSinkState) -> f64 {
        state.buffered.iter().map(|r| r.end - r.start).sum()
    }
}

#[async_trait]
impl SegmentSink for FakeSink {
    async fn declare_init_segment(
        &self,
        content: &ContentLocator,
        _data: Bytes,
    ) -> Result<(), MediaError> {
        self.state
            .lock()
            .init_declared
            .push(content.representation_id.clone());
        Ok(())
    }

    async fn push_segment(&self, content: &ContentLocator, _data: Bytes) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        if let Some(quota) = *self.quota_seconds.lock() {
            if Self::total_buffered(&state) + content.segment.duration > quota {
                return Err(MediaError::BufferFull);
            }
        }
        state.buffered.insert(TaggedRange {
            start: content.segment.start,
            end: content.segment.end(),
            locator: content.clone(),
        });
        state.pushed.push(content.clone());
        Ok(())
    }

    async fn remove(&self, start: f64, end: f64) -> Result<(), MediaError> {
        self.state.lock().buffered.remove(start, end);
        Ok(())
    }

    async fn flush(&self) -> Result<(), MediaError> {
        self.state.lock().flushes += 1;
        Ok(())
    }

    async fn buffered(&self) -> BufferedRanges {
        self.state.lock().buffered.clone()
    }
}

/// Locator over fixed test ids.
pub fn locator_for(segment: Segment) -> ContentLocator {
    ContentLocator {
        manifest_id: "m".into(),
        period_id: "p".into(),
        adaptation_id: "a".into(),
        representation_id: "r".into(),
        segment,
    }
}

/// Representation whose segments tile `[0, total)` in `duration` steps,
/// each addressable at `http://cdn/<id>/seg-<n>`.
pub fn tiled_representation(id: &str, bitrate: u64, total: f64, duration: f64) -> Representation {
    let mut media = Vec::new();
    let mut start = 0.0;
    let mut n = 0;
    while start < total {
        let mut segment = Segment::media(start, duration.min(total - start));
        segment.id = format!("{id}-seg-{n}");
        segment.urls = vec![Url::parse(&format!("http://cdn/{id}/seg-{n}")).expect("test url")];
        media.push(segment);
        start += duration;
        n += 1;
    }
    let mut init = Segment::init();
    init.urls = vec![Url::parse(&format!("http://cdn/{id}/init")).expect("test url")];
    Representation {
        id: id.into(),
        bitrate,
        codec: "mp4a.40.2".into(),
        width: None,
        height: None,
        frame_rate: None,
        channels: Some(2),
        sample_rate: Some(48_000),
        index: Arc::new(StaticSegmentIndex::new(Some(init), media, true)),
    }
}

/// Serve every segment of `representation` from `loader` with
/// `bytes_per_segment` zero bytes.
pub fn serve_representation(
    loader: &FakeLoader,
    representation: &Representation,
    bytes_per_segment: usize,
) {
    if let Some(init) = representation.index.init_segment() {
        for url in &init.urls {
            loader.serve(url.as_str(), vec![0_u8; 64]);
        }
    }
    for segment in representation.index.segments(0.0, f64::INFINITY) {
        for url in &segment.urls {
            loader.serve(url.as_str(), vec![0_u8; bytes_per_segment]);
        }
    }
}
