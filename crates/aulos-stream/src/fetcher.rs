use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use aulos_abr::{BandwidthEstimator, PendingRequestsStore, RequestStart};
use aulos_core::{ByteRange, ContentLocator, TrackType};
use aulos_net::{try_urls_with_backoff, BackoffOptions, NetError, NetResult};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Transport used to resolve one URL into bytes, implemented by the
/// host (HTTP client, test double, custom loader).
#[async_trait]
pub trait SegmentLoader: Send + Sync {
    async fn load(&self, url: Url, byte_range: Option<ByteRange>) -> NetResult<Bytes>;
}

/// Request-lifecycle telemetry, tagged with a locally unique id.
#[derive(Clone, Debug)]
pub enum FetcherEvent {
    RequestBegin { id: u64, time: f64, duration: f64 },
    Progress { id: u64, size: u64, elapsed: Duration },
    RequestEnd { id: u64 },
    Metrics { size: u64, duration: Duration },
    /// Non-fatal retry; data keeps flowing after it.
    Warning { id: u64, error: NetError, attempt: u32 },
}

/// Segment downloader for one track type.
///
/// Wraps the retry engine and feeds every completed request into the
/// track's bandwidth estimator and pending-requests store. Init
/// segments are cached so a representation switch does not refetch
/// them.
pub struct SegmentFetcher {
    track_type: TrackType,
    loader: Arc<dyn SegmentLoader>,
    backoff: BackoffOptions,
    estimator: Arc<Mutex<BandwidthEstimator>>,
    pending: Arc<Mutex<PendingRequestsStore>>,
    init_cache: Mutex<HashMap<String, Bytes>>,
    next_id: AtomicU64,
    events: broadcast::Sender<FetcherEvent>,
}

impl SegmentFetcher {
    pub fn new(
        track_type: TrackType,
        loader: Arc<dyn SegmentLoader>,
        backoff: BackoffOptions,
        estimator: Arc<Mutex<BandwidthEstimator>>,
        pending: Arc<Mutex<PendingRequestsStore>>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            track_type,
            loader,
            backoff,
            estimator,
            pending,
            init_cache: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            events,
        }
    }

    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<FetcherEvent> {
        self.events.subscribe()
    }

    pub fn pending(&self) -> Arc<Mutex<PendingRequestsStore>> {
        self.pending.clone()
    }

    /// Download one segment, rotating through its candidate URLs.
    ///
    /// Warnings for retried failures are emitted as [`FetcherEvent`]s;
    /// only the final outcome is returned.
    pub async fn fetch(
        &self,
        content: &ContentLocator,
        cancel: &CancellationToken,
    ) -> NetResult<Bytes> {
        let segment = &content.segment;
        if segment.is_init {
            if let Some(data) = self.init_cache.lock().get(&cache_key(content)) {
                tracing::debug!(track = %self.track_type, "init segment served from cache");
                return Ok(data.clone());
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().add(RequestStart {
            id,
            time: segment.start,
            duration: segment.duration,
            started_at: Instant::now(),
            content: content.clone(),
        });
        let guard = PendingGuard {
            pending: self.pending.clone(),
            events: self.events.clone(),
            id,
        };
        let _ = self.events.send(FetcherEvent::RequestBegin {
            id,
            time: segment.start,
            duration: segment.duration,
        });

        let loader = self.loader.clone();
        let byte_range = segment.byte_range;
        let result = try_urls_with_backoff(
            &segment.urls,
            |url| {
                let loader = loader.clone();
                async move {
                    let started = Instant::now();
                    let data = loader.load(url, byte_range).await?;
                    Ok((data, started.elapsed()))
                }
            },
            &self.backoff,
            |error, attempt| {
                tracing::debug!(
                    track = %self.track_type,
                    %error,
                    attempt,
                    "segment request retried"
                );
                let _ = self.events.send(FetcherEvent::Warning {
                    id,
                    error: error.clone(),
                    attempt,
                });
            },
            cancel,
        )
        .await;

        drop(guard);
        let (data, elapsed) = result?;

        let size = data.len() as u64;
        let _ = self.events.send(FetcherEvent::Progress {
            id,
            size,
            elapsed,
        });
        let _ = self.events.send(FetcherEvent::Metrics {
            size,
            duration: elapsed,
        });
        self.estimator.lock().add_sample(elapsed, size, false);

        if segment.is_init {
            self.init_cache
                .lock()
                .insert(cache_key(content), data.clone());
        }
        Ok(data)
    }
}

/// Clears the pending entry and announces the request's end when the
/// request finishes, including when the owning future is dropped with
/// the download still in flight.
struct PendingGuard {
    pending: Arc<Mutex<PendingRequestsStore>>,
    events: broadcast::Sender<FetcherEvent>,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(self.id);
        let _ = self.events.send(FetcherEvent::RequestEnd { id: self.id });
    }
}

/// Init segments are addressed by URL when they have one, otherwise by
/// their position in the content tree.
fn cache_key(content: &ContentLocator) -> String {
    content
        .segment
        .urls
        .first()
        .map(Url::to_string)
        .unwrap_or_else(|| {
            format!(
                "{}/{}/{}",
                content.adaptation_id, content.representation_id, content.segment.id
            )
        })
}
