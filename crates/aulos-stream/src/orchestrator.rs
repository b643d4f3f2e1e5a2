//! Top of the stack: owns the shared estimators and the picker
//! registry, and spawns one [`PeriodStream`] per (period, track) pair.

use std::{collections::HashMap, sync::Arc};

use aulos_abr::{
    BandwidthEstimator, DecodingCapabilities, PendingRequestsStore, PickerOptions,
    RepresentationPicker,
};
use aulos_core::{Adaptation, Period, PlaybackObservation, TrackType};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    error::{StreamError, StreamResult},
    events::{EventBus, StreamEvent},
    fetcher::{SegmentFetcher, SegmentLoader},
    options::StreamOptions,
    period::PeriodStream,
    representation::StreamContext,
    sink::SegmentSink,
};

/// One picker per (period, track) pair. Registration is exclusive so
/// two streams can never steer the same slot.
#[derive(Default)]
struct PickerRegistry {
    inner: Mutex<HashMap<(String, TrackType), Arc<Mutex<RepresentationPicker>>>>,
}

impl PickerRegistry {
    fn register(
        &self,
        period_id: &str,
        track_type: TrackType,
        options: PickerOptions,
    ) -> StreamResult<Arc<Mutex<RepresentationPicker>>> {
        let mut inner = self.inner.lock();
        let key = (period_id.to_string(), track_type);
        if inner.contains_key(&key) {
            return Err(StreamError::PickerAlreadyRegistered {
                period_id: period_id.to_string(),
                track_type,
            });
        }
        let picker = Arc::new(Mutex::new(RepresentationPicker::new(options)));
        inner.insert(key, picker.clone());
        Ok(picker)
    }

    fn deregister(&self, period_id: &str, track_type: TrackType) {
        let key = (period_id.to_string(), track_type);
        if self.inner.lock().remove(&key).is_none() {
            tracing::warn!(period_id, track = %track_type, "deregistering an unknown picker");
        }
    }

    fn get(&self, period_id: &str, track_type: TrackType) -> Option<Arc<Mutex<RepresentationPicker>>> {
        self.inner
            .lock()
            .get(&(period_id.to_string(), track_type))
            .cloned()
    }
}

/// Handle on one spawned (period, track) stream.
///
/// Dropping it does not stop the stream; use [`TrackHandle::select`] to
/// change tracks and [`StreamOrchestrator::shutdown`] or the selection
/// channel to wind it down.
pub struct TrackHandle {
    selection: watch::Sender<Option<Adaptation>>,
    join: tokio::task::JoinHandle<StreamResult<()>>,
}

impl TrackHandle {
    /// Switch the active adaptation; `None` silences the track.
    pub fn select(&self, adaptation: Option<Adaptation>) {
        self.selection.send_replace(adaptation);
    }

    /// Wait for the stream to end. Dropping the handle's selection side
    /// first lets the stream finish gracefully.
    pub async fn finished(self) -> StreamResult<()> {
        drop(self.selection);
        match self.join.await {
            Ok(result) => result,
            Err(_join) => Err(StreamError::Cancelled),
        }
    }
}

/// Entry point of the stream stack.
///
/// Bandwidth estimators are shared per track type across every period,
/// so a new period starts with the network knowledge of the previous
/// one. Pickers are per (period, track) and exclusive.
pub struct StreamOrchestrator {
    loader: Arc<dyn SegmentLoader>,
    prober: Arc<dyn DecodingCapabilities>,
    options: StreamOptions,
    events: EventBus,
    estimators: Mutex<HashMap<TrackType, Arc<Mutex<BandwidthEstimator>>>>,
    pending: Mutex<HashMap<TrackType, Arc<Mutex<PendingRequestsStore>>>>,
    pickers: Arc<PickerRegistry>,
    root: CancellationToken,
    tracker: TaskTracker,
}

impl StreamOrchestrator {
    pub fn new(
        loader: Arc<dyn SegmentLoader>,
        prober: Arc<dyn DecodingCapabilities>,
        options: StreamOptions,
    ) -> Self {
        Self {
            loader,
            prober,
            options,
            events: EventBus::default(),
            estimators: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            pickers: Arc::new(PickerRegistry::default()),
            root: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    #[must_use]
    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    /// The shared estimator for `track_type`, created on first use.
    pub fn estimator_for(&self, track_type: TrackType) -> Arc<Mutex<BandwidthEstimator>> {
        self.estimators
            .lock()
            .entry(track_type)
            .or_insert_with(|| {
                Arc::new(Mutex::new(BandwidthEstimator::new(
                    self.options.low_latency_mode,
                )))
            })
            .clone()
    }

    /// The shared pending-requests store for `track_type`.
    pub fn pending_requests_for(&self, track_type: TrackType) -> Arc<Mutex<PendingRequestsStore>> {
        self.pending
            .lock()
            .entry(track_type)
            .or_insert_with(|| Arc::new(Mutex::new(PendingRequestsStore::new())))
            .clone()
    }

    /// Claim the picker slot for `(period_id, track_type)`.
    pub fn register_picker(
        &self,
        period_id: &str,
        track_type: TrackType,
        options: PickerOptions,
    ) -> StreamResult<Arc<Mutex<RepresentationPicker>>> {
        self.pickers.register(period_id, track_type, options)
    }

    /// Release a slot claimed with [`register_picker`].
    ///
    /// [`register_picker`]: StreamOrchestrator::register_picker
    pub fn deregister_picker(&self, period_id: &str, track_type: TrackType) {
        self.pickers.deregister(period_id, track_type);
    }

    /// The registered picker for a slot, if any. Manual bitrate caps and
    /// auto-bounds are steered through it while the stream runs.
    pub fn picker_for(
        &self,
        period_id: &str,
        track_type: TrackType,
    ) -> Option<Arc<Mutex<RepresentationPicker>>> {
        self.pickers.get(period_id, track_type)
    }

    /// Spawn the stream for one track of `period`.
    ///
    /// Claims the picker slot for the pair and releases it when the
    /// stream ends, whatever the outcome.
    #[allow(clippy::too_many_arguments)]
    pub fn start_track(
        &self,
        manifest_id: &str,
        period: &Period,
        track_type: TrackType,
        initial_adaptation: Option<Adaptation>,
        picker_options: PickerOptions,
        sink: Arc<dyn SegmentSink>,
        observations: watch::Receiver<PlaybackObservation>,
    ) -> StreamResult<TrackHandle> {
        let picker = self.register_picker(&period.id, track_type, picker_options)?;
        let estimator = self.estimator_for(track_type);
        let fetcher = Arc::new(SegmentFetcher::new(
            track_type,
            self.loader.clone(),
            self.options.backoff.clone(),
            estimator.clone(),
            self.pending_requests_for(track_type),
        ));
        let (selection_tx, selection_rx) = watch::channel(initial_adaptation);

        let stream = PeriodStream::new(
            StreamContext {
                manifest_id: manifest_id.to_string(),
                period_id: period.id.clone(),
                adaptation_id: String::new(),
                track_type,
                period_start: period.start,
                period_end: period.end,
            },
            picker,
            estimator,
            self.prober.clone(),
            fetcher,
            sink,
            self.events.clone(),
            self.options.clone(),
            observations,
            selection_rx,
        );

        let cancel = self.root.child_token();
        let registry = self.pickers.clone();
        let period_id = period.id.clone();
        let join = self.tracker.spawn(async move {
            let result = stream.run(cancel).await;
            registry.deregister(&period_id, track_type);
            if let Err(error) = &result {
                if !error.is_cancellation() {
                    tracing::error!(period_id, track = %track_type, %error, "track stream failed");
                }
            }
            result
        });
        Ok(TrackHandle {
            selection: selection_tx,
            join,
        })
    }

    /// Cancel every running stream and wait for them to unwind.
    pub async fn shutdown(&self) {
        self.root.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
