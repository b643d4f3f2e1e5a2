//! Per-track quality management: owns the picker/stream pair for one
//! adaptation and handles transitions between successive picks.

use std::sync::Arc;

use aulos_abr::{
    filter_by_decoding_capabilities, BandwidthEstimator, CapabilityCache, DecodingCapabilities,
    PickerContext, QualityEstimate, RepresentationPicker,
};
use aulos_core::{PlaybackObservation, Representation};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{MediaError, StreamError, StreamResult},
    events::{EventBus, StreamEvent},
    fetcher::SegmentFetcher,
    options::StreamOptions,
    representation::{RepresentationStream, StreamContext, StreamState, TerminationOrder},
    sink::SegmentSink,
};

/// Per-representation buffer-goal multiplier, degraded when the sink
/// reports a full buffer and never restored within one adaptation.
#[derive(Clone, Copy, Debug)]
pub struct BufferGoalRatio {
    ratio: f64,
}

impl BufferGoalRatio {
    const STEP: f64 = 0.25;
    const FLOOR: f64 = 0.25;

    pub fn effective(&self, buffer_goal: f64) -> f64 {
        buffer_goal * self.ratio
    }

    /// Step the ratio down. `None` once the floor is already reached;
    /// degrading further would be meaningless.
    pub fn degrade(&mut self) -> Option<f64> {
        if self.ratio <= Self::FLOOR {
            return None;
        }
        self.ratio -= Self::STEP;
        Some(self.ratio)
    }
}

impl Default for BufferGoalRatio {
    fn default() -> Self {
        Self { ratio: 1.0 }
    }
}

/// How to transition from the previous estimate to the next one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SwitchDecision {
    NoChange,
    /// Nothing is playing yet; start directly.
    FirstPick,
    /// Let the previous stream drain its in-flight push first.
    Graceful,
    /// Abandon the previous stream immediately.
    Urgent,
    /// Manual direct-mode switch: the sink must be rebuilt.
    Reload,
}

pub fn switch_decision(
    previous: Option<&QualityEstimate>,
    next: &QualityEstimate,
) -> SwitchDecision {
    let Some(previous) = previous else {
        return SwitchDecision::FirstPick;
    };
    if previous.representation.id == next.representation.id {
        return SwitchDecision::NoChange;
    }
    if next.manual {
        return SwitchDecision::Reload;
    }
    if next.urgent {
        return SwitchDecision::Urgent;
    }
    SwitchDecision::Graceful
}

struct RunningStream {
    handle: tokio::task::JoinHandle<StreamResult<StreamState>>,
    term_tx: watch::Sender<Option<TerminationOrder>>,
}

impl RunningStream {
    async fn stop(self, urgent: bool) -> StreamResult<StreamState> {
        self.term_tx
            .send_replace(Some(TerminationOrder { urgent }));
        match self.handle.await {
            Ok(result) => result.or_else(|error| {
                if error.is_cancellation() {
                    Ok(StreamState::Terminated)
                } else {
                    Err(error)
                }
            }),
            Err(_join) => Ok(StreamState::Terminated),
        }
    }
}

/// Quality loop for one track of one period.
pub struct AdaptationStream {
    context: StreamContext,
    representations: Vec<Representation>,
    picker: Arc<Mutex<RepresentationPicker>>,
    estimator: Arc<Mutex<BandwidthEstimator>>,
    prober: Arc<dyn DecodingCapabilities>,
    fetcher: Arc<SegmentFetcher>,
    sink: Arc<dyn SegmentSink>,
    events: EventBus,
    options: StreamOptions,
    observations: watch::Receiver<PlaybackObservation>,
}

impl AdaptationStream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: StreamContext,
        representations: Vec<Representation>,
        picker: Arc<Mutex<RepresentationPicker>>,
        estimator: Arc<Mutex<BandwidthEstimator>>,
        prober: Arc<dyn DecodingCapabilities>,
        fetcher: Arc<SegmentFetcher>,
        sink: Arc<dyn SegmentSink>,
        events: EventBus,
        options: StreamOptions,
        observations: watch::Receiver<PlaybackObservation>,
    ) -> Self {
        Self {
            context,
            representations,
            picker,
            estimator,
            prober,
            fetcher,
            sink,
            events,
            options,
            observations,
        }
    }

    /// Run until the period is exhausted, the observation producer goes
    /// away, or a fatal error occurs.
    pub async fn run(mut self, cancel: CancellationToken) -> StreamResult<()> {
        // Capability filtering happens before any bitrate decision so an
        // undecodable "best" rung can never be picked.
        let mut cache = CapabilityCache::new();
        let candidates = filter_by_decoding_capabilities(
            &self.representations,
            self.context.track_type,
            self.prober.as_ref(),
            &mut cache,
        )
        .await;
        if candidates.is_empty() {
            return Err(MediaError::NoPlayableRepresentation {
                track_type: self.context.track_type,
            }
            .into());
        }

        let mut goal_ratio = BufferGoalRatio::default();
        let mut previous: Option<QualityEstimate> = None;
        let mut running: Option<RunningStream> = None;

        loop {
            if cancel.is_cancelled() {
                if let Some(running) = running.take() {
                    let _ = running.stop(true).await;
                }
                return Err(StreamError::Cancelled);
            }

            if let Some(pick) = self.next_pick(&candidates).await {
                let decision = switch_decision(previous.as_ref(), &pick);
                if decision != SwitchDecision::NoChange {
                    if let Some(running) = running.take() {
                        let urgent = matches!(
                            decision,
                            SwitchDecision::Urgent | SwitchDecision::Reload
                        );
                        running.stop(urgent).await?;
                    }
                    if decision == SwitchDecision::Reload {
                        self.events.publish(StreamEvent::NeedsBufferReload {
                            position_delta: self.options.reload_deltas.bitrate_switch,
                        });
                    }
                    tracing::debug!(
                        track = %self.context.track_type,
                        representation = %pick.representation.id,
                        bitrate = pick.bitrate,
                        ?decision,
                        "representation switch"
                    );
                    self.events.publish(StreamEvent::RepresentationChange {
                        period_id: self.context.period_id.clone(),
                        track_type: self.context.track_type,
                        representation_id: Some(pick.representation.id.clone()),
                        bitrate: Some(pick.bitrate),
                    });
                    running = Some(self.start_stream(
                        &pick,
                        &candidates,
                        goal_ratio.effective(self.options.buffer_goal),
                        &cancel,
                    ));
                    previous = Some(pick);
                }
            }

            // Wait for the next trigger: a playback observation, the
            // running stream ending, or cancellation.
            let stream_done = async {
                match running.as_mut() {
                    Some(r) => (&mut r.handle).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                () = cancel.cancelled() => {}
                changed = self.observations.changed() => {
                    if changed.is_err() {
                        if let Some(running) = running.take() {
                            let _ = running.stop(false).await;
                        }
                        return Ok(());
                    }
                }
                joined = stream_done => {
                    running = None;
                    match joined {
                        Ok(Ok(state)) => {
                            tracing::debug!(?state, "representation stream ended");
                        }
                        Ok(Err(StreamError::Media(MediaError::BufferFull))) => {
                            match goal_ratio.degrade() {
                                Some(ratio) => {
                                    tracing::warn!(
                                        ratio,
                                        "sink full, degrading buffer goal"
                                    );
                                    self.events.warn(MediaError::BufferFull);
                                    // Force a restart at the smaller goal.
                                    previous = None;
                                }
                                None => {
                                    return Err(MediaError::BufferFull.into());
                                }
                            }
                            if goal_ratio.effective(self.options.buffer_goal)
                                < self.options.minimum_buffer_goal
                            {
                                return Err(MediaError::BufferFull.into());
                            }
                        }
                        Ok(Err(error)) if error.is_cancellation() => {}
                        Ok(Err(error)) => return Err(error),
                        Err(_join) => return Err(StreamError::Cancelled),
                    }
                }
            }
        }
    }

    async fn next_pick(&self, candidates: &[Representation]) -> Option<QualityEstimate> {
        let observation = *self.observations.borrow();
        let buffer_gap = self.sink.buffered().await.ahead_of(observation.position);
        let bandwidth = self.estimator.lock().get_estimate();
        self.picker.lock().pick(
            candidates,
            bandwidth,
            &PickerContext {
                position: observation.position,
                buffer_gap,
                speed: observation.speed,
            },
        )
    }

    fn start_stream(
        &self,
        pick: &QualityEstimate,
        candidates: &[Representation],
        buffer_goal: f64,
        cancel: &CancellationToken,
    ) -> RunningStream {
        let (term_tx, term_rx) = watch::channel(None);
        let stream = RepresentationStream::new(
            self.context.clone(),
            pick.representation.clone(),
            candidates.to_vec(),
            self.fetcher.clone(),
            self.sink.clone(),
            self.events.clone(),
            buffer_goal,
            self.options.fast_switch_threshold,
            self.observations.clone(),
            term_rx,
        );
        let handle = tokio::spawn(stream.run(cancel.child_token()));
        RunningStream { handle, term_tx }
    }
}
