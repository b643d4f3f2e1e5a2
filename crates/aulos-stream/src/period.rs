//! Per-period, per-track management: which adaptation plays, how its
//! buffered leftovers are handled on a track switch, and how non-native
//! track failures are contained.

use std::sync::Arc;

use aulos_abr::{BandwidthEstimator, DecodingCapabilities, RepresentationPicker};
use aulos_core::{Adaptation, BufferedRanges, PlaybackObservation, TrackType};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    adaptation::AdaptationStream,
    error::StreamResult,
    events::{EventBus, StreamEvent},
    fetcher::SegmentFetcher,
    options::{StreamOptions, TrackSwitchMode},
    representation::StreamContext,
    sink::SegmentSink,
};

/// Leeway around the playback position when deciding whether foreign
/// data sits under the playhead.
const POSITION_PADDING: f64 = 0.1;

/// What to do about data left in the buffer by another adaptation.
#[derive(Clone, Debug, PartialEq)]
pub enum SwitchStrategy {
    /// Nothing foreign in the way.
    Continue,
    /// Remove these ranges and keep playing.
    CleanBuffer { ranges: Vec<(f64, f64)> },
    /// Remove these ranges and flush the decoder so the change is
    /// audible immediately.
    FlushBuffer { ranges: Vec<(f64, f64)> },
    /// Foreign data sits under the playhead of a native track; the sink
    /// must be rebuilt.
    NeedsReload,
}

/// Decide how to transition the buffer to `new_adaptation_id`.
#[allow(clippy::too_many_arguments)]
pub fn adaptation_switch_strategy(
    buffered: &BufferedRanges,
    period_id: &str,
    period_start: f64,
    period_end: Option<f64>,
    new_adaptation_id: &str,
    position: f64,
    track_type: TrackType,
    mode: TrackSwitchMode,
) -> SwitchStrategy {
    if period_end.is_some_and(|end| period_start > end) {
        tracing::warn!(
            period_id,
            period_start,
            ?period_end,
            "degenerate period bounds, nothing to transition"
        );
        return SwitchStrategy::Continue;
    }
    let end = period_end.unwrap_or(f64::INFINITY);

    let foreign: Vec<(f64, f64)> = buffered
        .iter()
        .filter(|r| {
            r.locator.period_id == period_id
                && r.locator.adaptation_id != new_adaptation_id
                && r.overlaps(period_start, end)
        })
        .map(|r| (r.start.max(period_start), r.end.min(end)))
        .collect();
    if foreign.is_empty() {
        return SwitchStrategy::Continue;
    }

    if !track_type.is_native() {
        return SwitchStrategy::CleanBuffer { ranges: foreign };
    }
    let under_playhead = foreign
        .iter()
        .any(|(start, range_end)| {
            *start < position + POSITION_PADDING && *range_end > position - POSITION_PADDING
        });
    if under_playhead {
        return SwitchStrategy::NeedsReload;
    }
    match mode {
        TrackSwitchMode::Direct => SwitchStrategy::FlushBuffer { ranges: foreign },
        TrackSwitchMode::Seamless => SwitchStrategy::CleanBuffer { ranges: foreign },
    }
}

/// One track of one period: reacts to track-selection changes, applies
/// the switch strategy and runs the adaptation underneath.
pub struct PeriodStream {
    context: StreamContext,
    picker: Arc<Mutex<RepresentationPicker>>,
    estimator: Arc<Mutex<BandwidthEstimator>>,
    prober: Arc<dyn DecodingCapabilities>,
    fetcher: Arc<SegmentFetcher>,
    sink: Arc<dyn SegmentSink>,
    events: EventBus,
    options: StreamOptions,
    observations: watch::Receiver<PlaybackObservation>,
    selection: watch::Receiver<Option<Adaptation>>,
}

impl PeriodStream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: StreamContext,
        picker: Arc<Mutex<RepresentationPicker>>,
        estimator: Arc<Mutex<BandwidthEstimator>>,
        prober: Arc<dyn DecodingCapabilities>,
        fetcher: Arc<SegmentFetcher>,
        sink: Arc<dyn SegmentSink>,
        events: EventBus,
        options: StreamOptions,
        observations: watch::Receiver<PlaybackObservation>,
        selection: watch::Receiver<Option<Adaptation>>,
    ) -> Self {
        Self {
            context,
            picker,
            estimator,
            prober,
            fetcher,
            sink,
            events,
            options,
            observations,
            selection,
        }
    }

    /// Run until cancelled or until the selection producer goes away.
    pub async fn run(mut self, cancel: CancellationToken) -> StreamResult<()> {
        self.events.publish(StreamEvent::PeriodStreamReady {
            period_id: self.context.period_id.clone(),
            track_type: self.context.track_type,
        });
        let mut first_switch = true;

        loop {
            if cancel.is_cancelled() {
                return Err(crate::error::StreamError::Cancelled);
            }
            let selection = self.selection.borrow().clone();
            self.events.publish(StreamEvent::AdaptationChange {
                period_id: self.context.period_id.clone(),
                track_type: self.context.track_type,
                adaptation_id: selection.as_ref().map(|a| a.id.clone()),
            });

            let ended = match selection {
                None => {
                    self.clear_track_data().await?;
                    self.run_empty(&cancel).await?
                }
                Some(adaptation) => {
                    self.apply_switch_strategy(&adaptation, first_switch).await?;
                    first_switch = false;
                    self.run_adaptation(adaptation, &cancel).await?
                }
            };
            if ended {
                return Ok(());
            }
        }
    }

    async fn apply_switch_strategy(
        &self,
        adaptation: &Adaptation,
        first_switch: bool,
    ) -> StreamResult<()> {
        let buffered = self.sink.buffered().await;
        let observation = *self.observations.borrow();
        let strategy = adaptation_switch_strategy(
            &buffered,
            &self.context.period_id,
            self.context.period_start,
            self.context.period_end,
            &adaptation.id,
            observation.position,
            self.context.track_type,
            self.options.track_switch_mode,
        );
        tracing::debug!(
            track = %self.context.track_type,
            adaptation = %adaptation.id,
            ?strategy,
            "track switch"
        );
        match strategy {
            SwitchStrategy::Continue => {}
            SwitchStrategy::CleanBuffer { ranges } => {
                for (start, end) in ranges {
                    self.sink.remove(start, end).await?;
                }
            }
            SwitchStrategy::FlushBuffer { ranges } => {
                for (start, end) in ranges {
                    self.sink.remove(start, end).await?;
                }
                self.sink.flush().await?;
            }
            SwitchStrategy::NeedsReload => {
                // A first switch has nothing under the playhead worth a
                // reload; later switches resume slightly behind it.
                let position_delta = if first_switch {
                    0.0
                } else {
                    self.options
                        .reload_deltas
                        .for_track_switch(self.context.track_type)
                };
                self.events
                    .publish(StreamEvent::NeedsBufferReload { position_delta });
            }
        }
        Ok(())
    }

    /// Drop everything this period's track holds in the sink.
    async fn clear_track_data(&self) -> StreamResult<()> {
        let end = self.context.period_end.unwrap_or(f64::INFINITY);
        self.sink.remove(self.context.period_start, end).await?;
        Ok(())
    }

    /// Silent stream: no fetches, but status updates keep flowing.
    /// Returns `true` when the selection producer is gone.
    async fn run_empty(&mut self, cancel: &CancellationToken) -> StreamResult<bool> {
        loop {
            self.events.publish(StreamEvent::StreamStatusUpdate {
                period_id: self.context.period_id.clone(),
                track_type: self.context.track_type,
                position: self.observations.borrow().position,
                has_finished: false,
                needed: Vec::new(),
            });
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(crate::error::StreamError::Cancelled);
                }
                changed = self.selection.changed() => {
                    return Ok(changed.is_err());
                }
                changed = self.observations.changed() => {
                    if changed.is_err() {
                        return Ok(true);
                    }
                }
            }
        }
    }

    /// Run one adaptation until the selection changes or it fails.
    /// Returns `true` when the stream should end for good.
    async fn run_adaptation(
        &mut self,
        adaptation: Adaptation,
        cancel: &CancellationToken,
    ) -> StreamResult<bool> {
        let track_type = self.context.track_type;
        let child = cancel.child_token();
        let mut context = self.context.clone();
        context.adaptation_id = adaptation.id.clone();
        let stream = AdaptationStream::new(
            context,
            adaptation.representations.clone(),
            self.picker.clone(),
            self.estimator.clone(),
            self.prober.clone(),
            self.fetcher.clone(),
            self.sink.clone(),
            self.events.clone(),
            self.options.clone(),
            self.observations.clone(),
        );
        let run = stream.run(child.clone());
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => {
                match result {
                    Ok(()) => Ok(true),
                    Err(error) if error.is_cancellation() => {
                        if cancel.is_cancelled() {
                            Err(crate::error::StreamError::Cancelled)
                        } else {
                            Ok(true)
                        }
                    }
                    Err(error) if error.is_isolable_for(track_type) => {
                        // A text-like track must never take playback
                        // down; fall back to silence until the user
                        // picks another track.
                        tracing::warn!(
                            track = %track_type,
                            %error,
                            "isolating failed non-native track"
                        );
                        self.events.warn(error);
                        self.clear_track_data().await?;
                        self.run_empty(cancel).await
                    }
                    Err(error) => Err(error),
                }
            }
            changed = self.selection.changed() => {
                child.cancel();
                let _ = run.await;
                Ok(changed.is_err())
            }
        }
    }
}
