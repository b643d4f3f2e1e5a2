use aulos_core::{ContentLocator, TrackType};
use tokio::sync::broadcast;

use crate::{error::StreamError, representation::NeededSegment};

/// Events published by the stream layers.
///
/// Fatal failures travel through `Result`s; everything here is either
/// informational or an action request the host must fulfill (seeks,
/// reloads, manifest refreshes).
#[derive(Clone, Debug)]
pub enum StreamEvent {
    /// A period stream finished setting up one track.
    PeriodStreamReady {
        period_id: String,
        track_type: TrackType,
    },

    /// The active adaptation changed; `None` means the track went silent.
    AdaptationChange {
        period_id: String,
        track_type: TrackType,
        adaptation_id: Option<String>,
    },

    /// The active representation changed.
    RepresentationChange {
        period_id: String,
        track_type: TrackType,
        representation_id: Option<String>,
        bitrate: Option<u64>,
    },

    /// A segment was pushed and acknowledged by the sink.
    AddedSegment { content: ContentLocator },

    /// Non-fatal failure the host may want to log or surface.
    Warning { error: StreamError },

    /// The index cannot describe the wanted range; the manifest document
    /// should be re-fetched.
    NeedsManifestRefresh,

    /// A requested segment vanished from a refreshed index; the manifest
    /// and the loaded one likely diverged.
    ManifestMightBeOutOfSync,

    /// Playback is wedged in an index gap; the host should seek past it.
    NeedsDiscontinuitySeek { track_type: TrackType, gap_start: f64 },

    /// The sink must be rebuilt and playback resumed at
    /// `position + position_delta`.
    NeedsBufferReload { position_delta: f64 },

    /// Scheduling status for one track of one period, published on every
    /// scheduling pass.
    StreamStatusUpdate {
        period_id: String,
        track_type: TrackType,
        /// Playback position the pass was computed against.
        position: f64,
        has_finished: bool,
        /// Segments still to download, most urgent first.
        needed: Vec<NeededSegment>,
    },
}

/// Broadcast bus shared by all stream layers.
///
/// Publishing is synchronous and never blocks; without subscribers the
/// event is dropped.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<StreamEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: StreamEvent) {
        let _ = self.tx.send(event);
    }

    pub fn warn(&self, error: impl Into<StreamError>) {
        self.publish(StreamEvent::Warning {
            error: error.into(),
        });
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
