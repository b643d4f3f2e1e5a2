use aulos_core::TrackType;
use aulos_net::NetError;
use thiserror::Error;

/// Media-side failures, raised by the sink or by quality selection.
#[derive(Debug, Error, Clone)]
pub enum MediaError {
    /// Every representation of a native track was filtered out.
    #[error("No playable representation for {track_type} track")]
    NoPlayableRepresentation { track_type: TrackType },

    #[error("Sink rejected an append: {0}")]
    BufferAppend(String),

    /// Quota exceeded even after garbage collection; recoverable while
    /// the buffer goal can still be degraded.
    #[error("Sink buffer is full")]
    BufferFull,
}

/// Centralized error type for aulos-stream.
#[derive(Debug, Error, Clone)]
pub enum StreamError {
    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Media(#[from] MediaError),

    /// A second picker was registered for a (period, track) pair that
    /// already has one.
    #[error("Picker already registered for period {period_id}, {track_type} track")]
    PickerAlreadyRegistered {
        period_id: String,
        track_type: TrackType,
    },

    #[error("Cancelled")]
    Cancelled,
}

impl StreamError {
    /// `true` when the error only degrades one non-native track and the
    /// rest of playback can continue.
    pub fn is_isolable_for(&self, track_type: TrackType) -> bool {
        !track_type.is_native() && !matches!(self, StreamError::Cancelled)
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, StreamError::Cancelled)
            || matches!(self, StreamError::Net(e) if e.is_cancellation())
    }
}

pub type StreamResult<T> = Result<T, StreamError>;
