use aulos_core::TrackType;
use aulos_net::BackoffOptions;

/// How a track switch on an already-playing track transitions.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TrackSwitchMode {
    /// Replace overlapping data and let playback continue.
    #[default]
    Seamless,
    /// Flush the decoder so the new track is audible immediately.
    Direct,
}

/// Position nudges applied after a reload, negative to land slightly
/// before the pre-reload position so decoding can restart cleanly.
#[derive(Clone, Copy, Debug)]
pub struct ReloadDeltas {
    pub bitrate_switch: f64,
    pub audio_track_switch: f64,
    pub video_track_switch: f64,
    pub other_track_switch: f64,
}

impl ReloadDeltas {
    pub fn for_track_switch(&self, track_type: TrackType) -> f64 {
        match track_type {
            TrackType::Audio => self.audio_track_switch,
            TrackType::Video => self.video_track_switch,
            TrackType::Text => self.other_track_switch,
        }
    }
}

impl Default for ReloadDeltas {
    fn default() -> Self {
        Self {
            bitrate_switch: -0.1,
            audio_track_switch: -0.7,
            video_track_switch: -0.1,
            other_track_switch: 0.0,
        }
    }
}

/// Tuning for the whole stream stack. One instance is shared by every
/// period and track.
#[derive(Clone, Debug)]
pub struct StreamOptions {
    /// Seconds of media to keep buffered ahead of the position.
    pub buffer_goal: f64,
    /// Hard floor under which degrading the goal further is pointless
    /// and a full buffer becomes fatal.
    pub minimum_buffer_goal: f64,
    /// Bitrate under which an already-buffered segment may be replaced
    /// by a higher-quality fetch of the same range. `Some(0)` disables
    /// replacement entirely, `None` allows replacing anything.
    pub fast_switch_threshold: Option<u64>,
    pub track_switch_mode: TrackSwitchMode,
    pub reload_deltas: ReloadDeltas,
    pub backoff: BackoffOptions,
    /// Tightens the bandwidth estimators against the burstiness of
    /// chunked low-latency downloads.
    pub low_latency_mode: bool,
}

impl StreamOptions {
    pub fn with_buffer_goal(mut self, seconds: f64) -> Self {
        self.buffer_goal = seconds;
        self
    }

    pub fn with_fast_switch_threshold(mut self, threshold: Option<u64>) -> Self {
        self.fast_switch_threshold = threshold;
        self
    }

    pub fn with_track_switch_mode(mut self, mode: TrackSwitchMode) -> Self {
        self.track_switch_mode = mode;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffOptions) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_low_latency_mode(mut self, enabled: bool) -> Self {
        self.low_latency_mode = enabled;
        self
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            buffer_goal: 30.0,
            minimum_buffer_goal: 2.0,
            fast_switch_threshold: None,
            track_switch_mode: TrackSwitchMode::default(),
            reload_deltas: ReloadDeltas::default(),
            backoff: BackoffOptions::default(),
            low_latency_mode: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_reload_lands_further_back_than_video() {
        let deltas = ReloadDeltas::default();
        assert!(
            deltas.for_track_switch(TrackType::Audio) < deltas.for_track_switch(TrackType::Video)
        );
        assert_eq!(deltas.for_track_switch(TrackType::Text), 0.0);
    }
}
