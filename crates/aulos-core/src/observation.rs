use tokio::sync::watch;

/// Snapshot of playback conditions, pushed by the host media-element
/// adapter on a regular cadence.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlaybackObservation {
    /// Current playback position, in seconds.
    pub position: f64,
    pub paused: bool,
    /// Host readiness level; 0 means nothing is decodable at `position`,
    /// which is how stalls are detected.
    pub ready_state: u8,
    /// Playback rate; 1.0 is normal speed.
    pub speed: f64,
}

impl PlaybackObservation {
    /// The player is wedged: not paused yet unable to decode forward.
    pub fn is_stalled(&self) -> bool {
        !self.paused && self.ready_state == 0
    }
}

impl Default for PlaybackObservation {
    fn default() -> Self {
        Self {
            position: 0.0,
            paused: true,
            ready_state: 0,
            speed: 1.0,
        }
    }
}

/// Owned state cell for playback observations.
///
/// The producer side belongs to the media-element adapter; every stream
/// layer holds a subscriber handle and wakes on updates.
#[derive(Debug)]
pub struct ObservationSource {
    tx: watch::Sender<PlaybackObservation>,
}

impl ObservationSource {
    pub fn new(initial: PlaybackObservation) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn update(&self, observation: PlaybackObservation) {
        // send_replace never fails even with no subscriber.
        self.tx.send_replace(observation);
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackObservation> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> PlaybackObservation {
        *self.tx.borrow()
    }
}

impl Default for ObservationSource {
    fn default() -> Self {
        Self::new(PlaybackObservation::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_updates() {
        let source = ObservationSource::default();
        let mut rx = source.subscribe();

        source.update(PlaybackObservation {
            position: 12.5,
            paused: false,
            ready_state: 4,
            speed: 1.0,
        });

        rx.changed().await.expect("sender alive");
        assert_eq!(rx.borrow().position, 12.5);
        assert!(!rx.borrow().is_stalled());
    }

    #[test]
    fn stall_detection() {
        let playing_starved = PlaybackObservation {
            paused: false,
            ready_state: 0,
            ..PlaybackObservation::default()
        };
        assert!(playing_starved.is_stalled());
        assert!(!PlaybackObservation::default().is_stalled());
    }
}
