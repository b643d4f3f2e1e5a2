use aulos_core::Representation;

/// Tuning knobs for one track's picker.
#[derive(Clone, Copy, Debug)]
pub struct PickerOptions {
    /// Bitrate assumed before the estimator has anything to say.
    pub initial_bitrate: u64,
    pub min_auto_bitrate: Option<u64>,
    pub max_auto_bitrate: Option<u64>,
    /// Buffer gap (seconds) under which a downgrade must not wait for a
    /// graceful transition.
    pub panic_buffer_gap: f64,
    /// Buffer gap (seconds) above which the playing bitrate is recorded
    /// as known-stable.
    pub stable_buffer_gap: f64,
}

impl Default for PickerOptions {
    fn default() -> Self {
        Self {
            initial_bitrate: 0,
            min_auto_bitrate: None,
            max_auto_bitrate: None,
            panic_buffer_gap: 5.0,
            stable_buffer_gap: 5.0,
        }
    }
}

/// Clock snapshot handed to each pick.
#[derive(Clone, Copy, Debug)]
pub struct PickerContext {
    /// Current playback position, in seconds.
    pub position: f64,
    /// Seconds of buffered media ahead of the position on this track.
    pub buffer_gap: f64,
    /// Playback rate.
    pub speed: f64,
}

/// One quality decision. Immutable; a new pick supersedes it.
#[derive(Clone, Debug)]
pub struct QualityEstimate {
    pub representation: Representation,
    pub bitrate: u64,
    /// `true` when a manual override drove the decision.
    pub manual: bool,
    /// `true` when the switch must bypass the graceful transition.
    pub urgent: bool,
    /// Last bitrate observed playing with a healthy buffer, if any.
    pub known_stable_bitrate: Option<u64>,
}

/// Chooses a representation from estimator output, clock observations
/// and user constraints.
///
/// Candidates are expected to already be capability-filtered; the
/// picker only reasons about bitrates.
#[derive(Debug)]
pub struct RepresentationPicker {
    options: PickerOptions,
    /// `None` selects automatically.
    manual_bitrate: Option<u64>,
    last_picked_bitrate: Option<u64>,
    known_stable_bitrate: Option<u64>,
}

impl RepresentationPicker {
    pub fn new(options: PickerOptions) -> Self {
        Self {
            options,
            manual_bitrate: None,
            last_picked_bitrate: None,
            known_stable_bitrate: None,
        }
    }

    pub fn set_manual_bitrate(&mut self, bitrate: Option<u64>) {
        self.manual_bitrate = bitrate;
    }

    pub fn manual_bitrate(&self) -> Option<u64> {
        self.manual_bitrate
    }

    pub fn set_auto_bounds(&mut self, min: Option<u64>, max: Option<u64>) {
        self.options.min_auto_bitrate = min;
        self.options.max_auto_bitrate = max;
    }

    /// Produce the next quality decision.
    ///
    /// `None` when `representations` is empty; the caller decides how
    /// fatal that is for its track type.
    pub fn pick(
        &mut self,
        representations: &[Representation],
        bandwidth_estimate: Option<f64>,
        context: &PickerContext,
    ) -> Option<QualityEstimate> {
        if representations.is_empty() {
            return None;
        }

        if context.buffer_gap >= self.options.stable_buffer_gap {
            if let Some(playing) = self.last_picked_bitrate {
                self.known_stable_bitrate = Some(playing);
            }
        }

        let estimate = if let Some(manual) = self.manual_bitrate {
            self.pick_manual(representations, manual)?
        } else {
            self.pick_auto(representations, bandwidth_estimate, context)?
        };
        self.last_picked_bitrate = Some(estimate.bitrate);
        tracing::debug!(
            bitrate = estimate.bitrate,
            manual = estimate.manual,
            urgent = estimate.urgent,
            "picked representation"
        );
        Some(estimate)
    }

    fn pick_manual(
        &self,
        representations: &[Representation],
        manual: u64,
    ) -> Option<QualityEstimate> {
        let chosen = highest_at_most(representations, manual).or_else(|| lowest_of(representations))?;
        Some(QualityEstimate {
            bitrate: chosen.bitrate,
            representation: chosen.clone(),
            manual: true,
            urgent: true,
            known_stable_bitrate: self.known_stable_bitrate,
        })
    }

    fn pick_auto(
        &self,
        representations: &[Representation],
        bandwidth_estimate: Option<f64>,
        context: &PickerContext,
    ) -> Option<QualityEstimate> {
        let min = self.options.min_auto_bitrate.unwrap_or(0);
        let max = self.options.max_auto_bitrate.unwrap_or(u64::MAX);
        let bounded: Vec<&Representation> = representations
            .iter()
            .filter(|r| r.bitrate >= min && r.bitrate <= max)
            .collect();
        // An over-constrained [min, max] window falls back to the lowest
        // quality rather than playing nothing.
        let candidates: Vec<&Representation> = if bounded.is_empty() {
            vec![lowest_of(representations)?]
        } else {
            bounded
        };

        let budget = bandwidth_estimate.unwrap_or(self.options.initial_bitrate as f64);
        let chosen = candidates
            .iter()
            .filter(|r| r.bitrate as f64 <= budget)
            .max_by_key(|r| r.bitrate)
            .copied()
            .or_else(|| candidates.iter().min_by_key(|r| r.bitrate).copied())?;

        Some(QualityEstimate {
            bitrate: chosen.bitrate,
            representation: chosen.clone(),
            manual: false,
            urgent: self.is_urgent(chosen.bitrate, context),
            known_stable_bitrate: self.known_stable_bitrate,
        })
    }

    /// A first pick is always urgent (there is nothing to transition
    /// from). Upgrades never are. Downgrades are urgent only when the
    /// buffer is too thin to survive a graceful switch.
    fn is_urgent(&self, bitrate: u64, context: &PickerContext) -> bool {
        match self.last_picked_bitrate {
            None => true,
            Some(previous) if bitrate >= previous => false,
            Some(_) => context.buffer_gap <= self.options.panic_buffer_gap,
        }
    }
}

fn highest_at_most(representations: &[Representation], ceiling: u64) -> Option<&Representation> {
    representations
        .iter()
        .filter(|r| r.bitrate <= ceiling)
        .max_by_key(|r| r.bitrate)
}

fn lowest_of(representations: &[Representation]) -> Option<&Representation> {
    representations.iter().min_by_key(|r| r.bitrate)
}
