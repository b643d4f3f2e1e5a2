use async_trait::async_trait;
use aulos_core::{Representation, TrackType};

/// Decoding configuration derived from one representation, as handed to
/// the capability prober.
#[derive(Clone, Debug, PartialEq)]
pub struct CapabilityConfig {
    pub track_type: TrackType,
    pub codec: String,
    pub bitrate: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub channels: Option<u32>,
    pub sample_rate: Option<u32>,
}

impl CapabilityConfig {
    pub fn from_representation(track_type: TrackType, representation: &Representation) -> Self {
        Self {
            track_type,
            codec: representation.codec.clone(),
            bitrate: representation.bitrate,
            width: representation.width,
            height: representation.height,
            frame_rate: representation.frame_rate,
            channels: representation.channels,
            sample_rate: representation.sample_rate,
        }
    }
}

/// Answer of the capability prober for one configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CapabilityInfo {
    /// The platform can decode this configuration at all.
    pub supported: bool,
    /// Playback is expected to keep up without dropping frames.
    pub smooth: bool,
    pub power_efficient: bool,
}

impl CapabilityInfo {
    /// Permissive default used when no prober answer is available.
    pub const UNKNOWN: Self = Self {
        supported: true,
        smooth: true,
        power_efficient: true,
    };
}

/// Platform decoding-capability prober.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DecodingCapabilities: Send + Sync {
    async fn decoding_info(&self, config: &CapabilityConfig) -> CapabilityInfo;
}

/// Memoizes prober answers per configuration.
///
/// Probing can be slow on some platforms and the same ladder is
/// re-evaluated on every estimate, so answers are kept for the lifetime
/// of the track.
#[derive(Debug, Default)]
pub struct CapabilityCache {
    entries: Vec<(CapabilityConfig, CapabilityInfo)>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, config: &CapabilityConfig) -> Option<CapabilityInfo> {
        self.entries
            .iter()
            .find(|(cached, _)| cached == config)
            .map(|(_, info)| *info)
    }

    pub fn insert(&mut self, config: CapabilityConfig, info: CapabilityInfo) {
        self.entries.push((config, info));
    }
}

/// Drops representations the platform cannot decode.
///
/// Text tracks are never probed. When every representation of a native
/// track is unsupported the result is empty and the caller decides how
/// fatal that is.
pub async fn filter_by_decoding_capabilities(
    representations: &[Representation],
    track_type: TrackType,
    prober: &dyn DecodingCapabilities,
    cache: &mut CapabilityCache,
) -> Vec<Representation> {
    if !track_type.is_native() {
        return representations.to_vec();
    }
    let mut kept = Vec::with_capacity(representations.len());
    for representation in representations {
        let config = CapabilityConfig::from_representation(track_type, representation);
        let info = match cache.get(&config) {
            Some(info) => info,
            None => {
                let info = prober.decoding_info(&config).await;
                cache.insert(config, info);
                info
            }
        };
        if info.supported {
            kept.push(representation.clone());
        } else {
            tracing::debug!(
                id = %representation.id,
                codec = %representation.codec,
                "dropping undecodable representation"
            );
        }
    }
    kept
}
