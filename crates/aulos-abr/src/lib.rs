#![forbid(unsafe_code)]

pub mod bandwidth_estimator;
pub mod capabilities;
mod ewma;
pub mod pending_requests;
pub mod picker;

pub use bandwidth_estimator::BandwidthEstimator;
pub use capabilities::{
    filter_by_decoding_capabilities, CapabilityCache, CapabilityConfig, CapabilityInfo,
    DecodingCapabilities,
};
pub use pending_requests::{PendingRequest, PendingRequestsStore, RequestStart};
pub use picker::{PickerContext, PickerOptions, QualityEstimate, RepresentationPicker};
