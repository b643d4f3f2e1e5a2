#![forbid(unsafe_code)]

pub mod index;
pub mod manifest;
pub mod observation;
pub mod ranges;
pub mod segment;
pub mod types;

pub use index::{SegmentIndex, StaticSegmentIndex};
pub use manifest::{Adaptation, Manifest, Period, Representation};
pub use observation::{ObservationSource, PlaybackObservation};
pub use ranges::{BufferedRanges, TaggedRange};
pub use segment::{ByteRange, Segment};
pub use types::{ContentLocator, TrackType};
