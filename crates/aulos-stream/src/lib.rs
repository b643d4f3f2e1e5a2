//! `aulos-stream`
//!
//! Segment scheduling, quality switching and period orchestration.
//!
//! ## Layers
//! - `RepresentationStream`: schedules and pushes one quality's segments
//! - `AdaptationStream`: picks qualities and transitions between them
//! - `PeriodStream`: reacts to track selection for one period
//! - `StreamOrchestrator`: shared estimators, picker registry, spawning

#![forbid(unsafe_code)]
#![cfg_attr(test, allow(clippy::ignored_unit_patterns, clippy::allow_attributes))]

mod adaptation;
mod error;
mod events;
mod fetcher;
mod options;
mod orchestrator;
mod period;
mod representation;
mod sink;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use adaptation::{switch_decision, AdaptationStream, BufferGoalRatio, SwitchDecision};
pub use error::{MediaError, StreamError, StreamResult};
pub use events::{EventBus, StreamEvent};
pub use fetcher::{FetcherEvent, SegmentFetcher, SegmentLoader};
pub use options::{ReloadDeltas, StreamOptions, TrackSwitchMode};
pub use orchestrator::{StreamOrchestrator, TrackHandle};
pub use period::{adaptation_switch_strategy, PeriodStream, SwitchStrategy};
pub use representation::{
    NeededSegment, RepresentationStream, ScheduleStatus, StreamContext, StreamState,
    TerminationOrder,
};
pub use sink::SegmentSink;
