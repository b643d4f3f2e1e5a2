use async_trait::async_trait;
use aulos_core::{BufferedRanges, ContentLocator};
use bytes::Bytes;

use crate::error::MediaError;

/// Destination for fetched media, implemented by the host around its
/// platform decoder buffers.
///
/// The scheduling layers never cache buffered state: after every
/// mutating call they re-query [`SegmentSink::buffered`], because the
/// sink is free to garbage-collect behind their back.
#[async_trait]
pub trait SegmentSink: Send + Sync {
    /// Hand over the codec-initialization data for a representation.
    /// Must be called before the first media push of that representation.
    async fn declare_init_segment(
        &self,
        content: &ContentLocator,
        data: Bytes,
    ) -> Result<(), MediaError>;

    /// Append one media segment. The sink records the pushed time range
    /// tagged with `content` so coverage stays attributable.
    ///
    /// `Err(MediaError::BufferFull)` means quota was exceeded even after
    /// the sink's own garbage collection.
    async fn push_segment(&self, content: &ContentLocator, data: Bytes) -> Result<(), MediaError>;

    /// Drop everything buffered in `[start, end)`.
    async fn remove(&self, start: f64, end: f64) -> Result<(), MediaError>;

    /// Flush the decoder pipeline so removed data stops playing
    /// immediately. Used by direct-mode track switches.
    async fn flush(&self) -> Result<(), MediaError>;

    /// Current buffered state, re-read from the platform.
    async fn buffered(&self) -> BufferedRanges;
}
