use std::{collections::HashMap, time::Instant};

use aulos_core::ContentLocator;

/// Payload registering a new pending request.
#[derive(Clone, Debug)]
pub struct RequestStart {
    pub id: u64,
    /// Start time of the requested segment, in seconds.
    pub time: f64,
    /// Duration of the requested segment, in seconds.
    pub duration: f64,
    pub started_at: Instant,
    pub content: ContentLocator,
}

/// One tracked request, from start to completion or cancellation.
#[derive(Clone, Debug)]
pub struct PendingRequest {
    pub time: f64,
    pub duration: f64,
    pub started_at: Instant,
    pub content: ContentLocator,
}

/// Store for requests currently in flight on one track.
///
/// Owned by exactly one track and mutated only from that track's
/// scheduling loop.
#[derive(Debug, Default)]
pub struct PendingRequestsStore {
    current: HashMap<u64, PendingRequest>,
}

impl PendingRequestsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, start: RequestStart) {
        let RequestStart {
            id,
            time,
            duration,
            started_at,
            content,
        } = start;
        self.current.insert(
            id,
            PendingRequest {
                time,
                duration,
                started_at,
                content,
            },
        );
    }

    pub fn remove(&mut self, id: u64) {
        if self.current.remove(&id).is_none() {
            tracing::warn!(id, "removing a request that was never added");
        }
    }

    /// All pending requests, in segment chronological order.
    pub fn requests(&self) -> Vec<&PendingRequest> {
        let mut all: Vec<&PendingRequest> = self.current.values().collect();
        all.sort_by(|a, b| a.time.total_cmp(&b.time));
        all
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }
}
