//! Progress tracking: completion rate, ETA and live events per space.

pub mod broadcast;
pub mod tracker;

pub use broadcast::{ProgressBroadcaster, ProgressEvent, ProgressKind};
pub use tracker::{eta_seconds, BatchStatus, ProgressTracker, SlidingWindow};
