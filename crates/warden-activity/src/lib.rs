//! Warden Activity crate - user activity segmentation.
//!
//! Samples input-idle time and the foreground process through an
//! [`ActivityProbe`], folds the samples into [`ActivitySegment`]s with the
//! pure [`Segmenter`], and hands each closed segment to a [`SegmentSink`]:
//! the event buffer when one is wired, or the collector directly.

pub mod probe;
pub mod sink;
pub mod state;
pub mod title;
pub mod tracker;

pub use probe::{ActivityProbe, MockProbe, WindowsProbe, UNKNOWN_PROCESS};
pub use sink::{BufferedSink, DirectSink, MemorySink, SegmentSink, SEGMENT_EVENT_TYPE};
pub use state::{
    classify, ActivitySegment, ActivityState, Sample, SessionIdentity, Segmenter,
    OFFLINE_THRESHOLD_SECS,
};
pub use title::enrich_title;
pub use tracker::{current_username, ActivityTracker, TrackerConfig};
