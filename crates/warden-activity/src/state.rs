//! Activity states and the segmenting state machine.
//!
//! The state for a sample is a pure function of the host's input-idle time:
//! - idle < idle threshold: Active
//! - idle threshold <= idle < 1800s: Idle
//! - idle >= 1800s: Offline
//!
//! [`Segmenter`] folds samples into segments. A segment stays open while the
//! state is unchanged (and, while active, the foreground process is
//! unchanged); it is returned to the caller only when it closes with a
//! non-zero duration.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Idle time at which a host is considered offline.
pub const OFFLINE_THRESHOLD_SECS: u64 = 30 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    /// Human input within the idle threshold.
    Active,
    /// No input for at least the idle threshold.
    Idle,
    /// No input for at least [`OFFLINE_THRESHOLD_SECS`].
    Offline,
}

impl fmt::Display for ActivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivityState::Active => write!(f, "active"),
            ActivityState::Idle => write!(f, "idle"),
            ActivityState::Offline => write!(f, "offline"),
        }
    }
}

/// Derive the state for `idle_secs` of input inactivity.
pub fn classify(idle_secs: u64, idle_threshold_secs: u64) -> ActivityState {
    if idle_secs < idle_threshold_secs {
        ActivityState::Active
    } else if idle_secs < OFFLINE_THRESHOLD_SECS {
        ActivityState::Idle
    } else {
        ActivityState::Offline
    }
}

/// One observation of the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub idle_secs: u64,
    pub process_name: String,
    pub window_title: String,
}

impl Sample {
    pub fn new(idle_secs: u64, process_name: &str, window_title: &str) -> Self {
        Self {
            idle_secs,
            process_name: process_name.to_string(),
            window_title: window_title.to_string(),
        }
    }
}

/// Fields stamped on every segment of one tracker run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub computer_name: String,
    pub username: String,
    pub session_id: String,
}

impl SessionIdentity {
    /// Session id is `<computer>-<unix seconds at start>`.
    pub fn new(computer_name: &str, username: &str, started: DateTime<Utc>) -> Self {
        Self {
            computer_name: computer_name.to_string(),
            username: username.to_string(),
            session_id: format!("{}-{}", computer_name, started.timestamp()),
        }
    }
}

/// A maximal interval of unchanged state (and process, while active).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySegment {
    pub timestamp_start: DateTime<Utc>,
    pub timestamp_end: DateTime<Utc>,
    pub duration_sec: u64,
    pub state: ActivityState,
    pub computer_name: String,
    pub username: String,
    pub process_name: String,
    pub window_title: String,
    pub session_id: String,
}

impl ActivitySegment {
    /// Move the end to `now` (never before the start) and recompute the
    /// whole-second duration.
    fn extend_to(&mut self, now: DateTime<Utc>) {
        self.timestamp_end = now.max(self.timestamp_start);
        self.duration_sec = (self.timestamp_end - self.timestamp_start)
            .num_seconds()
            .max(0) as u64;
    }
}

/// Pure segment state machine; the caller supplies the clock.
#[derive(Debug)]
pub struct Segmenter {
    idle_threshold_secs: u64,
    identity: SessionIdentity,
    current: Option<ActivitySegment>,
}

impl Segmenter {
    pub fn new(idle_threshold_secs: u64, identity: SessionIdentity) -> Self {
        Self {
            idle_threshold_secs,
            identity,
            current: None,
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// The open segment, if any.
    pub fn current(&self) -> Option<&ActivitySegment> {
        self.current.as_ref()
    }

    /// Feed one sample taken at `now`.
    ///
    /// Returns the segment closed by this sample, if it lasted at least one
    /// second.
    pub fn observe(&mut self, sample: Sample, now: DateTime<Utc>) -> Option<ActivitySegment> {
        let state = classify(sample.idle_secs, self.idle_threshold_secs);

        let switch = match &self.current {
            None => true,
            Some(open) => {
                open.state != state
                    || (state == ActivityState::Active && open.process_name != sample.process_name)
            }
        };

        if !switch {
            if let Some(open) = self.current.as_mut() {
                open.extend_to(now);
            }
            return None;
        }

        let closed = self.close(now);
        self.current = Some(ActivitySegment {
            timestamp_start: now,
            timestamp_end: now,
            duration_sec: 0,
            state,
            computer_name: self.identity.computer_name.clone(),
            username: self.identity.username.clone(),
            process_name: sample.process_name,
            window_title: sample.window_title,
            session_id: self.identity.session_id.clone(),
        });
        closed
    }

    /// Close the open segment at `now`.
    ///
    /// Returns it when its final duration is non-zero. Leaves no open
    /// segment, so a second call returns `None`.
    pub fn close(&mut self, now: DateTime<Utc>) -> Option<ActivitySegment> {
        let mut segment = self.current.take()?;
        segment.extend_to(now);
        (segment.duration_sec > 0).then_some(segment)
    }
}
