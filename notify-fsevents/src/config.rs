//! Configuration types

use notify_fsevents_types::{EventId, StreamFlags};
use std::time::Duration;

/// What to do with stream flags the host cannot honour.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, Default)]
pub enum UnsupportedFlags {
    /// Fail stream creation with [`ErrorKind::UnsupportedFlags`](crate::ErrorKind::UnsupportedFlags).
    #[default]
    Reject,

    /// Drop the unsupported flags and log a warning.
    Ignore,
}

/// Stream configuration
///
/// Everything in here is fixed once the stream is created.
///
/// ```rust
/// # use std::time::Duration;
/// # use notify_fsevents::{StreamConfig, StreamFlags};
/// let config = StreamConfig::default()
///     .with_latency(Duration::from_millis(200))
///     .with_flags(StreamFlags::FILE_EVENTS | StreamFlags::NO_DEFER);
/// ```
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct StreamConfig {
    /// See [StreamConfig::with_since_when]
    since_when: EventId,

    /// See [StreamConfig::with_latency]
    latency: Duration,

    /// See [StreamConfig::with_flags]
    flags: StreamFlags,

    unsupported_flags: UnsupportedFlags,
}

impl StreamConfig {
    /// Where in the host-wide event history delivery starts.
    ///
    /// [`EventId::NOW`] (the default) only delivers events that happen after the stream is
    /// started. Any other id first replays the recorded history after that id, followed by an
    /// event flagged [`EventFlags::HISTORY_DONE`](crate::EventFlags::HISTORY_DONE).
    pub fn with_since_when(mut self, since_when: EventId) -> Self {
        self.since_when = since_when;
        self
    }

    /// Returns current setting
    pub fn since_when(&self) -> EventId {
        self.since_when
    }

    /// How long the service may hold events back to coalesce them.
    ///
    /// Zero by default, meaning events are delivered as soon as the coalescing rules allow.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Returns current setting
    pub fn latency(&self) -> Duration {
        self.latency
    }

    /// Creation options, empty by default.
    pub fn with_flags(mut self, flags: StreamFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Returns current setting
    pub fn flags(&self) -> StreamFlags {
        self.flags
    }

    /// Policy for flags the host does not support. [`UnsupportedFlags::Reject`] by default.
    pub fn with_unsupported_flags(mut self, policy: UnsupportedFlags) -> Self {
        self.unsupported_flags = policy;
        self
    }

    /// Returns current setting
    pub fn unsupported_flags(&self) -> UnsupportedFlags {
        self.unsupported_flags
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            since_when: EventId::NOW,
            latency: Duration::ZERO,
            flags: StreamFlags::NONE,
            unsupported_flags: UnsupportedFlags::Reject,
        }
    }
}
