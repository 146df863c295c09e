//! The host-wide event cursor.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Position in the host-wide, monotonically increasing sequence of file system events.
///
/// Ids are global across all volumes and persist across reboots. They order by their raw value.
/// The counter may wrap around; when it does, the service reports it through
/// [`EventFlags::EVENT_IDS_WRAPPED`](crate::EventFlags::EVENT_IDS_WRAPPED) rather than by
/// reordering events.
///
/// Two values are reserved:
///
/// - [`EventId::NOW`] asks a new stream to deliver only events that happen after it is started.
///   It never appears on a delivered event.
/// - [`EventId::ZERO`] is carried by synthetic events such as a root change, which have no real
///   id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct EventId(u64);

impl EventId {
    /// Start receiving events from the moment the stream is started.
    pub const NOW: EventId = EventId(u64::MAX);

    /// Id carried by synthetic events.
    pub const ZERO: EventId = EventId(0);

    /// Wraps a raw id as handed out by the native service.
    pub const fn from_raw(raw: u64) -> Self {
        EventId(raw)
    }

    /// Returns the raw id.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns true for the [`EventId::NOW`] sentinel.
    pub const fn is_now(self) -> bool {
        self.0 == u64::MAX
    }

    /// Returns true for the [`EventId::ZERO`] sentinel.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for EventId {
    fn from(raw: u64) -> Self {
        EventId(raw)
    }
}

impl From<EventId> for u64 {
    fn from(id: EventId) -> Self {
        id.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_now() {
            f.write_str("now")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
