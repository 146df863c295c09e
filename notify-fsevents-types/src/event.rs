//! The `FileSystemEvent` record handed to stream handlers.

use std::{fmt, path::PathBuf};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{EventFlags, EventId};

/// A single change reported by an event stream.
///
/// For directory-level streams `path` is the directory whose contents changed; for file-level
/// streams it is the item itself. Sentinel events (see [`EventFlags::is_sentinel`]) carry a path
/// that should not be interpreted as a change location.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FileSystemEvent {
    pub path: PathBuf,
    pub id: EventId,
    pub flags: EventFlags,
}

impl FileSystemEvent {
    pub fn new(path: impl Into<PathBuf>, id: EventId, flags: EventFlags) -> Self {
        FileSystemEvent {
            path: path.into(),
            id,
            flags,
        }
    }

    /// See [`EventFlags::is_sentinel`].
    pub fn is_sentinel(&self) -> bool {
        self.flags.is_sentinel()
    }
}

impl fmt::Display for FileSystemEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} {}", self.id, self.path.display(), self.flags)
    }
}
