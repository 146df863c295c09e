//! Value types shared by `notify-fsevents` and its consumers.

pub mod event;
pub mod event_id;
pub mod flags;

pub use event::FileSystemEvent;
pub use event_id::EventId;
pub use flags::{EventFlags, ItemType, StreamFlags};
