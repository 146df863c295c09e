//! Bit sets attached to streams and to the events they deliver.
//!
//! Bit values match the FSEvents C API, so the raw integers can be handed to and read back from
//! the native service unchanged. Unknown bits coming from the service are retained, not dropped.

use std::fmt;

use bitflags::bitflags;

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    /// Options fixed when a stream is created.
    ///
    /// The empty set means default coalescing: events are batched into one delivery per latency
    /// window.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct StreamFlags: u32 {
        /// Deliver the first event of a burst immediately, then coalesce the rest.
        const NO_DEFER = 0x0000_0002;
        /// Also report changes to the path of the watched directories or their ancestors.
        const WATCH_ROOT = 0x0000_0004;
        /// Do not report events caused by the process that created the stream.
        const IGNORE_SELF = 0x0000_0008;
        /// Report individual files instead of only the directories containing them.
        const FILE_EVENTS = 0x0000_0010;
        /// Tag events caused by the creating process with [`EventFlags::OWN_EVENT`].
        const MARK_SELF = 0x0000_0020;
        /// When replaying history, never skip events sharing a storage chunk with the start id.
        const FULL_HISTORY = 0x0000_0080;
    }
}

bitflags! {
    /// Semantics of a single delivered event. Any subset of bits may be set.
    ///
    /// The `ITEM_*` bits and [`EventFlags::OWN_EVENT`] are only reported by streams created with
    /// [`StreamFlags::FILE_EVENTS`] (respectively [`StreamFlags::MARK_SELF`]). Without any bit
    /// set, the event only says that something in the directory changed.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct EventFlags: u32 {
        /// The subtree must be rescanned, events were coalesced or lost.
        const MUST_SCAN_SUBDIRS = 0x0000_0001;
        /// Events were dropped because a user-space buffer overflowed.
        const USER_DROPPED = 0x0000_0002;
        /// Events were dropped because a kernel buffer overflowed.
        const KERNEL_DROPPED = 0x0000_0004;
        /// The host-wide id counter wrapped around.
        const EVENT_IDS_WRAPPED = 0x0000_0008;
        /// Sentinel marking the end of replayed history.
        const HISTORY_DONE = 0x0000_0010;
        /// Sentinel: the watched path or one of its ancestors changed.
        const ROOT_CHANGED = 0x0000_0020;
        /// A volume was mounted under a watched path.
        const MOUNT = 0x0000_0040;
        /// A volume was unmounted from under a watched path.
        const UNMOUNT = 0x0000_0080;
        const ITEM_CREATED = 0x0000_0100;
        const ITEM_REMOVED = 0x0000_0200;
        /// Inode metadata such as permissions or timestamps changed.
        const ITEM_INODE_META_MOD = 0x0000_0400;
        const ITEM_RENAMED = 0x0000_0800;
        /// File contents changed.
        const ITEM_MODIFIED = 0x0000_1000;
        const ITEM_FINDER_INFO_MOD = 0x0000_2000;
        const ITEM_CHANGE_OWNER = 0x0000_4000;
        const ITEM_XATTR_MOD = 0x0000_8000;
        const ITEM_IS_FILE = 0x0001_0000;
        const ITEM_IS_DIR = 0x0002_0000;
        const ITEM_IS_SYMLINK = 0x0004_0000;
        /// The event was caused by the process that created the stream.
        const OWN_EVENT = 0x0008_0000;
        const ITEM_IS_HARDLINK = 0x0010_0000;
        const ITEM_IS_LAST_HARDLINK = 0x0020_0000;
        const ITEM_CLONED = 0x0040_0000;
    }
}

const STREAM_FLAG_NAMES: &[(StreamFlags, &str)] = &[
    (StreamFlags::NO_DEFER, "noDefer"),
    (StreamFlags::WATCH_ROOT, "watchRoot"),
    (StreamFlags::IGNORE_SELF, "ignoreSelf"),
    (StreamFlags::FILE_EVENTS, "fileEvents"),
    (StreamFlags::MARK_SELF, "markSelf"),
    (StreamFlags::FULL_HISTORY, "fullHistory"),
];

const EVENT_FLAG_NAMES: &[(EventFlags, &str)] = &[
    (EventFlags::MUST_SCAN_SUBDIRS, "mustScanSubDirs"),
    (EventFlags::USER_DROPPED, "userDropped"),
    (EventFlags::KERNEL_DROPPED, "kernelDropped"),
    (EventFlags::EVENT_IDS_WRAPPED, "eventIdsWrapped"),
    (EventFlags::HISTORY_DONE, "historyDone"),
    (EventFlags::ROOT_CHANGED, "rootChanged"),
    (EventFlags::MOUNT, "mount"),
    (EventFlags::UNMOUNT, "unmount"),
    (EventFlags::ITEM_CREATED, "itemCreated"),
    (EventFlags::ITEM_REMOVED, "itemRemoved"),
    (EventFlags::ITEM_INODE_META_MOD, "itemInodeMetaMod"),
    (EventFlags::ITEM_RENAMED, "itemRenamed"),
    (EventFlags::ITEM_MODIFIED, "itemModified"),
    (EventFlags::ITEM_FINDER_INFO_MOD, "itemFinderInfoMod"),
    (EventFlags::ITEM_CHANGE_OWNER, "itemChangeOwner"),
    (EventFlags::ITEM_XATTR_MOD, "itemXattrMod"),
    (EventFlags::ITEM_IS_FILE, "itemIsFile"),
    (EventFlags::ITEM_IS_DIR, "itemIsDir"),
    (EventFlags::ITEM_IS_SYMLINK, "itemIsSymlink"),
    (EventFlags::OWN_EVENT, "ownEvent"),
    (EventFlags::ITEM_IS_HARDLINK, "itemIsHardlink"),
    (EventFlags::ITEM_IS_LAST_HARDLINK, "itemIsLastHardlink"),
    (EventFlags::ITEM_CLONED, "itemCloned"),
];

/// Writes `[a, b]` for the named bits of `bits`, in bit order, plus any unnamed remainder in hex.
fn describe(f: &mut fmt::Formatter<'_>, bits: u32, names: &[(u32, &str)]) -> fmt::Result {
    let mut remaining = bits;
    let mut first = true;
    f.write_str("[")?;
    for &(bit, name) in names {
        if bits & bit == bit {
            if !first {
                f.write_str(", ")?;
            }
            f.write_str(name)?;
            first = false;
            remaining &= !bit;
        }
    }
    if remaining != 0 {
        if !first {
            f.write_str(", ")?;
        }
        write!(f, "{remaining:#x}")?;
    }
    f.write_str("]")
}

impl StreamFlags {
    /// Default coalescing, no options.
    pub const NONE: StreamFlags = StreamFlags::empty();

    /// Canonical name of a single named bit.
    pub fn name(self) -> Option<&'static str> {
        STREAM_FLAG_NAMES
            .iter()
            .find(|(flag, _)| *flag == self)
            .map(|(_, name)| *name)
    }
}

impl Default for StreamFlags {
    fn default() -> Self {
        StreamFlags::NONE
    }
}

impl fmt::Display for StreamFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<(u32, &str)> = STREAM_FLAG_NAMES
            .iter()
            .map(|(flag, name)| (flag.bits(), *name))
            .collect();
        describe(f, self.bits(), &names)
    }
}

/// What kind of item a file-level event refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum ItemType {
    File,
    Dir,
    Symlink,
    Hardlink,
}

impl EventFlags {
    /// A generic "something in this directory changed" signal.
    pub const NONE: EventFlags = EventFlags::empty();

    /// Bits only reported by file-level streams.
    pub const ITEM_MASK: EventFlags = EventFlags::ITEM_CREATED
        .union(EventFlags::ITEM_REMOVED)
        .union(EventFlags::ITEM_INODE_META_MOD)
        .union(EventFlags::ITEM_RENAMED)
        .union(EventFlags::ITEM_MODIFIED)
        .union(EventFlags::ITEM_FINDER_INFO_MOD)
        .union(EventFlags::ITEM_CHANGE_OWNER)
        .union(EventFlags::ITEM_XATTR_MOD)
        .union(EventFlags::ITEM_IS_FILE)
        .union(EventFlags::ITEM_IS_DIR)
        .union(EventFlags::ITEM_IS_SYMLINK)
        .union(EventFlags::ITEM_IS_HARDLINK)
        .union(EventFlags::ITEM_IS_LAST_HARDLINK)
        .union(EventFlags::ITEM_CLONED);

    /// Canonical name of a single named bit.
    pub fn name(self) -> Option<&'static str> {
        EVENT_FLAG_NAMES
            .iter()
            .find(|(flag, _)| *flag == self)
            .map(|(_, name)| *name)
    }

    /// True for synthetic events that signal stream or service state instead of a change.
    pub fn is_sentinel(self) -> bool {
        self.intersects(EventFlags::HISTORY_DONE | EventFlags::ROOT_CHANGED)
    }

    /// True when the receiver must rescan the event's subtree to stay consistent.
    pub fn must_rescan(self) -> bool {
        self.contains(EventFlags::MUST_SCAN_SUBDIRS)
    }

    /// True when the service reported lost events.
    pub fn events_dropped(self) -> bool {
        self.intersects(EventFlags::USER_DROPPED | EventFlags::KERNEL_DROPPED)
    }

    /// The item type of a file-level event, if reported.
    pub fn item_type(self) -> Option<ItemType> {
        if self.contains(EventFlags::ITEM_IS_DIR) {
            Some(ItemType::Dir)
        } else if self.contains(EventFlags::ITEM_IS_FILE) {
            Some(ItemType::File)
        } else if self.contains(EventFlags::ITEM_IS_SYMLINK) {
            Some(ItemType::Symlink)
        } else if self.contains(EventFlags::ITEM_IS_HARDLINK) {
            Some(ItemType::Hardlink)
        } else {
            None
        }
    }
}

impl Default for EventFlags {
    fn default() -> Self {
        EventFlags::NONE
    }
}

impl fmt::Display for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<(u32, &str)> = EVENT_FLAG_NAMES
            .iter()
            .map(|(flag, name)| (flag.bits(), *name))
            .collect();
        describe(f, self.bits(), &names)
    }
}

// Both sets travel as their raw integers so that bits unknown to this crate survive.
#[cfg(feature = "serde")]
macro_rules! serde_as_bits {
    ($t:ty) => {
        impl Serialize for $t {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_u32(self.bits())
            }
        }

        impl<'de> Deserialize<'de> for $t {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                u32::deserialize(deserializer).map(<$t>::from_bits_retain)
            }
        }
    };
}

#[cfg(feature = "serde")]
serde_as_bits!(StreamFlags);
#[cfg(feature = "serde")]
serde_as_bits!(EventFlags);

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case(StreamFlags::NONE, "[]")]
    #[case(StreamFlags::NO_DEFER, "[noDefer]")]
    #[case(StreamFlags::NO_DEFER | StreamFlags::WATCH_ROOT, "[noDefer, watchRoot]")]
    #[case(StreamFlags::FULL_HISTORY | StreamFlags::IGNORE_SELF, "[ignoreSelf, fullHistory]")]
    #[case(StreamFlags::all(), "[noDefer, watchRoot, ignoreSelf, fileEvents, markSelf, fullHistory]")]
    fn stream_flags_display(#[case] flags: StreamFlags, #[case] expected: &str) {
        assert_eq!(flags.to_string(), expected);
    }

    #[rstest]
    #[case(EventFlags::NONE, "[]")]
    #[case(EventFlags::ITEM_CREATED | EventFlags::ITEM_CLONED, "[itemCreated, itemCloned]")]
    #[case(EventFlags::MUST_SCAN_SUBDIRS | EventFlags::KERNEL_DROPPED, "[mustScanSubDirs, kernelDropped]")]
    #[case(EventFlags::ITEM_IS_FILE | EventFlags::ITEM_MODIFIED | EventFlags::OWN_EVENT, "[itemModified, itemIsFile, ownEvent]")]
    fn event_flags_display(#[case] flags: EventFlags, #[case] expected: &str) {
        assert_eq!(flags.to_string(), expected);
    }

    #[test]
    fn every_named_bit_renders_alone() {
        for (flag, name) in EVENT_FLAG_NAMES {
            assert_eq!(flag.to_string(), format!("[{name}]"));
            assert_eq!(flag.name(), Some(*name));
        }
        for (flag, name) in STREAM_FLAG_NAMES {
            assert_eq!(flag.to_string(), format!("[{name}]"));
            assert_eq!(flag.name(), Some(*name));
        }
    }

    #[test]
    fn unknown_bits_are_kept() {
        let flags = EventFlags::from_bits_retain(0x8000_0100);
        assert!(flags.contains(EventFlags::ITEM_CREATED));
        assert_eq!(flags.bits(), 0x8000_0100);
        insta::assert_snapshot!(flags.to_string(), @"[itemCreated, 0x80000000]");

        let flags = StreamFlags::from_bits_retain(0x1);
        insta::assert_snapshot!(flags.to_string(), @"[0x1]");
    }

    #[test]
    fn item_mask_covers_item_bits_only() {
        assert!(EventFlags::ITEM_MASK.contains(EventFlags::ITEM_CLONED));
        assert!(!EventFlags::ITEM_MASK.contains(EventFlags::OWN_EVENT));
        assert!(!EventFlags::ITEM_MASK.intersects(
            EventFlags::MUST_SCAN_SUBDIRS | EventFlags::HISTORY_DONE | EventFlags::MOUNT
        ));
    }

    #[test]
    fn classification() {
        assert!(EventFlags::HISTORY_DONE.is_sentinel());
        assert!(EventFlags::ROOT_CHANGED.is_sentinel());
        assert!(!EventFlags::ITEM_CREATED.is_sentinel());
        assert!((EventFlags::MUST_SCAN_SUBDIRS | EventFlags::USER_DROPPED).must_rescan());
        assert!(EventFlags::USER_DROPPED.events_dropped());
        assert!(!EventFlags::NONE.events_dropped());
        assert_eq!(
            (EventFlags::ITEM_IS_DIR | EventFlags::ITEM_IS_SYMLINK).item_type(),
            Some(ItemType::Dir)
        );
        assert_eq!(EventFlags::ITEM_IS_HARDLINK.item_type(), Some(ItemType::Hardlink));
        assert_eq!(EventFlags::ITEM_CREATED.item_type(), None);
    }

    #[test]
    fn set_operations() {
        let a = StreamFlags::NO_DEFER | StreamFlags::FILE_EVENTS;
        let b = StreamFlags::FILE_EVENTS | StreamFlags::MARK_SELF;
        assert_eq!(a & b, StreamFlags::FILE_EVENTS);
        assert_eq!((a | b).bits(), 0x32);
        assert!(a.contains(StreamFlags::NO_DEFER));
        assert_eq!(StreamFlags::default(), StreamFlags::NONE);
    }
}
