//! What a native service supports on the running host.
//!
//! Some stream flags only exist from a given OS release onwards. Rather than checking versions
//! throughout the stream code, the service reports its [`Capabilities`] once and the stream
//! configuration is resolved against them before a native stream is created.

use crate::config::{StreamConfig, UnsupportedFlags};
use crate::{Error, Result};
use notify_fsevents_types::StreamFlags;

/// Exclusion limit of FSEvents.
pub const MAX_EXCLUSION_PATHS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Capabilities {
    /// Stream flags the service accepts.
    pub stream_flags: StreamFlags,
    /// Number of directories that may be excluded from a stream.
    pub max_exclusion_paths: usize,
}

impl Capabilities {
    /// Everything this crate knows about.
    pub const ALL: Capabilities = Capabilities {
        stream_flags: StreamFlags::all(),
        max_exclusion_paths: MAX_EXCLUSION_PATHS,
    };

    pub fn supports(&self, flags: StreamFlags) -> bool {
        self.stream_flags.contains(flags)
    }

    /// Returns the flags to create a stream with.
    ///
    /// Unsupported flags are rejected or dropped depending on
    /// [`StreamConfig::unsupported_flags`].
    pub fn resolve(&self, config: &StreamConfig) -> Result<StreamFlags> {
        let requested = config.flags();
        let unsupported = requested.difference(self.stream_flags);
        if unsupported.is_empty() {
            return Ok(requested);
        }

        match config.unsupported_flags() {
            UnsupportedFlags::Reject => Err(Error::unsupported_flags(unsupported)),
            UnsupportedFlags::Ignore => {
                log::warn!("ignoring stream flags not supported on this host: {unsupported}");
                Ok(requested & self.stream_flags)
            }
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities::ALL
    }
}
