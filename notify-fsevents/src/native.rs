//! The boundary with the notification service that does the actual watching.
//!
//! [`NativeService`] mirrors the C API of FSEvents one call at a time. The stream state machine in
//! [`crate::stream`] is the only caller; it guarantees the ordering rules documented on each
//! method, so implementations may assume them.

use crate::capability::Capabilities;
use crate::Result;
use notify_fsevents_types::{EventId, StreamFlags};
use std::ffi::{c_char, c_void, CString};
use std::fmt;
use std::time::Duration;

/// Signature of the function the service calls with each batch of events.
///
/// `paths`, `flags` and `ids` are parallel arrays of `num_events` entries, borrowed for the
/// duration of the call. `info` is the pointer from the [`CallbackContext`].
pub type RawCallback = unsafe fn(
    info: *mut c_void,
    num_events: usize,
    paths: *const *const c_char,
    flags: *const u32,
    ids: *const u64,
);

/// Where the service delivers events for one stream.
///
/// `info` does not own what it points to. The stream keeps the target alive until it has
/// invalidated the native handle.
#[derive(Clone, Copy)]
pub struct CallbackContext {
    pub info: *mut c_void,
    pub callback: RawCallback,
}

// Safety: the pointer is only dereferenced by `callback`, on the execution context the stream is
// scheduled on, and the stream outlives every such call by construction.
unsafe impl Send for CallbackContext {}
unsafe impl Sync for CallbackContext {}

impl fmt::Debug for CallbackContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackContext")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Everything needed to create a native stream.
#[derive(Debug)]
pub struct CreateRequest<'a> {
    pub paths: &'a [CString],
    pub since_when: EventId,
    pub latency: Duration,
    pub flags: StreamFlags,
}

/// A host-wide file system notification service.
///
/// Implementations: [`CoreServices`](crate::fsevent::CoreServices) on macOS and
/// [`MemoryService`](crate::memory::MemoryService) everywhere.
pub trait NativeService: Send + Sync + 'static {
    /// Opaque reference to one native stream.
    type Handle: Send + Sync;

    /// The execution context streams are scheduled on and handlers run on.
    type Queue: Clone + Send + Sync + fmt::Debug;

    /// Flags and limits supported by this service on this host.
    fn capabilities(&self) -> Capabilities;

    /// Allocates a stream.
    ///
    /// Fails with [`ErrorKind::InvalidPath`](crate::ErrorKind::InvalidPath) if a path cannot be
    /// handed to the service. `Ok(None)` means the service could not allocate a handle at all.
    fn create(&self, request: &CreateRequest<'_>, context: CallbackContext) -> Result<Option<Self::Handle>>;

    /// Frees the handle. Called exactly once, after `invalidate` if the stream was ever scheduled.
    fn release(&self, handle: &Self::Handle);

    /// Moves the stream from `previous` to `next`; `None` means not scheduled.
    fn set_queue(&self, handle: &Self::Handle, previous: Option<&Self::Queue>, next: Option<&Self::Queue>);

    /// Starts delivery. Returns false if the service declines.
    fn start(&self, handle: &Self::Handle) -> bool;

    fn stop(&self, handle: &Self::Handle);

    /// Unschedules the stream for good. Only called while scheduled.
    fn invalidate(&self, handle: &Self::Handle);

    /// Asks for buffered events to be delivered soon; returns the highest id queued, or zero.
    fn flush_async(&self, handle: &Self::Handle) -> EventId;

    /// Delivers all buffered events and returns once the callback ran for each of them.
    fn flush_sync(&self, handle: &Self::Handle);

    /// Replaces the excluded paths. `Ok(false)` means the service declined the request.
    fn set_exclusion_paths(&self, handle: &Self::Handle, paths: &[CString]) -> Result<bool>;

    fn latest_event_id(&self, handle: &Self::Handle) -> EventId;

    fn paths_being_watched(&self, handle: &Self::Handle) -> Vec<CString>;

    /// The most recent id issued by the service to any stream.
    fn current_event_id(&self) -> EventId;

    /// Writes a description of the stream to the service's diagnostic sink.
    fn show(&self, handle: &Self::Handle);
}
