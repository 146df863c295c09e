//! The function the native service calls, and the decoding of its raw event arrays.

use crate::{path, EventHandler};
use notify_fsevents_types::{EventFlags, EventId, FileSystemEvent};
use std::ffi::{c_char, c_void, CStr};
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::{self, ThreadId};

/// The part of a stream the native callback context points at.
///
/// It lives in its own allocation so that its address stays put while the owning
/// [`EventStream`](crate::EventStream) value moves.
pub(crate) struct StreamTarget {
    handler: Mutex<Box<dyn EventHandler>>,
    /// Highest id handed to the handler so far.
    delivered: AtomicU64,
    /// Thread currently inside the handler, if any.
    delivering_on: Mutex<Option<ThreadId>>,
}

/// Clears `delivering_on` when a batch ends, also if the handler panics.
struct DeliveryScope<'a>(&'a Mutex<Option<ThreadId>>);

impl<'a> DeliveryScope<'a> {
    fn enter(slot: &'a Mutex<Option<ThreadId>>) -> Self {
        *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(thread::current().id());
        DeliveryScope(slot)
    }
}

impl Drop for DeliveryScope<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl StreamTarget {
    pub(crate) fn new(handler: Box<dyn EventHandler>) -> Self {
        StreamTarget {
            handler: Mutex::new(handler),
            delivered: AtomicU64::new(0),
            delivering_on: Mutex::new(None),
        }
    }

    /// Whether the calling thread is inside this target's handler.
    pub(crate) fn is_delivering_here(&self) -> bool {
        let current = thread::current().id();
        *self.delivering_on.lock().unwrap_or_else(|e| e.into_inner()) == Some(current)
    }

    pub(crate) fn delivered(&self) -> EventId {
        EventId::from_raw(self.delivered.load(Ordering::Acquire))
    }

    /// Hands each event to the handler, in order, one at a time.
    pub(crate) fn deliver(&self, events: impl Iterator<Item = FileSystemEvent>) {
        let mut handler = self.handler.lock().expect("lock not to be poisoned");
        let _scope = DeliveryScope::enter(&self.delivering_on);
        for event in events {
            if !event.id.is_now() {
                self.delivered.fetch_max(event.id.raw(), Ordering::AcqRel);
            }
            log::trace!("FSEvent: path = `{}`, id = {}, flags = {}", event.path.display(), event.id, event.flags);
            handler.handle_event(event);
        }
    }
}

/// Borrowed view over the parallel arrays of one native callback.
struct RawBatch<'a> {
    paths: &'a [*const c_char],
    flags: &'a [u32],
    ids: &'a [u64],
    next: usize,
}

impl<'a> RawBatch<'a> {
    /// # Safety
    ///
    /// Each pointer must be valid for `num_events` reads and every path entry must point to a
    /// NUL-terminated string, all for the lifetime `'a`. Pointers may be null when `num_events`
    /// is zero.
    unsafe fn new(
        num_events: usize,
        paths: *const *const c_char,
        flags: *const u32,
        ids: *const u64,
    ) -> Self {
        if num_events == 0 {
            return RawBatch {
                paths: &[],
                flags: &[],
                ids: &[],
                next: 0,
            };
        }
        unsafe {
            RawBatch {
                paths: slice::from_raw_parts(paths, num_events),
                flags: slice::from_raw_parts(flags, num_events),
                ids: slice::from_raw_parts(ids, num_events),
                next: 0,
            }
        }
    }
}

impl Iterator for RawBatch<'_> {
    type Item = FileSystemEvent;

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.next;
        if i == self.paths.len() {
            return None;
        }
        self.next += 1;

        let bytes = unsafe { CStr::from_ptr(self.paths[i]) }.to_bytes();
        Some(FileSystemEvent {
            path: path::decode(bytes),
            id: EventId::from_raw(self.ids[i]),
            flags: EventFlags::from_bits_retain(self.flags[i]),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.paths.len() - self.next;
        (left, Some(left))
    }
}

/// The [`RawCallback`](crate::native::RawCallback) every stream registers.
///
/// # Safety
///
/// `info` must point to a live [`StreamTarget`], and the arrays must satisfy the requirements of
/// [`RawBatch::new`]. Nothing is retained past the call.
pub(crate) unsafe fn trampoline(
    info: *mut c_void,
    num_events: usize,
    paths: *const *const c_char,
    flags: *const u32,
    ids: *const u64,
) {
    let target = unsafe { &*(info as *const StreamTarget) };
    let batch = unsafe { RawBatch::new(num_events, paths, flags, ids) };
    target.deliver(batch);
}
