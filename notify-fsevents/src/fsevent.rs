//! [`NativeService`] for Darwin's FSEvents API.
//!
//! Streams are scheduled on a [`RunLoop`]: a thread running a `CFRunLoop`, on which FSEvents
//! invokes the callback.
//!
//! For more information see the [FSEvents API reference][ref].
//!
//! [ref]: https://developer.apple.com/documentation/coreservices/file_system_events

use crate::capability::{Capabilities, MAX_EXCLUSION_PATHS};
use crate::native::{CallbackContext, CreateRequest, NativeService};
use crate::{path, Error, Result};
use notify_fsevents_types::{EventId, StreamFlags};
use objc2_core_foundation as cf;
use objc2_core_services as fs;
use std::ffi::{c_char, CStr, CString};
use std::fmt;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

/// The host's FSEvents service.
#[derive(Clone, Copy, Debug, Default)]
pub struct CoreServices;

/// A native `FSEventStreamRef` together with the route its callback takes.
pub struct CoreServicesStream {
    stream: fs::FSEventStreamRef,
    // Owned by the native stream, freed by `release_route`.
    route: NonNull<CallbackRoute>,
}

// Safety: FSEvents stream functions may be called from any thread, and the stream state machine
// never calls them concurrently for the same stream.
unsafe impl Send for CoreServicesStream {}
unsafe impl Sync for CoreServicesStream {}

impl fmt::Debug for CoreServicesStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreServicesStream")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

struct CallbackRoute {
    context: CallbackContext,
    /// Held for the duration of each callback; false once the stream is invalidated.
    open: Mutex<bool>,
}

// Free the route when the stream created by `FSEventStreamCreate` is released.
unsafe extern "C-unwind" fn release_route(info: *const libc::c_void) {
    // Safety:
    // - `release` is only called when the stream is deallocated, so nothing else refers to
    //   `info` anymore.
    unsafe {
        drop(Box::from_raw(info as *const CallbackRoute as *mut CallbackRoute));
    }
}

unsafe extern "C-unwind" fn callback(
    _stream_ref: fs::ConstFSEventStreamRef,
    info: *mut libc::c_void,
    num_events: libc::size_t,                          // size_t numEvents
    event_paths: NonNull<libc::c_void>,                // void *eventPaths
    event_flags: NonNull<fs::FSEventStreamEventFlags>, // const FSEventStreamEventFlags eventFlags[]
    event_ids: NonNull<fs::FSEventStreamEventId>,      // const FSEventStreamEventId eventIds[]
) {
    let route = unsafe { &*(info as *const CallbackRoute) };
    let open = route.open.lock().expect("lock not to be poisoned");
    if !*open {
        return;
    }
    unsafe {
        (route.context.callback)(
            route.context.info,
            num_events,
            event_paths.as_ptr() as *const *const c_char,
            event_flags.as_ptr(),
            event_ids.as_ptr(),
        )
    }
}

fn cf_paths(paths: &[CString]) -> Result<cf::CFRetained<cf::CFMutableArray<cf::CFString>>> {
    let array = cf::CFMutableArray::empty();
    for encoded in paths {
        let path = path::decode(encoded.as_bytes());
        let mut err: *mut cf::CFError = ptr::null_mut();
        let Some(cf_path) = (unsafe { path_to_cfstring_ref(&path, &mut err) }) else {
            if let Some(err) = NonNull::new(err) {
                let _ = unsafe { cf::CFRetained::from_raw(err) };
            }
            return Err(Error::invalid_path().add_path(path));
        };
        array.append(&cf_path);
    }
    Ok(array)
}

fn default_mode() -> &'static cf::CFRunLoopMode {
    unsafe { cf::kCFRunLoopDefaultMode }.expect("Failed to get default runloop mode")
}

impl NativeService for CoreServices {
    type Handle = CoreServicesStream;
    type Queue = RunLoop;

    fn capabilities(&self) -> Capabilities {
        let (major, minor) = product_version().unwrap_or((10, 9));
        let at_least = |want: (u32, u32)| (major, minor) >= want;

        let mut stream_flags = StreamFlags::NO_DEFER | StreamFlags::WATCH_ROOT | StreamFlags::IGNORE_SELF;
        if at_least((10, 7)) {
            stream_flags |= StreamFlags::FILE_EVENTS;
        }
        if at_least((10, 9)) {
            stream_flags |= StreamFlags::MARK_SELF;
        }
        if at_least((10, 15)) {
            stream_flags |= StreamFlags::FULL_HISTORY;
        }
        Capabilities {
            stream_flags,
            max_exclusion_paths: MAX_EXCLUSION_PATHS,
        }
    }

    fn create(&self, request: &CreateRequest<'_>, context: CallbackContext) -> Result<Option<CoreServicesStream>> {
        let paths = cf_paths(request.paths)?;
        let route = NonNull::from(Box::leak(Box::new(CallbackRoute {
            context,
            open: Mutex::new(true),
        })));

        let stream_context = fs::FSEventStreamContext {
            version: 0,
            info: route.as_ptr() as *mut libc::c_void,
            retain: None,
            release: Some(release_route),
            copyDescription: None,
        };

        let stream = unsafe {
            fs::FSEventStreamCreate(
                cf::kCFAllocatorDefault,
                Some(callback),
                &stream_context as *const _ as *mut _,
                paths.as_opaque(),
                request.since_when.raw(),
                request.latency.as_secs_f64(),
                request.flags.bits(),
            )
        };
        if stream.is_null() {
            // The stream never took ownership of the route.
            drop(unsafe { Box::from_raw(route.as_ptr()) });
            return Ok(None);
        }

        Ok(Some(CoreServicesStream { stream, route }))
    }

    fn release(&self, handle: &CoreServicesStream) {
        unsafe { fs::FSEventStreamRelease(handle.stream) };
    }

    fn set_queue(&self, handle: &CoreServicesStream, previous: Option<&RunLoop>, next: Option<&RunLoop>) {
        unsafe {
            if let Some(previous) = previous {
                #[allow(deprecated)]
                fs::FSEventStreamUnscheduleFromRunLoop(handle.stream, &previous.inner.runloop, default_mode());
            }
            if let Some(next) = next {
                #[allow(deprecated)]
                fs::FSEventStreamScheduleWithRunLoop(handle.stream, &next.inner.runloop, default_mode());
            }
        }
    }

    fn start(&self, handle: &CoreServicesStream) -> bool {
        unsafe { fs::FSEventStreamStart(handle.stream) }
    }

    fn stop(&self, handle: &CoreServicesStream) {
        unsafe { fs::FSEventStreamStop(handle.stream) };
    }

    fn invalidate(&self, handle: &CoreServicesStream) {
        unsafe { fs::FSEventStreamInvalidate(handle.stream) };
        // Waits for a callback in flight on the run loop thread.
        let route = unsafe { handle.route.as_ref() };
        *route.open.lock().expect("lock not to be poisoned") = false;
    }

    fn flush_async(&self, handle: &CoreServicesStream) -> EventId {
        EventId::from_raw(unsafe { fs::FSEventStreamFlushAsync(handle.stream) })
    }

    fn flush_sync(&self, handle: &CoreServicesStream) {
        unsafe { fs::FSEventStreamFlushSync(handle.stream) };
    }

    fn set_exclusion_paths(&self, handle: &CoreServicesStream, paths: &[CString]) -> Result<bool> {
        let paths = cf_paths(paths)?;
        Ok(unsafe { fs::FSEventStreamSetExclusionPaths(handle.stream, paths.as_opaque()) })
    }

    fn latest_event_id(&self, handle: &CoreServicesStream) -> EventId {
        EventId::from_raw(unsafe { fs::FSEventStreamGetLatestEventId(handle.stream) })
    }

    fn paths_being_watched(&self, handle: &CoreServicesStream) -> Vec<CString> {
        let paths = unsafe { fs::FSEventStreamCopyPathsBeingWatched(handle.stream) };
        let paths = unsafe { paths.cast_unchecked::<cf::CFString>() };
        paths
            .iter()
            .filter_map(|p| watched_path(p.to_string()))
            .collect()
    }

    fn current_event_id(&self) -> EventId {
        EventId::from_raw(unsafe { fs::FSEventsGetCurrentEventId() })
    }

    fn show(&self, handle: &CoreServicesStream) {
        unsafe { fs::FSEventStreamShow(handle.stream) };
    }
}

fn watched_path(path: String) -> Option<CString> {
    match CString::new(path) {
        Ok(encoded) => Some(encoded),
        Err(err) => {
            log::warn!("skipping watched path with interior NUL: {err}");
            None
        }
    }
}

/// Returns `(major, minor)` of the running macOS release.
fn product_version() -> Option<(u32, u32)> {
    let mut buf = [0u8; 32];
    let mut len = buf.len();
    let name = c"kern.osproductversion";
    let rc = unsafe {
        libc::sysctlbyname(
            name.as_ptr(),
            buf.as_mut_ptr().cast(),
            &mut len,
            ptr::null_mut(),
            0,
        )
    };
    // The sysctl only exists from 10.13.4 on.
    if rc != 0 {
        return None;
    }

    let version = CStr::from_bytes_until_nul(&buf[..len]).ok()?.to_str().ok()?;
    let mut parts = version.split('.').map(str::parse::<u32>);
    let major = parts.next()?.ok()?;
    let minor = parts.next().and_then(Result::ok).unwrap_or(0);
    Some((major, minor))
}

/// A thread running a `CFRunLoop`, usable as execution context for [`CoreServices`] streams.
///
/// Clones refer to the same thread, which stops once the last clone is dropped.
#[derive(Clone)]
pub struct RunLoop {
    inner: Arc<RunLoopInner>,
}

struct RunLoopInner {
    label: String,
    runloop: cf::CFRetained<cf::CFRunLoop>,
    stop: Arc<AtomicBool>,
    thread_id: ThreadId,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

// Safety:
// - According to the Apple documentation, it's safe to move `CFRunLoop`s across threads and to
//   stop them from another thread.
//   https://developer.apple.com/library/archive/documentation/Cocoa/Conceptual/Multithreading/ThreadSafetySummary/ThreadSafetySummary.html
unsafe impl Send for RunLoopInner {}
unsafe impl Sync for RunLoopInner {}

impl RunLoop {
    /// Spawns the run loop thread and waits until its run loop exists.
    pub fn new(label: &str) -> Result<Self> {
        // Wrapper to help send CFRunLoop types across threads.
        struct CFRunLoopSendWrapper(cf::CFRetained<cf::CFRunLoop>);
        unsafe impl Send for CFRunLoopSendWrapper {}

        let (rl_tx, rl_rx) = crossbeam_channel::bounded(1);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_handle = thread::Builder::new().name(label.to_string()).spawn({
            let stop = Arc::clone(&stop);
            move || {
                // Safety:
                // This may panic if OOM occurs.
                // Related: https://github.com/madsmtm/objc2/issues/797
                let cur_runloop = cf::CFRunLoop::current().expect("Failed to get current runloop");
                if rl_tx.send(CFRunLoopSendWrapper(cur_runloop)).is_err() {
                    return;
                }
                while !stop.load(Ordering::Acquire) {
                    let result = unsafe { cf::CFRunLoop::run_in_mode(Some(default_mode()), 0.25, false) };
                    // Returns right away while no stream is scheduled.
                    if result == cf::CFRunLoopRunResult::Finished {
                        thread::sleep(Duration::from_millis(20));
                    }
                }
            }
        })?;
        let thread_id = thread_handle.thread().id();
        let runloop = rl_rx
            .recv()
            .map_err(|_| Error::generic("run loop thread exited before starting"))?;

        Ok(RunLoop {
            inner: Arc::new(RunLoopInner {
                label: label.to_string(),
                runloop: runloop.0,
                stop,
                thread_id,
                thread_handle: Mutex::new(Some(thread_handle)),
            }),
        })
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Whether the caller is running on this run loop's thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }
}

impl fmt::Debug for RunLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RunLoop").field(&self.inner.label).finish()
    }
}

impl PartialEq for RunLoop {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Drop for RunLoopInner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.runloop.stop();
        if thread::current().id() == self.thread_id {
            return;
        }
        let handle = self.thread_handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            handle.join().expect("thread to shut down");
        }
    }
}

/// Grabbed from <https://docs.rs/fsevent-sys/4.1.0/src/fsevent_sys/core_foundation.rs.html#149-230>.
///
/// Resolves the existing part of `source` through a file reference URL, so that watching a path
/// below a symlinked directory reports the paths FSEvents uses.
unsafe fn path_to_cfstring_ref(
    source: &Path,
    err: &mut *mut cf::CFError,
) -> Option<cf::CFRetained<cf::CFString>> {
    let url = cf::CFURL::from_file_path(source)?;
    let mut placeholder = url.absolute_url()?;
    let imaginary = cf::CFMutableArray::empty();

    while !unsafe { placeholder.resource_is_reachable(err) } {
        if let Some(child) = placeholder.last_path_component() {
            imaginary.insert(0, &*child);
        }
        placeholder = cf::CFURL::new_copy_deleting_last_path_component(None, Some(&placeholder))?;
    }

    let url = unsafe { cf::CFURL::new_file_reference_url(None, Some(&placeholder), err) }?;
    let mut placeholder = unsafe { cf::CFURL::new_file_path_url(None, Some(&url), err) }?;

    for component in imaginary {
        placeholder = cf::CFURL::new_copy_appending_path_component(
            None,
            Some(&placeholder),
            Some(&component),
            false,
        )?;
    }

    placeholder.file_system_path(cf::CFURLPathStyle::CFURLPOSIXPathStyle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_a_product_version() {
        let (major, _) = product_version().expect("kern.osproductversion");
        assert!(major >= 10);
    }

    #[test]
    fn capabilities_include_file_events() {
        let caps = CoreServices.capabilities();
        assert!(caps.supports(StreamFlags::FILE_EVENTS | StreamFlags::NO_DEFER));
        assert_eq!(caps.max_exclusion_paths, 8);
    }

    #[test]
    fn watched_paths_with_nul_are_skipped() {
        assert_eq!(watched_path("/Users/me".into()), Some(CString::new("/Users/me").unwrap()));
        assert_eq!(watched_path("/Users/\0me".into()), None);
    }

    #[test]
    fn cf_paths_resolves_missing_components() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not").join("yet");
        let encoded = path::encode(&missing).unwrap();
        let array = cf_paths(&[encoded]).unwrap();
        assert_eq!(array.len(), 1);
    }

    #[test]
    fn run_loop_threads_stop_on_drop() {
        let runloop = RunLoop::new("runloop-test").unwrap();
        assert!(!runloop.is_current());
        assert_eq!(runloop, runloop.clone());
        drop(runloop);
    }

    #[test]
    fn current_event_id_is_not_now() {
        assert!(!CoreServices.current_event_id().is_now());
    }
}
