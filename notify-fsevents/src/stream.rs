//! The event stream and its lifecycle.
//!
//! ```text
//!            schedule                start
//!  Created ------------> Scheduled --------> Running
//!     ^ <---------------    |                 |   ^
//!     |     unschedule      | invalidate  stop|   | start
//!     |                     v                 v   |
//!     |               Invalidated <------- Stopped
//!     +------------------------------------- unschedule
//! ```
//!
//! Releasing is not a state: [`EventStream::release`] consumes the stream, and dropping it runs
//! the same teardown.

use crate::native::{CallbackContext, CreateRequest, NativeService};
use crate::trampoline::{trampoline, StreamTarget};
use crate::{path, Error, EventHandler, Result, StreamConfig};
use notify_fsevents_types::{EventId, StreamFlags};
use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};

/// Where an [`EventStream`] is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Created, not bound to an execution context.
    Created,
    /// Bound to an execution context, not delivering.
    Scheduled,
    /// Delivering events.
    Running,
    /// Bound, delivery paused. Starting again resumes after the last delivered event.
    Stopped,
    /// Unbound for good. Only releasing remains.
    Invalidated,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamState::Created => "created",
            StreamState::Scheduled => "scheduled",
            StreamState::Running => "running",
            StreamState::Stopped => "stopped",
            StreamState::Invalidated => "invalidated",
        })
    }
}

/// A stream of file system events for a set of directories.
///
/// The stream owns its native handle and the handler. Events are delivered to the handler on the
/// execution context the stream is scheduled on, in batches, in the order the service reports
/// them.
///
/// ```no_run
/// # use notify_fsevents::{EventStream, MemoryService, SerialQueue, StreamConfig, FileSystemEvent};
/// # fn main() -> notify_fsevents::Result<()> {
/// let service = MemoryService::new();
/// let queue = SerialQueue::new("events")?;
/// let mut stream = EventStream::new(
///     service,
///     ["/tmp"],
///     StreamConfig::default(),
///     |event: FileSystemEvent| println!("{event}"),
/// )?;
/// stream.schedule(&queue)?;
/// stream.start()?;
/// # Ok(())
/// # }
/// ```
pub struct EventStream<S: NativeService> {
    service: S,
    handle: S::Handle,
    queue: Option<S::Queue>,
    state: StreamState,
    started: bool,
    released: bool,
    config: StreamConfig,
    // Referenced by the native stream through `CallbackContext::info`; must outlive the handle.
    target: Box<StreamTarget>,
}

impl<S: NativeService> EventStream<S> {
    /// Creates a stream for `directories`.
    ///
    /// Fails if there are no directories, if a path cannot be passed to the service, or if the
    /// configuration asks for flags the host does not support.
    ///
    /// # Panics
    ///
    /// If the service cannot allocate a stream at all.
    pub fn new<I, P, F>(service: S, directories: I, config: StreamConfig, handler: F) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
        F: EventHandler,
    {
        let paths = path::encode_all(directories)?;
        if paths.is_empty() {
            return Err(Error::no_directories());
        }
        let flags = service.capabilities().resolve(&config)?;
        let config = config.with_flags(flags);

        let target = Box::new(StreamTarget::new(Box::new(handler)));
        let context = CallbackContext {
            info: &*target as *const StreamTarget as *mut c_void,
            callback: trampoline,
        };
        let request = CreateRequest {
            paths: &paths,
            since_when: config.since_when(),
            latency: config.latency(),
            flags,
        };
        let handle = match service.create(&request, context)? {
            Some(handle) => handle,
            None => panic!("event stream could not be allocated for {paths:?}"),
        };
        log::debug!("created event stream for {paths:?} with {config:?}");

        Ok(EventStream {
            service,
            handle,
            queue: None,
            state: StreamState::Created,
            started: false,
            released: false,
            config,
            target,
        })
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// The configuration the stream was created with, with flags resolved for this host.
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn flags(&self) -> StreamFlags {
        self.config.flags()
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// The execution context the stream is bound to, if any.
    pub fn execution_context(&self) -> Option<&S::Queue> {
        self.queue.as_ref()
    }

    /// Binds the stream to `queue`, or unbinds it with `None`.
    ///
    /// Not allowed while running or once invalidated. Unbinding a stream that is not bound does
    /// nothing.
    pub fn set_execution_context(&mut self, queue: Option<&S::Queue>) -> Result<()> {
        match self.state {
            StreamState::Running | StreamState::Invalidated => {
                return Err(Error::invalid_state(self.state));
            }
            StreamState::Created if queue.is_none() => return Ok(()),
            _ => {}
        }

        self.service.set_queue(&self.handle, self.queue.as_ref(), queue);
        self.queue = queue.cloned();
        let next = if self.queue.is_some() {
            StreamState::Scheduled
        } else {
            StreamState::Created
        };
        self.transition(next);
        Ok(())
    }

    /// Shorthand for `set_execution_context(Some(queue))`.
    pub fn schedule(&mut self, queue: &S::Queue) -> Result<()> {
        self.set_execution_context(Some(queue))
    }

    /// Shorthand for `set_execution_context(None)`.
    pub fn unschedule(&mut self) -> Result<()> {
        self.set_execution_context(None)
    }

    /// Starts delivering events. Starting a running stream does nothing.
    ///
    /// A stream with a `since_when` other than [`EventId::NOW`] first replays history, followed by
    /// a `HISTORY_DONE` sentinel. After [`stop`](Self::stop), starting resumes after the last
    /// delivered event.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            StreamState::Running => Ok(()),
            StreamState::Scheduled | StreamState::Stopped => {
                if !self.service.start(&self.handle) {
                    log::warn!("native service declined to start {:?}", self.directories());
                    return Err(Error::could_not_start_stream());
                }
                self.started = true;
                self.transition(StreamState::Running);
                Ok(())
            }
            StreamState::Created | StreamState::Invalidated => Err(Error::could_not_start_stream()),
        }
    }

    /// Pauses delivery. Does nothing unless running.
    pub fn stop(&mut self) {
        if self.state == StreamState::Running {
            self.service.stop(&self.handle);
            self.transition(StreamState::Stopped);
        }
    }

    /// Unbinds the stream for good, stopping it first if needed.
    ///
    /// Invalidating twice does nothing; invalidating a stream that was never bound is an error.
    pub fn invalidate(&mut self) -> Result<()> {
        match self.state {
            StreamState::Invalidated => return Ok(()),
            StreamState::Created => return Err(Error::invalid_state(self.state)),
            StreamState::Running => self.stop(),
            StreamState::Scheduled | StreamState::Stopped => {}
        }
        self.service.invalidate(&self.handle);
        self.queue = None;
        self.transition(StreamState::Invalidated);
        Ok(())
    }

    /// Asks for buffered events to be delivered soon.
    ///
    /// Returns the highest id that was queued, or [`EventId::ZERO`] if none was or the stream was
    /// never started.
    pub fn flush_async(&self) -> EventId {
        if !self.started || self.state == StreamState::Invalidated {
            return EventId::ZERO;
        }
        self.service.flush_async(&self.handle)
    }

    /// Delivers all buffered events before returning.
    ///
    /// Must not be called from inside this stream's handler: the handler is busy with the
    /// current batch, so there is nothing to deliver to. Such calls fail with
    /// [`ErrorKind::InvalidState`](crate::ErrorKind::InvalidState).
    pub fn flush_sync(&self) -> Result<()> {
        if !self.started || self.state == StreamState::Invalidated || self.target.is_delivering_here() {
            return Err(Error::invalid_state(self.state));
        }
        self.service.flush_sync(&self.handle);
        Ok(())
    }

    /// Stops reporting events below the given directories.
    ///
    /// At most [`Capabilities::max_exclusion_paths`](crate::Capabilities) directories can be
    /// excluded; each call replaces the previous set.
    pub fn set_exclusion_directories<I, P>(&mut self, directories: I) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let directories: Vec<PathBuf> = directories
            .into_iter()
            .map(|d| d.as_ref().to_path_buf())
            .collect();
        let paths = path::encode_all(&directories)?;

        let limit = self.service.capabilities().max_exclusion_paths;
        let accepted = paths.len() <= limit
            && self.state != StreamState::Invalidated
            && self.service.set_exclusion_paths(&self.handle, &paths)?;
        if !accepted {
            return Err(Error::could_not_exclude_directories().set_paths(directories));
        }
        log::debug!("excluding {directories:?}");
        Ok(())
    }

    /// The id of the last event delivered to the handler.
    ///
    /// Before anything was delivered this is the configured `since_when`.
    pub fn latest_event_id(&self) -> EventId {
        let native = self.service.latest_event_id(&self.handle);
        let delivered = self.target.delivered();
        if native.is_now() {
            if delivered.is_zero() {
                native
            } else {
                delivered
            }
        } else {
            native.max(delivered)
        }
    }

    /// The most recent event id issued by the service, for any stream.
    pub fn current_event_id(&self) -> EventId {
        self.service.current_event_id()
    }

    /// The directories the stream watches, as the service reports them.
    pub fn directories(&self) -> Vec<PathBuf> {
        self.service
            .paths_being_watched(&self.handle)
            .iter()
            .map(|p| path::decode(p.as_bytes()))
            .collect()
    }

    /// Prints a description of the stream to the service's diagnostic output.
    pub fn show(&self) {
        log::debug!("{self:?}");
        self.service.show(&self.handle);
    }

    /// Tears the stream down: stops it, invalidates it if it is bound, and frees the native
    /// handle. Dropping the stream does the same.
    pub fn release(mut self) {
        self.teardown();
    }

    fn transition(&mut self, next: StreamState) {
        log::debug!("event stream {} -> {}", self.state, next);
        self.state = next;
    }

    fn teardown(&mut self) {
        if self.released {
            return;
        }
        if self.queue.is_some() {
            if let Err(err) = self.invalidate() {
                log::warn!("could not invalidate event stream: {err}");
            }
        }
        self.service.release(&self.handle);
        self.released = true;
        log::debug!("released event stream");
    }
}

impl<S: NativeService> Drop for EventStream<S> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<S: NativeService> fmt::Debug for EventStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("state", &self.state)
            .field("queue", &self.queue)
            .field("config", &self.config)
            .field("latest_event_id", &self.latest_event_id())
            .finish_non_exhaustive()
    }
}
