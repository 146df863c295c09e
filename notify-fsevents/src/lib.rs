//! Host-wide file system event streams, after Darwin's FSEvents.
//!
//! An [`EventStream`] watches a set of directory trees and hands [`FileSystemEvent`]s to an
//! [`EventHandler`], in batches, on the execution context it is scheduled on. Each event carries
//! the affected path, a host-wide monotonically increasing [`EventId`] and [`EventFlags`]
//! describing what happened.
//!
//! The stream sits on top of a [`NativeService`]:
//!
//! - [`fsevent::CoreServices`] on macOS, scheduled on a [`fsevent::RunLoop`],
//! - [`MemoryService`] everywhere, scheduled on a [`SerialQueue`]. Changes are recorded into it
//!   by hand, which makes it the service to test handlers with.
//!
//! # Lifecycle
//!
//! A stream is created unbound, bound to an execution context, started, possibly stopped and
//! restarted, and finally invalidated and released. Dropping a stream releases it, stopping and
//! invalidating it first as needed. See [`StreamState`].
//!
//! # Examples
//!
//! ```
//! use notify_fsevents::{EventFlags, EventStream, FileSystemEvent, MemoryService, SerialQueue, StreamConfig, StreamFlags};
//! use std::sync::mpsc;
//! use std::time::Duration;
//!
//! fn main() -> notify_fsevents::Result<()> {
//!     let service = MemoryService::new();
//!     let queue = SerialQueue::new("events")?;
//!     let (tx, rx) = mpsc::channel::<FileSystemEvent>();
//!
//!     let config = StreamConfig::default().with_flags(StreamFlags::FILE_EVENTS);
//!     let mut stream = EventStream::new(service.clone(), ["/project"], config, tx)?;
//!     stream.schedule(&queue)?;
//!     stream.start()?;
//!
//!     let id = service.record("/project/Cargo.toml", EventFlags::ITEM_MODIFIED);
//!     let event = rx.recv_timeout(Duration::from_secs(5)).expect("an event");
//!     assert_eq!(event.id, id);
//!     assert_eq!(stream.latest_event_id(), id);
//!
//!     stream.release();
//!     Ok(())
//! }
//! ```

pub use capability::{Capabilities, MAX_EXCLUSION_PATHS};
pub use config::{StreamConfig, UnsupportedFlags};
pub use error::{Error, ErrorKind, Result};
pub use memory::{MemoryService, MemoryStream};
pub use native::{CallbackContext, CreateRequest, NativeService, RawCallback};
pub use notify_fsevents_types::{EventFlags, EventId, FileSystemEvent, ItemType, StreamFlags};
pub use queue::SerialQueue;
pub use stream::{EventStream, StreamState};

#[cfg(all(target_os = "macos", feature = "macos_fsevent"))]
pub mod fsevent;
pub mod memory;
pub mod native;
pub mod path;

mod capability;
mod config;
mod error;
mod queue;
mod stream;
mod trampoline;

/// An [`EventStream`] on the host's FSEvents service.
#[cfg(all(target_os = "macos", feature = "macos_fsevent"))]
pub type FsEventStream = EventStream<fsevent::CoreServices>;

/// The set of requirements for stream event handling functions.
///
/// Handlers run on the execution context of their stream, one event at a time.
///
/// # Example implementation
///
/// ```no_run
/// use notify_fsevents::{EventHandler, FileSystemEvent};
///
/// /// Prints received events
/// struct EventPrinter;
///
/// impl EventHandler for EventPrinter {
///     fn handle_event(&mut self, event: FileSystemEvent) {
///         println!("Event: {event}");
///     }
/// }
/// ```
pub trait EventHandler: Send + 'static {
    /// Handles an event.
    fn handle_event(&mut self, event: FileSystemEvent);
}

impl<F> EventHandler for F
where
    F: FnMut(FileSystemEvent) + Send + 'static,
{
    fn handle_event(&mut self, event: FileSystemEvent) {
        (self)(event);
    }
}

impl EventHandler for crossbeam_channel::Sender<FileSystemEvent> {
    fn handle_event(&mut self, event: FileSystemEvent) {
        let _ = self.send(event);
    }
}

#[cfg(feature = "futures")]
impl EventHandler for futures::channel::mpsc::UnboundedSender<FileSystemEvent> {
    fn handle_event(&mut self, event: FileSystemEvent) {
        let _ = self.unbounded_send(event);
    }
}

#[cfg(feature = "tokio")]
impl EventHandler for tokio::sync::mpsc::UnboundedSender<FileSystemEvent> {
    fn handle_event(&mut self, event: FileSystemEvent) {
        let _ = self.send(event);
    }
}

impl EventHandler for std::sync::mpsc::Sender<FileSystemEvent> {
    fn handle_event(&mut self, event: FileSystemEvent) {
        let _ = self.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_object_safe() {
        let _handler: Box<dyn EventHandler> = Box::new(|_event: FileSystemEvent| {});
    }

    #[test]
    fn test_debug_impl() {
        macro_rules! assert_debug_impl {
            ($t:ty) => {{
                #[allow(dead_code)]
                trait NeedsDebug: std::fmt::Debug {}
                impl NeedsDebug for $t {}
            }};
        }

        assert_debug_impl!(Capabilities);
        assert_debug_impl!(Error);
        assert_debug_impl!(ErrorKind);
        assert_debug_impl!(EventStream<MemoryService>);
        assert_debug_impl!(MemoryService);
        assert_debug_impl!(MemoryStream);
        assert_debug_impl!(SerialQueue);
        assert_debug_impl!(StreamConfig);
        assert_debug_impl!(StreamState);
        assert_debug_impl!(UnsupportedFlags);
    }

    #[test]
    fn crossbeam_sender_is_a_handler() {
        let (tx, rx) = crossbeam_channel::unbounded::<FileSystemEvent>();
        let service = MemoryService::new();
        let queue = SerialQueue::new("crossbeam").unwrap();
        let mut stream = EventStream::new(
            service.clone(),
            ["/w"],
            StreamConfig::default().with_flags(StreamFlags::FILE_EVENTS),
            tx,
        )
        .unwrap();
        stream.schedule(&queue).unwrap();
        stream.start().unwrap();

        let id = service.record("/w/a", EventFlags::ITEM_CREATED);
        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event, FileSystemEvent::new("/w/a", id, EventFlags::ITEM_CREATED));
    }

    #[cfg(feature = "tokio")]
    #[tokio::test]
    async fn tokio_sender_is_a_handler() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<FileSystemEvent>();
        let service = MemoryService::new();
        let queue = SerialQueue::new("tokio").unwrap();
        let mut stream = EventStream::new(service.clone(), ["/w"], StreamConfig::default(), tx).unwrap();
        stream.schedule(&queue).unwrap();
        stream.start().unwrap();

        service.record("/w/a", EventFlags::ITEM_CREATED);
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.path, std::path::PathBuf::from("/w"));
    }
}
