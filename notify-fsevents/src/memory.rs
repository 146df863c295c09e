//! An in-process notification service.
//!
//! `MemoryService` implements the same contract as CoreServices without watching anything: changes
//! are reported to it with [`MemoryService::record`], which hands out the next host-wide event id
//! and keeps the change in a history journal. Streams created on it replay that history, coalesce
//! with their latency, honour their flags and exclusions, and deliver batches through the native
//! callback on a [`SerialQueue`].
//!
//! It is what the crate's own tests run against, and lets consumers test their handlers on hosts
//! without FSEvents.

use crate::capability::{Capabilities, MAX_EXCLUSION_PATHS};
use crate::native::{CallbackContext, CreateRequest, NativeService};
use crate::path;
use crate::queue::SerialQueue;
use crate::Result;
use notify_fsevents_types::{EventFlags, EventId, StreamFlags};
use std::ffi::{c_char, CString};
use std::fmt;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

/// In-process [`NativeService`]. Clones share the same journal.
#[derive(Clone, Default)]
pub struct MemoryService {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    journal: Mutex<Journal>,
    capabilities: Capabilities,
    stream_limit: Option<usize>,
    running: AtomicUsize,
}

#[derive(Default)]
struct Journal {
    last_id: u64,
    history: Vec<Record>,
    streams: Vec<Weak<Cell>>,
}

#[derive(Clone, Debug)]
struct Record {
    path: PathBuf,
    flags: EventFlags,
    id: EventId,
}

/// Handle to a stream of a [`MemoryService`].
pub struct MemoryStream {
    cell: Arc<Cell>,
}

struct Cell {
    paths: Vec<CString>,
    watched: Vec<PathBuf>,
    since_when: EventId,
    latency: Duration,
    flags: StreamFlags,
    context: CallbackContext,
    state: Mutex<CellState>,
}

struct CellState {
    queue: Option<SerialQueue>,
    running: bool,
    started: bool,
    invalidated: bool,
    released: bool,
    /// Highest id handed to the callback, or the start cursor.
    latest: EventId,
    /// Highest id queued for delivery or skipped, used to drop duplicates.
    queued_through: u64,
    pending: Vec<Record>,
    delivery_scheduled: bool,
    last_delivery: Option<Instant>,
    /// Bumped whenever queued delivery jobs become stale.
    generation: u64,
    exclusions: Vec<PathBuf>,
}

impl MemoryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// A service that only accepts the given flags, like an older host would.
    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        MemoryService {
            shared: Arc::new(Shared {
                capabilities,
                ..Shared::default()
            }),
        }
    }

    /// A service that refuses to start more than `limit` streams at a time.
    pub fn with_stream_limit(limit: usize) -> Self {
        MemoryService {
            shared: Arc::new(Shared {
                stream_limit: Some(limit),
                ..Shared::default()
            }),
        }
    }

    /// Records a change at `path` and returns its id.
    ///
    /// `flags` describe the change at file level; directory-level streams report the containing
    /// directory with the `ITEM_*` bits removed. Include [`EventFlags::OWN_EVENT`] to mark the
    /// change as caused by the current process.
    pub fn record(&self, path: impl AsRef<Path>, flags: EventFlags) -> EventId {
        let mut journal = lock(&self.shared.journal);
        journal.last_id += 1;
        let record = Record {
            path: path.as_ref().to_path_buf(),
            flags,
            id: EventId::from_raw(journal.last_id),
        };
        journal.history.push(record.clone());
        journal.streams.retain(|cell| cell.strong_count() > 0);
        let streams: Vec<Arc<Cell>> = journal.streams.iter().filter_map(Weak::upgrade).collect();

        // Offered under the journal lock so that streams see ids in order.
        for cell in &streams {
            cell.offer(&record);
        }
        drop(journal);
        record.id
    }

    /// Number of streams currently started.
    pub fn running_streams(&self) -> usize {
        self.shared.running.load(Ordering::Acquire)
    }
}

impl fmt::Debug for MemoryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryService")
            .field("current_event_id", &self.current_event_id())
            .field("capabilities", &self.shared.capabilities)
            .field("stream_limit", &self.shared.stream_limit)
            .finish()
    }
}

impl fmt::Debug for MemoryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.cell.state);
        f.debug_struct("MemoryStream")
            .field("paths", &self.cell.watched)
            .field("since_when", &self.cell.since_when)
            .field("latency", &self.cell.latency)
            .field("flags", &self.cell.flags)
            .field("queue", &state.queue)
            .field("running", &state.running)
            .field("latest", &state.latest)
            .field("exclusions", &state.exclusions)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("lock not to be poisoned")
}

impl Cell {
    /// Rewrites a journal record the way this stream reports it, or drops it.
    fn translate(&self, record: &Record, exclusions: &[PathBuf]) -> Option<Record> {
        if !self.watched.iter().any(|root| record.path.starts_with(root)) {
            return None;
        }
        if exclusions.iter().any(|excluded| record.path.starts_with(excluded)) {
            return None;
        }

        let mut flags = record.flags;
        if flags.contains(EventFlags::OWN_EVENT) {
            if self.flags.contains(StreamFlags::IGNORE_SELF) {
                return None;
            }
            if !self.flags.contains(StreamFlags::MARK_SELF) {
                flags.remove(EventFlags::OWN_EVENT);
            }
        }

        let mut path = record.path.clone();
        if !self.flags.contains(StreamFlags::FILE_EVENTS) {
            let is_root = self.watched.iter().any(|root| *root == path);
            if flags.intersects(EventFlags::ITEM_MASK) && !is_root {
                if let Some(parent) = path.parent() {
                    path = parent.to_path_buf();
                }
            }
            flags.remove(EventFlags::ITEM_MASK);
        }

        Some(Record {
            path,
            flags,
            id: record.id,
        })
    }

    fn offer(self: &Arc<Self>, record: &Record) {
        let mut state = lock(&self.state);
        if !state.running || state.invalidated || record.id.raw() <= state.queued_through {
            return;
        }
        state.queued_through = record.id.raw();
        if let Some(event) = self.translate(record, &state.exclusions) {
            state.pending.push(event);
            self.schedule_delivery(&mut state);
        }
    }

    fn schedule_delivery(self: &Arc<Self>, state: &mut CellState) {
        if state.delivery_scheduled || state.pending.is_empty() || !state.running {
            return;
        }
        let Some(queue) = state.queue.clone() else {
            return;
        };

        let idle = state
            .last_delivery
            .map_or(true, |at| at.elapsed() >= self.latency);
        let delay = if self.flags.contains(StreamFlags::NO_DEFER) && idle {
            Duration::ZERO
        } else {
            self.latency
        };

        state.delivery_scheduled = true;
        let generation = state.generation;
        let cell = Arc::clone(self);
        queue.execute_after(delay, move || cell.deliver(generation));
    }

    fn deliver(&self, generation: u64) {
        let batch = {
            let mut state = lock(&self.state);
            if state.generation != generation {
                return;
            }
            state.delivery_scheduled = false;
            if !state.running || state.invalidated || state.pending.is_empty() {
                return;
            }
            let batch = mem::take(&mut state.pending);
            if let Some(max) = batch.iter().map(|r| r.id).filter(|id| !id.is_zero()).max() {
                state.latest = state.latest.max(max);
            }
            state.last_delivery = Some(Instant::now());
            batch
        };

        let mut paths = Vec::with_capacity(batch.len());
        let mut flags = Vec::with_capacity(batch.len());
        let mut ids = Vec::with_capacity(batch.len());
        for record in &batch {
            match path::encode(&record.path) {
                Ok(encoded) => {
                    paths.push(encoded);
                    flags.push(record.flags.bits());
                    ids.push(record.id.raw());
                }
                Err(err) => log::warn!("dropping event {}: {err}", record.id),
            }
        }
        let path_ptrs: Vec<*const c_char> = paths.iter().map(|p| p.as_ptr()).collect();

        // Safety: the stream owning `info` invalidates this handle before freeing it, and
        // invalidation waits for the delivery in flight on this queue.
        unsafe {
            (self.context.callback)(
                self.context.info,
                path_ptrs.len(),
                path_ptrs.as_ptr(),
                flags.as_ptr(),
                ids.as_ptr(),
            )
        }
    }

    /// Marks the stream stopped and returns whether it was running.
    fn halt(&self, state: &mut CellState) -> bool {
        let was_running = state.running;
        state.running = false;
        state.pending.clear();
        state.delivery_scheduled = false;
        state.generation += 1;
        was_running
    }
}

/// Waits for a job that may be delivering on `queue` right now.
fn drain(queue: &SerialQueue) {
    if !queue.is_current() {
        queue.sync(|| ());
    }
}

impl NativeService for MemoryService {
    type Handle = MemoryStream;
    type Queue = SerialQueue;

    fn capabilities(&self) -> Capabilities {
        self.shared.capabilities
    }

    fn create(&self, request: &CreateRequest<'_>, context: CallbackContext) -> Result<Option<MemoryStream>> {
        let cell = Arc::new(Cell {
            paths: request.paths.to_vec(),
            watched: request.paths.iter().map(|p| path::decode(p.as_bytes())).collect(),
            since_when: request.since_when,
            latency: request.latency,
            flags: request.flags,
            context,
            state: Mutex::new(CellState {
                queue: None,
                running: false,
                started: false,
                invalidated: false,
                released: false,
                latest: request.since_when,
                queued_through: 0,
                pending: Vec::new(),
                delivery_scheduled: false,
                last_delivery: None,
                generation: 0,
                exclusions: Vec::new(),
            }),
        });
        lock(&self.shared.journal).streams.push(Arc::downgrade(&cell));
        Ok(Some(MemoryStream { cell }))
    }

    fn release(&self, handle: &MemoryStream) {
        let mut state = lock(&handle.cell.state);
        debug_assert!(!state.released, "memory stream released twice");
        if handle.cell.halt(&mut state) {
            self.shared.running.fetch_sub(1, Ordering::AcqRel);
        }
        state.invalidated = true;
        state.released = true;
        state.queue = None;
    }

    fn set_queue(&self, handle: &MemoryStream, previous: Option<&SerialQueue>, next: Option<&SerialQueue>) {
        {
            let mut state = lock(&handle.cell.state);
            state.queue = next.cloned();
            state.generation += 1;
            state.delivery_scheduled = false;
            handle.cell.schedule_delivery(&mut state);
        }
        if let Some(previous) = previous {
            drain(previous);
        }
    }

    fn start(&self, handle: &MemoryStream) -> bool {
        let cell = &handle.cell;
        let journal = lock(&self.shared.journal);
        let mut state = lock(&cell.state);
        if state.invalidated || state.queue.is_none() {
            return false;
        }
        if state.running {
            return true;
        }
        if let Some(limit) = self.shared.stream_limit {
            if self.shared.running.load(Ordering::Acquire) >= limit {
                return false;
            }
        }

        let first = !state.started;
        let cursor = if first { cell.since_when } else { state.latest };
        if cursor.is_now() {
            state.queued_through = journal.last_id;
            state.latest = EventId::from_raw(journal.last_id);
        } else {
            state.queued_through = cursor.raw();
            for record in journal.history.iter().filter(|r| r.id > cursor) {
                state.queued_through = record.id.raw();
                if let Some(event) = cell.translate(record, &state.exclusions) {
                    state.pending.push(event);
                }
            }
            if let (true, Some(root)) = (first, cell.watched.first()) {
                state.pending.push(Record {
                    path: root.clone(),
                    flags: EventFlags::HISTORY_DONE,
                    id: EventId::ZERO,
                });
            }
        }
        drop(journal);

        state.running = true;
        state.started = true;
        self.shared.running.fetch_add(1, Ordering::AcqRel);
        cell.schedule_delivery(&mut state);
        true
    }

    fn stop(&self, handle: &MemoryStream) {
        let mut state = lock(&handle.cell.state);
        if handle.cell.halt(&mut state) {
            self.shared.running.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn invalidate(&self, handle: &MemoryStream) {
        let queue = {
            let mut state = lock(&handle.cell.state);
            if handle.cell.halt(&mut state) {
                self.shared.running.fetch_sub(1, Ordering::AcqRel);
            }
            state.invalidated = true;
            state.queue.take()
        };
        if let Some(queue) = queue {
            drain(&queue);
        }
    }

    fn flush_async(&self, handle: &MemoryStream) -> EventId {
        let cell = &handle.cell;
        let mut state = lock(&cell.state);
        let highest = state
            .pending
            .iter()
            .map(|r| r.id)
            .max()
            .unwrap_or(EventId::ZERO);
        if state.running && !state.pending.is_empty() {
            if let Some(queue) = state.queue.clone() {
                state.delivery_scheduled = true;
                let generation = state.generation;
                let cell = Arc::clone(cell);
                queue.execute(move || cell.deliver(generation));
            }
        }
        highest
    }

    fn flush_sync(&self, handle: &MemoryStream) {
        let (queue, generation) = {
            let state = lock(&handle.cell.state);
            (state.queue.clone(), state.generation)
        };
        if let Some(queue) = queue {
            let cell = Arc::clone(&handle.cell);
            queue.sync(move || cell.deliver(generation));
        }
    }

    fn set_exclusion_paths(&self, handle: &MemoryStream, paths: &[CString]) -> Result<bool> {
        let mut state = lock(&handle.cell.state);
        if paths.len() > MAX_EXCLUSION_PATHS || state.invalidated {
            return Ok(false);
        }
        state.exclusions = paths.iter().map(|p| path::decode(p.as_bytes())).collect();
        Ok(true)
    }

    fn latest_event_id(&self, handle: &MemoryStream) -> EventId {
        lock(&handle.cell.state).latest
    }

    fn paths_being_watched(&self, handle: &MemoryStream) -> Vec<CString> {
        handle.cell.paths.clone()
    }

    fn current_event_id(&self) -> EventId {
        EventId::from_raw(lock(&self.shared.journal).last_id)
    }

    fn show(&self, handle: &MemoryStream) {
        log::info!("{handle:?}");
    }
}
