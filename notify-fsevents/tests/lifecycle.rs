use notify_fsevents::{
    ErrorKind, EventFlags, EventId, EventStream, FileSystemEvent, MemoryService, NativeService, SerialQueue, StreamConfig,
    StreamFlags, StreamState,
};
use pretty_assertions::assert_eq;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

mod utils;
use utils::*;

fn file_events() -> StreamConfig {
    StreamConfig::default().with_flags(StreamFlags::FILE_EVENTS)
}

fn running(
    service: &MemoryService,
    queue: &SerialQueue,
    dirs: &[&str],
    config: StreamConfig,
) -> (EventStream<MemoryService>, mpsc::Receiver<FileSystemEvent>) {
    let (tx, rx) = mpsc::channel::<FileSystemEvent>();
    let mut stream = EventStream::new(service.clone(), dirs.iter().copied(), config, tx).expect("stream");
    stream.schedule(queue).expect("schedule");
    stream.start().expect("start");
    (stream, rx)
}

#[test]
fn events_arrive_in_id_order_on_the_queue() {
    let service = MemoryService::new();
    let queue = SerialQueue::new("ordering").unwrap();
    let threads = Arc::new(Mutex::new(Vec::new()));

    let (tx, rx) = mpsc::channel::<FileSystemEvent>();
    let mut stream = EventStream::new(service.clone(), ["/repo"], file_events(), {
        let threads = threads.clone();
        move |event: FileSystemEvent| {
            threads.lock().unwrap().push(std::thread::current().name().map(str::to_owned));
            let _ = tx.send(event);
        }
    })
    .unwrap();
    stream.schedule(&queue).unwrap();
    stream.start().unwrap();

    let ids: Vec<EventId> = (0..20)
        .map(|i| service.record(format!("/repo/file{i}"), EventFlags::ITEM_CREATED | EventFlags::ITEM_IS_FILE))
        .collect();

    let received: Vec<EventId> = recv_events(&rx, ids.len()).into_iter().map(|e| e.id).collect();
    assert_eq!(received, ids);
    assert!(threads
        .lock()
        .unwrap()
        .iter()
        .all(|name| name.as_deref() == Some("ordering")));
    assert_eq!(stream.latest_event_id(), *ids.last().unwrap());
}

#[test]
fn stop_and_start_resume_without_gaps_or_repeats() {
    let service = MemoryService::new();
    let queue = SerialQueue::new("resume").unwrap();
    let (mut stream, rx) = running(&service, &queue, &["/repo"], file_events());

    let first = service.record("/repo/a", EventFlags::ITEM_CREATED);
    assert_eq!(recv_events(&rx, 1)[0].id, first);
    stream.flush_sync().unwrap();

    stream.stop();
    assert_eq!(stream.state(), StreamState::Stopped);
    let while_stopped = service.record("/repo/b", EventFlags::ITEM_MODIFIED);
    let elsewhere = service.record("/other/c", EventFlags::ITEM_MODIFIED);
    stream.start().unwrap();
    let after = service.record("/repo/d", EventFlags::ITEM_REMOVED);

    let ids: Vec<EventId> = recv_events(&rx, 2).into_iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![while_stopped, after]);
    assert!(elsewhere > first);
    assert_eq!(stream.latest_event_id(), after);
}

#[test]
fn history_replay_ends_with_history_done() {
    let service = MemoryService::new();
    let queue = SerialQueue::new("history").unwrap();
    let baseline = service.current_event_id();
    let created = service.record("/repo/new", EventFlags::ITEM_CREATED | EventFlags::ITEM_IS_FILE);
    service.record("/unrelated/x", EventFlags::ITEM_CREATED);

    let (stream, rx) = running(&service, &queue, &["/repo"], file_events().with_since_when(baseline));
    let events = recv_events(&rx, 2);

    assert_eq!(events.len(), 2);
    assert_eq!(events[0], FileSystemEvent::new("/repo/new", created, EventFlags::ITEM_CREATED | EventFlags::ITEM_IS_FILE));
    assert!(events[1].is_sentinel());
    assert_eq!(events[1].flags, EventFlags::HISTORY_DONE);
    assert_eq!(stream.latest_event_id(), created);
}

#[test]
fn excluded_directories_are_silent() {
    let service = MemoryService::new();
    let queue = SerialQueue::new("exclusions").unwrap();
    let (tx, rx) = mpsc::channel::<FileSystemEvent>();
    let mut stream = EventStream::new(service.clone(), ["/repo"], file_events(), tx).unwrap();
    stream.set_exclusion_directories(["/repo/target", "/repo/.git"]).unwrap();
    stream.schedule(&queue).unwrap();
    stream.start().unwrap();

    service.record("/repo/target/debug/build", EventFlags::ITEM_CREATED);
    service.record("/repo/.git/index", EventFlags::ITEM_MODIFIED);
    let kept = service.record("/repo/src/lib.rs", EventFlags::ITEM_MODIFIED);

    let events = recv_events(&rx, 1);
    assert_eq!(events[0].id, kept);
    stream.flush_sync().unwrap();
    assert!(rx.try_recv().is_err());
}

#[test]
fn too_many_exclusions_are_reported_with_paths() {
    let service = MemoryService::new();
    let (tx, _rx) = mpsc::channel::<FileSystemEvent>();
    let mut stream = EventStream::new(service, ["/repo"], file_events(), tx).unwrap();

    let dirs: Vec<PathBuf> = (0..9).map(|i| PathBuf::from(format!("/repo/{i}"))).collect();
    let err = stream.set_exclusion_directories(&dirs).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::CouldNotExcludeDirectories));
    assert_eq!(err.paths, dirs);
    assert_eq!(err.to_string(), format!("Could not exclude directories about {dirs:?}"));
}

#[test]
fn flush_async_then_flush_sync() {
    let service = MemoryService::new();
    let queue = SerialQueue::new("flush").unwrap();
    let (stream, rx) = running(
        &service,
        &queue,
        &["/repo"],
        file_events().with_latency(Duration::from_secs(60)),
    );

    assert_eq!(stream.flush_async(), EventId::ZERO);
    let id = service.record("/repo/a", EventFlags::ITEM_CREATED);
    assert_eq!(stream.flush_async(), id);
    stream.flush_sync().unwrap();
    assert_eq!(recv_events(&rx, 1)[0].id, id);
}

#[test]
fn directory_level_streams_report_directories() {
    let service = MemoryService::new();
    let queue = SerialQueue::new("dirs").unwrap();
    let (_stream, rx) = running(&service, &queue, &["/repo"], StreamConfig::default());

    let id = service.record("/repo/src/main.rs", EventFlags::ITEM_MODIFIED | EventFlags::ITEM_IS_FILE);
    assert_eq!(recv_events(&rx, 1), vec![FileSystemEvent::new("/repo/src", id, EventFlags::NONE)]);
}

#[test]
fn handler_may_see_own_events_marked() {
    let service = MemoryService::new();
    let queue = SerialQueue::new("own").unwrap();
    let (_stream, rx) = running(
        &service,
        &queue,
        &["/repo"],
        file_events().with_flags(StreamFlags::FILE_EVENTS | StreamFlags::MARK_SELF),
    );

    service.record("/repo/mine", EventFlags::ITEM_CREATED | EventFlags::OWN_EVENT);
    let event = recv_until(&rx, |e| e.path == PathBuf::from("/repo/mine"));
    assert!(event.flags.contains(EventFlags::OWN_EVENT));
}

#[test]
fn dropped_events_ask_for_a_rescan() {
    let service = MemoryService::new();
    let queue = SerialQueue::new("rescan").unwrap();
    let (_stream, rx) = running(&service, &queue, &["/repo"], file_events());

    service.record("/repo", EventFlags::MUST_SCAN_SUBDIRS | EventFlags::KERNEL_DROPPED);
    let event = recv_events(&rx, 1).remove(0);
    assert!(event.flags.must_rescan());
    assert!(event.flags.events_dropped());
}

#[test]
fn release_after_invalidate_and_drop_are_equivalent() {
    let service = MemoryService::new();
    let queue = SerialQueue::new("teardown").unwrap();

    let (mut explicit, _rx) = running(&service, &queue, &["/a"], StreamConfig::default());
    let (implicit, _rx2) = running(&service, &queue, &["/b"], StreamConfig::default());
    assert_eq!(service.running_streams(), 2);

    explicit.stop();
    explicit.invalidate().unwrap();
    explicit.release();
    drop(implicit);
    assert_eq!(service.running_streams(), 0);
}

#[test]
fn directories_round_trip() {
    let service = MemoryService::new();
    let (tx, _rx) = mpsc::channel::<FileSystemEvent>();
    let dirs = ["/Volumes/data/photos", "/Users/me/Library/Caches"];
    let stream = EventStream::new(service, dirs, StreamConfig::default(), tx).unwrap();
    let expected: Vec<PathBuf> = dirs.iter().map(PathBuf::from).collect();
    assert_eq!(stream.directories(), expected);
}

#[test]
fn without_sentinels_keeps_real_events() {
    let service = MemoryService::new();
    let queue = SerialQueue::new("sentinels").unwrap();
    let created = service.record("/repo/x", EventFlags::ITEM_CREATED);
    let (_stream, rx) = running(
        &service,
        &queue,
        &["/repo"],
        file_events().with_since_when(EventId::ZERO),
    );
    let events = without_sentinels(recv_events(&rx, 2));
    assert_eq!(events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![created]);
}

#[test]
fn concurrent_recording_loses_nothing() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 200;

    let service = MemoryService::new();
    let queue = SerialQueue::new("concurrent").unwrap();
    let (stream, rx) = running(&service, &queue, &["/w"], file_events());

    let writers: Vec<_> = (0..THREADS)
        .map(|t| {
            let service = service.clone();
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    service.record(format!("/w/{t}/{i}"), EventFlags::ITEM_CREATED);
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    stream.flush_sync().unwrap();
    queue.sync(|| ());

    let ids: Vec<u64> = rx.try_iter().map(|e| e.id.raw()).collect();
    assert_eq!(ids.len(), THREADS * PER_THREAD, "events recorded concurrently went missing");
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids delivered out of order");
    assert_eq!(stream.latest_event_id(), service.current_event_id());
}

#[test]
fn drop_waits_for_a_handler_in_flight() {
    let service = MemoryService::new();
    let queue = SerialQueue::new("in-flight").unwrap();
    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut stream = EventStream::new(service.clone(), ["/repo"], file_events(), {
        let order = order.clone();
        move |_event: FileSystemEvent| {
            let _ = entered_tx.send(());
            let _ = resume_rx.recv_timeout(TIMEOUT);
            order.lock().unwrap().push("handler returned");
        }
    })
    .unwrap();
    stream.schedule(&queue).unwrap();
    stream.start().unwrap();

    service.record("/repo/a", EventFlags::ITEM_CREATED);
    entered_rx.recv_timeout(TIMEOUT).expect("handler entered");

    let dropper = thread::spawn({
        let order = order.clone();
        move || {
            drop(stream);
            order.lock().unwrap().push("stream dropped");
        }
    });
    thread::sleep(Duration::from_millis(100));
    assert!(!dropper.is_finished(), "stream freed while its handler was running");

    resume_tx.send(()).unwrap();
    dropper.join().unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["handler returned", "stream dropped"]);
}
