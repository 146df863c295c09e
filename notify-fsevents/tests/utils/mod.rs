#![allow(dead_code)]

use notify_fsevents::{EventFlags, FileSystemEvent};
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Receives until `count` events arrived or the timeout passed.
pub fn recv_events(rx: &Receiver<FileSystemEvent>, count: usize) -> Vec<FileSystemEvent> {
    let deadline = Instant::now() + TIMEOUT;
    let mut events = Vec::new();
    while events.len() < count {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left) {
            Ok(event) => events.push(event),
            Err(_) => break,
        }
    }
    events
}

/// Receives events until one matches `pred`, failing after the timeout.
pub fn recv_until(rx: &Receiver<FileSystemEvent>, pred: impl Fn(&FileSystemEvent) -> bool) -> FileSystemEvent {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let event = rx.recv_timeout(left).expect("did not receive expected event");
        if pred(&event) {
            return event;
        }
    }
}

pub fn without_sentinels(events: Vec<FileSystemEvent>) -> Vec<FileSystemEvent> {
    events
        .into_iter()
        .filter(|e| !e.flags.contains(EventFlags::HISTORY_DONE))
        .collect()
}
