#![forbid(unsafe_code)]

use crate::domain::{VmId, VmStatus};
use crate::error::Error;
use crate::notifier::VmStatusListener;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use tracing::{error, warn};

struct Event {
    status: VmStatus,
    vm_id: VmId,
    pid: u32,
}

/// Events that did not fit into the channel, oldest first. Everything in
/// here is newer than everything still in the channel.
#[derive(Default)]
struct Overflow {
    events: VecDeque<Event>,
}

impl Overflow {
    /// Queue `event`, cancelling it against a START for the same VM that
    /// has not been delivered yet.
    fn push(&mut self, event: Event) {
        if event.status == VmStatus::Stopped {
            let pending_start = self.events.iter().rposition(|queued| {
                queued.pid == event.pid
                    && queued.vm_id == event.vm_id
                    && queued.status != VmStatus::Stopped
            });
            if let Some(index) = pending_start {
                self.events.remove(index);
                return;
            }
        }
        self.events.push_back(event);
    }
}

/// Hands events to a wrapped listener on its own worker thread.
///
/// Delivery never blocks the caller and never loses an event: once the
/// channel is full, events spill into an unbounded overflow that the worker
/// drains in order. The worker exits once the listener is dropped and every
/// queued event has been delivered.
pub struct QueuedListener {
    name: String,
    tx: flume::Sender<Event>,
    overflow: Arc<Mutex<Overflow>>,
    spilled: Arc<AtomicU64>,
}

impl QueuedListener {
    pub fn spawn(
        name: impl Into<String>,
        inner: Arc<dyn VmStatusListener>,
        capacity: usize,
    ) -> Result<Self, Error> {
        let name = name.into();
        let (tx, rx) = flume::bounded::<Event>(capacity.max(1));
        let overflow = Arc::new(Mutex::new(Overflow::default()));
        let worker_overflow = Arc::clone(&overflow);
        let worker_name = name.clone();
        thread::Builder::new()
            .name(format!("vm-listener-{name}"))
            .spawn(move || {
                while let Some(event) = next_event(&rx, &worker_overflow) {
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        inner.vm_status_changed(event.status, &event.vm_id, event.pid)
                    }));
                    if outcome.is_err() {
                        warn!(listener = %worker_name, status = %event.status, pid = event.pid, "queued listener panicked");
                    }
                }
            })
            .map_err(Error::Spawn)?;
        Ok(Self {
            name,
            tx,
            overflow,
            spilled: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Events that had to wait in the overflow because the channel was full.
    pub fn spilled(&self) -> u64 {
        self.spilled.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.tx.len() + self.overflow.lock().events.len()
    }
}

/// Next event in arrival order, or `None` once the sender is gone and
/// nothing is left to deliver.
fn next_event(rx: &flume::Receiver<Event>, overflow: &Mutex<Overflow>) -> Option<Event> {
    {
        // Senders hold this lock while choosing between channel and overflow.
        let mut overflow = overflow.lock();
        match rx.try_recv() {
            Ok(event) => return Some(event),
            Err(flume::TryRecvError::Empty) => {
                if let Some(event) = overflow.events.pop_front() {
                    return Some(event);
                }
            }
            Err(flume::TryRecvError::Disconnected) => return overflow.events.pop_front(),
        }
    }
    rx.recv().ok()
}

impl VmStatusListener for QueuedListener {
    fn vm_status_changed(&self, status: VmStatus, vm_id: &VmId, pid: u32) {
        let event = Event {
            status,
            vm_id: vm_id.clone(),
            pid,
        };
        let mut overflow = self.overflow.lock();
        let event = if overflow.events.is_empty() {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(flume::TrySendError::Full(event)) => {
                    error!(
                        listener = %self.name,
                        status = %event.status,
                        pid = event.pid,
                        vm_id = %event.vm_id,
                        "listener queue full; spilling events until the worker catches up"
                    );
                    event
                }
                Err(flume::TrySendError::Disconnected(event)) => {
                    error!(listener = %self.name, status = %event.status, pid = event.pid, "listener worker is gone; event lost");
                    return;
                }
            }
        } else {
            event
        };
        self.spilled.fetch_add(1, Ordering::Relaxed);
        overflow.push(event);
    }
}
