//! Ordered delivery callback dispatch
//!
//! Every published record registers a callback under its (topic, key) lane
//! and sequence number. Outcomes may arrive in any order (batches for
//! different partitions complete independently, retried batches complete
//! late), but a lane only fires the callback for its oldest pending sequence,
//! and only once that sequence's outcome is known.
//!
//! Registration and completion events flow through one channel into a single
//! dispatcher task, so callbacks for a lane never run concurrently.

use crate::record::{DeliveryCallback, DeliveryOutcome, DeliveryReport, LaneKey, Record};
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

// ============================================================================
// Lane bookkeeping
// ============================================================================

#[derive(Default)]
struct Slot {
    callback: Option<DeliveryCallback>,
    report: Option<DeliveryReport>,
}

#[derive(Default)]
struct Lane {
    /// Next sequence allowed to fire
    next: u64,
    pending: BTreeMap<u64, Slot>,
}

impl Lane {
    fn drain_ready(&mut self) -> Vec<(DeliveryCallback, DeliveryReport)> {
        let mut ready = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            let slot = entry.get();
            if *entry.key() != self.next || slot.callback.is_none() || slot.report.is_none() {
                break;
            }
            let slot = entry.remove();
            if let (Some(callback), Some(report)) = (slot.callback, slot.report) {
                ready.push((callback, report));
            }
            self.next += 1;
        }
        ready
    }
}

/// Per-lane ordering state, independent of the task that drives it
#[derive(Default)]
pub(crate) struct DispatchLanes {
    lanes: HashMap<LaneKey, Lane>,
}

impl DispatchLanes {
    /// Register a callback; returns callbacks that became ready, in order
    pub(crate) fn register(
        &mut self,
        key: LaneKey,
        sequence: u64,
        callback: DeliveryCallback,
    ) -> Vec<(DeliveryCallback, DeliveryReport)> {
        let lane = self.lanes.entry(key).or_default();
        lane.pending.entry(sequence).or_default().callback = Some(callback);
        lane.drain_ready()
    }

    /// Record an outcome; returns callbacks that became ready, in order
    pub(crate) fn complete(
        &mut self,
        report: DeliveryReport,
    ) -> Vec<(DeliveryCallback, DeliveryReport)> {
        let lane = self.lanes.entry(report.lane()).or_default();
        let slot = lane.pending.entry(report.sequence).or_default();
        if slot.report.is_some() {
            warn!(
                "Duplicate outcome for {}/seq {} ignored",
                report.topic, report.sequence
            );
            return Vec::new();
        }
        slot.report = Some(report);
        lane.drain_ready()
    }

    /// Number of registered messages whose callback has not fired yet
    pub(crate) fn outstanding(&self) -> usize {
        self.lanes.values().map(|l| l.pending.len()).sum()
    }
}

// ============================================================================
// Dispatcher task
// ============================================================================

pub(crate) enum DispatchEvent {
    Register {
        lane: LaneKey,
        sequence: u64,
        callback: DeliveryCallback,
    },
    Complete(DeliveryReport),
    Shutdown,
}

/// Count of registered-but-unreported messages, for flush and close
#[derive(Default)]
pub(crate) struct PendingTracker {
    pending: AtomicU64,
    idle: Notify,
}

impl PendingTracker {
    pub(crate) fn count(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Resolves once no message is pending
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn add(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    fn done(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Cloneable sender side of the dispatcher
#[derive(Clone)]
pub(crate) struct DispatcherHandle {
    tx: mpsc::UnboundedSender<DispatchEvent>,
    pending: Arc<PendingTracker>,
}

impl DispatcherHandle {
    pub(crate) fn register(&self, lane: LaneKey, sequence: u64, callback: DeliveryCallback) {
        self.pending.add();
        if self
            .tx
            .send(DispatchEvent::Register {
                lane,
                sequence,
                callback,
            })
            .is_err()
        {
            self.pending.done();
            warn!("Dispatcher stopped; callback for seq {} dropped", sequence);
        }
    }

    pub(crate) fn complete(&self, record: Record, sequence: u64, outcome: DeliveryOutcome) {
        let report = DeliveryReport::new(record, sequence, outcome);
        if self.tx.send(DispatchEvent::Complete(report)).is_err() {
            warn!("Dispatcher stopped; outcome for seq {} dropped", sequence);
        }
    }

    pub(crate) fn pending(&self) -> &Arc<PendingTracker> {
        &self.pending
    }

    /// Ask the task to exit once every event queued before this one is handled
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(DispatchEvent::Shutdown);
    }
}

/// Create the dispatcher channel without starting the task
pub(crate) fn channel() -> (DispatcherHandle, mpsc::UnboundedReceiver<DispatchEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = DispatcherHandle {
        tx,
        pending: Arc::new(PendingTracker::default()),
    };
    (handle, rx)
}

/// Create the dispatcher and spawn its task
pub(crate) fn spawn() -> (DispatcherHandle, JoinHandle<()>) {
    let (handle, rx) = channel();
    let pending = Arc::clone(&handle.pending);
    let task = tokio::spawn(dispatch_loop(rx, pending));
    (handle, task)
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<DispatchEvent>,
    pending: Arc<PendingTracker>,
) {
    let mut lanes = DispatchLanes::default();

    while let Some(event) = rx.recv().await {
        let ready = match event {
            DispatchEvent::Register {
                lane,
                sequence,
                callback,
            } => lanes.register(lane, sequence, callback),
            DispatchEvent::Complete(report) => lanes.complete(report),
            DispatchEvent::Shutdown => break,
        };

        for (callback, report) in ready {
            let (topic, sequence) = (report.topic.clone(), report.sequence);
            if catch_unwind(AssertUnwindSafe(|| callback(report))).is_err() {
                warn!("Delivery callback for {}/seq {} panicked", topic, sequence);
            }
            pending.done();
        }
    }

    let outstanding = lanes.outstanding();
    if outstanding > 0 {
        warn!("Dispatcher exiting with {} unreported messages", outstanding);
    } else {
        debug!("Dispatcher drained");
    }
}
