//! Shared arena owned by the supervisor and borrowed by every rider.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::error;

use crate::config::{SimConfig, Timings};
use crate::locks::VehiclePool;
use crate::order_queue::OrderQueue;
use crate::types::OrderId;

/// Counts outcomes across riders; optionally remembers every delivered id.
pub struct DeliveryLedger {
    delivered: AtomicUsize,
    abandoned: AtomicUsize,
    seen: Option<Mutex<HashSet<OrderId>>>,
    double_delivery: AtomicBool,
}

impl DeliveryLedger {
    pub fn new(track_ids: bool) -> Self {
        Self {
            delivered: AtomicUsize::new(0),
            abandoned: AtomicUsize::new(0),
            seen: track_ids.then(|| Mutex::new(HashSet::new())),
            double_delivery: AtomicBool::new(false),
        }
    }

    pub fn record_delivery(&self, order: OrderId) {
        self.delivered.fetch_add(1, Ordering::SeqCst);
        if let Some(seen) = self.seen.as_ref() {
            let mut guard = seen.lock().unwrap_or_else(PoisonError::into_inner);
            if !guard.insert(order) {
                error!(order, "order delivered twice");
                self.double_delivery.store(true, Ordering::SeqCst);
            }
        }
    }

    pub fn record_abandon(&self) {
        self.abandoned.fetch_add(1, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    pub fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }

    pub fn double_delivery(&self) -> bool {
        self.double_delivery.load(Ordering::SeqCst)
    }
}

/// Everything the riders and the dispatcher share: order slots, vehicles,
/// timings and the cooperative shutdown flag.
pub struct DispatchContext {
    pub queue: OrderQueue,
    pub vehicles: VehiclePool,
    pub timings: Timings,
    pub ledger: DeliveryLedger,
    shutdown: AtomicBool,
    failed: AtomicBool,
}

impl DispatchContext {
    pub fn new(config: &SimConfig) -> Self {
        Self {
            queue: OrderQueue::new(config.capacity),
            vehicles: VehiclePool::new(config.restaurants),
            timings: config.timings,
            ledger: DeliveryLedger::new(config.validate),
            shutdown: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// A rider hit a fatal fault; everyone stops.
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
        self.request_shutdown();
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}
