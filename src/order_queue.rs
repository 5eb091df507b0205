//! Fixed-capacity circular order queue shared by the dispatcher and riders.
//!
//! `head` and `tail` grow without bound and are read modulo the capacity.
//! Slots in `[head, tail)` form the live window riders may claim from. Only
//! the dispatcher writes either cursor; riders read them as relaxed hints,
//! and the per-slot lock stays the authority on who owns an order.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use rand::Rng;
use tracing::debug;

use crate::error::{DispatchError, Result};
use crate::locks::{Resource, ResourceLock};
use crate::types::{OrderRecord, OrderState, SlotIndex};

pub struct OrderSlot {
    record: AtomicU64,
    lock: ResourceLock,
}

impl OrderSlot {
    fn new(slot: SlotIndex) -> Self {
        Self {
            record: AtomicU64::new(OrderRecord::EMPTY.pack()),
            lock: ResourceLock::new(Resource::Order(slot)),
        }
    }

    /// Unsynchronized view of the slot; may be stale by the time it is used.
    pub fn record(&self) -> OrderRecord {
        OrderRecord::unpack(self.record.load(Ordering::Acquire))
    }

    pub fn lock(&self) -> &ResourceLock {
        &self.lock
    }
}

/// An order a rider found waiting during the admission scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub slot: SlotIndex,
    pub order: OrderRecord,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched { slot: SlotIndex, order: OrderRecord },
    /// The tail slot still holds an order in flight.
    Backpressure { slot: SlotIndex, occupant: OrderRecord },
}

pub struct OrderQueue {
    slots: Box<[OrderSlot]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl OrderQueue {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "capacity must be > 0");
        Self {
            slots: (0..capacity).map(OrderSlot::new).collect(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn head(&self) -> usize {
        self.head.load(Ordering::Relaxed)
    }

    pub fn tail(&self) -> usize {
        self.tail.load(Ordering::Relaxed)
    }

    pub fn slot(&self, slot: SlotIndex) -> &OrderSlot {
        &self.slots[slot]
    }

    pub fn slots(&self) -> &[OrderSlot] {
        &self.slots
    }

    pub fn record(&self, slot: SlotIndex) -> OrderRecord {
        self.slots[slot].record()
    }

    /// Insert a new order at the tail.
    ///
    /// Must only be called from the single producer thread: the cursors have
    /// no writer-side exclusion. `make_order` runs only when the tail slot is
    /// free, so a rejected attempt consumes nothing.
    pub fn dispatch(&self, make_order: impl FnOnce() -> OrderRecord) -> DispatchOutcome {
        let capacity = self.capacity();
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);

        // Catch up by at most one delivered slot per call.
        if head < tail && self.record(head % capacity).state == OrderState::Delivered {
            self.head.store(head + 1, Ordering::Relaxed);
        }

        let slot = tail % capacity;
        let occupant = self.record(slot);
        if !occupant.state.is_free() {
            debug!(slot, order = occupant.id, state = %occupant.state, "dispatch waiting on queue position");
            return DispatchOutcome::Backpressure { slot, occupant };
        }

        let order = make_order();
        debug_assert_eq!(order.state, OrderState::Placed);
        self.slots[slot].record.store(order.pack(), Ordering::Release);
        self.tail.store(tail + 1, Ordering::Relaxed);
        DispatchOutcome::Dispatched { slot, order }
    }

    /// Randomized search of the live window for an order still `Placed`.
    ///
    /// Starts at a random offset so idle riders spread over the window
    /// instead of piling onto `head`.
    pub fn find_available_order<R: Rng>(&self, rng: &mut R) -> Option<Candidate> {
        let capacity = self.capacity();
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        let width = tail.saturating_sub(head).min(capacity);
        if width == 0 {
            return None;
        }

        let offset = rng.random_range(0..width);
        (0..=width)
            .map(|step| (head + (offset + step) % width) % capacity)
            .find_map(|slot| {
                let order = self.record(slot);
                (order.state == OrderState::Placed).then_some(Candidate { slot, order })
            })
    }

    /// Compare-and-swap the slot from `from` to `to`.
    ///
    /// Returns `Ok(false)` when the slot no longer holds exactly `from`.
    /// Transitions that change the order identity or do not move the
    /// lifecycle forward are rejected as protocol violations.
    pub fn transition(&self, slot: SlotIndex, from: OrderRecord, to: OrderRecord) -> Result<bool> {
        if from.id != to.id
            || from.restaurant != to.restaurant
            || to.state.rank() <= from.state.rank()
        {
            return Err(DispatchError::violation(
                Resource::Order(slot),
                format!(
                    "illegal transition of order {} from {} to {}",
                    from.id, from.state, to.state
                ),
            ));
        }
        Ok(self.slots[slot]
            .record
            .compare_exchange(from.pack(), to.pack(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    /// Number of slots holding an order that is placed or in flight.
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !slot.record().state.is_free())
            .count()
    }

    /// Every slot is `Unknown` or `Delivered`.
    pub fn is_drained(&self) -> bool {
        self.in_flight() == 0
    }
}
