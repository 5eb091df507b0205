//! Read-only status line for the order queue.

use std::fmt;

use crate::order_queue::OrderQueue;
use crate::types::{OrderRecord, WorkerId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotView {
    pub record: OrderRecord,
    /// Rider holding the slot's order lock.
    pub holder: Option<WorkerId>,
}

/// Point-in-time copy of the cursors and every slot. Reads are unsynchronized,
/// so fields may come from slightly different instants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub head: usize,
    pub tail: usize,
    pub slots: Vec<SlotView>,
}

impl QueueSnapshot {
    pub fn capture(queue: &OrderQueue) -> Self {
        Self {
            head: queue.head(),
            tail: queue.tail(),
            slots: queue
                .slots()
                .iter()
                .map(|slot| SlotView {
                    record: slot.record(),
                    holder: slot.lock().holder(),
                })
                .collect(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|view| !view.record.state.is_free())
            .count()
    }
}

impl fmt::Display for QueueSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let capacity = self.slots.len().max(1);
        write!(f, " {:4}:{:4} [", self.head % capacity, self.tail % capacity)?;
        for (index, view) in self.slots.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            let state = view.record.state;
            write!(f, "{} (", state.shorthand())?;
            if state.is_free() && view.record == OrderRecord::EMPTY {
                f.write_str("----:")?;
            } else {
                write!(f, "{:4}:", view.record.id)?;
            }
            match view.holder {
                Some(rider) if state.is_claimed() => write!(f, "{rider:4})")?,
                _ => f.write_str("----)")?,
            }
        }
        f.write_str("]")
    }
}
