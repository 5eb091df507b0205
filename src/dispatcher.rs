//! Single producer that feeds new orders into the queue.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::order_queue::{DispatchOutcome, OrderQueue};
use crate::types::{OrderId, OrderRecord, RestaurantId, RestaurantName};

/// Fresh `Placed` order for a uniformly chosen restaurant in `1..=restaurants`.
pub fn generate_order<R: Rng>(id: OrderId, restaurants: RestaurantId, rng: &mut R) -> OrderRecord {
    OrderRecord::placed(id, rng.random_range(1..=restaurants))
}

/// Owns the order id sequence and the restaurant picker.
///
/// There must be exactly one dispatcher per queue; it is the only writer of
/// the queue cursors.
pub struct Dispatcher {
    rng: StdRng,
    restaurants: RestaurantId,
    next_id: OrderId,
}

impl Dispatcher {
    pub fn new(restaurants: RestaurantId, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            restaurants,
            next_id: 0,
        }
    }

    /// Id the next successful dispatch will use.
    pub fn next_id(&self) -> OrderId {
        self.next_id
    }

    /// One insertion attempt. The candidate id is only consumed on success,
    /// so a backpressured attempt is retried with the same id.
    pub fn dispatch(&mut self, queue: &OrderQueue) -> DispatchOutcome {
        let id = self.next_id;
        let restaurants = self.restaurants;
        let rng = &mut self.rng;
        let outcome = queue.dispatch(|| generate_order(id, restaurants, rng));
        if let DispatchOutcome::Dispatched { slot, order } = outcome {
            self.next_id += 1;
            info!(
                order = order.id,
                slot,
                restaurant = %RestaurantName(order.restaurant),
                "dispatching order"
            );
        }
        outcome
    }
}
