//! Riders and the dual-lock acquisition protocol.
//!
//! A rider must hold both the order lock and the vehicle lock of the order's
//! restaurant before it may deliver. Vehicle-first and order-first riders take
//! the two locks in opposite order, so a vehicle-first rider can hold the
//! vehicle while an order-first rider holds the order. Locks are only ever
//! tried, never waited on, and the claim on an order is a compare-and-swap
//! from its exact `Placed` record: whoever loses the swap, or later sees the
//! order move away from the state it set, releases what it holds and drops
//! the order. At most one side of any cycle keeps polling.

use std::fmt;
use std::sync::Barrier;
use std::thread;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, error, info};

use crate::context::DispatchContext;
use crate::error::{DispatchError, Result};
use crate::locks::{LockGuard, Resource};
use crate::order_queue::Candidate;
use crate::types::{OrderId, OrderRecord, OrderState, RestaurantId, RestaurantName, SlotIndex, WorkerId};

/// Order in which a rider takes its two locks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Vehicle, walk to the counter, then the order.
    VehicleFirst,
    /// Order, walk to the parking lot, then the vehicle.
    OrderFirst,
}

impl Strategy {
    /// State the rider writes when its first lock is in hand.
    pub fn claim_state(self) -> OrderState {
        match self {
            Self::VehicleFirst => OrderState::WaitingForRider,
            Self::OrderFirst => OrderState::WaitingForVehicle,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::VehicleFirst => "vehicle-first",
            Self::OrderFirst => "order-first",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbandonReason {
    /// The first lock was busy and the order had already left `Placed`.
    ClaimedElsewhere,
    /// The order no longer carries the claim this rider made (or tried to).
    StaleClaim,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Delivered(OrderId),
    Abandoned { order: OrderId, reason: AbandonReason },
    /// Shutdown was requested while the rider was polling.
    Interrupted,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub delivered: usize,
    pub abandoned: usize,
    pub scans: usize,
}

/// Order and vehicle a rider is currently working on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Assignment {
    pub slot: SlotIndex,
    pub order: OrderId,
    pub restaurant: RestaurantId,
}

pub struct Rider {
    id: WorkerId,
    strategy: Strategy,
    rng: StdRng,
    assignment: Option<Assignment>,
    stats: WorkerStats,
}

impl Rider {
    pub fn new(id: WorkerId, strategy: Strategy, seed: u64) -> Self {
        Self {
            id,
            strategy,
            rng: StdRng::seed_from_u64(seed),
            assignment: None,
            stats: WorkerStats::default(),
        }
    }

    #[cfg(test)]
    pub fn assignment(&self) -> Option<Assignment> {
        self.assignment
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Thread body: wait for the start barrier, then work until shutdown.
    ///
    /// A fatal error marks the whole run as failed before returning it.
    pub fn run(mut self, ctx: &DispatchContext, start: &Barrier) -> Result<WorkerStats> {
        start.wait();
        while !ctx.is_shutdown() {
            match self.work_once(ctx) {
                Ok(Some(Outcome::Delivered(_))) => thread::sleep(ctx.timings.rest),
                Ok(_) => {}
                Err(err) => {
                    error!(
                        rider = self.id,
                        strategy = %self.strategy,
                        assignment = ?self.assignment,
                        error = %err,
                        "rider halted"
                    );
                    ctx.mark_failed();
                    return Err(err);
                }
            }
        }
        debug!(rider = self.id, stats = ?self.stats, "rider stopped");
        Ok(self.stats())
    }

    /// One admission scan and, if it found something, one delivery attempt.
    pub fn work_once(&mut self, ctx: &DispatchContext) -> Result<Option<Outcome>> {
        thread::sleep(ctx.timings.check_cost);
        self.stats.scans += 1;
        match ctx.queue.find_available_order(&mut self.rng) {
            Some(candidate) => self.deliver(ctx, candidate).map(Some),
            None => Ok(None),
        }
    }

    /// Take `candidate` through claim, both acquisitions, delivery and release.
    ///
    /// The assignment is kept on error so the failure can be reported.
    pub fn deliver(&mut self, ctx: &DispatchContext, candidate: Candidate) -> Result<Outcome> {
        self.assignment = Some(Assignment {
            slot: candidate.slot,
            order: candidate.order.id,
            restaurant: candidate.order.restaurant,
        });
        let outcome = self.pursue(ctx, candidate);
        if outcome.is_ok() {
            self.assignment = None;
        }
        match outcome {
            Ok(Outcome::Delivered(_)) => self.stats.delivered += 1,
            Ok(Outcome::Abandoned { .. }) => {
                self.stats.abandoned += 1;
                ctx.ledger.record_abandon();
            }
            _ => {}
        }
        outcome
    }

    fn pursue(&self, ctx: &DispatchContext, candidate: Candidate) -> Result<Outcome> {
        let Candidate { slot, order } = candidate;
        let restaurant = RestaurantName(order.restaurant);
        let vehicle = ctx.vehicles.for_restaurant(order.restaurant)?;
        let order_lock = ctx.queue.slot(slot).lock();
        let (first, second) = match self.strategy {
            Strategy::VehicleFirst => (vehicle, order_lock),
            Strategy::OrderFirst => (order_lock, vehicle),
        };

        let first_guard = loop {
            if ctx.is_shutdown() {
                return Ok(Outcome::Interrupted);
            }
            if let Some(guard) = first.try_acquire(self.id)? {
                break guard;
            }
            if ctx.queue.record(slot) != order {
                debug!(rider = self.id, order = order.id, "gave up on order");
                return Ok(Outcome::Abandoned {
                    order: order.id,
                    reason: AbandonReason::ClaimedElsewhere,
                });
            }
            thread::sleep(ctx.timings.first_retry);
        };

        let claimed = order.with_state(self.strategy.claim_state());
        if !ctx.queue.transition(slot, order, claimed)? {
            debug!(rider = self.id, order = order.id, "lost the claim");
            first_guard.release()?;
            return Ok(Outcome::Abandoned {
                order: order.id,
                reason: AbandonReason::StaleClaim,
            });
        }
        debug!(
            rider = self.id,
            strategy = %self.strategy,
            order = order.id,
            %restaurant,
            state = %claimed.state,
            "claimed order"
        );

        thread::sleep(ctx.timings.walk);
        let second_guard = loop {
            if let Some(guard) = second.try_acquire(self.id)? {
                break guard;
            }
            if ctx.queue.record(slot) != claimed {
                info!(
                    rider = self.id,
                    order = order.id,
                    holding = %first.resource(),
                    "stale claim detected, giving up"
                );
                first_guard.release()?;
                return Ok(Outcome::Abandoned {
                    order: order.id,
                    reason: AbandonReason::StaleClaim,
                });
            }
            if ctx.is_shutdown() {
                first_guard.release()?;
                return Ok(Outcome::Interrupted);
            }
            thread::sleep(ctx.timings.second_retry);
        };

        let moving = claimed.with_state(OrderState::Moving);
        self.advance(ctx, slot, claimed, moving)?;
        info!(rider = self.id, order = order.id, %restaurant, "off to deliver");
        thread::sleep(ctx.timings.delivery);
        self.advance(ctx, slot, moving, moving.with_state(OrderState::Delivered))?;
        ctx.ledger.record_delivery(order.id);
        info!(rider = self.id, order = order.id, %restaurant, "delivered");

        let (vehicle_guard, order_guard) = match self.strategy {
            Strategy::VehicleFirst => (first_guard, second_guard),
            Strategy::OrderFirst => (second_guard, first_guard),
        };
        release_in_order(vehicle_guard, order_guard)?;
        Ok(Outcome::Delivered(order.id))
    }

    /// Transition performed while both locks are held; nobody else may touch
    /// the slot, so a failed swap is a protocol fault.
    fn advance(
        &self,
        ctx: &DispatchContext,
        slot: SlotIndex,
        from: OrderRecord,
        to: OrderRecord,
    ) -> Result<()> {
        if ctx.queue.transition(slot, from, to)? {
            return Ok(());
        }
        let found = ctx.queue.record(slot);
        Err(DispatchError::violation(
            Resource::Order(slot),
            format!(
                "rider {} holds both locks of order {} but found it {} (order {}) instead of {}",
                self.id, from.id, found.state, found.id, from.state
            ),
        ))
    }
}

/// Vehicle goes back first, then the order.
fn release_in_order(vehicle: LockGuard<'_>, order: LockGuard<'_>) -> Result<()> {
    debug_assert!(matches!(vehicle.resource(), Resource::Vehicle(_)));
    let vehicle_result = vehicle.release();
    let order_result = order.release();
    vehicle_result.and(order_result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SimConfig, Timings};
    use crate::dispatcher::Dispatcher;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn context(capacity: usize, restaurants: RestaurantId) -> Arc<DispatchContext> {
        let config = SimConfig {
            capacity,
            restaurants,
            workers: 2,
            timings: Timings::fast(),
            validate: true,
            ..SimConfig::default()
        };
        Arc::new(DispatchContext::new(&config))
    }

    fn place_order(ctx: &DispatchContext) -> Candidate {
        let mut dispatcher = Dispatcher::new(ctx.vehicles.len() as RestaurantId, 7);
        dispatcher.dispatch(&ctx.queue);
        ctx.queue
            .find_available_order(&mut StdRng::seed_from_u64(0))
            .expect("placed order")
    }

    fn wait_until(what: &str, condition: impl Fn() -> bool) {
        let start = Instant::now();
        while !condition() {
            assert!(start.elapsed() < Duration::from_secs(5), "timed out waiting for {what}");
            thread::sleep(Duration::from_micros(100));
        }
    }

    fn all_locks_free(ctx: &DispatchContext) -> bool {
        ctx.vehicles.iter().all(|lock| lock.holder().is_none())
            && ctx.queue.slots().iter().all(|slot| slot.lock().holder().is_none())
    }

    #[test]
    fn opposite_strategies_on_one_order_deliver_once() {
        for round in 0..20 {
            let ctx = context(5, 1);
            let candidate = place_order(&ctx);
            let barrier = Arc::new(Barrier::new(2));

            let mut handles = Vec::new();
            for (rider_id, strategy) in [(0, Strategy::VehicleFirst), (1, Strategy::OrderFirst)] {
                let ctx = Arc::clone(&ctx);
                let barrier = Arc::clone(&barrier);
                handles.push(thread::spawn(move || {
                    let mut rider = Rider::new(rider_id, strategy, round);
                    barrier.wait();
                    rider.deliver(&ctx, candidate).expect("no protocol fault")
                }));
            }
            let outcomes: Vec<Outcome> = handles
                .into_iter()
                .map(|handle| handle.join().expect("rider thread panicked"))
                .collect();

            let delivered = outcomes
                .iter()
                .filter(|outcome| **outcome == Outcome::Delivered(candidate.order.id))
                .count();
            let abandoned = outcomes
                .iter()
                .filter(|outcome| matches!(outcome, Outcome::Abandoned { order, .. } if *order == candidate.order.id))
                .count();
            assert_eq!((delivered, abandoned), (1, 1), "round {round}: {outcomes:?}");
            assert_eq!(ctx.queue.record(candidate.slot).state, OrderState::Delivered);
            assert!(all_locks_free(&ctx));
            assert_eq!(ctx.ledger.delivered(), 1);
            assert!(!ctx.ledger.double_delivery());
        }
    }

    #[test]
    fn losing_the_claim_releases_the_first_lock() {
        let ctx = context(5, 1);
        let candidate = place_order(&ctx);
        // An order-first rider got there first and is waiting for the vehicle.
        let order_guard = ctx
            .queue
            .slot(candidate.slot)
            .lock()
            .try_acquire(9)
            .expect("lock fault")
            .expect("order lock free");
        let claimed = candidate.order.with_state(OrderState::WaitingForVehicle);
        assert!(ctx.queue.transition(candidate.slot, candidate.order, claimed).expect("legal"));
        drop(order_guard);

        let mut rider = Rider::new(0, Strategy::VehicleFirst, 1);
        let outcome = rider.deliver(&ctx, candidate).expect("no protocol fault");
        assert_eq!(
            outcome,
            Outcome::Abandoned {
                order: candidate.order.id,
                reason: AbandonReason::StaleClaim
            }
        );
        assert_eq!(ctx.queue.record(candidate.slot), claimed);
        assert!(all_locks_free(&ctx));
        assert_eq!(rider.stats().abandoned, 1);
        assert_eq!(rider.assignment(), None);
    }

    #[test]
    fn busy_first_lock_on_claimed_order_gives_up() {
        let ctx = context(5, 1);
        let candidate = place_order(&ctx);
        let vehicle = ctx.vehicles.for_restaurant(1).expect("vehicle");
        let vehicle_guard = vehicle.try_acquire(9).expect("lock fault").expect("vehicle free");
        let claimed = candidate.order.with_state(OrderState::WaitingForRider);
        assert!(ctx.queue.transition(candidate.slot, candidate.order, claimed).expect("legal"));

        let mut rider = Rider::new(0, Strategy::VehicleFirst, 1);
        let outcome = rider.deliver(&ctx, candidate).expect("no protocol fault");
        assert_eq!(
            outcome,
            Outcome::Abandoned {
                order: candidate.order.id,
                reason: AbandonReason::ClaimedElsewhere
            }
        );
        assert_eq!(vehicle.holder(), Some(9));
        vehicle_guard.release().expect("release fault");
    }

    #[test]
    fn order_first_polls_busy_vehicle_then_delivers() {
        let ctx = context(5, 1);
        let candidate = place_order(&ctx);
        let vehicle = ctx.vehicles.for_restaurant(1).expect("vehicle");
        let vehicle_guard = vehicle.try_acquire(9).expect("lock fault").expect("vehicle free");

        let (done_tx, done_rx) = mpsc::channel();
        let handle = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || {
                let mut rider = Rider::new(3, Strategy::OrderFirst, 1);
                let outcome = rider.deliver(&ctx, candidate);
                done_tx.send(()).expect("done");
                outcome
            })
        };

        wait_until("order-first claim", || {
            ctx.queue.record(candidate.slot).state == OrderState::WaitingForVehicle
        });
        // The claim still matches, so the rider keeps polling instead of leaving.
        assert!(done_rx.recv_timeout(Duration::from_millis(20)).is_err());
        assert_eq!(ctx.queue.slot(candidate.slot).lock().holder(), Some(3));

        vehicle_guard.release().expect("release fault");
        let outcome = handle.join().expect("rider panicked").expect("no protocol fault");
        assert_eq!(outcome, Outcome::Delivered(candidate.order.id));
        assert!(all_locks_free(&ctx));
    }

    #[test]
    fn diverged_claim_while_polling_abandons() {
        let ctx = context(5, 1);
        let candidate = place_order(&ctx);
        let order_lock = ctx.queue.slot(candidate.slot).lock();
        let order_guard = order_lock.try_acquire(9).expect("lock fault").expect("order free");

        let handle = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || {
                let mut rider = Rider::new(0, Strategy::VehicleFirst, 1);
                rider.deliver(&ctx, candidate)
            })
        };

        let claimed = candidate.order.with_state(OrderState::WaitingForRider);
        wait_until("vehicle-first claim", || ctx.queue.record(candidate.slot) == claimed);
        // The order lock holder moves the order on; the rider's claim is stale.
        assert!(
            ctx.queue
                .transition(candidate.slot, claimed, claimed.with_state(OrderState::Moving))
                .expect("legal")
        );

        let outcome = handle.join().expect("rider panicked").expect("no protocol fault");
        assert_eq!(
            outcome,
            Outcome::Abandoned {
                order: candidate.order.id,
                reason: AbandonReason::StaleClaim
            }
        );
        assert_eq!(ctx.vehicles.for_restaurant(1).expect("vehicle").holder(), None);
        order_guard.release().expect("release fault");
    }

    #[test]
    fn shutdown_interrupts_a_polling_rider() {
        let ctx = context(5, 1);
        let candidate = place_order(&ctx);
        let vehicle = ctx.vehicles.for_restaurant(1).expect("vehicle");
        let vehicle_guard = vehicle.try_acquire(9).expect("lock fault").expect("vehicle free");

        let handle = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || Rider::new(2, Strategy::OrderFirst, 1).deliver(&ctx, candidate))
        };
        wait_until("order-first claim", || {
            ctx.queue.record(candidate.slot).state == OrderState::WaitingForVehicle
        });
        ctx.request_shutdown();

        let outcome = handle.join().expect("rider panicked").expect("no protocol fault");
        assert_eq!(outcome, Outcome::Interrupted);
        assert_eq!(ctx.queue.slot(candidate.slot).lock().holder(), None);
        drop(vehicle_guard);
    }

    #[test]
    fn poisoned_vehicle_halts_the_run() {
        let ctx = context(5, 1);
        place_order(&ctx);
        let poisoner = Arc::clone(&ctx);
        let crashed = thread::spawn(move || {
            let vehicle = poisoner.vehicles.for_restaurant(1).expect("vehicle");
            let _guard = vehicle.try_acquire(8).expect("lock fault").expect("vehicle free");
            assert!(vehicle.holder().is_none(), "rider crashed mid-delivery");
        })
        .join();
        assert!(crashed.is_err());

        let rider = Rider::new(0, Strategy::VehicleFirst, 1);
        let result = rider.run(&ctx, &Barrier::new(1));
        assert!(matches!(result, Err(DispatchError::LockPoisoned { .. })));
        assert!(ctx.has_failed());
        assert!(ctx.is_shutdown());
    }
}
