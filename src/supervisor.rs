//! Rider lifecycle: spawn, start barrier, driving loop and orderly shutdown.

use std::mem;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::SimConfig;
use crate::context::DispatchContext;
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, Result};
use crate::order_queue::DispatchOutcome;
use crate::status::QueueSnapshot;
use crate::types::{RestaurantId, WorkerId};
use crate::worker::{Rider, Strategy, WorkerStats};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RiderReport {
    pub id: WorkerId,
    pub strategy: Strategy,
    pub stats: WorkerStats,
}

/// Totals of a finished run.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub workers: usize,
    pub capacity: usize,
    pub restaurants: RestaurantId,
    pub dispatched: usize,
    pub delivered: usize,
    pub abandoned: usize,
    pub max_in_flight: usize,
    pub double_delivery: bool,
    pub head: usize,
    pub tail: usize,
    pub elapsed: Duration,
    pub riders: Vec<RiderReport>,
}

struct RiderHandle {
    id: WorkerId,
    strategy: Strategy,
    handle: thread::JoinHandle<Result<WorkerStats>>,
}

pub struct Supervisor {
    ctx: Arc<DispatchContext>,
    riders: Vec<RiderHandle>,
    restaurants: RestaurantId,
    deadline: Option<Duration>,
    started: Instant,
    dispatched: usize,
    max_in_flight: usize,
}

impl Supervisor {
    /// Spawn every rider and release them together once all are ready.
    pub fn start(config: &SimConfig) -> Result<Self> {
        config.validate()?;
        let ctx = Arc::new(DispatchContext::new(config));
        let start = Arc::new(Barrier::new(config.workers + 1));

        let mut riders = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let id = index as WorkerId;
            let strategy = config.mix.strategy_for(id, config.workers);
            let rider = Rider::new(id, strategy, config.seed.wrapping_add(u64::from(id) + 1));
            let name = format!("rider-{id}");
            let handle = {
                let ctx = Arc::clone(&ctx);
                let start = Arc::clone(&start);
                thread::Builder::new()
                    .name(name.clone())
                    .spawn(move || rider.run(&ctx, &start))
            };
            // Riders already spawned stay parked on the barrier; the caller is
            // expected to exit the process on this error.
            let handle = handle.map_err(|source| {
                ctx.mark_failed();
                DispatchError::Spawn { name, source }
            })?;
            riders.push(RiderHandle {
                id,
                strategy,
                handle,
            });
        }

        start.wait();
        info!(
            workers = config.workers,
            capacity = config.capacity,
            vehicles = ctx.vehicles.len(),
            mix = ?config.mix,
            "riders released"
        );
        Ok(Self {
            ctx,
            riders,
            restaurants: config.restaurants,
            deadline: config.deadline,
            started: Instant::now(),
            dispatched: 0,
            max_in_flight: 0,
        })
    }

    pub fn context(&self) -> &Arc<DispatchContext> {
        &self.ctx
    }

    /// Dispatch `orders` orders, then wait until every slot is free again.
    ///
    /// `observe` gets a status snapshot after every tick. Returns early
    /// (without error) if a rider failed; [`Supervisor::shutdown`] reports
    /// that failure.
    pub fn drive(
        &mut self,
        dispatcher: &mut Dispatcher,
        orders: usize,
        mut observe: impl FnMut(&QueueSnapshot),
    ) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let pacing = ctx.timings.pacing;

        while self.dispatched < orders {
            if !self.keep_going()? {
                return Ok(());
            }
            match dispatcher.dispatch(&ctx.queue) {
                DispatchOutcome::Dispatched { .. } => self.dispatched += 1,
                DispatchOutcome::Backpressure { slot, occupant } => {
                    debug!(
                        slot,
                        occupant = occupant.id,
                        next_order = dispatcher.next_id(),
                        "queue full, retrying"
                    );
                }
            }
            self.tick(&mut observe);
            thread::sleep(pacing);
        }

        while !ctx.queue.is_drained() {
            if !self.keep_going()? {
                return Ok(());
            }
            self.tick(&mut observe);
            thread::sleep(pacing);
        }
        info!(dispatched = self.dispatched, "queue drained");
        Ok(())
    }

    fn keep_going(&self) -> Result<bool> {
        if self.ctx.has_failed() {
            warn!("rider failure observed, stopping the driving loop");
            return Ok(false);
        }
        if let Some(limit) = self.deadline {
            if self.started.elapsed() > limit {
                return Err(DispatchError::Stalled(limit));
            }
        }
        Ok(true)
    }

    fn tick(&mut self, observe: &mut impl FnMut(&QueueSnapshot)) {
        let snapshot = QueueSnapshot::capture(&self.ctx.queue);
        self.max_in_flight = self.max_in_flight.max(snapshot.in_flight());
        observe(&snapshot);
    }

    /// Raise the shutdown flag, join every rider and collect the report.
    ///
    /// The first rider error (or panic) is returned instead of a report.
    pub fn shutdown(mut self) -> Result<RunReport> {
        self.ctx.request_shutdown();
        let mut first_error = None;
        let mut riders = Vec::with_capacity(self.riders.len());
        for rider in mem::take(&mut self.riders) {
            match rider.handle.join() {
                Ok(Ok(stats)) => riders.push(RiderReport {
                    id: rider.id,
                    strategy: rider.strategy,
                    stats,
                }),
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(_) => {
                    first_error.get_or_insert(DispatchError::WorkerPanicked(rider.id));
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let queue = &self.ctx.queue;
        let leaked = self
            .ctx
            .vehicles
            .iter()
            .chain(queue.slots().iter().map(|slot| slot.lock()))
            .find_map(|lock| lock.holder().map(|rider| (lock.resource(), rider)));
        if let Some((resource, rider)) = leaked {
            return Err(DispatchError::violation(
                resource,
                format!("still held by rider {rider} after every rider exited"),
            ));
        }

        let report = RunReport {
            workers: riders.len(),
            capacity: queue.capacity(),
            restaurants: self.restaurants,
            dispatched: self.dispatched,
            delivered: self.ctx.ledger.delivered(),
            abandoned: self.ctx.ledger.abandoned(),
            max_in_flight: self.max_in_flight,
            double_delivery: self.ctx.ledger.double_delivery(),
            head: queue.head(),
            tail: queue.tail(),
            elapsed: self.started.elapsed(),
            riders,
        };
        info!(
            delivered = report.delivered,
            abandoned = report.abandoned,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "run finished"
        );
        Ok(report)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.ctx.request_shutdown();
    }
}

/// Start, drive `config.orders` orders to completion and shut down.
///
/// A rider failure takes precedence over a missed deadline.
pub fn run(config: &SimConfig, observe: impl FnMut(&QueueSnapshot)) -> Result<RunReport> {
    let mut supervisor = Supervisor::start(config)?;
    let mut dispatcher = Dispatcher::new(config.restaurants, config.seed);
    let driven = supervisor.drive(&mut dispatcher, config.orders, observe);
    let report = supervisor.shutdown()?;
    driven?;
    Ok(report)
}
