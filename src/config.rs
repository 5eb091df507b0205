//! Run configuration and simulated timing knobs.

use std::time::Duration;

use clap::ValueEnum;

use crate::error::{DispatchError, Result};
use crate::types::{OrderId, RestaurantId, WorkerId};
use crate::worker::Strategy;

/// How strategies are assigned to riders.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum StrategyMix {
    /// First half vehicle-first, second half order-first.
    #[default]
    Split,
    VehicleFirst,
    OrderFirst,
}

impl StrategyMix {
    pub fn strategy_for(self, worker: WorkerId, workers: usize) -> Strategy {
        match self {
            Self::VehicleFirst => Strategy::VehicleFirst,
            Self::OrderFirst => Strategy::OrderFirst,
            Self::Split if (worker as usize) < workers / 2 => Strategy::VehicleFirst,
            Self::Split => Strategy::OrderFirst,
        }
    }
}

/// Simulated latencies. These sleeps are the only intentional suspension
/// points of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timings {
    /// Cost of one admission scan.
    pub check_cost: Duration,
    /// Pause between attempts on the first lock.
    pub first_retry: Duration,
    /// Pause between attempts on the second lock.
    pub second_retry: Duration,
    /// Walk between the first and second acquisition.
    pub walk: Duration,
    pub delivery: Duration,
    /// Rest after a delivery so other riders get a turn.
    pub rest: Duration,
    /// Driving loop tick.
    pub pacing: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            check_cost: Duration::from_micros(250),
            first_retry: Duration::from_millis(1),
            second_retry: Duration::from_millis(1),
            walk: Duration::from_millis(1),
            delivery: Duration::from_millis(80),
            rest: Duration::from_micros(500),
            pacing: Duration::from_millis(20),
        }
    }
}

impl Timings {
    #[cfg(test)]
    pub fn fast() -> Self {
        Self {
            check_cost: Duration::from_micros(20),
            first_retry: Duration::from_micros(50),
            second_retry: Duration::from_micros(50),
            walk: Duration::from_micros(100),
            delivery: Duration::from_millis(2),
            rest: Duration::from_micros(20),
            pacing: Duration::from_micros(200),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub restaurants: RestaurantId,
    pub capacity: usize,
    pub workers: usize,
    /// Total orders the driving loop dispatches.
    pub orders: usize,
    pub mix: StrategyMix,
    pub seed: u64,
    pub timings: Timings,
    /// Remember delivered ids and flag double deliveries.
    pub validate: bool,
    /// Give up if the queue has not drained by then.
    pub deadline: Option<Duration>,
}

pub const DEFAULT_RESTAURANTS: RestaurantId = 5;
pub const DEFAULT_SEED: u64 = 70649;

impl Default for SimConfig {
    fn default() -> Self {
        let restaurants = DEFAULT_RESTAURANTS;
        Self {
            restaurants,
            capacity: usize::from(restaurants) * 2,
            workers: usize::from(restaurants) * 4,
            orders: 30,
            mix: StrategyMix::Split,
            seed: DEFAULT_SEED,
            timings: Timings::default(),
            validate: false,
            deadline: None,
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<()> {
        if self.restaurants == 0 {
            return Err(DispatchError::InvalidConfig(
                "restaurants must be > 0".to_string(),
            ));
        }
        if self.capacity == 0 {
            return Err(DispatchError::InvalidConfig(
                "capacity must be > 0".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(DispatchError::InvalidConfig(
                "workers must be > 0".to_string(),
            ));
        }
        if WorkerId::try_from(self.workers).is_err() {
            return Err(DispatchError::InvalidConfig(format!(
                "at most {} workers are supported",
                WorkerId::MAX
            )));
        }
        if OrderId::try_from(self.orders).is_err() {
            return Err(DispatchError::InvalidConfig(format!(
                "at most {} orders are supported",
                OrderId::MAX
            )));
        }
        Ok(())
    }
}
