//! Non-blocking exclusive locks for vehicles and order slots.
//!
//! Every lock also records which rider currently holds it. The marker is
//! diagnostic bookkeeping for the status line, but it is checked on every
//! acquire and release so a broken lock surfaces as a protocol violation.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};

use tracing::debug;

use crate::error::{DispatchError, Result};
use crate::types::{RestaurantId, SlotIndex, WorkerId};

const FREE: u32 = 0;

/// What a lock protects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    /// The single vehicle of a restaurant.
    Vehicle(RestaurantId),
    /// An order slot in the queue.
    Order(SlotIndex),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vehicle(restaurant) => write!(f, "vehicle {restaurant}"),
            Self::Order(slot) => write!(f, "order slot {slot}"),
        }
    }
}

pub struct ResourceLock {
    resource: Resource,
    mutex: Mutex<()>,
    // Holder id + 1, FREE when unlocked.
    holder: AtomicU32,
}

impl ResourceLock {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            mutex: Mutex::new(()),
            holder: AtomicU32::new(FREE),
        }
    }

    pub fn resource(&self) -> Resource {
        self.resource
    }

    /// One lock attempt that never blocks.
    ///
    /// `Ok(Some(_))` means the lock is now held by `worker`, `Ok(None)` means
    /// somebody else holds it. A poisoned mutex or inconsistent holder marker
    /// is returned as an error and must not be retried.
    pub fn try_acquire(&self, worker: WorkerId) -> Result<Option<LockGuard<'_>>> {
        let guard = match self.mutex.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                debug!(rider = worker, resource = %self.resource, "busy");
                return Ok(None);
            }
            Err(TryLockError::Poisoned(_)) => {
                return Err(DispatchError::LockPoisoned {
                    resource: self.resource,
                });
            }
        };
        let previous = self.holder.swap(worker + 1, Ordering::AcqRel);
        if previous != FREE {
            self.holder.store(previous, Ordering::Release);
            drop(guard);
            return Err(DispatchError::violation(
                self.resource,
                format!(
                    "rider {worker} acquired a lock still marked as held by rider {}",
                    previous - 1
                ),
            ));
        }
        debug!(rider = worker, resource = %self.resource, "locked");
        Ok(Some(LockGuard {
            lock: self,
            worker,
            guard: Some(guard),
        }))
    }

    /// Rider currently recorded as holder, if any.
    pub fn holder(&self) -> Option<WorkerId> {
        match self.holder.load(Ordering::Acquire) {
            FREE => None,
            marker => Some(marker - 1),
        }
    }

    fn clear_holder(&self, worker: WorkerId) -> Result<()> {
        match self
            .holder
            .compare_exchange(worker + 1, FREE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(FREE) => Err(DispatchError::violation(
                self.resource,
                format!("rider {worker} released a lock with no recorded holder"),
            )),
            Err(other) => Err(DispatchError::violation(
                self.resource,
                format!(
                    "rider {worker} released a lock held by rider {}",
                    other - 1
                ),
            )),
        }
    }
}

/// Scoped ownership of a [`ResourceLock`].
///
/// Dropping the guard unlocks on every exit path; [`LockGuard::release`]
/// does the same but reports bookkeeping failures.
pub struct LockGuard<'a> {
    lock: &'a ResourceLock,
    worker: WorkerId,
    guard: Option<MutexGuard<'a, ()>>,
}

impl LockGuard<'_> {
    pub fn resource(&self) -> Resource {
        self.lock.resource
    }

    /// Release the lock, verifying this rider was the recorded holder.
    pub fn release(mut self) -> Result<()> {
        let result = self.lock.clear_holder(self.worker);
        self.guard.take();
        if result.is_ok() {
            debug!(rider = self.worker, resource = %self.lock.resource, "unlocked");
        }
        result
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.guard.is_some() {
            let _ = self.lock.clear_holder(self.worker);
        }
    }
}

/// One vehicle lock per restaurant, indexed by `restaurant - 1`.
pub struct VehiclePool {
    vehicles: Box<[ResourceLock]>,
}

impl VehiclePool {
    pub fn new(restaurants: RestaurantId) -> Self {
        let vehicles = (1..=restaurants)
            .map(|restaurant| ResourceLock::new(Resource::Vehicle(restaurant)))
            .collect();
        Self { vehicles }
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn for_restaurant(&self, restaurant: RestaurantId) -> Result<&ResourceLock> {
        usize::from(restaurant)
            .checked_sub(1)
            .and_then(|index| self.vehicles.get(index))
            .ok_or(DispatchError::UnknownRestaurant(restaurant))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceLock> {
        self.vehicles.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn lock_is_exclusive_under_contention() {
        let lock = Arc::new(ResourceLock::new(Resource::Vehicle(1)));
        let contenders = 6;
        let barrier = Arc::new(Barrier::new(contenders));
        let occupancy = Arc::new(AtomicUsize::new(0));
        let violation = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for rider in 0..contenders as WorkerId {
            let lock = Arc::clone(&lock);
            let barrier = Arc::clone(&barrier);
            let occupancy = Arc::clone(&occupancy);
            let violation = Arc::clone(&violation);
            handles.push(thread::spawn(move || {
                barrier.wait();
                let mut rounds = 0;
                while rounds < 5 {
                    let Some(guard) = lock.try_acquire(rider).expect("lock fault") else {
                        thread::yield_now();
                        continue;
                    };
                    if occupancy.fetch_add(1, Ordering::SeqCst) + 1 > 1 {
                        violation.store(true, Ordering::SeqCst);
                    }
                    assert_eq!(lock.holder(), Some(rider));
                    thread::sleep(Duration::from_millis(2));
                    occupancy.fetch_sub(1, Ordering::SeqCst);
                    guard.release().expect("release fault");
                    rounds += 1;
                }
            }));
        }

        for handle in handles {
            handle.join().expect("contender thread panicked");
        }

        assert!(!violation.load(Ordering::SeqCst));
        assert_eq!(lock.holder(), None);
    }

    #[test]
    fn busy_lock_reports_none_without_blocking() {
        let lock = ResourceLock::new(Resource::Order(3));
        let guard = lock.try_acquire(1).expect("lock fault").expect("free lock");
        assert!(lock.try_acquire(2).expect("lock fault").is_none());
        assert_eq!(lock.holder(), Some(1));
        guard.release().expect("release fault");
        assert!(lock.try_acquire(2).expect("lock fault").is_some());
    }

    #[test]
    fn dropping_guard_frees_lock() {
        let lock = ResourceLock::new(Resource::Order(0));
        {
            let _guard = lock.try_acquire(4).expect("lock fault").expect("free lock");
        }
        assert_eq!(lock.holder(), None);
        assert!(lock.try_acquire(5).expect("lock fault").is_some());
    }

    #[test]
    fn release_by_foreign_holder_is_a_violation() {
        let lock = ResourceLock::new(Resource::Vehicle(2));
        let guard = lock.try_acquire(1).expect("lock fault").expect("free lock");
        // Simulate corrupted bookkeeping.
        lock.holder.store(8, Ordering::SeqCst);
        let err = guard.release().expect_err("foreign release accepted");
        assert!(matches!(err, DispatchError::ProtocolViolation { .. }));
    }

    #[test]
    fn poisoned_lock_is_fatal() {
        let lock = Arc::new(ResourceLock::new(Resource::Vehicle(1)));
        let poisoner = Arc::clone(&lock);
        let result = thread::spawn(move || {
            let _guard = poisoner.try_acquire(0).expect("lock fault").expect("free lock");
            assert!(
                poisoner.holder().is_none(),
                "rider crashed while holding the vehicle"
            );
        })
        .join();
        assert!(result.is_err());

        let err = match lock.try_acquire(1) {
            Err(err) => err,
            Ok(_) => panic!("poisoned lock was acquired"),
        };
        assert!(matches!(
            err,
            DispatchError::LockPoisoned {
                resource: Resource::Vehicle(1)
            }
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn vehicle_pool_is_indexed_by_restaurant() {
        let pool = VehiclePool::new(3);
        assert_eq!(pool.len(), 3);
        let vehicle = pool.for_restaurant(3).expect("restaurant 3");
        assert_eq!(vehicle.resource(), Resource::Vehicle(3));
        assert!(matches!(
            pool.for_restaurant(0),
            Err(DispatchError::UnknownRestaurant(0))
        ));
        assert!(pool.for_restaurant(4).is_err());
    }
}
