//! Shared identifiers and the order model used across the system.

use std::fmt;

/// Unique, monotonically increasing identifier of a dispatched order.
pub type OrderId = u32;
/// Identifier of a rider (worker thread).
pub type WorkerId = u32;
/// Restaurant identifier, 1-based.
pub type RestaurantId = u16;
/// Position of an order inside the circular queue.
pub type SlotIndex = usize;

/// Lifecycle of a single order instance.
///
/// States only move forward: `Unknown/Placed -> WaitingFor* -> Moving -> Delivered`.
/// `Unknown` and `Delivered` both mean the slot is free for reuse.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OrderState {
    Unknown = 0,
    Placed = 1,
    WaitingForRider = 2,
    WaitingForVehicle = 3,
    Moving = 4,
    Delivered = 5,
}

impl OrderState {
    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::Placed,
            2 => Self::WaitingForRider,
            3 => Self::WaitingForVehicle,
            4 => Self::Moving,
            5 => Self::Delivered,
            _ => Self::Unknown,
        }
    }

    /// Position in the lifecycle; both waiting states share a rank.
    pub fn rank(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Placed => 1,
            Self::WaitingForRider | Self::WaitingForVehicle => 2,
            Self::Moving => 3,
            Self::Delivered => 4,
        }
    }

    /// Slot may be overwritten by the dispatcher.
    pub fn is_free(self) -> bool {
        matches!(self, Self::Unknown | Self::Delivered)
    }

    /// Claimed by a rider and not yet delivered.
    pub fn is_claimed(self) -> bool {
        matches!(
            self,
            Self::WaitingForRider | Self::WaitingForVehicle | Self::Moving
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Delivered => "delivered",
            Self::Placed => "placed",
            Self::WaitingForRider => "waiting rider",
            Self::WaitingForVehicle => "waiting vehicle",
            Self::Moving => "on the move",
        }
    }

    /// Four-character form used by the status line.
    pub fn shorthand(self) -> &'static str {
        match self {
            Self::Unknown => "....",
            Self::Delivered => "DONE",
            Self::Placed => "WAIT",
            Self::WaitingForRider => "PICK",
            Self::WaitingForVehicle => "VHCL",
            Self::Moving => "TRVL",
        }
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Snapshot of one order slot.
///
/// Packed into a single `u64` (`id:32 | restaurant:16 | state:8`) so the
/// queue can publish and compare-and-swap the whole record atomically.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrderRecord {
    pub id: OrderId,
    pub restaurant: RestaurantId,
    pub state: OrderState,
}

impl OrderRecord {
    /// Record of a never-used slot.
    pub const EMPTY: Self = Self {
        id: 0,
        restaurant: 0,
        state: OrderState::Unknown,
    };

    pub fn placed(id: OrderId, restaurant: RestaurantId) -> Self {
        Self {
            id,
            restaurant,
            state: OrderState::Placed,
        }
    }

    /// Same order, different lifecycle state.
    pub fn with_state(self, state: OrderState) -> Self {
        Self { state, ..self }
    }

    pub(crate) fn pack(self) -> u64 {
        (u64::from(self.id) << 32) | (u64::from(self.restaurant) << 8) | self.state as u64
    }

    pub(crate) fn unpack(bits: u64) -> Self {
        Self {
            id: (bits >> 32) as OrderId,
            restaurant: ((bits >> 8) & 0xffff) as RestaurantId,
            state: OrderState::from_bits((bits & 0xff) as u8),
        }
    }
}

const RESTAURANT_NAMES: [&str; 5] = [
    "Golden Wok",
    "Casa Verde",
    "Harbour Fry",
    "Nonna's Oven",
    "Saffron Lane",
];

/// Display adapter for a restaurant id; falls back to the number.
#[derive(Clone, Copy, Debug)]
pub struct RestaurantName(pub RestaurantId);

impl fmt::Display for RestaurantName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let index = usize::from(self.0);
        match index.checked_sub(1).and_then(|i| RESTAURANT_NAMES.get(i)) {
            Some(name) => f.write_str(name),
            None if index == 0 => f.write_str("INVALID"),
            None => write!(f, "restaurant #{index}"),
        }
    }
}
