//! Delivery status tracking.
//!
//! Statuses are attached to messages the relay accepted. The bundled
//! [`SimulatedStatusSource`] picks one at random and stands in for a real
//! provider feed (webhooks, bounce processing).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::relay::OutboundMessage;

/// Delivery status of an accepted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// Delivered to the mailbox.
    Delivered,
    /// Bounced back.
    Bounced,
    /// Not yet known.
    Pending,
    /// Opened by the recipient.
    Opened,
}

impl DeliveryStatus {
    /// All statuses.
    pub const ALL: [DeliveryStatus; 4] = [
        DeliveryStatus::Delivered,
        DeliveryStatus::Bounced,
        DeliveryStatus::Pending,
        DeliveryStatus::Opened,
    ];

    /// Position in [`DeliveryStatus::ALL`].
    pub fn index(&self) -> usize {
        match self {
            DeliveryStatus::Delivered => 0,
            DeliveryStatus::Bounced => 1,
            DeliveryStatus::Pending => 2,
            DeliveryStatus::Opened => 3,
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeliveryStatus::Delivered => "Delivered",
            DeliveryStatus::Bounced => "Bounced",
            DeliveryStatus::Pending => "Pending",
            DeliveryStatus::Opened => "Opened",
        };
        f.write_str(name)
    }
}

/// Source of delivery statuses for accepted messages.
pub trait DeliveryStatusSource: Send {
    /// Returns the status for a message the relay just accepted.
    fn status_for(&mut self, message: &OutboundMessage) -> DeliveryStatus;
}

/// Uniformly random statuses.
#[derive(Debug)]
pub struct SimulatedStatusSource {
    rng: StdRng,
}

impl SimulatedStatusSource {
    /// Seeds from system entropy.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic sequence for a given seed.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for SimulatedStatusSource {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryStatusSource for SimulatedStatusSource {
    fn status_for(&mut self, _message: &OutboundMessage) -> DeliveryStatus {
        DeliveryStatus::ALL[self.rng.gen_range(0..DeliveryStatus::ALL.len())]
    }
}
