//! Shared primitive types used across the engine.

use chrono::{DateTime, Utc};

/// Stable identifier of a subscriber, owned by the CRM side.
pub type ClientId = String;

/// Identifier of a service package in the catalog.
pub type PackageId = String;

/// Wall-clock instant; all engine timestamps are UTC.
pub type Timestamp = DateTime<Utc>;

/// Round a currency amount to whole cents.
pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}
