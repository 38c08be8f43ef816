//! # basalt-types: Core types for `Basalt`
//!
//! This crate contains shared types used across the `Basalt` system:
//! - Entity IDs ([`TableId`], [`ViewId`])
//! - Temporal types ([`Timestamp`], [`Ttl`], [`Expiry`])
//! - Store limits ([`MAX_KEY_COMPONENT_SIZE`])

use std::{
    fmt::{Debug, Display},
    ops::Add,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

// ============================================================================
// Entity IDs - All Copy (cheap 8-byte values)
// ============================================================================

/// Unique identifier for a base table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct TableId(u64);

impl TableId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl Add for TableId {
    type Output = TableId;

    fn add(self, rhs: Self) -> Self::Output {
        TableId::new(self.0 + rhs.0)
    }
}

impl Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TableId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<TableId> for u64 {
    fn from(id: TableId) -> Self {
        id.0
    }
}

/// Unique identifier for a materialized view.
///
/// View IDs share no namespace with table IDs; a view is always addressed
/// together with the base table it was derived from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ViewId(u64);

impl ViewId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl Add for ViewId {
    type Output = ViewId;

    fn add(self, rhs: Self) -> Self::Output {
        ViewId::new(self.0 + rhs.0)
    }
}

impl Display for ViewId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ViewId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<ViewId> for u64 {
    fn from(id: ViewId) -> Self {
        id.0
    }
}

// ============================================================================
// Temporal Types - Copy (8-byte values)
// ============================================================================

/// Write timestamp in microseconds since the Unix epoch.
///
/// Every cell, row marker and tombstone carries one. Conflicts are resolved
/// last-write-wins: the larger timestamp supersedes the smaller, and a
/// tombstone shadows data written at or before its own timestamp.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The Unix epoch (1970-01-01 00:00:00 UTC).
    pub const EPOCH: Timestamp = Timestamp(0);

    /// The smallest representable timestamp; older than any write.
    pub const MIN: Timestamp = Timestamp(i64::MIN);

    /// Creates a timestamp from microseconds since Unix epoch.
    pub fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Returns the timestamp as microseconds since Unix epoch.
    pub fn as_micros(&self) -> i64 {
        self.0
    }

    /// Returns the timestamp as whole seconds since Unix epoch.
    pub fn as_secs(&self) -> i64 {
        self.0.div_euclid(1_000_000)
    }

    /// Creates a timestamp for the current time.
    ///
    /// # Panics
    ///
    /// Panics if the system clock is before Unix epoch (should never happen).
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before Unix epoch");
        Self(duration.as_micros() as i64)
    }

    /// Creates a timestamp ensuring monotonicity: `max(now, last + 1µs)`.
    ///
    /// Independent writes never share a timestamp, even if the system clock
    /// moves backwards or two writes land in the same microsecond.
    pub fn now_monotonic(last: Option<Timestamp>) -> Self {
        let now = Self::now();
        match last {
            Some(prev) if now.0 <= prev.0 => Timestamp(prev.0.saturating_add(1)),
            _ => now,
        }
    }

    /// Returns the instant `ttl` after this timestamp.
    pub fn plus(self, ttl: Ttl) -> Self {
        Timestamp(
            self.0
                .saturating_add(i64::from(ttl.as_secs()).saturating_mul(1_000_000)),
        )
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Timestamp {
    fn from(micros: i64) -> Self {
        Self(micros)
    }
}

impl From<Timestamp> for i64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

/// Time-to-live in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ttl(u32);

impl Ttl {
    pub fn from_secs(secs: u32) -> Self {
        Self(secs)
    }

    pub fn as_secs(&self) -> u32 {
        self.0
    }
}

impl Display for Ttl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}s", self.0)
    }
}

/// Expiration attached to a cell or row marker written with a TTL.
///
/// The absolute `expires_at` instant is fixed at write time so that every
/// replica (and every view row derived from the write) expires together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Expiry {
    pub ttl: Ttl,
    pub expires_at: Timestamp,
}

impl Expiry {
    /// Computes the expiry for a write at `written_at` with the given TTL.
    pub fn new(ttl: Ttl, written_at: Timestamp) -> Self {
        Self {
            ttl,
            expires_at: written_at.plus(ttl),
        }
    }

    /// Returns true if the expiry instant has passed at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

// ============================================================================
// Store Limits
// ============================================================================

/// Maximum serialized size of a single key component, in bytes.
///
/// Regular columns may hold values far larger than this (multi-megabyte
/// blobs are fine), but once a regular column is promoted into a view key
/// its values must fit.
pub const MAX_KEY_COMPONENT_SIZE: usize = 65_535;
