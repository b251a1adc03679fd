//! Ledger boundary: identifiers, records and the client traits.
//!
//! The ledger is authoritative for which regions exist, where they are and
//! which items are placed in them. The engine only reads through
//! [`LedgerClient`] and writes local edits through [`LedgerSubmitter`]; the
//! wire format behind either trait is not its concern.

use std::fmt;

use glam::Vec3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::asset::AssetKey;
use crate::coord::{BoundaryShape, Transform};
use crate::BoxFuture;

/// Identifier of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionId(pub u32);

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a world-level owner (items placed outside any region).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorldId(pub u32);

impl fmt::Display for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "world-{}", self.0)
    }
}

/// Ledger item identifier. Negative ids name local, unsubmitted items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl ItemId {
    pub fn is_local(&self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque version marker of a region's item set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeToken(pub String);

impl ChangeToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One placed item as recorded on the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: ItemId,
    pub asset: AssetKey,
    pub issuer: String,
    pub price: u64,
    pub quantity: u32,
    pub transform: Transform,
}

impl ItemRecord {
    /// A record with empty trade metadata.
    pub fn new(id: ItemId, asset: AssetKey, transform: Transform) -> Self {
        Self {
            id,
            asset,
            issuer: String::new(),
            price: 0,
            quantity: 1,
            transform,
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    pub fn with_price(mut self, price: u64, quantity: u32) -> Self {
        self.price = price;
        self.quantity = quantity;
        self
    }
}

/// Placement of a region in the world.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionMetadata {
    pub id: RegionId,
    pub origin: Vec3,
    pub boundary: BoundaryShape,
}

/// Errors reported by ledger collaborators.
///
/// All of them are treated as transient by region refresh: the last good
/// state stays in place and the refresh is retried with backoff.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("not found on ledger: {0}")]
    NotFound(String),

    #[error("ledger rejected request: {0}")]
    Rejected(String),
}

/// Read access to the ledger.
pub trait LedgerClient: Send + Sync {
    /// Current change token of a region's item set.
    fn region_change_token(&self, region: RegionId) -> BoxFuture<'_, Result<ChangeToken, LedgerError>>;

    /// Every item currently placed in a region.
    fn region_items(&self, region: RegionId) -> BoxFuture<'_, Result<Vec<ItemRecord>, LedgerError>>;

    /// Origin and boundary of a region.
    fn region_metadata(&self, region: RegionId) -> BoxFuture<'_, Result<RegionMetadata, LedgerError>>;

    /// Total number of regions in the world.
    fn count_regions(&self) -> BoxFuture<'_, Result<u32, LedgerError>>;
}

/// Write access used by [`crate::world::Region::save`].
pub trait LedgerSubmitter: Send + Sync {
    /// Submit local additions and removals for one region.
    fn submit_region_edits(
        &self,
        region: RegionId,
        adds: Vec<ItemRecord>,
        removals: Vec<ItemId>,
    ) -> BoxFuture<'_, Result<(), LedgerError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_ids() {
        assert!(ItemId(-1).is_local());
        assert!(!ItemId(0).is_local());
        assert!(!ItemId(42).is_local());
    }

    #[test]
    fn test_record_serde() {
        let record = ItemRecord::new(
            ItemId(7),
            AssetKey::new("chairs", 3),
            Transform::from_position(Vec3::new(1.0, 0.0, 2.0)),
        )
        .with_issuer("alice")
        .with_price(100, 2);

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"id\":7"));
        let back: ItemRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_token_display() {
        assert_eq!(ChangeToken::new("abc").to_string(), "abc");
        assert_eq!(RegionId(4).to_string(), "4");
        assert_eq!(WorldId(1).to_string(), "world-1");
    }
}
