//! In-memory ledger.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::ledger::{
    ChangeToken, ItemId, ItemRecord, LedgerClient, LedgerError, LedgerSubmitter, RegionId,
    RegionMetadata,
};
use crate::BoxFuture;

#[derive(Debug, Clone)]
struct RegionEntry {
    metadata: RegionMetadata,
    token: ChangeToken,
    items: Vec<ItemRecord>,
    revision: u64,
}

/// Per-method call counters.
#[derive(Debug, Default)]
pub struct LedgerCalls {
    pub change_token: AtomicU64,
    pub items: AtomicU64,
    pub metadata: AtomicU64,
    pub count: AtomicU64,
    pub submits: AtomicU64,
}

/// Mutable, in-process stand-in for the ledger.
///
/// Implements both [`LedgerClient`] and [`LedgerSubmitter`]. Availability
/// can be toggled to exercise retry paths.
#[derive(Debug)]
pub struct MemoryLedger {
    regions: RwLock<BTreeMap<RegionId, RegionEntry>>,
    calls: LedgerCalls,
    unavailable: AtomicBool,
    failing_count: AtomicBool,
    failing_metadata: Mutex<HashSet<RegionId>>,
    next_item_id: AtomicI64,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            regions: RwLock::new(BTreeMap::new()),
            calls: LedgerCalls::default(),
            unavailable: AtomicBool::new(false),
            failing_count: AtomicBool::new(false),
            failing_metadata: Mutex::new(HashSet::new()),
            next_item_id: AtomicI64::new(1),
        }
    }

    /// Register a region with no items at token `"0"`.
    pub fn add_region(&self, metadata: RegionMetadata) {
        self.regions.write().insert(
            metadata.id,
            RegionEntry {
                metadata,
                token: ChangeToken::new("0"),
                items: Vec::new(),
                revision: 0,
            },
        );
    }

    /// Replace a region's items under an explicit token.
    pub fn set_items(&self, region: RegionId, token: impl Into<String>, items: Vec<ItemRecord>) {
        self.observe_ids(&items);
        if let Some(entry) = self.regions.write().get_mut(&region) {
            entry.token = ChangeToken::new(token);
            entry.items = items;
            entry.revision += 1;
        }
    }

    /// Replace a region's items and advance its token automatically.
    pub fn publish(&self, region: RegionId, items: Vec<ItemRecord>) -> Option<ChangeToken> {
        self.observe_ids(&items);
        let mut regions = self.regions.write();
        let entry = regions.get_mut(&region)?;
        entry.revision += 1;
        entry.token = ChangeToken::new(format!("r{}", entry.revision));
        entry.items = items;
        Some(entry.token.clone())
    }

    pub fn items(&self, region: RegionId) -> Vec<ItemRecord> {
        self.regions
            .read()
            .get(&region)
            .map(|entry| entry.items.clone())
            .unwrap_or_default()
    }

    pub fn token(&self, region: RegionId) -> Option<ChangeToken> {
        self.regions.read().get(&region).map(|entry| entry.token.clone())
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make only `count_regions` fail.
    pub fn fail_count(&self, failing: bool) {
        self.failing_count.store(failing, Ordering::SeqCst);
    }

    pub fn fail_metadata(&self, region: RegionId, failing: bool) {
        let mut set = self.failing_metadata.lock();
        if failing {
            set.insert(region);
        } else {
            set.remove(&region);
        }
    }

    pub fn calls(&self) -> &LedgerCalls {
        &self.calls
    }

    pub fn token_calls(&self) -> u64 {
        self.calls.change_token.load(Ordering::SeqCst)
    }

    pub fn item_calls(&self) -> u64 {
        self.calls.items.load(Ordering::SeqCst)
    }

    pub fn metadata_calls(&self) -> u64 {
        self.calls.metadata.load(Ordering::SeqCst)
    }

    pub fn submit_calls(&self) -> u64 {
        self.calls.submits.load(Ordering::SeqCst)
    }

    /// Keep ledger-assigned ids above any id published by hand.
    fn observe_ids(&self, items: &[ItemRecord]) {
        if let Some(max) = items.iter().map(|r| r.id.0).max() {
            self.next_item_id.fetch_max(max + 1, Ordering::SeqCst);
        }
    }

    fn check_available(&self) -> Result<(), LedgerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(LedgerError::Unavailable("ledger offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn with_region<T>(
        &self,
        region: RegionId,
        f: impl FnOnce(&RegionEntry) -> T,
    ) -> Result<T, LedgerError> {
        self.check_available()?;
        self.regions
            .read()
            .get(&region)
            .map(f)
            .ok_or_else(|| LedgerError::NotFound(format!("region {}", region)))
    }
}

impl LedgerClient for MemoryLedger {
    fn region_change_token(&self, region: RegionId) -> BoxFuture<'_, Result<ChangeToken, LedgerError>> {
        self.calls.change_token.fetch_add(1, Ordering::SeqCst);
        let result = self.with_region(region, |entry| entry.token.clone());
        Box::pin(async move { result })
    }

    fn region_items(&self, region: RegionId) -> BoxFuture<'_, Result<Vec<ItemRecord>, LedgerError>> {
        self.calls.items.fetch_add(1, Ordering::SeqCst);
        let result = self.with_region(region, |entry| entry.items.clone());
        Box::pin(async move { result })
    }

    fn region_metadata(&self, region: RegionId) -> BoxFuture<'_, Result<RegionMetadata, LedgerError>> {
        self.calls.metadata.fetch_add(1, Ordering::SeqCst);
        let result = if self.failing_metadata.lock().contains(&region) {
            Err(LedgerError::Unavailable(format!("metadata for region {}", region)))
        } else {
            self.with_region(region, |entry| entry.metadata)
        };
        Box::pin(async move { result })
    }

    fn count_regions(&self) -> BoxFuture<'_, Result<u32, LedgerError>> {
        self.calls.count.fetch_add(1, Ordering::SeqCst);
        let result = if self.failing_count.load(Ordering::SeqCst) {
            Err(LedgerError::Unavailable("region count".to_string()))
        } else {
            self.check_available()
                .map(|_| self.regions.read().len() as u32)
        };
        Box::pin(async move { result })
    }
}

impl LedgerSubmitter for MemoryLedger {
    fn submit_region_edits(
        &self,
        region: RegionId,
        adds: Vec<ItemRecord>,
        removals: Vec<ItemId>,
    ) -> BoxFuture<'_, Result<(), LedgerError>> {
        self.calls.submits.fetch_add(1, Ordering::SeqCst);
        let result = self.check_available().and_then(|_| {
            let mut regions = self.regions.write();
            let entry = regions
                .get_mut(&region)
                .ok_or_else(|| LedgerError::NotFound(format!("region {}", region)))?;

            if let Some(id) = removals
                .iter()
                .find(|id| !entry.items.iter().any(|r| r.id == **id))
            {
                return Err(LedgerError::Rejected(format!("item {} not in region", id)));
            }
            entry.items.retain(|r| !removals.contains(&r.id));
            for mut record in adds {
                record.id = ItemId(self.next_item_id.fetch_add(1, Ordering::SeqCst));
                entry.items.push(record);
            }
            entry.revision += 1;
            entry.token = ChangeToken::new(format!("r{}", entry.revision));
            Ok(())
        });
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetKey;
    use crate::coord::{BoundaryShape, Transform};
    use glam::Vec3;

    fn ledger_with_region() -> MemoryLedger {
        let ledger = MemoryLedger::new();
        ledger.add_region(RegionMetadata {
            id: RegionId(0),
            origin: Vec3::ZERO,
            boundary: BoundaryShape::Sphere { radius: 10.0 },
        });
        ledger
    }

    fn record(id: i64) -> ItemRecord {
        ItemRecord::new(ItemId(id), AssetKey::new("col", 1), Transform::default())
    }

    #[tokio::test]
    async fn test_publish_advances_token() {
        let ledger = ledger_with_region();
        let before = ledger.region_change_token(RegionId(0)).await.unwrap();
        ledger.publish(RegionId(0), vec![record(1)]);
        let after = ledger.region_change_token(RegionId(0)).await.unwrap();
        assert_ne!(before, after);
        assert_eq!(ledger.region_items(RegionId(0)).await.unwrap().len(), 1);
        assert_eq!(ledger.token_calls(), 2);
        assert_eq!(ledger.item_calls(), 1);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let ledger = ledger_with_region();
        ledger.set_unavailable(true);
        assert!(matches!(
            ledger.count_regions().await,
            Err(LedgerError::Unavailable(_))
        ));
        ledger.set_unavailable(false);
        assert_eq!(ledger.count_regions().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_submit_assigns_ids_and_removes() {
        let ledger = ledger_with_region();
        ledger.set_items(RegionId(0), "a", vec![record(5)]);

        ledger
            .submit_region_edits(RegionId(0), vec![record(-1)], vec![ItemId(5)])
            .await
            .unwrap();

        let items = ledger.items(RegionId(0));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, ItemId(6));
        assert_ne!(ledger.token(RegionId(0)), Some(ChangeToken::new("a")));
    }

    #[tokio::test]
    async fn test_submit_rejects_unknown_removal() {
        let ledger = ledger_with_region();
        let err = ledger
            .submit_region_edits(RegionId(0), Vec::new(), vec![ItemId(42)])
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Rejected(_)));
    }
}
