use crate::types::{BranchCount, RetailerID, StoreError};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

/// Columns of a merchant row that the backfill reads.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct MerchantRow {
    pub retailer_id: RetailerID,
    pub branch_count: Option<BranchCount>,
}

/// Store trait needed for the gateway.
#[async_trait]
pub trait MerchantStore: Send + Sync {
    async fn find_merchant(&self, id: RetailerID) -> Result<Option<MerchantRow>, StoreError>;
    /// Sets the branch count only where it is still unset.
    /// Returns `false` when no row was changed.
    async fn set_branch_count(
        &self,
        id: RetailerID,
        branch_count: BranchCount,
    ) -> Result<bool, StoreError>;
}

/// Uses a simple HashMap to hold merchant rows.
///
/// Uses a lock to be thread-safe.
pub struct InMemoryStore {
    merchants: RwLock<HashMap<RetailerID, Option<BranchCount>>>,
    writes: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            merchants: RwLock::new(HashMap::new()),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn from_rows<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = (RetailerID, Option<BranchCount>)>,
    {
        Self {
            merchants: RwLock::new(rows.into_iter().collect()),
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of writes that changed a row.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Result<HashMap<RetailerID, Option<BranchCount>>, StoreError> {
        match self.merchants.read() {
            Ok(db) => Ok(db.clone()),
            Err(_) => Err(StoreError::PoisonLock),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MerchantStore for InMemoryStore {
    async fn find_merchant(&self, id: RetailerID) -> Result<Option<MerchantRow>, StoreError> {
        match self.merchants.read() {
            Ok(db) => Ok(db.get(&id).map(|branch_count| MerchantRow {
                retailer_id: id,
                branch_count: *branch_count,
            })),
            Err(_) => Err(StoreError::PoisonLock),
        }
    }

    async fn set_branch_count(
        &self,
        id: RetailerID,
        branch_count: BranchCount,
    ) -> Result<bool, StoreError> {
        let mut db = self.merchants.write().map_err(|_| StoreError::PoisonLock)?;
        match db.get_mut(&id) {
            Some(slot) if slot.is_none() => {
                *slot = Some(branch_count);
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
