use crate::db::MerchantStore;
use crate::types::{BranchCount, GatewayError, RetailerID};
use log::{info, warn};
use std::sync::Arc;

/// What `apply_branch_count` did for one record. None of these is an error.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum UpdateOutcome {
    Updated,
    /// The stored value, which was left as is.
    AlreadySet(BranchCount),
    NotFound,
    /// The row was unset at lookup but filled by someone else before the update.
    Superseded,
}

pub struct BranchCountUpdater {
    store: Arc<dyn MerchantStore>,
}

impl BranchCountUpdater {
    pub fn new(store: Arc<dyn MerchantStore>) -> Self {
        Self { store }
    }

    /// Writes `branch_count` for the retailer only if its stored count is unset.
    /// Safe to repeat: a populated count is never overwritten.
    pub async fn apply_branch_count(
        &self,
        retailer_id: RetailerID,
        branch_count: BranchCount,
    ) -> Result<UpdateOutcome, GatewayError> {
        let merchant = self
            .store
            .find_merchant(retailer_id)
            .await
            .map_err(|source| GatewayError::Lookup {
                retailer_id,
                source,
            })?;

        let Some(merchant) = merchant else {
            info!(target: "gateway", "Retailer ID {retailer_id} not found");
            return Ok(UpdateOutcome::NotFound);
        };

        if let Some(current) = merchant.branch_count {
            info!(target: "gateway", "Retailer ID {retailer_id}: branch count already set to {current}");
            return Ok(UpdateOutcome::AlreadySet(current));
        }

        let changed = self
            .store
            .set_branch_count(retailer_id, branch_count)
            .await
            .map_err(|source| GatewayError::Update {
                retailer_id,
                source,
            })?;

        if changed {
            info!(target: "gateway", "Retailer ID {retailer_id}: branch count updated to {branch_count}");
            Ok(UpdateOutcome::Updated)
        } else {
            warn!(target: "gateway", "Retailer ID {retailer_id}: branch count was filled concurrently, skipped");
            Ok(UpdateOutcome::Superseded)
        }
    }
}
