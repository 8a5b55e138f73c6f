use crate::types::{BranchCount, RetailerID};
use serde::Deserialize;

/// One input line as it appears in the file, before narrowing.
#[derive(Deserialize, Debug)]
pub struct MerchantRecordView {
    pub retailer_id: RetailerID,
    pub branch_count: i64,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct MerchantUpdateRecord {
    pub retailer_id: RetailerID,
    pub branch_count: BranchCount,
}

impl TryFrom<MerchantRecordView> for MerchantUpdateRecord {
    type Error = i64;

    /// Fails with the raw value when the branch count does not fit in an `i32`.
    fn try_from(view: MerchantRecordView) -> Result<Self, Self::Error> {
        let branch_count =
            BranchCount::try_from(view.branch_count).map_err(|_| view.branch_count)?;
        Ok(MerchantUpdateRecord {
            retailer_id: view.retailer_id,
            branch_count,
        })
    }
}
