//! Page-addressed board operations and the change records built from them.
//!
//! Public document methods address pages by index because that is what the
//! editor works with. Recorded inverses address pages by id, so replaying
//! them later still hits the right page after remote inserts or deletes.

use serde::{Deserialize, Serialize};

use crate::model::{Asset, AssetPatch, Page, Stroke, StrokePatch};

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum BoardOp {
    /// Insert at `index`, clamped to the current page count.
    InsertPage { index: u32, page: Page },
    RemovePage { page_id: String },
    /// Insert at `index` (clamped), or append when `None`.
    InsertStroke { page_id: String, index: Option<u32>, stroke: Stroke },
    RemoveStroke { page_id: String, stroke_id: String },
    UpdateStroke { page_id: String, stroke_id: String, patch: StrokePatch },
    InsertAsset { page_id: String, index: Option<u32>, asset: Asset },
    RemoveAsset { page_id: String, asset_id: String },
    UpdateAsset { page_id: String, asset_id: String, patch: AssetPatch },
    /// Drop every page and insert `pages` in order.
    ReplacePages { pages: Vec<Page> },
}

impl BoardOp {
    /// Id of the page the operation targets, if it targets a single page.
    pub fn page_id(&self) -> Option<&str> {
        match self {
            BoardOp::InsertPage { page, .. } => Some(&page.id),
            BoardOp::RemovePage { page_id }
            | BoardOp::InsertStroke { page_id, .. }
            | BoardOp::RemoveStroke { page_id, .. }
            | BoardOp::UpdateStroke { page_id, .. }
            | BoardOp::InsertAsset { page_id, .. }
            | BoardOp::RemoveAsset { page_id, .. }
            | BoardOp::UpdateAsset { page_id, .. } => Some(page_id),
            BoardOp::ReplacePages { .. } => None,
        }
    }
}

/// Emitted after every committed page transaction that changed something.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeRecord {
    /// Origin tag the transaction was opened with.
    pub origin: Option<String>,
    /// Operations that revert the transaction, in application order.
    pub inverse: Vec<BoardOp>,
}

impl ChangeRecord {
    pub fn has_origin(&self, origin: &str) -> bool {
        self.origin.as_deref() == Some(origin)
    }

    /// True for whole-board resets such as hydration.
    pub fn replaces_pages(&self) -> bool {
        self.inverse.iter().any(|op| matches!(op, BoardOp::ReplacePages { .. }))
    }
}
