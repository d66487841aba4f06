//! Item-limits validation, used by legit mode. The tables themselves are
//! loaded by an external collaborator; rooms only ever ask one question of
//! it.

use crate::client::InvItem;
use keel::version::ItemVersion;

pub trait ItemLimits: Send + Sync {
    /// True if the item is allowed for the given item-table generation.
    fn check_item(&self, item: &InvItem, version: ItemVersion) -> bool;
}

/// Stand-in used when no limits file is configured: everything passes, so
/// legit mode degenerates to a no-op exactly like running without tables.
pub struct PermissiveLimits;

impl ItemLimits for PermissiveLimits {
    fn check_item(&self, _item: &InvItem, _version: ItemVersion) -> bool {
        true
    }
}
