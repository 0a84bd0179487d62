//! Listing projection for announcements.
//!
//! Turns an inventory snapshot into the ordered `AssetForListing`
//! records sent to the listing service, computes their checksum, trims
//! the dedup baseline out of them, and diffs two listings.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

use crate::engine::dedup::deduplicate_set;
use crate::types::{Asset, AssetId, AssetInInventory, AssetType, ClassId, InventoryState, SetKey};

/// One announced asset, positioned within the full inventory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetForListing {
    #[serde(flatten)]
    pub asset: AssetInInventory,
    /// Position of the asset in the full inventory snapshot.
    pub index: u32,
    /// AssetID of the item right before this one in the full snapshot.
    pub previous_asset_id: AssetId,
}

impl AssetForListing {
    pub fn new(asset: &Asset, index: u32, previous_asset_id: AssetId) -> Self {
        Self {
            asset: AssetInInventory::from(asset),
            index,
            previous_asset_id,
        }
    }

    pub fn set_key(&self) -> SetKey {
        SetKey::new(self.asset.real_app_id, self.asset.asset_type, self.asset.rarity)
    }

    /// Content hash the listing service recomputes on its side.
    pub fn backend_hash_code(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}-{}-{}-{}-{}",
            self.index,
            self.previous_asset_id,
            self.asset.asset_id,
            self.asset.class_id,
            self.asset.rarity,
            self.asset.real_app_id,
            self.asset.tradable,
            self.asset.asset_type,
            self.asset.amount,
        )
    }
}

/// Added/changed assets plus the removed ones, relative to the last
/// announced listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingDiff {
    pub added_or_changed: Vec<AssetForListing>,
    pub removed: Vec<AssetForListing>,
}

impl ListingDiff {
    pub fn is_empty(&self) -> bool {
        self.added_or_changed.is_empty() && self.removed.is_empty()
    }
}

/// Project `inventory` into listing records.
///
/// Index and previous AssetID follow the full snapshot order even for
/// skipped items. Unless `match_everything` is set, only sets with at
/// least one tradable representative are kept.
pub fn build_listing(
    inventory: &[Asset],
    accepted_types: &HashSet<AssetType>,
    match_everything: bool,
) -> Vec<AssetForListing> {
    let tradable_sets: Option<HashSet<SetKey>> = (!match_everything).then(|| {
        inventory
            .iter()
            .filter(|item| item.tradable && accepted_types.contains(&item.asset_type))
            .map(Asset::set_key)
            .collect()
    });

    let mut listing = Vec::new();
    let mut previous_asset_id: AssetId = 0;

    for (index, item) in inventory.iter().enumerate() {
        let accepted = accepted_types.contains(&item.asset_type)
            && tradable_sets
                .as_ref()
                .map_or(true, |sets| sets.contains(&item.set_key()));

        if accepted {
            listing.push(AssetForListing::new(item, index as u32, previous_asset_id));
        }

        previous_asset_id = item.asset_id;
    }

    listing
}

/// Stable checksum over the ordered content hashes of a listing.
pub fn checksum(listing: &[AssetForListing]) -> String {
    let text = listing
        .iter()
        .map(AssetForListing::backend_hash_code)
        .collect::<Vec<_>>()
        .join("|");

    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Per-set ClassID counts of a listing.
pub fn listing_state(listing: &[AssetForListing]) -> InventoryState {
    let mut state = InventoryState::new();

    for item in listing {
        *state
            .entry(item.set_key())
            .or_default()
            .entry(item.asset.class_id)
            .or_insert(0) += item.asset.amount;
    }

    state
}

/// Remove one complete set's worth from every set whose membership is
/// fully known.
///
/// The surplus copies kept in the listing are picked tradable-first, then
/// in inventory order; the result keeps inventory order.
pub fn deduplicate_listing(
    listing: &[AssetForListing],
    canonical: &HashMap<SetKey, HashSet<ClassId>>,
) -> Vec<AssetForListing> {
    let mut targets: HashMap<SetKey, HashMap<ClassId, u32>> = listing_state(listing)
        .iter()
        .filter_map(|(set, local)| {
            let surplus = deduplicate_set(local, canonical.get(set)?)?;
            Some((*set, surplus))
        })
        .collect();

    let mut ordered: Vec<&AssetForListing> = listing.iter().collect();
    ordered.sort_by_key(|item| (!item.asset.tradable, item.index));

    let mut kept = Vec::with_capacity(listing.len());

    for item in ordered {
        let Some(set_targets) = targets.get_mut(&item.set_key()) else {
            kept.push(item.clone());
            continue;
        };

        let Some(remaining) = set_targets.get_mut(&item.asset.class_id) else {
            continue;
        };

        let taken = (*remaining).min(item.asset.amount);

        if taken == 0 {
            continue;
        }

        *remaining -= taken;

        let mut copy = item.clone();
        copy.asset.amount = taken;
        kept.push(copy);
    }

    kept.sort_by_key(|item| item.index);
    kept
}

/// Diff `current` against the previously announced listing.
pub fn diff_listing(previous: &[AssetForListing], current: &[AssetForListing]) -> ListingDiff {
    let previous_by_id: HashMap<AssetId, &AssetForListing> =
        previous.iter().map(|item| (item.asset.asset_id, item)).collect();
    let current_ids: HashSet<AssetId> = current.iter().map(|item| item.asset.asset_id).collect();

    let added_or_changed = current
        .iter()
        .filter(|item| previous_by_id.get(&item.asset.asset_id) != Some(item))
        .cloned()
        .collect();

    let removed = previous
        .iter()
        .filter(|item| !current_ids.contains(&item.asset.asset_id))
        .cloned()
        .collect();

    ListingDiff { added_or_changed, removed }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
