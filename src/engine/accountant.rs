//! Accountant: multiset views of an inventory.
//!
//! Builds per-set ClassID counts (full and tradable), selects concrete
//! assets for requested amounts, and answers whether a set still has
//! anything to offer in a swap.

use rand::seq::SliceRandom;
use std::collections::HashMap;

use crate::types::{Asset, ClassId, InventoryState, MatcherError, SetKey, SetState};

// ---------------------------------------------------------------------------
// State builders
// ---------------------------------------------------------------------------

/// Build the full and the tradable state of an inventory in a single pass.
///
/// Tradable counts are always a subset of the full counts for the same
/// set and ClassID.
pub fn build_divided_state(inventory: &[Asset]) -> (InventoryState, InventoryState) {
    let mut full_state = InventoryState::new();
    let mut tradable_state = InventoryState::new();

    for item in inventory {
        let key = item.set_key();

        *full_state
            .entry(key)
            .or_default()
            .entry(item.class_id)
            .or_insert(0) += item.amount;

        if !item.tradable {
            continue;
        }

        *tradable_state
            .entry(key)
            .or_default()
            .entry(item.class_id)
            .or_insert(0) += item.amount;
    }

    (full_state, tradable_state)
}

/// Build only the tradable state of an inventory.
pub fn build_tradable_state(inventory: &[Asset]) -> InventoryState {
    let mut tradable_state = InventoryState::new();

    for item in inventory.iter().filter(|item| item.tradable) {
        *tradable_state
            .entry(item.set_key())
            .or_default()
            .entry(item.class_id)
            .or_insert(0) += item.amount;
    }

    tradable_state
}

/// Per-set counts sorted ascending, used for set-progress comparisons.
pub fn inventory_sets(inventory: &[Asset]) -> HashMap<SetKey, Vec<u32>> {
    let (full_state, _) = build_divided_state(inventory);

    full_state
        .into_iter()
        .map(|(set, state)| {
            let mut amounts: Vec<u32> = state.into_values().collect();
            amounts.sort_unstable();
            (set, amounts)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Select concrete assets from `inventory` that exactly satisfy `targets`.
///
/// Candidates are consumed in the given order (or shuffled when
/// `randomize` is set). A stack larger than what is still needed is
/// cloned with a reduced amount. Targets that cannot be satisfied from
/// this inventory are an internal-consistency fault.
pub fn extract_items_for_targets(
    inventory: &[Asset],
    targets: &HashMap<ClassId, u32>,
    randomize: bool,
) -> Result<Vec<Asset>, MatcherError> {
    let mut remaining: HashMap<ClassId, u32> = targets
        .iter()
        .filter(|(_, &amount)| amount > 0)
        .map(|(&class_id, &amount)| (class_id, amount))
        .collect();

    let mut result = Vec::new();

    if remaining.is_empty() {
        return Ok(result);
    }

    let mut candidates: Vec<&Asset> = inventory
        .iter()
        .filter(|item| remaining.contains_key(&item.class_id))
        .collect();

    // Spreads concurrent passes over different instances of the same class
    if randomize {
        candidates.shuffle(&mut rand::thread_rng());
    }

    for item in candidates {
        let Some(&amount) = remaining.get(&item.class_id) else {
            continue;
        };

        if amount >= item.amount {
            result.push(item.clone());

            if amount > item.amount {
                remaining.insert(item.class_id, amount - item.amount);
                continue;
            }
        } else {
            let mut partial = item.clone();
            partial.amount = amount;
            result.push(partial);
        }

        remaining.remove(&item.class_id);

        if remaining.is_empty() {
            return Ok(result);
        }
    }

    Err(MatcherError::consistency(format!(
        "inventory cannot satisfy targets, missing {} class(es)",
        remaining.len()
    )))
}

// ---------------------------------------------------------------------------
// Matchability
// ---------------------------------------------------------------------------

/// Whether a single set has nothing left that could be swapped.
///
/// A tradable ClassID with two or more copies is always matchable. A
/// single tradable copy is matchable only when another copy of the same
/// class exists somewhere untradable.
pub fn is_set_empty_for_matching(
    full_set: &SetState,
    tradable_set: &SetState,
) -> Result<bool, MatcherError> {
    for (class_id, &amount) in tradable_set {
        match amount {
            0 => {
                return Err(MatcherError::consistency(format!(
                    "tradable count of class {class_id} is zero"
                )));
            }
            1 => {
                let full_amount = full_set.get(class_id).copied().unwrap_or(0);

                if full_amount == 0 {
                    return Err(MatcherError::consistency(format!(
                        "tradable class {class_id} missing from full state"
                    )));
                }

                if full_amount > 1 {
                    return Ok(false);
                }
            }
            _ => return Ok(false),
        }
    }

    Ok(true)
}

/// Whether no set of the inventory is matchable anymore.
pub fn is_state_empty_for_matching(
    full_state: &InventoryState,
    tradable_state: &InventoryState,
) -> Result<bool, MatcherError> {
    for (set, tradable_set) in tradable_state {
        let full_set = full_state
            .get(set)
            .filter(|full_set| !full_set.is_empty())
            .ok_or_else(|| MatcherError::consistency(format!("tradable set {set} missing from full state")))?;

        if !is_set_empty_for_matching(full_set, tradable_set)? {
            return Ok(false);
        }
    }

    Ok(true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
