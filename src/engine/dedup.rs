//! Deduplication against the listing service's set membership.
//!
//! One complete set's worth of every fully-known set is never surplus:
//! it is what the account keeps. Stripping it leaves only the copies
//! worth announcing or trading.

use std::collections::{HashMap, HashSet};
use tracing::trace;

use crate::types::{ClassId, InventoryState, SetKey, SetPart, SetState};

/// Fold set part records into Set → canonical ClassIDs.
pub fn group_set_parts(parts: &[SetPart]) -> HashMap<SetKey, HashSet<ClassId>> {
    let mut sets: HashMap<SetKey, HashSet<ClassId>> = HashMap::new();

    for part in parts {
        sets.entry(part.set_key()).or_default().insert(part.class_id);
    }

    sets
}

/// Whether the local ClassIDs are exactly the canonical membership.
pub fn membership_matches(local: &SetState, canonical: &HashSet<ClassId>) -> bool {
    local.len() == canonical.len() && local.keys().all(|class_id| canonical.contains(class_id))
}

/// Strip one complete set from `local` if its membership is fully known.
///
/// Returns `None` when the set is ineligible (unknown completeness means
/// unknown redundancy), otherwise the surplus with zero counts dropped.
pub fn deduplicate_set(local: &SetState, canonical: &HashSet<ClassId>) -> Option<SetState> {
    if local.is_empty() || !membership_matches(local, canonical) {
        return None;
    }

    let minimum = local.values().copied().min()?;

    Some(
        local
            .iter()
            .filter(|(_, &amount)| amount > minimum)
            .map(|(&class_id, &amount)| (class_id, amount - minimum))
            .collect(),
    )
}

/// Deduplicate every eligible set of `state`, leaving the others as-is.
///
/// Sets reduced to nothing are removed.
pub fn deduplicate_state(
    state: &InventoryState,
    canonical: &HashMap<SetKey, HashSet<ClassId>>,
) -> InventoryState {
    let mut result = InventoryState::with_capacity(state.len());

    for (set, local) in state {
        let reduced = canonical
            .get(set)
            .and_then(|classes| deduplicate_set(local, classes));

        match reduced {
            Some(surplus) => {
                trace!(set = %set, before = local.len(), after = surplus.len(), "Set deduplicated");

                if !surplus.is_empty() {
                    result.insert(*set, surplus);
                }
            }
            None => {
                result.insert(*set, local.clone());
            }
        }
    }

    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
