//! Trade fairness predicates.
//!
//! `is_fair_exchange` guards every submitted offer. The neutral-or-better
//! test gates each tentative pairing of the matching loop and sits behind
//! the `FairnessPolicy` trait so that its tie handling can be swapped.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::engine::accountant::inventory_sets;
use crate::types::{Asset, MatcherError, SetKey};

/// How a trade changes set progress for the side evaluating it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeVerdict {
    Worse,
    Neutral,
    Better,
}

/// Decides whether a trade is acceptable from the perspective of the
/// owner of `inventory`.
#[cfg_attr(test, mockall::automock)]
pub trait FairnessPolicy: Send + Sync {
    fn is_neutral_or_better(
        &self,
        inventory: &[Asset],
        items_to_give: &[Asset],
        items_to_receive: &[Asset],
    ) -> Result<bool, MatcherError>;
}

/// Set-progress fairness: a trade must never reduce the number of
/// distinct classes held in a set, never reduce the number of complete
/// sets, and never lose progress at any rank of the sorted counts.
#[derive(Debug, Clone)]
pub struct SetProgressFairness {
    /// Whether a trade that leaves progress exactly unchanged is accepted.
    pub accept_neutral: bool,
}

impl Default for SetProgressFairness {
    fn default() -> Self {
        Self { accept_neutral: true }
    }
}

impl FairnessPolicy for SetProgressFairness {
    fn is_neutral_or_better(
        &self,
        inventory: &[Asset],
        items_to_give: &[Asset],
        items_to_receive: &[Asset],
    ) -> Result<bool, MatcherError> {
        Ok(match evaluate_trade(inventory, items_to_give, items_to_receive)? {
            TradeVerdict::Better => true,
            TradeVerdict::Neutral => self.accept_neutral,
            TradeVerdict::Worse => false,
        })
    }
}

/// Compare set progress of `inventory` before and after the trade.
pub fn evaluate_trade(
    inventory: &[Asset],
    items_to_give: &[Asset],
    items_to_receive: &[Asset],
) -> Result<TradeVerdict, MatcherError> {
    let initial_sets = inventory_sets(inventory);

    let mut after: Vec<Asset> = inventory.to_vec();

    for item_to_give in items_to_give {
        let mut amount_to_give = item_to_give.amount;

        for item in after.iter_mut().filter(|item| item.class_id == item_to_give.class_id) {
            let taken = amount_to_give.min(item.amount);
            item.amount -= taken;
            amount_to_give -= taken;

            if amount_to_give == 0 {
                break;
            }
        }

        if amount_to_give > 0 {
            return Err(MatcherError::consistency(format!(
                "giving {} more of class {} than owned",
                amount_to_give, item_to_give.class_id
            )));
        }
    }

    after.retain(|item| item.amount > 0);
    after.extend(items_to_receive.iter().cloned());

    let final_sets = inventory_sets(&after);

    let mut verdict = TradeVerdict::Neutral;

    for (set, before) in &initial_sets {
        match compare_set(final_sets.get(set), before) {
            TradeVerdict::Worse => return Ok(TradeVerdict::Worse),
            TradeVerdict::Better => verdict = TradeVerdict::Better,
            TradeVerdict::Neutral => {}
        }
    }

    if final_sets.keys().any(|set| !initial_sets.contains_key(set)) {
        verdict = TradeVerdict::Better;
    }

    Ok(verdict)
}

fn compare_set(after: Option<&Vec<u32>>, before: &[u32]) -> TradeVerdict {
    let Some(after) = after else {
        return TradeVerdict::Worse;
    };

    // Fewer distinct classes: 1 1 -> 0 2
    match after.len().cmp(&before.len()) {
        Ordering::Less => return TradeVerdict::Worse,
        Ordering::Greater => return TradeVerdict::Better,
        Ordering::Equal => {}
    }

    // Fewer complete sets: 2 2 2 -> 1 2 3
    match after[0].cmp(&before[0]) {
        Ordering::Less => return TradeVerdict::Worse,
        Ordering::Greater => return TradeVerdict::Better,
        Ordering::Equal => {}
    }

    // Progress may never dip below zero at any rank, even if it recovers later
    let mut neutrality: i64 = 0;
    let mut changed = false;

    for (a, b) in after.iter().zip(before) {
        neutrality += i64::from(*a) - i64::from(*b);
        changed |= a != b;

        if neutrality < 0 {
            return TradeVerdict::Worse;
        }
    }

    if changed {
        TradeVerdict::Better
    } else {
        TradeVerdict::Neutral
    }
}

/// Every set given must be matched by at least as many items received
/// from the same set.
pub fn is_fair_exchange(items_to_give: &[Asset], items_to_receive: &[Asset]) -> bool {
    let give = amounts_per_set(items_to_give);
    let receive = amounts_per_set(items_to_receive);

    give.iter()
        .all(|(set, amount)| receive.get(set).is_some_and(|received| amount <= received))
}

fn amounts_per_set(items: &[Asset]) -> HashMap<SetKey, u32> {
    let mut amounts = HashMap::new();

    for item in items {
        *amounts.entry(item.set_key()).or_insert(0) += item.amount;
    }

    amounts
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
