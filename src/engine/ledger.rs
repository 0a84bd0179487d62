//! Speculative post-trade ledger.
//!
//! A match pass keeps matching against the inventory it would have if
//! every offer it sent so far were accepted. The ledger holds those
//! tentative views next to the confirmed snapshot it started from. It is
//! discarded at the end of the pass and never merged into durable state;
//! the next authoritative inventory fetch reconciles everything.

use tracing::trace;

use crate::engine::accountant::{build_divided_state, is_set_empty_for_matching, is_state_empty_for_matching};
use crate::types::{Asset, InventoryState, MatcherError, SetKey};

#[derive(Debug, Clone)]
pub struct SpeculativeLedger {
    confirmed: Vec<Asset>,
    inventory: Vec<Asset>,
    full_state: InventoryState,
    tradable_state: InventoryState,
    trades_applied: usize,
}

impl SpeculativeLedger {
    pub fn new(inventory: Vec<Asset>) -> Self {
        let (full_state, tradable_state) = build_divided_state(&inventory);

        Self {
            confirmed: inventory.clone(),
            inventory,
            full_state,
            tradable_state,
            trades_applied: 0,
        }
    }

    /// Snapshot the pass started from.
    pub fn confirmed(&self) -> &[Asset] {
        &self.confirmed
    }

    /// Inventory assuming every applied trade went through.
    pub fn inventory(&self) -> &[Asset] {
        &self.inventory
    }

    pub fn full_state(&self) -> &InventoryState {
        &self.full_state
    }

    pub fn tradable_state(&self) -> &InventoryState {
        &self.tradable_state
    }

    #[cfg(test)]
    pub fn full_set(&self, set: &SetKey) -> Option<&crate::types::SetState> {
        self.full_state.get(set)
    }

    #[cfg(test)]
    pub fn tradable_set(&self, set: &SetKey) -> Option<&crate::types::SetState> {
        self.tradable_state.get(set)
    }

    pub fn trades_applied(&self) -> usize {
        self.trades_applied
    }

    /// Record a sent offer as if accepted.
    ///
    /// Given items leave both views. Received items enter the full view
    /// only: they stay untradable until the platform says otherwise.
    pub fn apply_trade(&mut self, items_to_give: &[Asset], items_to_receive: &[Asset]) -> Result<(), MatcherError> {
        for item in items_to_give {
            let set = item.set_key();

            subtract(&mut self.full_state, &set, item)?;
            subtract(&mut self.tradable_state, &set, item)?;

            let owned = self
                .inventory
                .iter_mut()
                .find(|owned| owned.asset_id == item.asset_id && owned.amount >= item.amount)
                .ok_or_else(|| {
                    MatcherError::consistency(format!("given asset {} not in ledger", item.asset_id))
                })?;

            owned.amount -= item.amount;
        }

        self.inventory.retain(|item| item.amount > 0);

        for item in items_to_receive {
            *self
                .full_state
                .entry(item.set_key())
                .or_default()
                .entry(item.class_id)
                .or_insert(0) += item.amount;

            let mut received = item.clone();
            received.tradable = false;
            self.inventory.push(received);
        }

        self.trades_applied += 1;

        trace!(
            given = items_to_give.len(),
            received = items_to_receive.len(),
            trades = self.trades_applied,
            "Speculative trade applied"
        );

        Ok(())
    }

    pub fn is_set_empty_for_matching(&self, set: &SetKey) -> Result<bool, MatcherError> {
        match (self.full_state.get(set), self.tradable_state.get(set)) {
            (_, None) => Ok(true),
            (Some(full), Some(tradable)) => is_set_empty_for_matching(full, tradable),
            (None, Some(_)) => Err(MatcherError::consistency(format!(
                "tradable set {set} missing from full state"
            ))),
        }
    }

    pub fn is_empty_for_matching(&self) -> Result<bool, MatcherError> {
        is_state_empty_for_matching(&self.full_state, &self.tradable_state)
    }
}

fn subtract(state: &mut InventoryState, set: &SetKey, item: &Asset) -> Result<(), MatcherError> {
    let classes = state
        .get_mut(set)
        .ok_or_else(|| MatcherError::consistency(format!("given set {set} not owned")))?;

    let amount = classes.get_mut(&item.class_id).ok_or_else(|| {
        MatcherError::consistency(format!("given class {} not owned in {set}", item.class_id))
    })?;

    *amount = amount.checked_sub(item.amount).ok_or_else(|| {
        MatcherError::consistency(format!("giving more of class {} than owned", item.class_id))
    })?;

    if *amount == 0 {
        classes.remove(&item.class_id);
    }

    if classes.is_empty() {
        state.remove(set);
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
