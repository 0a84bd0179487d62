//! Dry-run account session.
//!
//! Serves a fixed inventory snapshot from a JSON file and logs trade
//! offers instead of sending them. Every offer is reported as sent and
//! stays active until cancelled.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use super::{AccountSession, AccountStatus, TradeOfferReceipt, TradeOfferState};
use crate::types::{Asset, SteamId, TradeOfferId, TransportError};

/// On-disk snapshot consumed by the dry-run session.
#[derive(Debug, Deserialize)]
struct InventorySnapshot {
    #[serde(default)]
    status: Option<AccountStatus>,
    assets: Vec<Asset>,
}

pub struct DryRunSession {
    steam_id: SteamId,
    trade_token: Option<String>,
    status: AccountStatus,
    inventory: Vec<Asset>,
    next_offer_id: AtomicU64,
    offers: Mutex<HashMap<TradeOfferId, (SteamId, TradeOfferState)>>,
}

impl DryRunSession {
    pub fn new(steam_id: SteamId, trade_token: Option<String>, status: AccountStatus, inventory: Vec<Asset>) -> Self {
        Self {
            steam_id,
            trade_token,
            status,
            inventory,
            next_offer_id: AtomicU64::new(1),
            offers: Mutex::new(HashMap::new()),
        }
    }

    /// Load the snapshot at `path`. A snapshot without a `status` is treated
    /// as a fully eligible account.
    pub fn load(steam_id: SteamId, trade_token: Option<String>, path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read inventory snapshot {}", path.display()))?;

        let snapshot: InventorySnapshot = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse inventory snapshot {}", path.display()))?;

        let status = snapshot.status.unwrap_or(AccountStatus {
            has_mobile_authenticator: true,
            public_inventory: true,
            ..AccountStatus::default()
        });

        info!(
            steam_id,
            path = %path.display(),
            assets = snapshot.assets.len(),
            "Dry-run inventory snapshot loaded"
        );

        Ok(Self::new(steam_id, trade_token, status, snapshot.assets))
    }
}

#[async_trait]
impl AccountSession for DryRunSession {
    fn steam_id(&self) -> SteamId {
        self.steam_id
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn account_status(&self) -> Result<AccountStatus, TransportError> {
        Ok(self.status.clone())
    }

    async fn trade_token(&self) -> Result<Option<String>, TransportError> {
        Ok(self.trade_token.clone())
    }

    async fn inventory(&self) -> Result<Vec<Asset>, TransportError> {
        Ok(self.inventory.clone())
    }

    async fn combined_trade_hold(&self, _partner: SteamId, _trade_token: &str) -> Option<u8> {
        Some(0)
    }

    async fn send_trade_offer(
        &self,
        partner: SteamId,
        _trade_token: &str,
        items_to_give: &[Asset],
        items_to_receive: &[Asset],
    ) -> Result<TradeOfferReceipt, TransportError> {
        let offer_id = self.next_offer_id.fetch_add(1, Ordering::Relaxed);

        info!(
            steam_id = self.steam_id,
            partner,
            offer_id,
            give = items_to_give.iter().map(|item| item.amount).sum::<u32>(),
            receive = items_to_receive.iter().map(|item| item.amount).sum::<u32>(),
            "[DRY RUN] Would send trade offer"
        );

        self.offers.lock().insert(offer_id, (partner, TradeOfferState::Active));

        Ok(TradeOfferReceipt {
            success: true,
            offer_ids: vec![offer_id],
            mobile_confirmation_ids: Vec::new(),
        })
    }

    async fn trade_offer_state(&self, offer_id: TradeOfferId) -> Result<TradeOfferState, TransportError> {
        Ok(self
            .offers
            .lock()
            .get(&offer_id)
            .map_or(TradeOfferState::Other, |(_, state)| *state))
    }

    async fn trade_offer_partner(&self, offer_id: TradeOfferId) -> Option<SteamId> {
        self.offers.lock().get(&offer_id).map(|(partner, _)| *partner)
    }

    async fn cancel_trade_offer(&self, offer_id: TradeOfferId) -> Result<(), TransportError> {
        info!(steam_id = self.steam_id, offer_id, "[DRY RUN] Would cancel trade offer");

        if let Some((_, state)) = self.offers.lock().get_mut(&offer_id) {
            *state = TradeOfferState::Canceled;
        }

        Ok(())
    }

    async fn confirm_trade_offers(&self, offer_ids: &[TradeOfferId]) -> Result<(), TransportError> {
        info!(steam_id = self.steam_id, count = offer_ids.len(), "[DRY RUN] Would confirm trade offers");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
