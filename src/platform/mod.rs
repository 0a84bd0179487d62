//! Platform collaborators.
//!
//! The engine never talks to the gaming platform directly. Everything it
//! needs from an account session (inventory, trade offers, confirmations)
//! goes through `AccountSession`; durable per-account values go through
//! `KeyValueStore`; wall-clock reads go through `Clock`.

pub mod dry_run;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Asset, MatcherError, SteamId, TradeOfferId, TransportError};

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Account facts that decide listing and matching eligibility.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStatus {
    pub limited: bool,
    pub locked: bool,
    pub has_mobile_authenticator: bool,
    #[serde(default)]
    pub last_password_change: Option<DateTime<Utc>>,
    #[serde(default)]
    pub authenticator_added_at: Option<DateTime<Utc>>,
    pub public_inventory: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TradeOfferReceipt {
    pub success: bool,
    pub offer_ids: Vec<TradeOfferId>,
    /// Offers still waiting for a second-factor confirmation.
    pub mobile_confirmation_ids: Vec<TradeOfferId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeOfferState {
    Active,
    Accepted,
    Declined,
    Canceled,
    Expired,
    /// Offer not found or in a state the engine does not act on.
    Other,
}

/// Live session of one account on the gaming platform.
#[async_trait]
pub trait AccountSession: Send + Sync {
    fn steam_id(&self) -> SteamId;

    fn is_connected(&self) -> bool;

    async fn account_status(&self) -> Result<AccountStatus, TransportError>;

    async fn trade_token(&self) -> Result<Option<String>, TransportError>;

    async fn inventory(&self) -> Result<Vec<Asset>, TransportError>;

    /// Combined trade hold in days with `partner`; `None` when unknown.
    async fn combined_trade_hold(&self, partner: SteamId, trade_token: &str) -> Option<u8>;

    async fn send_trade_offer(
        &self,
        partner: SteamId,
        trade_token: &str,
        items_to_give: &[Asset],
        items_to_receive: &[Asset],
    ) -> Result<TradeOfferReceipt, TransportError>;

    async fn trade_offer_state(&self, offer_id: TradeOfferId) -> Result<TradeOfferState, TransportError>;

    /// Partner of a still-known offer.
    async fn trade_offer_partner(&self, offer_id: TradeOfferId) -> Option<SteamId>;

    async fn cancel_trade_offer(&self, offer_id: TradeOfferId) -> Result<(), TransportError>;

    async fn confirm_trade_offers(&self, offer_ids: &[TradeOfferId]) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// Durable key/value storage
// ---------------------------------------------------------------------------

/// Durable per-account JSON values.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>, MatcherError>;

    async fn set_json(&self, key: &str, value: Option<serde_json::Value>) -> Result<(), MatcherError>;
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
