//! Shared types for the items matcher.
//!
//! These types form the data model used across all modules: assets and
//! their set keys, backend records (listed users, set parts), and the
//! error taxonomy. They are kept free of engine logic so that the
//! backend, platform, and engine modules can depend on them without
//! circular references.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

pub type AssetId = u64;
pub type ClassId = u64;
pub type AppId = u32;
pub type SteamId = u64;
pub type TradeOfferId = u64;

/// ClassID → count within one set.
pub type SetState = HashMap<ClassId, u32>;

/// Set → (ClassID → count) for a whole inventory.
pub type InventoryState = HashMap<SetKey, SetState>;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Item type as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AssetType {
    Unknown,
    BoosterPack,
    Emoticon,
    FoilTradingCard,
    ProfileBackground,
    TradingCard,
    SteamGems,
    SaleItem,
    Consumable,
}

impl AssetType {
    /// Types the listing service accepts for matching.
    pub const MATCHABLE: [AssetType; 4] = [
        AssetType::Emoticon,
        AssetType::FoilTradingCard,
        AssetType::ProfileBackground,
        AssetType::TradingCard,
    ];

    pub fn is_matchable(self) -> bool {
        Self::MATCHABLE.contains(&self)
    }

    /// Trading cards (plain and foil) are subject to the sales blacklist.
    pub fn is_trading_card(self) -> bool {
        matches!(self, AssetType::TradingCard | AssetType::FoilTradingCard)
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::str::FromStr for AssetType {
    type Err = MatcherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['_', '-', ' '], "").as_str() {
            "unknown" => Ok(AssetType::Unknown),
            "boosterpack" | "booster" => Ok(AssetType::BoosterPack),
            "emoticon" => Ok(AssetType::Emoticon),
            "foiltradingcard" | "foil" => Ok(AssetType::FoilTradingCard),
            "profilebackground" | "background" => Ok(AssetType::ProfileBackground),
            "tradingcard" | "card" => Ok(AssetType::TradingCard),
            "steamgems" | "gems" => Ok(AssetType::SteamGems),
            "saleitem" => Ok(AssetType::SaleItem),
            "consumable" => Ok(AssetType::Consumable),
            _ => Err(MatcherError::Config(format!("unknown asset type: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Rarity {
    Unknown,
    Common,
    Uncommon,
    Rare,
}

impl fmt::Display for Rarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// Asset
// ---------------------------------------------------------------------------

/// Groups ClassIDs into one matchable collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SetKey {
    pub real_app_id: AppId,
    pub asset_type: AssetType,
    pub rarity: Rarity,
}

impl SetKey {
    pub fn new(real_app_id: AppId, asset_type: AssetType, rarity: Rarity) -> Self {
        Self { real_app_id, asset_type, rarity }
    }
}

impl fmt::Display for SetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.real_app_id, self.asset_type, self.rarity)
    }
}

/// One item instance or stack in an inventory snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Asset {
    pub asset_id: AssetId,
    pub class_id: ClassId,
    pub amount: u32,
    pub real_app_id: AppId,
    pub asset_type: AssetType,
    pub rarity: Rarity,
    pub tradable: bool,
}

impl Asset {
    pub fn set_key(&self) -> SetKey {
        SetKey::new(self.real_app_id, self.asset_type, self.rarity)
    }

    /// Well-formed assets carry a real app, a class and a non-zero amount.
    pub fn is_well_formed(&self) -> bool {
        self.real_app_id != 0 && self.class_id != 0 && self.amount > 0
    }

    /// Helper to build a test asset.
    #[cfg(test)]
    pub fn sample(asset_id: AssetId, class_id: ClassId, amount: u32, tradable: bool) -> Self {
        Asset {
            asset_id,
            class_id,
            amount,
            real_app_id: 730,
            asset_type: AssetType::TradingCard,
            rarity: Rarity::Common,
            tradable,
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} #{}", self.set_key(), self.class_id, self.amount)
    }
}

// ---------------------------------------------------------------------------
// Backend records
// ---------------------------------------------------------------------------

/// Canonical membership record for one ClassID of a set, as known by the
/// listing service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SetPart {
    pub class_id: ClassId,
    pub real_app_id: AppId,
    pub asset_type: AssetType,
    pub rarity: Rarity,
}

impl SetPart {
    pub fn set_key(&self) -> SetKey {
        SetKey::new(self.real_app_id, self.asset_type, self.rarity)
    }
}

/// An asset as declared by a listed user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetInInventory {
    pub asset_id: AssetId,
    pub class_id: ClassId,
    pub amount: u32,
    pub real_app_id: AppId,
    pub asset_type: AssetType,
    pub rarity: Rarity,
    pub tradable: bool,
}

impl From<&Asset> for AssetInInventory {
    fn from(asset: &Asset) -> Self {
        Self {
            asset_id: asset.asset_id,
            class_id: asset.class_id,
            amount: asset.amount,
            real_app_id: asset.real_app_id,
            asset_type: asset.asset_type,
            rarity: asset.rarity,
            tradable: asset.tradable,
        }
    }
}

impl From<&AssetInInventory> for Asset {
    fn from(asset: &AssetInInventory) -> Self {
        Self {
            asset_id: asset.asset_id,
            class_id: asset.class_id,
            amount: asset.amount,
            real_app_id: asset.real_app_id,
            asset_type: asset.asset_type,
            rarity: asset.rarity,
            tradable: asset.tradable,
        }
    }
}

/// A candidate counterpart returned by the listing service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListedUser {
    pub steam_id: SteamId,
    pub trade_token: String,
    #[serde(default)]
    pub nickname: Option<String>,
    pub matchable_types: HashSet<AssetType>,
    pub match_everything: bool,
    pub max_trade_hold_duration: u8,
    pub total_inventory_count: u32,
    #[serde(default)]
    pub total_games_count: u16,
    pub assets: Vec<AssetInInventory>,
}

impl fmt::Display for ListedUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.nickname {
            Some(nickname) => write!(f, "{} ({nickname})", self.steam_id),
            None => write!(f, "{}", self.steam_id),
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Network-class failure talking to the backend or the platform.
///
/// Never advances a backoff timestamp; the next trigger retries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Malformed response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_decode() {
            TransportError::Decode(e.to_string())
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

/// Domain-specific error types for the matcher.
#[derive(Debug, thiserror::Error)]
pub enum MatcherError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// An accounting invariant was violated. Fatal for the current pass.
    #[error("Internal consistency fault: {0}")]
    Consistency(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MatcherError {
    pub fn consistency(message: impl Into<String>) -> Self {
        MatcherError::Consistency(message.into())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
