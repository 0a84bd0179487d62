//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Every section and field has a default, so an empty file is valid.
//! The license key is referenced by env-var name and resolved at runtime.

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{AppId, AssetType, SteamId};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub listing: ListingConfig,
    pub matching: MatchingConfig,
    pub storage: StorageConfig,
    pub bots: Vec<BotConfig>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    /// Name of the env var holding the matching license key.
    pub license_key_env: String,
    pub timeout_secs: u64,
    /// How many times a pending announcement job is polled.
    pub poll_attempts: u32,
    pub poll_interval_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "https://asf-backend.example.net".into(),
            license_key_env: "ITEMS_MATCHER_LICENSE_KEY".into(),
            timeout_secs: 30,
            poll_attempts: 20,
            poll_interval_secs: 5,
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// License key from the environment, if set and non-empty.
    pub fn license_key(&self) -> Option<SecretString> {
        AppConfig::resolve_env(&self.license_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .map(SecretString::new)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ListingConfig {
    pub max_announcement_ttl_mins: i64,
    /// Used instead of the max TTL once new items arrived.
    pub min_announcement_ttl_mins: i64,
    pub min_heartbeat_ttl_mins: i64,
    pub min_persona_state_ttl_mins: i64,
    /// Period of the heartbeat timer.
    pub heartbeat_tick_secs: u64,
    /// A cached listing older than this is re-announced even if unchanged.
    pub max_inactivity_days: i64,
    pub max_items_count: usize,
    pub min_items_count: usize,
    pub password_change_cooldown_days: i64,
    pub authenticator_min_age_days: i64,
    /// Delay between consecutive accounts' timers at startup.
    pub stagger_secs: u64,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            max_announcement_ttl_mins: 60,
            min_announcement_ttl_mins: 5,
            min_heartbeat_ttl_mins: 10,
            min_persona_state_ttl_mins: 5,
            heartbeat_tick_secs: 60,
            max_inactivity_days: 14,
            max_items_count: 500_000,
            min_items_count: 100,
            password_change_cooldown_days: 5,
            authenticator_min_age_days: 7,
            stagger_secs: 30,
        }
    }
}

impl ListingConfig {
    pub fn announcement_ttl(&self, early: bool) -> ChronoDuration {
        ChronoDuration::minutes(if early {
            self.min_announcement_ttl_mins
        } else {
            self.max_announcement_ttl_mins
        })
    }

    pub fn min_heartbeat_ttl(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.min_heartbeat_ttl_mins)
    }

    pub fn min_persona_state_ttl(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.min_persona_state_ttl_mins)
    }

    pub fn max_inactivity(&self) -> ChronoDuration {
        ChronoDuration::days(self.max_inactivity_days)
    }

    pub fn heartbeat_tick(&self) -> Duration {
        Duration::from_secs(self.heartbeat_tick_secs)
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_secs(self.stagger_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MatchingConfig {
    /// Our own trade-hold ceiling in days.
    pub max_trade_hold_duration: u8,
    pub max_items_per_trade: usize,
    pub max_trades_per_account: usize,
    pub max_consecutive_failures: usize,
    /// Offers accumulated before a batch confirmation.
    pub confirmation_threshold: usize,
    /// Ceiling of the item pool sent for candidate discovery.
    pub max_pool_items: usize,
    /// Apps whose trading cards are never received while a trade hold applies.
    pub sales_blacklist: HashSet<AppId>,
    pub match_interval_hours: u64,
    pub initial_match_delay_mins: u64,
    /// Whether a trade leaving set progress unchanged passes the fairness gate.
    pub accept_neutral: bool,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            max_trade_hold_duration: 15,
            max_items_per_trade: 255,
            max_trades_per_account: 5,
            max_consecutive_failures: 3,
            confirmation_threshold: 5,
            max_pool_items: 500_000,
            sales_blacklist: HashSet::new(),
            match_interval_hours: 6,
            initial_match_delay_mins: 60,
            accept_neutral: true,
        }
    }
}

impl MatchingConfig {
    pub fn match_interval(&self) -> Duration {
        Duration::from_secs(self.match_interval_hours * 60 * 60)
    }

    pub fn initial_match_delay(&self) -> Duration {
        Duration::from_secs(self.initial_match_delay_mins * 60)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub cache_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(crate::storage::DEFAULT_CACHE_DIR),
        }
    }
}

/// One managed account.
#[derive(Debug, Deserialize, Clone)]
pub struct BotConfig {
    pub name: String,
    pub steam_id: SteamId,
    #[serde(default)]
    pub trade_token: Option<String>,
    #[serde(default)]
    pub matchable_types: Vec<AssetType>,
    #[serde(default)]
    pub remote_listing: bool,
    #[serde(default)]
    pub active_matching: bool,
    #[serde(default)]
    pub match_everything: bool,
    #[serde(default)]
    pub trade_blacklist: HashSet<SteamId>,
    /// Apps whose items are never offered by active matching.
    #[serde(default)]
    pub matching_app_blacklist: HashSet<AppId>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub avatar_hash: Option<String>,
    /// Inventory snapshot for the dry-run session.
    #[serde(default)]
    pub dry_run_inventory: Option<PathBuf>,
}

impl BotConfig {
    /// Configured types the listing service accepts, in stable order.
    pub fn accepted_matchable_types(&self) -> Vec<AssetType> {
        let mut types: Vec<AssetType> = self
            .matchable_types
            .iter()
            .copied()
            .filter(|asset_type| asset_type.is_matchable())
            .collect();
        types.sort();
        types.dedup();
        types
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
