//! Registry of running accounts.
//!
//! Owned by the binary and passed where needed; there is no process-wide
//! instance.

use anyhow::{bail, Result};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::backend::ListingBackend;
use crate::config::{AppConfig, BotConfig};
use crate::engine::actor::{AccountActor, AccountHandle, ActorSchedule};
use crate::engine::announcer::Announcer;
use crate::engine::fairness::SetProgressFairness;
use crate::engine::matcher::Matcher;
use crate::engine::poller::JobPoller;
use crate::engine::AccountContext;
use crate::platform::{AccountSession, Clock, KeyValueStore};
use crate::storage::{cache_path, load_bot_cache, CacheWriter};
use crate::types::SteamId;

/// Collaborators one account is wired to.
pub struct AccountServices {
    pub backend: Arc<dyn ListingBackend>,
    pub session: Arc<dyn AccountSession>,
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Default)]
pub struct MatcherManager {
    accounts: HashMap<SteamId, AccountHandle>,
}

impl MatcherManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn get(&self, steam_id: SteamId) -> Option<&AccountHandle> {
        self.accounts.get(&steam_id)
    }

    pub fn steam_ids(&self) -> impl Iterator<Item = SteamId> + '_ {
        self.accounts.keys().copied()
    }

    /// Wire and spawn one account. Accounts with neither listing nor
    /// matching enabled are not started.
    pub fn start_account(&mut self, config: &AppConfig, bot: BotConfig, services: AccountServices) -> Result<bool> {
        if self.accounts.contains_key(&bot.steam_id) {
            bail!("Account {} is already running", bot.steam_id);
        }

        if !bot.remote_listing && !bot.active_matching {
            info!(bot = %bot.name, steam_id = bot.steam_id, "Listing and matching disabled, not starting");
            return Ok(false);
        }

        let steam_id = bot.steam_id;
        let position = u32::try_from(self.accounts.len()).unwrap_or(u32::MAX);

        let ctx = Arc::new(AccountContext::new(
            bot,
            services.backend,
            services.session,
            services.store,
            services.clock,
        ));

        let announcer = if ctx.bot.remote_listing {
            let path = cache_path(&config.storage.cache_dir, steam_id);
            let cache = load_bot_cache(&path)?;
            let writer = CacheWriter::spawn(path, cache.clone());

            Some(Arc::new(Announcer::new(
                Arc::clone(&ctx),
                config.listing.clone(),
                config.matching.max_trade_hold_duration,
                JobPoller::new(config.backend.poll_attempts, config.backend.poll_interval()),
                cache,
                Some(writer),
            )))
        } else {
            None
        };

        let matcher = ctx.bot.active_matching.then(|| {
            Arc::new(Matcher::new(
                Arc::clone(&ctx),
                config.matching.clone(),
                config.listing.clone(),
                Arc::new(SetProgressFairness {
                    accept_neutral: config.matching.accept_neutral,
                }),
            ))
        });

        let schedule = ActorSchedule {
            heartbeat_tick: config.listing.heartbeat_tick(),
            match_interval: config.matching.match_interval(),
            initial_match_delay: config.matching.initial_match_delay(),
            start_offset: config.listing.stagger().saturating_mul(position),
        };

        info!(
            bot = %ctx.bot.name,
            steam_id,
            listing = ctx.bot.remote_listing,
            matching = ctx.bot.active_matching,
            "Starting account"
        );

        let handle = AccountActor::new(ctx, announcer, matcher, schedule).spawn();
        self.accounts.insert(steam_id, handle);

        Ok(true)
    }

    /// Stop one account, waiting for its in-flight work.
    pub async fn stop_account(&mut self, steam_id: SteamId) -> bool {
        match self.accounts.remove(&steam_id) {
            Some(handle) => {
                handle.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Stop every account concurrently.
    pub async fn shutdown(self) {
        let count = self.accounts.len();
        join_all(self.accounts.into_values().map(AccountHandle::shutdown)).await;
        info!(accounts = count, "All accounts stopped");
    }
}
