//! Announcement state machine.
//!
//! Keeps one account listed on the remote listing service: decides whether
//! a trigger leads to a full announcement, a diff announcement, a plain
//! heartbeat or nothing at all, and owns the account's `BotCache`.
//!
//! Timing is expressed through `last_announcement`: a backoff simply moves
//! it into the future and parks the machine in `AnnouncerPhase::Disabled`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use reqwest::StatusCode;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::{AnnouncementDiffRequest, AnnouncementRequest, BackendResponse, Refusal};
use crate::config::ListingConfig;
use crate::engine::dedup::group_set_parts;
use crate::engine::listing::{build_listing, checksum, deduplicate_listing, diff_listing, AssetForListing};
use crate::engine::poller::{JobOutcome, JobPoller};
use crate::engine::AccountContext;
use crate::platform::AccountStatus;
use crate::storage::{BotCache, CacheWriter};
use crate::types::{AppId, AssetType, TransportError};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnnouncerPhase {
    #[default]
    Idle,
    Announcing,
    AwaitingJob,
    HeartBeating,
    Disabled {
        until: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnouncerState {
    pub phase: AnnouncerPhase,
    pub last_announcement: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_persona_request: Option<DateTime<Utc>>,
    /// New items arrived: re-announce after the short TTL.
    pub announce_earlier: bool,
    pub heartbeats_enabled: bool,
    /// Authenticated with the listing service during this process lifetime.
    pub signed_in: bool,
    pub nickname: Option<String>,
    pub avatar_hash: Option<String>,
}

/// Why an account may not be listed (or matched) right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ineligibility {
    Limited,
    Locked,
    NoMobileAuthenticator,
    NoMatchableTypes,
    RecentPasswordChange,
    RecentAuthenticator,
    PrivateInventory,
    NoTradeToken,
    TooFewItems,
    TooManyItems,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Fresh,
    MatchActive,
    Disabled,
    Disconnected,
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnounceOutcome {
    Skipped(SkipReason),
    Ineligible(Ineligibility),
    NetworkFailure,
    /// Listing unchanged since the last accepted announcement.
    Unchanged,
    /// Nothing left to list once the dedup baseline was removed.
    Empty,
    Announced { diff: bool, assets: usize },
    /// The job did not finish within the poll budget.
    Exhausted,
    BackedOff { until: DateTime<Utc> },
    /// The service lost track of our listing; cache cleared.
    Resync,
    SignInRequired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Skipped,
    Sent,
    NetworkFailure,
    ServerError(StatusCode),
    Resync,
    SignInRequired,
    BackedOff { until: DateTime<Utc> },
    /// The tick was used for a persona refresh announcement instead.
    Announced(AnnounceOutcome),
}

/// Listing eligibility of an account. `require_public_inventory` is off for
/// matching, which only needs trading to work.
pub fn check_eligibility(
    status: &AccountStatus,
    accepted_types: &[AssetType],
    config: &ListingConfig,
    now: DateTime<Utc>,
    require_public_inventory: bool,
) -> Result<(), Ineligibility> {
    if status.limited {
        return Err(Ineligibility::Limited);
    }

    if status.locked {
        return Err(Ineligibility::Locked);
    }

    if !status.has_mobile_authenticator {
        return Err(Ineligibility::NoMobileAuthenticator);
    }

    if accepted_types.is_empty() {
        return Err(Ineligibility::NoMatchableTypes);
    }

    let cooldown = ChronoDuration::days(config.password_change_cooldown_days);

    if status.last_password_change.is_some_and(|changed| now - changed < cooldown) {
        return Err(Ineligibility::RecentPasswordChange);
    }

    let min_age = ChronoDuration::days(config.authenticator_min_age_days);

    if status.authenticator_added_at.is_some_and(|added| now - added < min_age) {
        return Err(Ineligibility::RecentAuthenticator);
    }

    if require_public_inventory && !status.public_inventory {
        return Err(Ineligibility::PrivateInventory);
    }

    Ok(())
}

/// Backoff applied after a structured refusal.
pub fn backoff_for(refusal: &Refusal) -> ChronoDuration {
    match refusal.status() {
        Some(StatusCode::FORBIDDEN) => ChronoDuration::days(365),
        Some(StatusCode::TOO_MANY_REQUESTS) => ChronoDuration::days(1),
        _ => ChronoDuration::hours(6),
    }
}

fn elapsed(since: Option<DateTime<Utc>>, ttl: ChronoDuration, now: DateTime<Utc>) -> bool {
    since.map_or(true, |at| now >= at + ttl)
}

fn is_conflict(refusal: &Refusal) -> bool {
    matches!(refusal, Refusal::ClientRejected(status) if *status == StatusCode::CONFLICT)
}

// ---------------------------------------------------------------------------
// Announcer
// ---------------------------------------------------------------------------

pub struct Announcer {
    ctx: Arc<AccountContext>,
    config: ListingConfig,
    max_trade_hold_duration: u8,
    poller: JobPoller,
    state: Mutex<AnnouncerState>,
    cache: Mutex<BotCache>,
    writer: Mutex<Option<CacheWriter>>,
}

impl Announcer {
    pub fn new(
        ctx: Arc<AccountContext>,
        config: ListingConfig,
        max_trade_hold_duration: u8,
        poller: JobPoller,
        cache: BotCache,
        writer: Option<CacheWriter>,
    ) -> Self {
        let state = AnnouncerState {
            nickname: ctx.bot.nickname.clone(),
            avatar_hash: ctx.bot.avatar_hash.clone(),
            ..AnnouncerState::default()
        };

        Self {
            ctx,
            config,
            max_trade_hold_duration,
            poller,
            state: Mutex::new(state),
            cache: Mutex::new(cache),
            writer: Mutex::new(writer),
        }
    }

    pub fn state(&self) -> AnnouncerState {
        self.state.lock().clone()
    }

    pub fn cache(&self) -> BotCache {
        self.cache.lock().clone()
    }

    // -- Triggers --------------------------------------------------------

    pub fn on_new_items(&self) {
        self.state.lock().announce_earlier = true;
    }

    /// Persona refresh: remember the persona and run an announcement cycle.
    pub async fn on_persona_state(&self, nickname: Option<String>, avatar_hash: Option<String>) -> AnnounceOutcome {
        {
            let mut state = self.state.lock();
            if nickname.is_some() {
                state.nickname = nickname;
            }
            if avatar_hash.is_some() {
                state.avatar_hash = avatar_hash;
            }
        }

        self.announce().await
    }

    /// Heartbeat timer tick.
    pub async fn on_heartbeat_tick(&self) -> HeartbeatOutcome {
        if !self.ctx.session.is_connected() {
            return HeartbeatOutcome::Skipped;
        }

        let now = self.ctx.clock.now();

        let persona_due = {
            let mut state = self.state.lock();
            let due = elapsed(state.last_persona_request, self.config.min_persona_state_ttl(), now)
                && elapsed(
                    state.last_announcement,
                    self.config.announcement_ttl(state.announce_earlier),
                    now,
                );

            if due {
                state.last_persona_request = Some(now);
            }

            due
        };

        if persona_due {
            return HeartbeatOutcome::Announced(self.announce().await);
        }

        let due = {
            let state = self.state.lock();
            state.heartbeats_enabled && elapsed(state.last_heartbeat, self.config.min_heartbeat_ttl(), now)
        };

        if !due {
            return HeartbeatOutcome::Skipped;
        }

        let Ok(_permit) = self.ctx.locks.request.try_acquire() else {
            return HeartbeatOutcome::Skipped;
        };

        self.send_heartbeat(now).await
    }

    /// Full announcement cycle (also the manual trigger).
    pub async fn announce(&self) -> AnnounceOutcome {
        if let Some(reason) = self.skip_reason(self.ctx.clock.now()) {
            debug!(steam_id = self.ctx.bot.steam_id, reason = ?reason, "Announcement skipped");
            return AnnounceOutcome::Skipped(reason);
        }

        let Ok(_permit) = self.ctx.locks.request.acquire().await else {
            return AnnounceOutcome::Skipped(SkipReason::ShuttingDown);
        };

        let now = self.ctx.clock.now();

        if let Some(reason) = self.skip_reason(now) {
            debug!(steam_id = self.ctx.bot.steam_id, reason = ?reason, "Announcement skipped after lock");
            return AnnounceOutcome::Skipped(reason);
        }

        self.set_phase(AnnouncerPhase::Announcing);

        let outcome = self.announce_locked(now).await;

        {
            let mut state = self.state.lock();
            if matches!(state.phase, AnnouncerPhase::Announcing | AnnouncerPhase::AwaitingJob) {
                state.phase = AnnouncerPhase::Idle;
            }
        }

        info!(steam_id = self.ctx.bot.steam_id, outcome = ?outcome, "Announcement cycle finished");
        outcome
    }

    /// Flush the cache and stop its writer. Callers hold both account locks.
    pub async fn shutdown(&self) {
        let writer = self.writer.lock().take();

        if let Some(writer) = writer {
            writer.update(self.cache());
            writer.close().await;
        }
    }

    // -- Cycle -----------------------------------------------------------

    fn skip_reason(&self, now: DateTime<Utc>) -> Option<SkipReason> {
        if !self.ctx.session.is_connected() {
            return Some(SkipReason::Disconnected);
        }

        {
            let state = self.state.lock();

            if let AnnouncerPhase::Disabled { until } = state.phase {
                if now < until {
                    return Some(SkipReason::Disabled);
                }
            }

            let ttl = self.config.announcement_ttl(state.announce_earlier);

            if state.heartbeats_enabled && !elapsed(state.last_announcement, ttl, now) {
                return Some(SkipReason::Fresh);
            }
        }

        if self.ctx.locks.is_matching_active() {
            return Some(SkipReason::MatchActive);
        }

        None
    }

    async fn announce_locked(&self, now: DateTime<Utc>) -> AnnounceOutcome {
        let bot = &self.ctx.bot;
        let session = &self.ctx.session;
        let types = bot.accepted_matchable_types();

        let status = match session.account_status().await {
            Ok(status) => status,
            Err(e) => return self.network_failure("account status", &e),
        };

        if let Err(reason) = check_eligibility(&status, &types, &self.config, now, true) {
            return self.ineligible(reason, now);
        }

        let trade_token = match session.trade_token().await {
            Ok(Some(token)) => token,
            Ok(None) => match bot.trade_token.clone() {
                Some(token) => token,
                None => return self.ineligible(Ineligibility::NoTradeToken, now),
            },
            Err(e) => return self.network_failure("trade token", &e),
        };

        let inventory = match session.inventory().await {
            Ok(inventory) => inventory,
            Err(e) => return self.network_failure("inventory", &e),
        };

        let accepted: HashSet<AssetType> = types.iter().copied().collect();

        let tradable_count = inventory
            .iter()
            .filter(|item| item.tradable && accepted.contains(&item.asset_type))
            .count();

        if tradable_count < self.config.min_items_count {
            return self.ineligible(Ineligibility::TooFewItems, now);
        }

        let listing = build_listing(&inventory, &accepted, bot.match_everything);
        let pre_dedup_checksum = checksum(&listing);

        if self.pre_dedup_matches(&pre_dedup_checksum, &trade_token, now) {
            debug!(steam_id = bot.steam_id, "Inventory unchanged before dedup");
            return self.keep_alive(now).await;
        }

        let signed_in = self.state.lock().signed_in;

        if !signed_in {
            match self.ctx.backend.sign_in(bot.steam_id).await {
                Err(e) => return self.network_failure("sign in", &e),
                Ok(BackendResponse::Success(())) => {
                    info!(steam_id = bot.steam_id, "Signed in to listing service");
                    self.state.lock().signed_in = true;
                }
                Ok(response) => {
                    warn!(steam_id = bot.steam_id, response = ?response.refusal(), "Sign in rejected");
                    let until = self.back_off(now + ChronoDuration::days(1));
                    return AnnounceOutcome::BackedOff { until };
                }
            }
        }

        let listing = if bot.match_everything {
            listing
        } else {
            let app_ids: Vec<AppId> = listing
                .iter()
                .map(|item| item.asset.real_app_id)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();

            let parts = match self.ctx.backend.get_set_parts(bot.steam_id, &types, &app_ids).await {
                Err(e) => return self.network_failure("set parts", &e),
                Ok(BackendResponse::Success(parts)) => parts,
                Ok(response) => match response.refusal() {
                    Some(refusal) => return self.refused(refusal, now),
                    None => return self.network_failure("set parts", &TransportError::Decode("job for set parts".into())),
                },
            };

            deduplicate_listing(&listing, &group_set_parts(&parts))
        };

        if listing.len() > self.config.max_items_count {
            return self.ineligible(Ineligibility::TooManyItems, now);
        }

        if listing.is_empty() {
            {
                let mut cache = self.cache.lock();
                cache.last_announced_assets.clear();
                cache.last_pre_dedup_checksum = Some(pre_dedup_checksum);
                cache.last_request_at = Some(now);
            }
            self.persist();

            let mut state = self.state.lock();
            state.last_announcement = Some(now);
            state.announce_earlier = false;
            state.heartbeats_enabled = false;

            info!(steam_id = bot.steam_id, "Nothing left to announce after dedup");
            return AnnounceOutcome::Empty;
        }

        let final_checksum = checksum(&listing);
        let last_announced = self.cache.lock().last_announced_checksum();

        if last_announced.as_ref() == Some(&final_checksum) && self.cached_token_is(&trade_token) {
            debug!(steam_id = bot.steam_id, "Listing unchanged after dedup");
            {
                let mut cache = self.cache.lock();
                cache.last_pre_dedup_checksum = Some(pre_dedup_checksum);
                cache.last_request_at = Some(now);
            }
            self.persist();
            return self.keep_alive(now).await;
        }

        let (nickname, avatar_hash) = {
            let state = self.state.lock();
            (state.nickname.clone(), state.avatar_hash.clone())
        };

        let request = AnnouncementRequest {
            steam_id: bot.steam_id,
            trade_token: trade_token.clone(),
            nickname,
            avatar_hash,
            matchable_types: types,
            match_everything: bot.match_everything,
            max_trade_hold_duration: self.max_trade_hold_duration,
            total_inventory_count: inventory.len() as u32,
            inventory: listing.clone(),
            inventory_checksum: final_checksum,
        };

        let previous = self.cache.lock().last_announced_assets.clone();

        let (outcome, diff) = if previous.is_empty() {
            (self.submit_full(&request).await, false)
        } else {
            match self.submit_diff(&request, &previous, &listing).await {
                JobOutcome::Refused(refusal) if is_conflict(&refusal) => {
                    info!(steam_id = bot.steam_id, "Diff announcement conflicted, retrying as full announcement");
                    (self.submit_full(&request).await, false)
                }
                outcome => (outcome, true),
            }
        };

        match outcome {
            JobOutcome::Completed(()) => {
                {
                    let mut state = self.state.lock();
                    state.last_announcement = Some(now);
                    state.last_heartbeat = Some(now);
                    state.announce_earlier = false;
                    state.heartbeats_enabled = true;
                    state.phase = AnnouncerPhase::HeartBeating;
                }

                {
                    let mut cache = self.cache.lock();
                    cache.last_announced_assets = listing.clone();
                    cache.last_announced_trade_token = Some(trade_token);
                    cache.last_pre_dedup_checksum = Some(pre_dedup_checksum);
                    cache.last_request_at = Some(now);
                }
                self.persist();

                info!(steam_id = bot.steam_id, assets = listing.len(), diff, "Listing announced");
                AnnounceOutcome::Announced { diff, assets: listing.len() }
            }
            JobOutcome::NetworkFailure(e) => self.network_failure("announcement", &e),
            JobOutcome::Exhausted => AnnounceOutcome::Exhausted,
            JobOutcome::Refused(refusal) => self.refused(refusal, now),
        }
    }

    async fn submit_full(&self, request: &AnnouncementRequest) -> JobOutcome<()> {
        let backend = &self.ctx.backend;
        let steam_id = request.steam_id;

        self.set_phase(AnnouncerPhase::AwaitingJob);

        self.poller
            .run(backend.announce(request).await, |job_id| backend.poll_announcement(steam_id, job_id))
            .await
    }

    async fn submit_diff(
        &self,
        request: &AnnouncementRequest,
        previous: &[AssetForListing],
        listing: &[AssetForListing],
    ) -> JobOutcome<()> {
        let backend = &self.ctx.backend;
        let steam_id = request.steam_id;
        let diff = diff_listing(previous, listing);

        debug!(
            steam_id,
            added_or_changed = diff.added_or_changed.len(),
            removed = diff.removed.len(),
            "Announcing listing diff"
        );

        let diff_request = AnnouncementDiffRequest {
            announcement: AnnouncementRequest {
                inventory: diff.added_or_changed,
                ..request.clone()
            },
            inventory_removed: diff.removed,
            previous_inventory_checksum: checksum(previous),
        };

        self.set_phase(AnnouncerPhase::AwaitingJob);

        self.poller
            .run(backend.announce_diff(&diff_request).await, |job_id| {
                backend.poll_announcement(steam_id, job_id)
            })
            .await
    }

    // -- Heartbeat -------------------------------------------------------

    /// Send one heartbeat. Callers hold the request lock.
    async fn send_heartbeat(&self, now: DateTime<Utc>) -> HeartbeatOutcome {
        let steam_id = self.ctx.bot.steam_id;

        let response = match self.ctx.backend.heart_beat(steam_id).await {
            Ok(response) => response,
            Err(e) => {
                warn!(steam_id, error = %e, "Heartbeat failed, will retry");
                return HeartbeatOutcome::NetworkFailure;
            }
        };

        if let BackendResponse::ServerError(status) = response {
            warn!(steam_id, status = %status, "Heartbeat hit a server error, will retry");
            return HeartbeatOutcome::ServerError(status);
        }

        let Some(refusal) = response.refusal() else {
            self.state.lock().last_heartbeat = Some(now);
            debug!(steam_id, "Heartbeat sent");
            return HeartbeatOutcome::Sent;
        };

        if refusal.is_login_redirect() {
            let mut state = self.state.lock();
            state.signed_in = false;
            state.heartbeats_enabled = false;
            warn!(steam_id, "Heartbeat redirected to login");
            return HeartbeatOutcome::SignInRequired;
        }

        if is_conflict(&refusal) {
            self.cache.lock().clear();
            self.persist();

            let mut state = self.state.lock();
            state.last_announcement = None;
            state.last_heartbeat = None;
            state.heartbeats_enabled = false;
            state.phase = AnnouncerPhase::Idle;

            info!(steam_id, "Listing service asked for a fresh announcement");
            return HeartbeatOutcome::Resync;
        }

        warn!(steam_id, refusal = %refusal, "Heartbeat refused");
        let until = self.back_off(now + backoff_for(&refusal));
        HeartbeatOutcome::BackedOff { until }
    }

    // -- State transitions -----------------------------------------------

    fn set_phase(&self, phase: AnnouncerPhase) {
        self.state.lock().phase = phase;
    }

    /// Same pre-dedup listing, same token, and the service saw us recently.
    fn pre_dedup_matches(&self, checksum: &str, trade_token: &str, now: DateTime<Utc>) -> bool {
        let cache = self.cache.lock();

        cache.last_pre_dedup_checksum.as_deref() == Some(checksum)
            && cache.last_announced_trade_token.as_deref() == Some(trade_token)
            && cache
                .last_request_at
                .is_some_and(|at| now - at < self.config.max_inactivity())
    }

    fn cached_token_is(&self, trade_token: &str) -> bool {
        self.cache.lock().last_announced_trade_token.as_deref() == Some(trade_token)
    }

    /// Listing is current: make sure heartbeats flow.
    async fn keep_alive(&self, now: DateTime<Utc>) -> AnnounceOutcome {
        let was_flowing = {
            let mut state = self.state.lock();
            let was_flowing = state.heartbeats_enabled;
            state.last_announcement = Some(now);
            state.announce_earlier = false;
            state.heartbeats_enabled = true;
            state.phase = AnnouncerPhase::HeartBeating;
            was_flowing
        };

        if !was_flowing {
            self.send_heartbeat(now).await;
        }

        AnnounceOutcome::Unchanged
    }

    fn network_failure(&self, what: &str, e: &TransportError) -> AnnounceOutcome {
        warn!(steam_id = self.ctx.bot.steam_id, step = what, error = %e, "Network failure, heartbeats suspended");

        let mut state = self.state.lock();
        state.heartbeats_enabled = false;
        state.phase = AnnouncerPhase::Idle;

        AnnounceOutcome::NetworkFailure
    }

    fn ineligible(&self, reason: Ineligibility, now: DateTime<Utc>) -> AnnounceOutcome {
        info!(steam_id = self.ctx.bot.steam_id, reason = ?reason, "Account not eligible for listing");

        let mut state = self.state.lock();
        state.last_announcement = Some(now);
        state.announce_earlier = false;
        state.heartbeats_enabled = false;
        state.phase = AnnouncerPhase::Idle;

        AnnounceOutcome::Ineligible(reason)
    }

    fn refused(&self, refusal: Refusal, now: DateTime<Utc>) -> AnnounceOutcome {
        let steam_id = self.ctx.bot.steam_id;

        if refusal.is_login_redirect() {
            warn!(steam_id, "Listing service redirected to login");
            self.state.lock().signed_in = false;
            return AnnounceOutcome::SignInRequired;
        }

        if is_conflict(&refusal) {
            info!(steam_id, "Full announcement conflicted, clearing cache");

            self.cache.lock().clear();
            self.persist();

            let mut state = self.state.lock();
            state.announce_earlier = true;
            state.heartbeats_enabled = false;

            return AnnounceOutcome::Resync;
        }

        warn!(steam_id, refusal = %refusal, "Announcement refused");
        let until = self.back_off(now + backoff_for(&refusal));
        AnnounceOutcome::BackedOff { until }
    }

    fn back_off(&self, until: DateTime<Utc>) -> DateTime<Utc> {
        let mut state = self.state.lock();
        state.last_announcement = Some(until);
        state.announce_earlier = false;
        state.heartbeats_enabled = false;
        state.phase = AnnouncerPhase::Disabled { until };

        warn!(steam_id = self.ctx.bot.steam_id, until = %until, "Listing disabled until backoff expires");
        until
    }

    fn persist(&self) {
        let cache = self.cache.lock().clone();

        if let Some(writer) = self.writer.lock().as_ref() {
            writer.update(cache);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
