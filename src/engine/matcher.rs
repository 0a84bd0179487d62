//! Active matching pass.
//!
//! Pulls ranked candidates from the listing service and sends them
//! one-for-one swaps that improve our set progress without hurting theirs.
//! The pass works on a `SpeculativeLedger`: every offer sent is assumed
//! accepted for the rest of the pass.

use serde_json::json;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{BackendResponse, Refusal};
use crate::config::{ListingConfig, MatchingConfig};
use crate::engine::accountant::{build_divided_state, build_tradable_state, extract_items_for_targets, is_set_empty_for_matching};
use crate::engine::announcer::{check_eligibility, Ineligibility};
use crate::engine::dedup::{deduplicate_set, group_set_parts, membership_matches};
use crate::engine::fairness::{is_fair_exchange, FairnessPolicy};
use crate::engine::ledger::SpeculativeLedger;
use crate::engine::AccountContext;
use crate::platform::TradeOfferState;
use crate::types::{
    AppId, Asset, AssetType, ClassId, InventoryState, ListedUser, MatcherError, SetKey, SetState, SteamId,
    TradeOfferId,
};

/// Key of the pending actively-matched trade offers in the account store.
pub const PENDING_OFFERS_KEY: &str = "match_actively_trade_offer_ids";

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchReport {
    pub candidates: usize,
    pub trades_sent: usize,
    pub matched_sets: usize,
    pub failures: usize,
    pub offer_ids: Vec<TradeOfferId>,
    /// A confirmation batch failed and the pass stopped early.
    pub confirmation_failed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchSkip {
    AlreadyRunning,
    Disconnected,
    MatchEverything,
    Ineligible(Ineligibility),
    NoLicense,
    NothingToMatch,
    PoolTooLarge(usize),
    NoCandidates,
    NetworkFailure,
    Refused(Refusal),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Skipped(MatchSkip),
    Completed(MatchReport),
}

// ---------------------------------------------------------------------------
// Greedy trade planning
// ---------------------------------------------------------------------------

/// Class amounts one trade gives and receives, and the sets it touches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TradePlan {
    pub give: HashMap<ClassId, u32>,
    pub receive: HashMap<ClassId, u32>,
    pub sets: HashSet<SetKey>,
    pub items: usize,
}

impl TradePlan {
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

/// Fairness bookkeeping for one trade, evaluated from the counterpart's side.
struct FairnessRound<'a> {
    policy: &'a dyn FairnessPolicy,
    our_items: &'a [Asset],
    their_items: &'a [Asset],
    give: HashMap<ClassId, u32>,
    receive: HashMap<ClassId, u32>,
}

impl FairnessRound<'_> {
    /// Tentatively add one `our_item` ↔ `their_item` swap; undone when the
    /// counterpart would end up worse.
    fn try_accept(
        &mut self,
        set: SetKey,
        sets_this_trade: &HashSet<SetKey>,
        our_item: ClassId,
        their_item: ClassId,
    ) -> Result<bool, MatcherError> {
        *self.give.entry(our_item).or_insert(0) += 1;
        *self.receive.entry(their_item).or_insert(0) += 1;

        let relevant = |item: &&Asset| item.set_key() == set || sets_this_trade.contains(&item.set_key());

        let their_filtered: Vec<Asset> = self.their_items.iter().filter(relevant).cloned().collect();
        let our_filtered: Vec<Asset> = self.our_items.iter().filter(relevant).cloned().collect();

        let their_tradable: Vec<Asset> = their_filtered.iter().filter(|item| item.tradable).cloned().collect();

        let items_to_give = extract_items_for_targets(&our_filtered, &self.give, false)?;
        let items_to_receive = extract_items_for_targets(&their_tradable, &self.receive, false)?;

        // They give what we receive
        if self.policy.is_neutral_or_better(&their_filtered, &items_to_receive, &items_to_give)? {
            return Ok(true);
        }

        decrement(&mut self.give, our_item);
        decrement(&mut self.receive, their_item);

        Ok(false)
    }
}

fn decrement(amounts: &mut HashMap<ClassId, u32>, class_id: ClassId) {
    if let Some(amount) = amounts.get_mut(&class_id) {
        *amount -= 1;

        if *amount == 0 {
            amounts.remove(&class_id);
        }
    }
}

fn increment(amounts: &mut HashMap<ClassId, u32>, class_id: ClassId) {
    *amounts.entry(class_id).or_insert(0) += 1;
}

/// Inputs of one greedy planning round against one counterpart.
pub struct PlanInput<'a> {
    pub our_full: &'a InventoryState,
    pub our_tradable: &'a InventoryState,
    /// Our tradable assets, used for the fairness re-evaluation.
    pub our_items: &'a [Asset],
    pub their_items: &'a [Asset],
    pub their_types: &'a HashSet<AssetType>,
    pub skip_sets: &'a HashSet<SetKey>,
    /// `None` skips the fairness gate (counterpart matches everything).
    pub fairness: Option<&'a dyn FairnessPolicy>,
    pub max_items_per_trade: usize,
}

/// Assemble one trade greedily.
///
/// Per set, repeatedly pair our class with the highest count against the
/// counterpart class we hold least of, as long as the swap does not worsen
/// our duplicate margin. `their_tradable` is consumed as items get paired.
/// Ties are broken by ClassID so the plan is deterministic.
pub fn plan_trade(input: &PlanInput<'_>, their_tradable: &mut InventoryState) -> Result<TradePlan, MatcherError> {
    let mut plan = TradePlan::default();
    let cap = input.max_items_per_trade.saturating_sub(1);

    let mut fairness = input.fairness.map(|policy| FairnessRound {
        policy,
        our_items: input.our_items,
        their_items: input.their_items,
        give: HashMap::new(),
        receive: HashMap::new(),
    });

    let mut sets: Vec<SetKey> = input
        .our_full
        .iter()
        .filter(|(set, classes)| {
            !input.skip_sets.contains(*set)
                && input.their_types.contains(&set.asset_type)
                && classes.values().any(|&amount| amount > 1)
        })
        .map(|(set, _)| *set)
        .collect();
    sets.sort();

    for set in sets {
        let Some(our_full_items) = input.our_full.get(&set) else {
            continue;
        };

        let Some(our_tradable_items) = input.our_tradable.get(&set).filter(|items| !items.is_empty()) else {
            continue;
        };

        let Some(their_items) = their_tradable.get_mut(&set).filter(|items| !items.is_empty()) else {
            continue;
        };

        if is_set_empty_for_matching(our_full_items, our_tradable_items)? {
            continue;
        }

        let mut our_full_set: SetState = our_full_items.clone();
        let mut our_tradable_set: SetState = our_tradable_items.clone();

        while plan.items < cap {
            let Some((our_item, their_item)) = find_pairing(
                set,
                &our_full_set,
                &our_tradable_set,
                their_items,
                fairness.as_mut(),
                &plan.sets,
            )?
            else {
                break;
            };

            plan.sets.insert(set);

            increment(&mut plan.give, our_item);
            decrement(&mut our_full_set, our_item);
            decrement(&mut our_tradable_set, our_item);

            increment(&mut plan.receive, their_item);
            increment(&mut our_full_set, their_item);

            decrement(their_items, their_item);

            plan.items += 2;

            trace!(set = %set, give = our_item, receive = their_item, "Pairing accepted");
        }

        if plan.items >= cap {
            break;
        }
    }

    Ok(plan)
}

fn find_pairing(
    set: SetKey,
    our_full_set: &SetState,
    our_tradable_set: &SetState,
    their_items: &SetState,
    mut fairness: Option<&mut FairnessRound<'_>>,
    sets_this_trade: &HashSet<SetKey>,
) -> Result<Option<(ClassId, ClassId)>, MatcherError> {
    let mut ours: Vec<(ClassId, u32)> = our_full_set
        .iter()
        .filter(|(_, &amount)| amount > 1)
        .map(|(&class_id, &amount)| (class_id, amount))
        .collect();
    ours.sort_by_key(|&(class_id, amount)| (Reverse(amount), class_id));

    let our_amount = |class_id: ClassId| our_full_set.get(&class_id).copied().unwrap_or(0);

    let mut theirs: Vec<ClassId> = their_items
        .iter()
        .filter(|(_, &amount)| amount > 0)
        .map(|(&class_id, _)| class_id)
        .collect();
    theirs.sort_by_key(|&class_id| (our_amount(class_id), class_id));

    for (our_item, our_full_amount) in ours {
        if our_tradable_set.get(&our_item).copied().unwrap_or(0) == 0 {
            continue;
        }

        for &their_item in &theirs {
            // The swap must not worsen our margin
            if our_full_amount <= our_amount(their_item) + 1 {
                continue;
            }

            if let Some(round) = fairness.as_deref_mut() {
                if !round.try_accept(set, sets_this_trade, our_item, their_item)? {
                    continue;
                }
            }

            return Ok(Some((our_item, their_item)));
        }
    }

    Ok(None)
}

// ---------------------------------------------------------------------------
// Pool preparation
// ---------------------------------------------------------------------------

/// Reduce our inventory to the sets worth matching and the concrete pool
/// announced to the listing service for candidate discovery.
///
/// Sets without any duplicate are dropped. Sets whose membership is known
/// lose their dedup baseline and are dropped when the spread between the
/// most and least held class is below two; other sets are dropped when no
/// class is held twice.
pub fn prepare_pool(
    inventory: &[Asset],
    canonical: &HashMap<SetKey, HashSet<ClassId>>,
) -> Result<(Vec<Asset>, Vec<Asset>), MatcherError> {
    let (full_state, _) = build_divided_state(inventory);

    let mut kept_sets = HashSet::new();
    let mut targets: HashMap<ClassId, u32> = HashMap::new();

    for (set, classes) in &full_state {
        let max = classes.values().copied().max().unwrap_or(0);
        let min = classes.values().copied().min().unwrap_or(0);

        if max < 2 {
            continue;
        }

        let reduced = match canonical.get(set) {
            Some(members) if membership_matches(classes, members) => {
                if max - min < 2 {
                    continue;
                }

                deduplicate_set(classes, members).unwrap_or_default()
            }
            _ => classes.clone(),
        };

        kept_sets.insert(*set);

        for (class_id, amount) in reduced {
            *targets.entry(class_id).or_insert(0) += amount;
        }
    }

    let mut candidates: Vec<Asset> = inventory
        .iter()
        .filter(|item| kept_sets.contains(&item.set_key()))
        .cloned()
        .collect();

    // Tradable copies first
    candidates.sort_by_key(|item| !item.tradable);

    let pool = extract_items_for_targets(&candidates, &targets, false)?;

    let mut kept: Vec<Asset> = inventory
        .iter()
        .filter(|item| kept_sets.contains(&item.set_key()))
        .cloned()
        .collect();
    kept.sort_by_key(|item| item.asset_id);

    Ok((kept, pool))
}

/// Rank candidates: not recently stuck with us, owning several games,
/// matching everything, smallest inventory first.
pub fn rank_candidates(
    candidates: Vec<ListedUser>,
    own_steam_id: SteamId,
    own_types: &HashSet<AssetType>,
    blacklist: &HashSet<SteamId>,
    deprioritized: &HashSet<SteamId>,
) -> Vec<ListedUser> {
    let mut ranked: Vec<ListedUser> = candidates
        .into_iter()
        .filter(|user| {
            user.steam_id != own_steam_id
                && !blacklist.contains(&user.steam_id)
                && user.matchable_types.iter().any(|asset_type| own_types.contains(asset_type))
        })
        .collect();

    ranked.sort_by_key(|user| {
        (
            deprioritized.contains(&user.steam_id),
            user.total_games_count <= 1,
            !user.match_everything,
            user.total_inventory_count,
            user.steam_id,
        )
    });

    ranked
}

fn sum_amounts(items: &[Asset]) -> u64 {
    items.iter().map(|item| u64::from(item.amount)).sum()
}

fn remove_items(inventory: &mut Vec<Asset>, taken: &[Asset]) {
    for item in taken {
        if let Some(owned) = inventory
            .iter_mut()
            .find(|owned| owned.asset_id == item.asset_id && owned.amount >= item.amount)
        {
            owned.amount -= item.amount;
        }
    }

    inventory.retain(|item| item.amount > 0);
}

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

pub struct Matcher {
    ctx: Arc<AccountContext>,
    config: MatchingConfig,
    listing: ListingConfig,
    fairness: Arc<dyn FairnessPolicy>,
}

impl Matcher {
    pub fn new(
        ctx: Arc<AccountContext>,
        config: MatchingConfig,
        listing: ListingConfig,
        fairness: Arc<dyn FairnessPolicy>,
    ) -> Self {
        Self {
            ctx,
            config,
            listing,
            fairness,
        }
    }

    /// Run one match pass unless one is already running.
    pub async fn run(&self) -> Result<MatchOutcome, MatcherError> {
        let Some(_permit) = self.ctx.locks.try_begin_match() else {
            debug!(steam_id = self.ctx.bot.steam_id, "Match pass already running, trigger dropped");
            return Ok(MatchOutcome::Skipped(MatchSkip::AlreadyRunning));
        };

        let outcome = self.run_locked().await;

        match &outcome {
            Ok(MatchOutcome::Completed(report)) => info!(
                steam_id = self.ctx.bot.steam_id,
                candidates = report.candidates,
                trades = report.trades_sent,
                matched_sets = report.matched_sets,
                failures = report.failures,
                confirmation_failed = report.confirmation_failed,
                "Match pass finished"
            ),
            Ok(MatchOutcome::Skipped(reason)) => {
                info!(steam_id = self.ctx.bot.steam_id, reason = ?reason, "Match pass skipped")
            }
            Err(e) => error!(steam_id = self.ctx.bot.steam_id, error = %e, "Match pass aborted"),
        }

        outcome
    }

    async fn run_locked(&self) -> Result<MatchOutcome, MatcherError> {
        let bot = &self.ctx.bot;
        let session = &self.ctx.session;
        let backend = &self.ctx.backend;

        if !session.is_connected() {
            return Ok(MatchOutcome::Skipped(MatchSkip::Disconnected));
        }

        if bot.match_everything {
            return Ok(MatchOutcome::Skipped(MatchSkip::MatchEverything));
        }

        let types = bot.accepted_matchable_types();
        let now = self.ctx.clock.now();

        let Ok(status) = session.account_status().await else {
            return Ok(MatchOutcome::Skipped(MatchSkip::NetworkFailure));
        };

        if let Err(reason) = check_eligibility(&status, &types, &self.listing, now, false) {
            return Ok(MatchOutcome::Skipped(MatchSkip::Ineligible(reason)));
        }

        match backend.get_license_status().await {
            Ok(BackendResponse::Success(license)) if license.active => {}
            Ok(BackendResponse::Success(_)) => return Ok(MatchOutcome::Skipped(MatchSkip::NoLicense)),
            Ok(response) => {
                return Ok(MatchOutcome::Skipped(
                    response.refusal().map_or(MatchSkip::NoLicense, MatchSkip::Refused),
                ))
            }
            Err(e) => {
                warn!(steam_id = bot.steam_id, error = %e, "License check failed");
                return Ok(MatchOutcome::Skipped(MatchSkip::NetworkFailure));
            }
        }

        let trade_token = match session.trade_token().await {
            Ok(Some(token)) => token,
            Ok(None) => match bot.trade_token.clone() {
                Some(token) => token,
                None => return Ok(MatchOutcome::Skipped(MatchSkip::Ineligible(Ineligibility::NoTradeToken))),
            },
            Err(_) => return Ok(MatchOutcome::Skipped(MatchSkip::NetworkFailure)),
        };

        // 1. Snapshot
        let own_types: HashSet<AssetType> = types.iter().copied().collect();

        let Ok(inventory) = session.inventory().await else {
            return Ok(MatchOutcome::Skipped(MatchSkip::NetworkFailure));
        };

        let inventory: Vec<Asset> = inventory
            .into_iter()
            .filter(|item| {
                own_types.contains(&item.asset_type)
                    && item.is_well_formed()
                    && !bot.matching_app_blacklist.contains(&item.real_app_id)
            })
            .collect();

        // 2. Sets with at least one duplicate
        let (full_state, _) = build_divided_state(&inventory);

        let candidate_sets: HashSet<SetKey> = full_state
            .iter()
            .filter(|(_, classes)| classes.values().any(|&amount| amount > 1))
            .map(|(set, _)| *set)
            .collect();

        if candidate_sets.is_empty() {
            return Ok(MatchOutcome::Skipped(MatchSkip::NothingToMatch));
        }

        // 3. Dedup against canonical membership
        let mut app_ids: Vec<AppId> = candidate_sets.iter().map(|set| set.real_app_id).collect();
        app_ids.sort_unstable();
        app_ids.dedup();

        let parts = match backend.get_set_parts(bot.steam_id, &types, &app_ids).await {
            Ok(BackendResponse::Success(parts)) => parts,
            Ok(response) => {
                return Ok(MatchOutcome::Skipped(
                    response.refusal().map_or(MatchSkip::NetworkFailure, MatchSkip::Refused),
                ))
            }
            Err(e) => {
                warn!(steam_id = bot.steam_id, error = %e, "Set parts request failed");
                return Ok(MatchOutcome::Skipped(MatchSkip::NetworkFailure));
            }
        };

        let inventory: Vec<Asset> = inventory
            .into_iter()
            .filter(|item| candidate_sets.contains(&item.set_key()))
            .collect();

        // 4. Concrete pool
        let (kept, pool) = prepare_pool(&inventory, &group_set_parts(&parts))?;

        if pool.is_empty() {
            return Ok(MatchOutcome::Skipped(MatchSkip::NothingToMatch));
        }

        if pool.len() > self.config.max_pool_items {
            return Ok(MatchOutcome::Skipped(MatchSkip::PoolTooLarge(pool.len())));
        }

        // 5. Candidates
        let candidates = match backend
            .get_listed_users_for_matching(bot.steam_id, &trade_token, &pool, &types)
            .await
        {
            Ok(BackendResponse::Success(users)) => users,
            Ok(response) => {
                return Ok(MatchOutcome::Skipped(
                    response.refusal().map_or(MatchSkip::NetworkFailure, MatchSkip::Refused),
                ))
            }
            Err(e) => {
                warn!(steam_id = bot.steam_id, error = %e, "Candidate request failed");
                return Ok(MatchOutcome::Skipped(MatchSkip::NetworkFailure));
            }
        };

        if candidates.is_empty() {
            return Ok(MatchOutcome::Skipped(MatchSkip::NoCandidates));
        }

        // 6. Pending offers from the previous pass
        let deprioritized = self.reconcile_pending_offers().await?;

        // 7. Ranking
        let ranked = rank_candidates(candidates, bot.steam_id, &own_types, &bot.trade_blacklist, &deprioritized);

        info!(
            steam_id = bot.steam_id,
            pool = pool.len(),
            candidates = ranked.len(),
            deprioritized = deprioritized.len(),
            "Starting match pass"
        );

        // 8. Negotiation
        let report = self.negotiate(SpeculativeLedger::new(kept), ranked).await?;

        Ok(MatchOutcome::Completed(report))
    }

    async fn negotiate(&self, mut ledger: SpeculativeLedger, ranked: Vec<ListedUser>) -> Result<MatchReport, MatcherError> {
        let session = &self.ctx.session;
        let steam_id = self.ctx.bot.steam_id;

        let mut report = MatchReport::default();
        let mut consecutive_failures = 0;
        let mut pending_confirmations: Vec<TradeOfferId> = Vec::new();

        for user in ranked {
            if !session.is_connected() {
                warn!(steam_id, "Disconnected during match pass");
                break;
            }

            if consecutive_failures >= self.config.max_consecutive_failures {
                warn!(steam_id, failures = consecutive_failures, "Too many failed offers, ending pass");
                break;
            }

            let mut wanted_sets: HashSet<SetKey> = HashSet::new();

            for set in ledger.tradable_state().keys() {
                if user.matchable_types.contains(&set.asset_type) && !ledger.is_set_empty_for_matching(set)? {
                    wanted_sets.insert(*set);
                }
            }

            if wanted_sets.is_empty() {
                continue;
            }

            // a. Trade hold
            let Some(hold) = session.combined_trade_hold(user.steam_id, &user.trade_token).await else {
                trace!(partner = %user, "Trade hold unknown, skipping");
                continue;
            };

            if hold > 0 && (hold > self.config.max_trade_hold_duration || hold > user.max_trade_hold_duration) {
                trace!(partner = %user, hold, "Trade hold too long, skipping");
                continue;
            }

            // b. Their side
            let mut their_items: Vec<Asset> = user
                .assets
                .iter()
                .map(Asset::from)
                .filter(|item| {
                    (!user.match_everything || item.tradable)
                        && wanted_sets.contains(&item.set_key())
                        && (hold == 0
                            || !(item.asset_type.is_trading_card()
                                && self.config.sales_blacklist.contains(&item.real_app_id)))
                })
                .collect();

            if their_items.is_empty() {
                continue;
            }

            report.candidates += 1;

            let mut their_tradable = build_tradable_state(&their_items);
            let mut skipped_sets: HashSet<SetKey> = HashSet::new();

            // c..i. Trades with this counterpart
            for _ in 0..self.config.max_trades_per_account {
                let our_items: Vec<Asset> = ledger.inventory().iter().filter(|item| item.tradable).cloned().collect();

                let plan = plan_trade(
                    &PlanInput {
                        our_full: ledger.full_state(),
                        our_tradable: ledger.tradable_state(),
                        our_items: &our_items,
                        their_items: &their_items,
                        their_types: &user.matchable_types,
                        skip_sets: &skipped_sets,
                        fairness: (!user.match_everything).then_some(self.fairness.as_ref()),
                        max_items_per_trade: self.config.max_items_per_trade,
                    },
                    &mut their_tradable,
                )?;

                if plan.is_empty() {
                    break;
                }

                let their_offerable: Vec<Asset> = their_items.iter().filter(|item| item.tradable).cloned().collect();

                let items_to_give = extract_items_for_targets(&our_items, &plan.give, false)?;
                let items_to_receive = extract_items_for_targets(&their_offerable, &plan.receive, true)?;

                if sum_amounts(&items_to_give) != sum_amounts(&items_to_receive)
                    || !is_fair_exchange(&items_to_give, &items_to_receive)
                {
                    error!(steam_id, partner = %user, "Assembled trade is not a fair one-for-one exchange");
                    return Err(MatcherError::consistency(format!(
                        "unfair trade assembled against {}",
                        user.steam_id
                    )));
                }

                info!(
                    steam_id,
                    partner = %user,
                    items = items_to_receive.len(),
                    sets = plan.sets.len(),
                    "Match found, sending trade offer"
                );

                let receipt = {
                    let _trading = self.ctx.locks.trading.lock().await;
                    session
                        .send_trade_offer(user.steam_id, &user.trade_token, &items_to_give, &items_to_receive)
                        .await
                };

                let receipt = match receipt {
                    Ok(receipt) if receipt.success => receipt,
                    Ok(_) => {
                        warn!(steam_id, partner = %user, "Trade offer rejected");
                        consecutive_failures += 1;
                        report.failures += 1;
                        break;
                    }
                    Err(e) => {
                        warn!(steam_id, partner = %user, error = %e, "Trade offer failed");
                        consecutive_failures += 1;
                        report.failures += 1;
                        break;
                    }
                };

                consecutive_failures = 0;
                report.trades_sent += 1;

                if !receipt.offer_ids.is_empty() {
                    report.offer_ids.extend(&receipt.offer_ids);
                    self.track_pending_offers(&receipt.offer_ids).await?;
                }

                pending_confirmations.extend(&receipt.mobile_confirmation_ids);

                if pending_confirmations.len() >= self.config.confirmation_threshold
                    && !self.confirm(&mut pending_confirmations).await
                {
                    warn!(steam_id, partner = %user, "Unconfirmed offers would pile up, ending pass");
                    report.confirmation_failed = true;
                    return Ok(report);
                }

                ledger.apply_trade(&items_to_give, &items_to_receive)?;
                remove_items(&mut their_items, &items_to_receive);

                skipped_sets.extend(plan.sets);
            }

            report.matched_sets += skipped_sets.len();

            if !skipped_sets.is_empty() && ledger.is_empty_for_matching()? {
                debug!(steam_id, "No duplicates left to match");
                break;
            }
        }

        if !pending_confirmations.is_empty() && !self.confirm(&mut pending_confirmations).await {
            report.confirmation_failed = true;
        }

        debug!(
            steam_id,
            trades = ledger.trades_applied(),
            items_before = ledger.confirmed().len(),
            items_after = ledger.inventory().len(),
            "Speculative inventory at end of pass"
        );

        Ok(report)
    }

    /// Confirm a batch of offers. Returns false if the platform refused.
    async fn confirm(&self, offer_ids: &mut Vec<TradeOfferId>) -> bool {
        let result = self.ctx.session.confirm_trade_offers(offer_ids).await;
        let count = offer_ids.len();
        offer_ids.clear();

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(steam_id = self.ctx.bot.steam_id, count, error = %e, "Trade confirmation failed");
                false
            }
        }
    }

    // -- Pending offers --------------------------------------------------

    async fn load_pending_offers(&self) -> Result<HashSet<TradeOfferId>, MatcherError> {
        let Some(value) = self.ctx.store.get_json(PENDING_OFFERS_KEY).await? else {
            return Ok(HashSet::new());
        };

        serde_json::from_value(value).map_err(|e| MatcherError::Storage(e.to_string()))
    }

    async fn save_pending_offers(&self, offers: &HashSet<TradeOfferId>) -> Result<(), MatcherError> {
        let value = if offers.is_empty() {
            None
        } else {
            let mut sorted: Vec<TradeOfferId> = offers.iter().copied().collect();
            sorted.sort_unstable();
            Some(json!(sorted))
        };

        self.ctx.store.set_json(PENDING_OFFERS_KEY, value).await
    }

    async fn track_pending_offers(&self, offer_ids: &[TradeOfferId]) -> Result<(), MatcherError> {
        let mut offers = self.load_pending_offers().await?;
        offers.extend(offer_ids);
        self.save_pending_offers(&offers).await
    }

    /// Cancel offers from the previous pass that are still open and return
    /// their counterparts.
    async fn reconcile_pending_offers(&self) -> Result<HashSet<SteamId>, MatcherError> {
        let session = &self.ctx.session;
        let mut offers = self.load_pending_offers().await?;
        let mut deprioritized = HashSet::new();

        if offers.is_empty() {
            return Ok(deprioritized);
        }

        let mut resolved = Vec::new();

        for &offer_id in &offers {
            match session.trade_offer_state(offer_id).await {
                Ok(TradeOfferState::Active) => {
                    if let Some(partner) = session.trade_offer_partner(offer_id).await {
                        deprioritized.insert(partner);
                    }

                    match session.cancel_trade_offer(offer_id).await {
                        Ok(()) => {
                            debug!(offer_id, "Cancelled stale matching offer");
                            resolved.push(offer_id);
                        }
                        Err(e) => warn!(offer_id, error = %e, "Failed to cancel stale matching offer"),
                    }
                }
                Ok(_) => resolved.push(offer_id),
                Err(e) => warn!(offer_id, error = %e, "Failed to check matching offer"),
            }
        }

        for offer_id in resolved {
            offers.remove(&offer_id);
        }

        self.save_pending_offers(&offers).await?;

        Ok(deprioritized)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
