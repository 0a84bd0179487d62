//! Trigger serialization: match locks, actor commands and shutdown.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use items_matcher::config::{AppConfig, ListingConfig, MatchingConfig};
use items_matcher::engine::actor::{AccountActor, ActorSchedule};
use items_matcher::engine::announcer::{AnnounceOutcome, Announcer, SkipReason};
use items_matcher::engine::fairness::SetProgressFairness;
use items_matcher::engine::manager::{AccountServices, MatcherManager};
use items_matcher::engine::matcher::{MatchOutcome, MatchSkip, Matcher};
use items_matcher::engine::poller::JobPoller;
use items_matcher::storage::{cache_path, load_bot_cache, BotCache, CacheWriter};
use items_matcher::types::*;

use crate::mock_backend::{bot, card, Harness, MemoryStore};

fn matcher(harness: &Harness) -> Arc<Matcher> {
    Arc::new(Matcher::new(
        Arc::clone(&harness.ctx),
        MatchingConfig::default(),
        ListingConfig::default(),
        Arc::new(SetProgressFairness::default()),
    ))
}

fn counterpart() -> ListedUser {
    ListedUser {
        steam_id: 500,
        trade_token: "token500".into(),
        nickname: Some("partner".into()),
        matchable_types: HashSet::from([AssetType::TradingCard]),
        match_everything: false,
        max_trade_hold_duration: 15,
        total_inventory_count: 1,
        total_games_count: 10,
        assets: vec![AssetInInventory::from(&card(90, 12, 1, true))],
    }
}

fn schedule() -> ActorSchedule {
    ActorSchedule {
        heartbeat_tick: Duration::from_secs(3600),
        match_interval: Duration::from_secs(3600),
        initial_match_delay: Duration::from_secs(3600),
        start_offset: Duration::ZERO,
    }
}

#[tokio::test]
async fn test_overlapping_match_triggers_run_once() {
    let harness = Harness::new(vec![card(1, 10, 3, true)]);
    harness.backend.set_listed_users(vec![counterpart()]);
    harness.backend.set_inventories_delay(Duration::from_millis(50));

    let matcher = matcher(&harness);
    let (first, second) = tokio::join!(matcher.run(), matcher.run());

    let outcomes = [first.unwrap(), second.unwrap()];
    let dropped = outcomes
        .iter()
        .filter(|outcome| **outcome == MatchOutcome::Skipped(MatchSkip::AlreadyRunning))
        .count();

    assert_eq!(dropped, 1);
    assert_eq!(harness.session.sent().len(), 1);
    assert!(!harness.ctx.locks.is_matching_active());
}

#[tokio::test]
async fn test_announcement_skipped_while_matching() {
    let harness = Harness::new(vec![card(1, 10, 3, true)]);
    let announcer = Announcer::new(
        Arc::clone(&harness.ctx),
        ListingConfig {
            min_items_count: 1,
            ..ListingConfig::default()
        },
        15,
        JobPoller::new(1, Duration::ZERO),
        BotCache::default(),
        None,
    );

    let permit = harness.ctx.locks.try_begin_match();
    assert!(permit.is_some());

    assert_eq!(announcer.announce().await, AnnounceOutcome::Skipped(SkipReason::MatchActive));

    drop(permit);
    assert!(matches!(announcer.announce().await, AnnounceOutcome::Announced { .. }));
}

#[tokio::test]
async fn test_match_now_command_runs_pass() {
    let harness = Harness::new(vec![card(1, 10, 3, true)]);
    harness.backend.set_listed_users(vec![counterpart()]);

    let handle = AccountActor::new(Arc::clone(&harness.ctx), None, Some(matcher(&harness)), schedule()).spawn();

    assert!(handle.match_now().await);
    handle.shutdown().await;

    assert_eq!(harness.session.sent().len(), 1);
    assert!(harness.ctx.locks.is_closed());
}

#[tokio::test]
async fn test_failed_pass_is_contained_by_actor() {
    let harness = Harness::new(vec![card(1, 10, 3, true)]);
    harness.backend.set_listed_users(vec![counterpart()]);
    harness.store.set_fail_writes(true);

    let matcher = matcher(&harness);
    assert!(matches!(matcher.run().await, Err(MatcherError::Storage(_))));

    let handle = AccountActor::new(Arc::clone(&harness.ctx), None, Some(matcher), schedule()).spawn();

    assert!(handle.match_now().await);
    handle.shutdown().await;

    assert_eq!(harness.session.sent().len(), 2);
    assert!(harness.ctx.locks.is_closed());
}

#[tokio::test]
async fn test_shutdown_flushes_cache() {
    let dir = tempfile::tempdir().unwrap();
    let path = cache_path(dir.path(), bot().steam_id);

    let harness = Harness::new(vec![card(1, 10, 1, true), card(2, 11, 1, true)]);
    let announcer = Arc::new(Announcer::new(
        Arc::clone(&harness.ctx),
        ListingConfig {
            min_items_count: 1,
            ..ListingConfig::default()
        },
        15,
        JobPoller::new(1, Duration::ZERO),
        BotCache::default(),
        Some(CacheWriter::spawn(path.clone(), BotCache::default())),
    ));

    let handle = AccountActor::new(Arc::clone(&harness.ctx), Some(Arc::clone(&announcer)), None, schedule()).spawn();

    assert!(handle.persona_refresh(Some("primary".into()), None).await);
    handle.shutdown().await;

    let persisted = load_bot_cache(&path).unwrap();
    assert_eq!(persisted, announcer.cache());
    assert_eq!(persisted.last_announced_assets.len(), 2);
    assert_eq!(announcer.state().nickname.as_deref(), Some("primary"));
}

#[tokio::test]
async fn test_manager_starts_and_stops_accounts() {
    let dir = tempfile::tempdir().unwrap();

    let mut config = AppConfig::default();
    config.storage.cache_dir = dir.path().to_path_buf();

    let harness = Harness::new(vec![card(1, 10, 1, true)]);
    let mut manager = MatcherManager::new();

    let services = || AccountServices {
        backend: harness.backend.clone(),
        session: harness.session.clone(),
        store: MemoryStore::new(),
        clock: harness.clock.clone(),
    };

    assert!(tokio_test::assert_ok!(manager.start_account(&config, bot(), services())));
    tokio_test::assert_err!(manager.start_account(&config, bot(), services()));

    let mut idle = bot();
    idle.steam_id += 1;
    idle.remote_listing = false;
    idle.active_matching = false;
    assert!(!manager.start_account(&config, idle, services()).unwrap());

    assert_eq!(manager.len(), 1);
    assert!(manager.get(bot().steam_id).is_some());

    manager.shutdown().await;
}
