//! Announcement cycle tests against the scripted backend.

use chrono::Duration;
use reqwest::StatusCode;
use std::sync::Arc;

use items_matcher::backend::BackendResponse;
use items_matcher::config::ListingConfig;
use items_matcher::engine::announcer::{
    AnnounceOutcome, Announcer, AnnouncerPhase, HeartbeatOutcome, Ineligibility, SkipReason,
};
use items_matcher::engine::poller::JobPoller;
use items_matcher::platform::AccountStatus;
use items_matcher::storage::BotCache;
use items_matcher::types::*;

use crate::mock_backend::{card, eligible_status, Call, Harness};

fn listing_config() -> ListingConfig {
    ListingConfig {
        min_items_count: 1,
        ..ListingConfig::default()
    }
}

fn announcer(harness: &Harness) -> Announcer {
    announcer_with_cache(harness, BotCache::default())
}

fn announcer_with_cache(harness: &Harness, cache: BotCache) -> Announcer {
    Announcer::new(
        Arc::clone(&harness.ctx),
        listing_config(),
        15,
        JobPoller::new(3, std::time::Duration::ZERO),
        cache,
        None,
    )
}

fn inventory() -> Vec<Asset> {
    vec![card(1, 10, 1, true), card(2, 11, 1, true), card(3, 10, 1, true)]
}

fn part(class_id: ClassId) -> SetPart {
    SetPart {
        class_id,
        real_app_id: 730,
        asset_type: AssetType::TradingCard,
        rarity: Rarity::Common,
    }
}

#[tokio::test]
async fn test_first_cycle_announces_full_listing() {
    let harness = Harness::new(inventory());
    let announcer = announcer(&harness);

    let outcome = announcer.announce().await;

    assert_eq!(outcome, AnnounceOutcome::Announced { diff: false, assets: 3 });

    let calls = harness.backend.calls();
    assert_eq!(calls[0], Call::SignIn);
    assert!(calls.contains(&Call::SetParts));

    let Some(Call::Announce(request)) = calls.iter().find(|call| matches!(call, Call::Announce(_))) else {
        panic!("no announcement sent");
    };
    assert_eq!(request.trade_token, "owntoken");
    assert_eq!(request.total_inventory_count, 3);
    assert_eq!(request.max_trade_hold_duration, 15);

    let state = announcer.state();
    assert!(state.heartbeats_enabled);
    assert!(state.signed_in);
    assert_eq!(state.phase, AnnouncerPhase::HeartBeating);
    assert_eq!(announcer.cache().last_announced_assets.len(), 3);
}

#[tokio::test]
async fn test_unchanged_inventory_is_not_announced_twice() {
    let harness = Harness::new(inventory());
    let announcer = announcer(&harness);

    announcer.announce().await;
    harness.clock.advance(Duration::minutes(61));

    let outcome = announcer.announce().await;

    assert_eq!(outcome, AnnounceOutcome::Unchanged);
    assert_eq!(harness.backend.announcements(), 1);
    assert!(announcer.state().heartbeats_enabled);
}

#[tokio::test]
async fn test_fresh_listing_skips_cycle() {
    let harness = Harness::new(inventory());
    let announcer = announcer(&harness);

    announcer.announce().await;
    harness.clock.advance(Duration::minutes(1));

    assert_eq!(announcer.announce().await, AnnounceOutcome::Skipped(SkipReason::Fresh));
}

#[tokio::test]
async fn test_restored_cache_starts_heartbeats_without_announcing() {
    let harness = Harness::new(inventory());
    let first = announcer(&harness);
    first.announce().await;
    let cache = first.cache();

    harness.backend.clear_calls();
    harness.clock.advance(Duration::minutes(5));

    let restarted = announcer_with_cache(&harness, cache);
    let outcome = restarted.announce().await;

    assert_eq!(outcome, AnnounceOutcome::Unchanged);
    assert_eq!(harness.backend.calls(), vec![Call::HeartBeat]);
    assert!(restarted.state().heartbeats_enabled);
}

#[tokio::test]
async fn test_changed_inventory_announces_diff() {
    let harness = Harness::new(inventory());
    let announcer = announcer(&harness);
    announcer.announce().await;

    let mut grown = inventory();
    grown.push(card(4, 12, 1, true));
    harness.session.set_inventory(grown);
    harness.clock.advance(Duration::minutes(61));

    let outcome = announcer.announce().await;
    assert_eq!(outcome, AnnounceOutcome::Announced { diff: true, assets: 4 });

    let diff = harness
        .backend
        .calls()
        .into_iter()
        .find_map(|call| match call {
            Call::AnnounceDiff(request) => Some(request),
            _ => None,
        })
        .unwrap();

    assert_eq!(diff.announcement.inventory.len(), 1);
    assert_eq!(diff.announcement.inventory[0].asset.asset_id, 4);
    assert!(diff.inventory_removed.is_empty());
}

#[tokio::test]
async fn test_diff_conflict_falls_back_to_full_announce() {
    let harness = Harness::new(inventory());
    let announcer = announcer(&harness);
    announcer.announce().await;

    harness.session.set_inventory(vec![card(1, 10, 1, true), card(4, 12, 1, true)]);
    harness.clock.advance(Duration::minutes(61));
    harness.backend.clear_calls();
    harness
        .backend
        .queue_announce_diff(Ok(BackendResponse::ClientRejected(StatusCode::CONFLICT)));

    let outcome = announcer.announce().await;

    assert_eq!(outcome, AnnounceOutcome::Announced { diff: false, assets: 2 });

    let writes: Vec<Call> = harness
        .backend
        .calls()
        .into_iter()
        .filter(|call| matches!(call, Call::Announce(_) | Call::AnnounceDiff(_)))
        .collect();
    assert_eq!(writes.len(), 2);
    assert!(matches!(writes[0], Call::AnnounceDiff(_)));
    assert!(matches!(writes[1], Call::Announce(_)));
}

#[tokio::test]
async fn test_forbidden_backs_off_for_a_year() {
    let harness = Harness::new(inventory());
    let announcer = announcer(&harness);
    let now = harness.now();

    harness
        .backend
        .queue_announce(Ok(BackendResponse::ClientRejected(StatusCode::FORBIDDEN)));

    let outcome = announcer.announce().await;
    assert_eq!(outcome, AnnounceOutcome::BackedOff { until: now + Duration::days(365) });

    harness.clock.advance(Duration::days(30));
    assert_eq!(announcer.announce().await, AnnounceOutcome::Skipped(SkipReason::Disabled));
}

#[tokio::test]
async fn test_rate_limit_backs_off_for_a_day() {
    let harness = Harness::new(inventory());
    let announcer = announcer(&harness);
    let now = harness.now();

    harness
        .backend
        .queue_announce(Ok(BackendResponse::ClientRejected(StatusCode::TOO_MANY_REQUESTS)));

    let outcome = announcer.announce().await;
    assert_eq!(outcome, AnnounceOutcome::BackedOff { until: now + Duration::days(1) });

    harness.clock.advance(Duration::days(1));
    assert!(matches!(announcer.announce().await, AnnounceOutcome::Announced { .. }));
}

#[tokio::test]
async fn test_login_redirect_forces_sign_in() {
    let harness = Harness::new(inventory());
    let announcer = announcer(&harness);

    harness.backend.queue_announce(Ok(BackendResponse::Redirect {
        location: Some("https://listing.example/Account/Login".into()),
    }));

    assert_eq!(announcer.announce().await, AnnounceOutcome::SignInRequired);
    assert!(!announcer.state().signed_in);

    assert!(matches!(announcer.announce().await, AnnounceOutcome::Announced { .. }));

    let sign_ins = harness.backend.calls().iter().filter(|call| **call == Call::SignIn).count();
    assert_eq!(sign_ins, 2);
}

#[tokio::test]
async fn test_network_failure_suspends_heartbeats() {
    let harness = Harness::new(inventory());
    let announcer = announcer(&harness);

    harness
        .backend
        .queue_announce(Err(TransportError::Timeout));

    assert_eq!(announcer.announce().await, AnnounceOutcome::NetworkFailure);

    let state = announcer.state();
    assert!(!state.heartbeats_enabled);
    assert!(state.last_announcement.is_none());
}

#[tokio::test]
async fn test_failed_diff_is_announced_again_next_cycle() {
    let harness = Harness::new(inventory());
    let announcer = announcer(&harness);
    announcer.announce().await;
    let announced = announcer.cache();

    let mut grown = inventory();
    grown.push(card(4, 12, 1, true));
    harness.session.set_inventory(grown);
    harness.backend.queue_announce_diff(Err(TransportError::Timeout));
    harness.clock.advance(Duration::minutes(61));

    assert_eq!(announcer.announce().await, AnnounceOutcome::NetworkFailure);
    assert_eq!(announcer.cache(), announced);

    harness.clock.advance(Duration::minutes(1));

    assert_eq!(announcer.announce().await, AnnounceOutcome::Announced { diff: true, assets: 4 });
    assert_eq!(harness.backend.announcements(), 3);
    assert_eq!(announcer.cache().last_announced_assets.len(), 4);
}

#[tokio::test]
async fn test_refused_diff_is_announced_again_after_backoff() {
    let harness = Harness::new(inventory());
    let announcer = announcer(&harness);
    announcer.announce().await;
    let announced = announcer.cache();

    harness.session.set_inventory(vec![card(1, 10, 1, true), card(4, 12, 1, true)]);
    harness
        .backend
        .queue_announce_diff(Ok(BackendResponse::ClientRejected(StatusCode::BAD_REQUEST)));
    harness.clock.advance(Duration::minutes(61));

    assert!(matches!(announcer.announce().await, AnnounceOutcome::BackedOff { .. }));
    assert_eq!(announcer.cache(), announced);

    harness.clock.advance(Duration::hours(7));

    assert_eq!(announcer.announce().await, AnnounceOutcome::Announced { diff: true, assets: 2 });
}

#[tokio::test]
async fn test_too_many_items_leaves_cache_untouched() {
    let harness = Harness::new(inventory());
    let announcer = Announcer::new(
        Arc::clone(&harness.ctx),
        ListingConfig {
            max_items_count: 2,
            ..listing_config()
        },
        15,
        JobPoller::new(3, std::time::Duration::ZERO),
        BotCache::default(),
        None,
    );

    assert_eq!(
        announcer.announce().await,
        AnnounceOutcome::Ineligible(Ineligibility::TooManyItems)
    );
    assert_eq!(announcer.cache(), BotCache::default());
    assert_eq!(harness.backend.announcements(), 0);
    assert!(!announcer.state().heartbeats_enabled);
}

#[tokio::test]
async fn test_complete_sets_record_request_in_cache() {
    let harness = Harness::new(vec![card(1, 10, 1, true), card(2, 11, 1, true)]);
    let announcer = announcer(&harness);
    harness.backend.set_set_parts(vec![part(10), part(11)]);

    assert_eq!(announcer.announce().await, AnnounceOutcome::Empty);

    let cache = announcer.cache();
    assert!(cache.last_pre_dedup_checksum.is_some());
    assert_eq!(cache.last_request_at, Some(harness.now()));
    assert!(cache.last_announced_assets.is_empty());
}

#[tokio::test]
async fn test_ineligible_account_makes_no_calls() {
    let harness = Harness::new(inventory());
    let announcer = announcer(&harness);

    harness.session.set_status(AccountStatus {
        limited: true,
        ..eligible_status()
    });

    assert_eq!(
        announcer.announce().await,
        AnnounceOutcome::Ineligible(Ineligibility::Limited)
    );
    assert!(harness.backend.calls().is_empty());
}

#[tokio::test]
async fn test_complete_sets_only_lists_nothing() {
    let harness = Harness::new(vec![card(1, 10, 1, true), card(2, 11, 1, true)]);
    let announcer = announcer(&harness);

    harness.backend.set_set_parts(vec![part(10), part(11)]);

    assert_eq!(announcer.announce().await, AnnounceOutcome::Empty);
    assert_eq!(harness.backend.announcements(), 0);
    assert!(!announcer.state().heartbeats_enabled);
}

#[tokio::test]
async fn test_new_items_shorten_ttl() {
    let harness = Harness::new(inventory());
    let announcer = announcer(&harness);
    announcer.announce().await;

    harness.session.set_inventory(vec![card(1, 10, 1, true), card(5, 13, 1, true)]);
    announcer.on_new_items();
    assert!(announcer.state().announce_earlier);

    harness.clock.advance(Duration::minutes(6));

    assert!(matches!(announcer.announce().await, AnnounceOutcome::Announced { diff: true, .. }));
    assert!(!announcer.state().announce_earlier);
}

#[tokio::test]
async fn test_heartbeat_conflict_resyncs() {
    let harness = Harness::new(inventory());
    let announcer = announcer(&harness);
    announcer.announce().await;

    harness.clock.advance(Duration::minutes(11));
    harness
        .backend
        .queue_heart_beat(Ok(BackendResponse::ClientRejected(StatusCode::CONFLICT)));

    assert_eq!(announcer.on_heartbeat_tick().await, HeartbeatOutcome::Resync);
    assert_eq!(announcer.cache(), BotCache::default());
    assert!(announcer.state().last_announcement.is_none());

    // The next tick re-announces from scratch
    harness.clock.advance(Duration::minutes(1));
    let outcome = announcer.on_heartbeat_tick().await;

    assert_eq!(
        outcome,
        HeartbeatOutcome::Announced(AnnounceOutcome::Announced { diff: false, assets: 3 })
    );
}

#[tokio::test]
async fn test_heartbeat_server_error_keeps_heartbeats() {
    let harness = Harness::new(inventory());
    let announcer = announcer(&harness);
    announcer.announce().await;

    harness.clock.advance(Duration::minutes(11));
    harness
        .backend
        .queue_heart_beat(Ok(BackendResponse::ServerError(StatusCode::BAD_GATEWAY)));

    assert_eq!(
        announcer.on_heartbeat_tick().await,
        HeartbeatOutcome::ServerError(StatusCode::BAD_GATEWAY)
    );
    assert!(announcer.state().heartbeats_enabled);

    assert_eq!(announcer.on_heartbeat_tick().await, HeartbeatOutcome::Sent);
}

#[tokio::test]
async fn test_heartbeat_waits_for_min_ttl() {
    let harness = Harness::new(inventory());
    let announcer = announcer(&harness);
    announcer.announce().await;

    harness.clock.advance(Duration::minutes(3));
    assert_eq!(announcer.on_heartbeat_tick().await, HeartbeatOutcome::Skipped);
    assert_eq!(harness.backend.heartbeats(), 0);
}

#[tokio::test]
async fn test_disconnected_skips() {
    let harness = Harness::new(inventory());
    let announcer = announcer(&harness);
    harness.session.set_connected(false);

    assert_eq!(announcer.announce().await, AnnounceOutcome::Skipped(SkipReason::Disconnected));
    assert_eq!(announcer.on_heartbeat_tick().await, HeartbeatOutcome::Skipped);
}

#[tokio::test]
async fn test_pending_job_is_polled_to_completion() {
    let harness = Harness::new(inventory());
    let announcer = announcer(&harness);

    harness
        .backend
        .queue_announce(Ok(BackendResponse::Pending(uuid::Uuid::new_v4())));

    assert!(matches!(announcer.announce().await, AnnounceOutcome::Announced { diff: false, .. }));
    assert!(harness.backend.calls().contains(&Call::Poll));
}
