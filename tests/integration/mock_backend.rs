//! In-memory collaborators for integration testing.
//!
//! A scripted `ListingBackend`, a controllable `AccountSession`, a
//! map-backed `KeyValueStore` and a manually advanced `Clock`. Every
//! backend call is recorded so tests can assert on network writes.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use items_matcher::backend::{
    AnnouncementDiffRequest, AnnouncementRequest, BackendResponse, BackendResult, JobStatus, LicenseStatus,
    ListingBackend,
};
use items_matcher::config::{AppConfig, BotConfig};
use items_matcher::engine::AccountContext;
use items_matcher::platform::{AccountSession, AccountStatus, Clock, KeyValueStore, TradeOfferReceipt, TradeOfferState};
use items_matcher::types::*;

pub const OWN_STEAM_ID: SteamId = 76561198000000001;

/// A plain trading card of app 730.
pub fn card(asset_id: AssetId, class_id: ClassId, amount: u32, tradable: bool) -> Asset {
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

pub fn eligible_status() -> AccountStatus {
    AccountStatus {
        has_mobile_authenticator: true,
        public_inventory: true,
        ..AccountStatus::default()
    }
}

pub fn bot() -> BotConfig {
    let cfg = AppConfig::parse(&format!(
        r#"
        [[bots]]
        name = "primary"
        steam_id = {OWN_STEAM_ID}
        trade_token = "owntoken"
        matchable_types = ["TradingCard"]
        remote_listing = true
        active_matching = true
        "#
    ))
    .unwrap();

    cfg.bots[0].clone()
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    SignIn,
    Announce(AnnouncementRequest),
    AnnounceDiff(AnnouncementDiffRequest),
    Poll,
    SetParts,
    Inventories(Vec<Asset>),
    HeartBeat,
    License,
}

/// Scripted listing service. Queued responses are consumed first; an empty
/// queue answers `Success`.
#[derive(Default)]
pub struct MockBackend {
    calls: Mutex<Vec<Call>>,
    announce: Mutex<VecDeque<BackendResult<()>>>,
    announce_diff: Mutex<VecDeque<BackendResult<()>>>,
    heart_beat: Mutex<VecDeque<BackendResult<()>>>,
    set_parts: Mutex<Vec<SetPart>>,
    listed_users: Mutex<Vec<ListedUser>>,
    license_inactive: AtomicBool,
    /// Delay applied to candidate discovery.
    inventories_delay: Mutex<Option<std::time::Duration>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Number of announce and diff-announce requests seen.
    pub fn announcements(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, Call::Announce(_) | Call::AnnounceDiff(_)))
            .count()
    }

    pub fn heartbeats(&self) -> usize {
        self.calls.lock().iter().filter(|call| **call == Call::HeartBeat).count()
    }

    pub fn queue_announce(&self, response: BackendResult<()>) {
        self.announce.lock().push_back(response);
    }

    pub fn queue_announce_diff(&self, response: BackendResult<()>) {
        self.announce_diff.lock().push_back(response);
    }

    pub fn queue_heart_beat(&self, response: BackendResult<()>) {
        self.heart_beat.lock().push_back(response);
    }

    pub fn set_set_parts(&self, parts: Vec<SetPart>) {
        *self.set_parts.lock() = parts;
    }

    pub fn set_listed_users(&self, users: Vec<ListedUser>) {
        *self.listed_users.lock() = users;
    }

    pub fn set_license_active(&self, active: bool) {
        self.license_inactive.store(!active, Ordering::SeqCst);
    }

    pub fn set_inventories_delay(&self, delay: std::time::Duration) {
        *self.inventories_delay.lock() = Some(delay);
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

fn next(queue: &Mutex<VecDeque<BackendResult<()>>>) -> BackendResult<()> {
    queue.lock().pop_front().unwrap_or(Ok(BackendResponse::Success(())))
}

#[async_trait]
impl ListingBackend for MockBackend {
    async fn sign_in(&self, _steam_id: SteamId) -> BackendResult<()> {
        self.record(Call::SignIn);
        Ok(BackendResponse::Success(()))
    }

    async fn announce(&self, request: &AnnouncementRequest) -> BackendResult<()> {
        self.record(Call::Announce(request.clone()));
        next(&self.announce)
    }

    async fn announce_diff(&self, request: &AnnouncementDiffRequest) -> BackendResult<()> {
        self.record(Call::AnnounceDiff(request.clone()));
        next(&self.announce_diff)
    }

    async fn poll_announcement(&self, _steam_id: SteamId, job_id: Uuid) -> BackendResult<JobStatus<()>> {
        self.record(Call::Poll);
        Ok(BackendResponse::Success(JobStatus {
            request_id: job_id,
            finished: true,
            result: Some(()),
        }))
    }

    async fn get_set_parts(&self, _steam_id: SteamId, _types: &[AssetType], _app_ids: &[AppId]) -> BackendResult<Vec<SetPart>> {
        self.record(Call::SetParts);
        Ok(BackendResponse::Success(self.set_parts.lock().clone()))
    }

    async fn get_listed_users_for_matching(
        &self,
        _steam_id: SteamId,
        _trade_token: &str,
        assets: &[Asset],
        _types: &[AssetType],
    ) -> BackendResult<Vec<ListedUser>> {
        self.record(Call::Inventories(assets.to_vec()));

        let delay = *self.inventories_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        Ok(BackendResponse::Success(self.listed_users.lock().clone()))
    }

    async fn heart_beat(&self, _steam_id: SteamId) -> BackendResult<()> {
        self.record(Call::HeartBeat);
        next(&self.heart_beat)
    }

    async fn get_license_status(&self) -> BackendResult<LicenseStatus> {
        self.record(Call::License);
        Ok(BackendResponse::Success(LicenseStatus {
            active: !self.license_inactive.load(Ordering::SeqCst),
            expires_at: None,
        }))
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SentOffer {
    pub partner: SteamId,
    pub give: Vec<Asset>,
    pub receive: Vec<Asset>,
}

pub struct MockSession {
    connected: AtomicBool,
    status: Mutex<AccountStatus>,
    inventory: Mutex<Vec<Asset>>,
    trade_hold: Mutex<Option<u8>>,
    reject_offers: AtomicBool,
    fail_confirmations: AtomicBool,
    next_offer_id: AtomicU64,
    sent: Mutex<Vec<SentOffer>>,
    offers: Mutex<HashMap<TradeOfferId, (SteamId, TradeOfferState)>>,
    cancelled: Mutex<Vec<TradeOfferId>>,
    confirmed: Mutex<Vec<TradeOfferId>>,
}

impl MockSession {
    pub fn new(inventory: Vec<Asset>) -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            status: Mutex::new(eligible_status()),
            inventory: Mutex::new(inventory),
            trade_hold: Mutex::new(Some(0)),
            reject_offers: AtomicBool::new(false),
            fail_confirmations: AtomicBool::new(false),
            next_offer_id: AtomicU64::new(1000),
            sent: Mutex::new(Vec::new()),
            offers: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(Vec::new()),
            confirmed: Mutex::new(Vec::new()),
        })
    }

    pub fn set_inventory(&self, inventory: Vec<Asset>) {
        *self.inventory.lock() = inventory;
    }

    pub fn set_status(&self, status: AccountStatus) {
        *self.status.lock() = status;
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_trade_hold(&self, hold: Option<u8>) {
        *self.trade_hold.lock() = hold;
    }

    pub fn set_reject_offers(&self, reject: bool) {
        self.reject_offers.store(reject, Ordering::SeqCst);
    }

    pub fn set_fail_confirmations(&self, fail: bool) {
        self.fail_confirmations.store(fail, Ordering::SeqCst);
    }

    /// Register an offer left over from an earlier pass.
    pub fn add_offer(&self, offer_id: TradeOfferId, partner: SteamId, state: TradeOfferState) {
        self.offers.lock().insert(offer_id, (partner, state));
    }

    pub fn sent(&self) -> Vec<SentOffer> {
        self.sent.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<TradeOfferId> {
        self.cancelled.lock().clone()
    }

    pub fn confirmed(&self) -> Vec<TradeOfferId> {
        self.confirmed.lock().clone()
    }
}

#[async_trait]
impl AccountSession for MockSession {
    fn steam_id(&self) -> SteamId {
        OWN_STEAM_ID
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn account_status(&self) -> Result<AccountStatus, TransportError> {
        Ok(self.status.lock().clone())
    }

    async fn trade_token(&self) -> Result<Option<String>, TransportError> {
        Ok(Some("owntoken".into()))
    }

    async fn inventory(&self) -> Result<Vec<Asset>, TransportError> {
        Ok(self.inventory.lock().clone())
    }

    async fn combined_trade_hold(&self, _partner: SteamId, _trade_token: &str) -> Option<u8> {
        *self.trade_hold.lock()
    }

    async fn send_trade_offer(
        &self,
        partner: SteamId,
        _trade_token: &str,
        items_to_give: &[Asset],
        items_to_receive: &[Asset],
    ) -> Result<TradeOfferReceipt, TransportError> {
        if self.reject_offers.load(Ordering::SeqCst) {
            return Ok(TradeOfferReceipt::default());
        }

        let offer_id = self.next_offer_id.fetch_add(1, Ordering::SeqCst);

        self.sent.lock().push(SentOffer {
            partner,
            give: items_to_give.to_vec(),
            receive: items_to_receive.to_vec(),
        });
        self.offers.lock().insert(offer_id, (partner, TradeOfferState::Active));

        Ok(TradeOfferReceipt {
            success: true,
            offer_ids: vec![offer_id],
            mobile_confirmation_ids: vec![offer_id],
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
        self.cancelled.lock().push(offer_id);

        if let Some((_, state)) = self.offers.lock().get_mut(&offer_id) {
            *state = TradeOfferState::Canceled;
        }

        Ok(())
    }

    async fn confirm_trade_offers(&self, offer_ids: &[TradeOfferId]) -> Result<(), TransportError> {
        if self.fail_confirmations.load(Ordering::SeqCst) {
            return Err(TransportError::Timeout);
        }

        self.confirmed.lock().extend_from_slice(offer_ids);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store and clock
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, serde_json::Value>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>, MatcherError> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set_json(&self, key: &str, value: Option<serde_json::Value>) -> Result<(), MatcherError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MatcherError::Storage("disk full".into()));
        }

        let mut values = self.values.lock();

        match value {
            Some(value) => {
                values.insert(key.to_string(), value);
            }
            None => {
                values.remove(key);
            }
        }

        Ok(())
    }
}

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()),
        })
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub backend: Arc<MockBackend>,
    pub session: Arc<MockSession>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub ctx: Arc<AccountContext>,
}

impl Harness {
    pub fn new(inventory: Vec<Asset>) -> Self {
        Self::with_bot(bot(), inventory)
    }

    pub fn with_bot(bot: BotConfig, inventory: Vec<Asset>) -> Self {
        let backend = MockBackend::new();
        let session = MockSession::new(inventory);
        let store = MemoryStore::new();
        let clock = ManualClock::new();

        let ctx = Arc::new(AccountContext::new(
            bot,
            backend.clone(),
            session.clone(),
            store.clone(),
            clock.clone(),
        ));

        Self {
            backend,
            session,
            store,
            clock,
            ctx,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
