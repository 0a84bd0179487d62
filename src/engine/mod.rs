//! Matching engine: accounting, dedup, the announcement state machine,
//! the match negotiation pass, and the per-account actor driving them.

pub mod accountant;
pub mod actor;
pub mod announcer;
pub mod dedup;
pub mod fairness;
pub mod ledger;
pub mod listing;
pub mod locks;
pub mod manager;
pub mod matcher;
pub mod poller;

use std::sync::Arc;

use crate::backend::ListingBackend;
use crate::config::BotConfig;
use crate::platform::{AccountSession, Clock, KeyValueStore};
use locks::AccountLocks;

/// Everything one account's announcer and matcher share.
pub struct AccountContext {
    pub bot: BotConfig,
    pub backend: Arc<dyn ListingBackend>,
    pub session: Arc<dyn AccountSession>,
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
    pub locks: AccountLocks,
}

impl AccountContext {
    pub fn new(
        bot: BotConfig,
        backend: Arc<dyn ListingBackend>,
        session: Arc<dyn AccountSession>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            bot,
            backend,
            session,
            store,
            clock,
            locks: AccountLocks::new(),
        }
    }
}
