//! items-matcher entry point.
//!
//! Loads configuration, initialises structured logging, wires every
//! configured account to the listing service and runs until Ctrl+C,
//! then shuts the accounts down gracefully.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use items_matcher::backend::http::ListingClient;
use items_matcher::backend::ListingBackend;
use items_matcher::config::{AppConfig, BotConfig};
use items_matcher::engine::manager::{AccountServices, MatcherManager};
use items_matcher::platform::dry_run::DryRunSession;
use items_matcher::platform::SystemClock;
use items_matcher::storage::{store_path, JsonFileStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("ITEMS_MATCHER_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let cfg = AppConfig::load(&config_path)?;

    init_logging();

    info!(
        config = %config_path,
        backend = %cfg.backend.base_url,
        bots = cfg.bots.len(),
        "items-matcher starting up"
    );

    // -- Shared components -----------------------------------------------

    let license_key = cfg.backend.license_key();
    if license_key.is_none() {
        warn!(env = %cfg.backend.license_key_env, "No license key configured, active matching will be skipped");
    }

    let backend: Arc<dyn ListingBackend> =
        Arc::new(ListingClient::new(&cfg.backend.base_url, license_key, cfg.backend.timeout())?);

    // -- Accounts --------------------------------------------------------

    let mut manager = MatcherManager::new();

    for bot in &cfg.bots {
        let name = bot.name.clone();

        match build_services(&cfg, bot, Arc::clone(&backend)) {
            Ok(Some(services)) => {
                if let Err(e) = manager.start_account(&cfg, bot.clone(), services) {
                    error!(bot = %name, error = %e, "Failed to start account");
                }
            }
            Ok(None) => warn!(bot = %name, "No session available for account, skipping"),
            Err(e) => error!(bot = %name, error = %e, "Failed to prepare account"),
        }
    }

    if manager.is_empty() {
        warn!("No account started. Nothing to do.");
        return Ok(());
    }

    info!(accounts = manager.len(), "Accounts running. Press Ctrl+C to stop.");

    // -- Main loop -------------------------------------------------------

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut status = tokio::time::interval(std::time::Duration::from_secs(60 * 60));
    status.tick().await;

    loop {
        tokio::select! {
            _ = status.tick() => {
                info!(accounts = manager.len(), "Accounts running");
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    manager.shutdown().await;
    info!("items-matcher shut down cleanly.");

    Ok(())
}

/// Build the session and store of one account.
///
/// Only the dry-run session is available here; accounts without an
/// inventory snapshot have nothing to run against.
fn build_services(cfg: &AppConfig, bot: &BotConfig, backend: Arc<dyn ListingBackend>) -> Result<Option<AccountServices>> {
    let Some(snapshot) = &bot.dry_run_inventory else {
        return Ok(None);
    };

    let session = DryRunSession::load(bot.steam_id, bot.trade_token.clone(), snapshot)?;
    let store = JsonFileStore::open(store_path(&cfg.storage.cache_dir, bot.steam_id))
        .with_context(|| format!("Failed to open store for {}", bot.name))?;

    Ok(Some(AccountServices {
        backend,
        session: Arc::new(session),
        store: Arc::new(store),
        clock: Arc::new(SystemClock),
    }))
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("items_matcher=info"));

    let json_logging = std::env::var("ITEMS_MATCHER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
