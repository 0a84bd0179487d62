//! Per-account driver.
//!
//! One tokio task per account owns the heartbeat and match timers and
//! turns platform callbacks into announcer and matcher work. The work
//! itself runs on spawned tasks so a long match pass never delays a
//! heartbeat; the account locks keep the pieces apart. On shutdown the
//! timers stop first, triggered work drains, then the locks close and
//! the cache is flushed.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::announcer::{Announcer, HeartbeatOutcome};
use crate::engine::matcher::Matcher;
use crate::engine::AccountContext;
use crate::types::SteamId;

const COMMAND_BUFFER: usize = 32;

#[derive(Debug)]
pub enum AccountCommand {
    PersonaRefresh {
        nickname: Option<String>,
        avatar_hash: Option<String>,
    },
    NewItems,
    MatchNow,
    Shutdown(oneshot::Sender<()>),
}

/// Timer settings of one account.
#[derive(Debug, Clone, Copy)]
pub struct ActorSchedule {
    pub heartbeat_tick: Duration,
    pub match_interval: Duration,
    pub initial_match_delay: Duration,
    /// Offset applied to both timers so accounts do not fire together.
    pub start_offset: Duration,
}

pub struct AccountActor {
    ctx: Arc<AccountContext>,
    announcer: Option<Arc<Announcer>>,
    matcher: Option<Arc<Matcher>>,
    schedule: ActorSchedule,
}

/// Sending side of a running account actor.
#[derive(Debug)]
pub struct AccountHandle {
    steam_id: SteamId,
    tx: mpsc::Sender<AccountCommand>,
    task: JoinHandle<()>,
}

impl AccountHandle {
    pub fn steam_id(&self) -> SteamId {
        self.steam_id
    }

    pub async fn send(&self, command: AccountCommand) -> bool {
        self.tx.send(command).await.is_ok()
    }

    pub async fn persona_refresh(&self, nickname: Option<String>, avatar_hash: Option<String>) -> bool {
        self.send(AccountCommand::PersonaRefresh { nickname, avatar_hash }).await
    }

    pub async fn new_items(&self) -> bool {
        self.send(AccountCommand::NewItems).await
    }

    pub async fn match_now(&self) -> bool {
        self.send(AccountCommand::MatchNow).await
    }

    /// Stop the timers, wait for in-flight work and flush the cache.
    pub async fn shutdown(self) {
        let (done_tx, done_rx) = oneshot::channel();

        if self.tx.send(AccountCommand::Shutdown(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }

        if let Err(e) = self.task.await {
            warn!(steam_id = self.steam_id, error = %e, "Account task ended abnormally");
        }
    }
}

impl AccountActor {
    pub fn new(
        ctx: Arc<AccountContext>,
        announcer: Option<Arc<Announcer>>,
        matcher: Option<Arc<Matcher>>,
        schedule: ActorSchedule,
    ) -> Self {
        Self {
            ctx,
            announcer,
            matcher,
            schedule,
        }
    }

    pub fn spawn(self) -> AccountHandle {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let steam_id = self.ctx.bot.steam_id;
        let task = tokio::spawn(self.run(rx));

        AccountHandle { steam_id, tx, task }
    }

    async fn run(self, mut rx: mpsc::Receiver<AccountCommand>) {
        let steam_id = self.ctx.bot.steam_id;
        let start = Instant::now() + self.schedule.start_offset;

        let mut heartbeat = time::interval_at(start, self.schedule.heartbeat_tick.max(Duration::from_secs(1)));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let next_match = time::sleep_until(start + self.schedule.initial_match_delay);
        tokio::pin!(next_match);

        let mut tasks = JoinSet::new();

        info!(
            steam_id,
            listing = self.announcer.is_some(),
            matching = self.matcher.is_some(),
            offset_secs = self.schedule.start_offset.as_secs(),
            "Account actor started"
        );

        let shutdown_ack = loop {
            tokio::select! {
                _ = heartbeat.tick(), if self.announcer.is_some() => {
                    self.spawn_heartbeat(&mut tasks);
                }
                _ = &mut next_match, if self.matcher.is_some() => {
                    self.spawn_match(&mut tasks);
                    next_match.as_mut().reset(Instant::now() + self.schedule.match_interval);
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                command = rx.recv() => match command {
                    Some(AccountCommand::PersonaRefresh { nickname, avatar_hash }) => {
                        self.spawn_persona_refresh(&mut tasks, nickname, avatar_hash);
                    }
                    Some(AccountCommand::NewItems) => {
                        if let Some(announcer) = &self.announcer {
                            announcer.on_new_items();
                        }
                    }
                    Some(AccountCommand::MatchNow) => {
                        if self.matcher.is_some() {
                            self.spawn_match(&mut tasks);
                            next_match.as_mut().reset(Instant::now() + self.schedule.match_interval);
                        }
                    }
                    Some(AccountCommand::Shutdown(ack)) => break Some(ack),
                    None => break None,
                },
            }
        };

        self.teardown(tasks).await;

        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    fn spawn_heartbeat(&self, tasks: &mut JoinSet<()>) {
        let Some(announcer) = self.announcer.clone() else {
            return;
        };
        let steam_id = self.ctx.bot.steam_id;

        tasks.spawn(async move {
            match announcer.on_heartbeat_tick().await {
                HeartbeatOutcome::Skipped => {}
                outcome => debug!(steam_id, outcome = ?outcome, "Heartbeat tick"),
            }
        });
    }

    fn spawn_persona_refresh(&self, tasks: &mut JoinSet<()>, nickname: Option<String>, avatar_hash: Option<String>) {
        let Some(announcer) = self.announcer.clone() else {
            return;
        };

        tasks.spawn(async move {
            announcer.on_persona_state(nickname, avatar_hash).await;
        });
    }

    fn spawn_match(&self, tasks: &mut JoinSet<()>) {
        let Some(matcher) = self.matcher.clone() else {
            return;
        };

        if self.ctx.locks.is_matching_active() {
            debug!(steam_id = self.ctx.bot.steam_id, "Match pass already running, trigger dropped");
            return;
        }

        let steam_id = self.ctx.bot.steam_id;

        tasks.spawn(async move {
            if let Err(e) = matcher.run().await {
                warn!(steam_id, error = %e, "Match pass failed");
            }
        });
    }

    async fn teardown(&self, mut tasks: JoinSet<()>) {
        let steam_id = self.ctx.bot.steam_id;
        info!(steam_id, in_flight = tasks.len(), "Account actor stopping");

        // Work already triggered runs to completion
        while tasks.join_next().await.is_some() {}

        let permits = self.ctx.locks.quiesce().await;
        self.ctx.locks.close();

        if let Some(announcer) = &self.announcer {
            announcer.shutdown().await;
        }

        drop(permits);

        info!(steam_id, "Account actor stopped");
    }
}
