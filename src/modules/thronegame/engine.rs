use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use poise::serenity_prelude::{self as serenity};
use rand::Rng;
use thiserror::Error;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::db::{
    NewThroneRound, RoundStore, RoundStoreError, ScoreEntry, SettingsStore, ThroneRound,
    ThroneSettings,
};
use crate::sink::NotificationSink;
use crate::util;

/// A wake landing anywhere inside this window around the deadline ends the
/// round, so a sleep that comes up just short can't push the end past it.
const END_WINDOW_SECS: i64 = 60;

/// Scoreboard length for the end-of-round announcement.
const END_LEADERBOARD_LIMIT: usize = 5;

/// Scoreboard length for the leaderboard command.
const LEADERBOARD_LIMIT: usize = 10;

#[derive(Debug, Error)]
pub(crate) enum RoundError {
    #[error("there is already an active round")]
    AlreadyActive,
    #[error("no round is active right now")]
    NoActiveRound,
    #[error("the throne game is not set up, set a throne role and game channel first")]
    NotConfigured,
    #[error(transparent)]
    Store(#[from] RoundStoreError),
}

#[derive(Debug, Error)]
pub(crate) enum ClaimError {
    #[error("the throne can not be claimed for another {remaining}s")]
    OnCooldown { remaining: i64 },
    #[error("you already sit upon the throne")]
    AlreadyHolder,
    #[error("no round is active right now")]
    NoActiveRound,
    #[error(transparent)]
    Store(#[from] RoundStoreError),
}

#[derive(Debug, Clone)]
pub(crate) struct ClaimOutcome {
    pub(crate) previous_holder: serenity::UserId,
    pub(crate) score: u32,
}

/// In-memory image of a guild's active round.
#[derive(Debug, Clone)]
struct LiveRound {
    round_number: i32,
    end_at: i64,
    holder_id: serenity::UserId,
    last_claim_at: i64,
    scores: Vec<ScoreEntry>,
}

impl LiveRound {
    fn of(round: &ThroneRound) -> Self {
        Self {
            round_number: round.round_number,
            end_at: round.end_at,
            holder_id: round.holder_id,
            last_claim_at: round.last_claim_at,
            scores: round.scores.clone(),
        }
    }
}

/// Runs one crown-claiming round per guild: a loop task that watches the
/// round deadline, lets the engine's own pseudo-player seize an idle crown,
/// and ends the round when its time is up. Claims arrive from the command
/// layer in between wakes.
pub(crate) struct ThroneEngine {
    rounds: Arc<dyn RoundStore>,
    settings: Arc<dyn SettingsStore>,
    sink: Arc<dyn NotificationSink>,
    /// The pseudo-player that holds a fresh or seized crown.
    actor_id: serenity::UserId,
    active: DashMap<serenity::GuildId, LiveRound>,
    /// Registry of loop tasks, force-end cancels through it.
    tasks: DashMap<serenity::GuildId, AbortHandle>,
    /// Self-handle the loop tasks are spawned with.
    weak: Weak<ThroneEngine>,
}

/// Whether a wake cycle at `now` should end the round.
fn end_window_reached(now: i64, end_at: i64) -> bool {
    let remaining = end_at - now;
    remaining.abs() < END_WINDOW_SECS || remaining < 0
}

/// Next wake delay: half the remaining round time, capped by however long
/// until the idle-seize deadline.
fn sleep_secs(remaining: i64, until_seize: i64) -> i64 {
    (remaining / 2).min(until_seize).max(1)
}

/// Scores ordered for display; the stable sort keeps discovery order for
/// equal scores.
fn leaderboard(scores: &[ScoreEntry], limit: usize) -> Vec<ScoreEntry> {
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| b.score.cmp(&a.score));
    sorted.truncate(limit);
    sorted
}

fn render_leaderboard(scores: &[ScoreEntry], limit: usize) -> String {
    leaderboard(scores, limit)
        .iter()
        .enumerate()
        .map(|(idx, entry)| format!("{}. <@{}> - {} points", idx + 1, entry.user_id, entry.score))
        .collect::<Vec<_>>()
        .join("\n")
}

fn ordinal_suffix(n: u32) -> &'static str {
    if (11..=13).contains(&(n % 100)) {
        return "th";
    }
    match n % 10 {
        1 => "st",
        2 => "nd",
        3 => "rd",
        _ => "th",
    }
}

impl ThroneEngine {
    pub(crate) fn new(
        rounds: Arc<dyn RoundStore>,
        settings: Arc<dyn SettingsStore>,
        sink: Arc<dyn NotificationSink>,
        actor_id: serenity::UserId,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            rounds,
            settings,
            sink,
            actor_id,
            active: DashMap::new(),
            tasks: DashMap::new(),
            weak: weak.clone(),
        })
    }

    pub(crate) async fn load_settings(
        &self,
        guild_id: serenity::GuildId,
    ) -> Result<ThroneSettings, RoundError> {
        Ok(self.settings.load(guild_id).await?)
    }

    pub(crate) async fn save_settings(
        &self,
        guild_id: serenity::GuildId,
        settings: &ThroneSettings,
    ) -> Result<(), RoundError> {
        Ok(self.settings.save(guild_id, settings).await?)
    }

    pub(crate) fn holder(&self, guild_id: serenity::GuildId) -> Option<serenity::UserId> {
        self.active.get(&guild_id).map(|r| r.holder_id)
    }

    pub(crate) fn current_leaderboard(
        &self,
        guild_id: serenity::GuildId,
    ) -> Result<String, RoundError> {
        let round = self
            .active
            .get(&guild_id)
            .ok_or(RoundError::NoActiveRound)?;
        Ok(render_leaderboard(&round.scores, LEADERBOARD_LIMIT))
    }

    /// Re-enter the loop for every round that never ended. Rounds already
    /// past their deadline end on the loop's first wake.
    pub(crate) async fn resume(&self) -> Result<(), RoundError> {
        for round in self.rounds.latest_all().await? {
            if round.active {
                info!(
                    guild_id = round.guild_id.get(),
                    round_number = round.round_number,
                    "resuming active throne round",
                );
                self.spawn_round_loop(&round);
            }
        }
        Ok(())
    }

    pub(crate) async fn start_round(
        &self,
        guild_id: serenity::GuildId,
    ) -> Result<ThroneRound, RoundError> {
        self.start_round_at(guild_id, util::now_unix()).await
    }

    pub(crate) async fn start_round_at(
        &self,
        guild_id: serenity::GuildId,
        now: i64,
    ) -> Result<ThroneRound, RoundError> {
        if self.active.contains_key(&guild_id) {
            return Err(RoundError::AlreadyActive);
        }

        let settings = self.settings.load(guild_id).await?;
        let channel_id = game_channel(&settings)?;
        if settings.throne_role_id.is_none() {
            return Err(RoundError::NotConfigured);
        }

        let round_number = self
            .rounds
            .latest(guild_id)
            .await?
            .map(|r| r.round_number)
            .unwrap_or(0)
            + 1;

        let round = self
            .rounds
            .create(NewThroneRound {
                guild_id,
                round_number,
                start_at: now,
                end_at: now + (settings.round_length_hours * 60.0 * 60.0) as i64,
                holder_id: self.actor_id,
                // claimable right away
                last_claim_at: now - settings.cooldown_seconds,
            })
            .await
            .map_err(|err| match err {
                RoundStoreError::AlreadyActive => RoundError::AlreadyActive,
                err => RoundError::Store(err),
            })?;

        info!(
            guild_id = guild_id.get(),
            round_number,
            end_at = round.end_at,
            "throne round started",
        );

        self.spawn_round_loop(&round);
        self.announce(
            guild_id,
            channel_id,
            &format!(
                "Starting new round! This round will run for {} hours!",
                settings.round_length_hours
            ),
        )
        .await;

        Ok(round)
    }

    /// Claim the crown for `user_id`, subject to the cooldown.
    pub(crate) async fn claim(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
    ) -> Result<ClaimOutcome, ClaimError> {
        self.claim_at(guild_id, user_id, util::now_unix()).await
    }

    pub(crate) async fn claim_at(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
        now: i64,
    ) -> Result<ClaimOutcome, ClaimError> {
        let settings = self.settings.load(guild_id).await?;

        // one synchronous block over the live round so other tasks never
        // observe a half-applied claim
        let (state, previous, score) = {
            let mut round = self
                .active
                .get_mut(&guild_id)
                .ok_or(ClaimError::NoActiveRound)?;

            if round.holder_id == user_id {
                return Err(ClaimError::AlreadyHolder);
            }

            let elapsed = now - round.last_claim_at;
            if elapsed <= settings.cooldown_seconds {
                return Err(ClaimError::OnCooldown {
                    remaining: settings.cooldown_seconds - elapsed,
                });
            }

            let previous = round.holder_id;
            round.holder_id = user_id;
            round.last_claim_at = now;

            let uid = user_id.get();
            let score = match round.scores.iter_mut().find(|entry| entry.user_id == uid) {
                Some(entry) => {
                    entry.score += 1;
                    entry.score
                }
                None => {
                    round.scores.push(ScoreEntry { user_id: uid, score: 1 });
                    1
                }
            };

            (round.clone(), previous, score)
        };

        self.persist_state(guild_id, &state).await;

        if let Some(role_id) = settings.throne_role_id.map(serenity::RoleId::new) {
            if let Err(err) = self.sink.grant_role(guild_id, user_id, role_id).await {
                warn!(
                    guild_id = guild_id.get(),
                    user_id = user_id.get(),
                    "couldn't grant the throne role: {}",
                    err,
                );
            }
            if previous != self.actor_id {
                if let Err(err) = self.sink.revoke_role(guild_id, previous, role_id).await {
                    warn!(
                        guild_id = guild_id.get(),
                        user_id = previous.get(),
                        "couldn't remove the throne role: {}",
                        err,
                    );
                }
            }
        }

        if let Ok(channel_id) = game_channel(&settings) {
            self.announce(
                guild_id,
                channel_id,
                &format!(
                    "<@{}> has claimed the throne from <@{}>! All hail <@{}> the {}{}!",
                    user_id.get(),
                    previous.get(),
                    user_id.get(),
                    score,
                    ordinal_suffix(score),
                ),
            )
            .await;
        }

        Ok(ClaimOutcome {
            previous_holder: previous,
            score,
        })
    }

    /// The engine's pseudo-player contends for a crown nobody has claimed
    /// since the idle-seize delay ran out.
    pub(crate) async fn force_seize(&self, guild_id: serenity::GuildId) -> Result<(), RoundError> {
        self.idle_seize_at(guild_id, true, util::now_unix()).await
    }

    async fn idle_seize_at(
        &self,
        guild_id: serenity::GuildId,
        force: bool,
        now: i64,
    ) -> Result<(), RoundError> {
        let settings = self.settings.load(guild_id).await?;
        let channel_id = game_channel(&settings)?;

        let holder_id = self
            .active
            .get(&guild_id)
            .map(|r| r.holder_id)
            .ok_or(RoundError::NoActiveRound)?;

        if holder_id == self.actor_id {
            // nothing to take, reopen the claim window and taunt
            let state = self.reset_claim_window(guild_id, now - settings.cooldown_seconds)?;
            self.persist_state(guild_id, &state).await;
            self.announce(
                guild_id,
                channel_id,
                "**King Regent** grows tired of your petty squabbles and demands tribute! \
                 Claim the throne, if you dare!",
            )
            .await;
            return Ok(());
        }

        let odds = settings.seize_odds.clamp(0.0, 1.0);
        if !force && !rand::rng().random_bool(odds) {
            debug!(
                guild_id = guild_id.get(),
                seize_odds = odds,
                "the crown survives this time",
            );
            return Ok(());
        }

        let state = {
            let mut round = self
                .active
                .get_mut(&guild_id)
                .ok_or(RoundError::NoActiveRound)?;
            round.holder_id = self.actor_id;
            round.last_claim_at = now - settings.cooldown_seconds;
            round.clone()
        };
        self.persist_state(guild_id, &state).await;

        if let Some(role_id) = settings.throne_role_id.map(serenity::RoleId::new) {
            if let Err(err) = self.sink.revoke_role(guild_id, holder_id, role_id).await {
                warn!(
                    guild_id = guild_id.get(),
                    user_id = holder_id.get(),
                    "couldn't remove the throne role: {}",
                    err,
                );
            }
        }

        self.announce(
            guild_id,
            channel_id,
            &format!(
                "The game grows dormant, King Regent takes this opportunity to seize the \
                 throne from <@{}>!\nAll hail King Regent!",
                holder_id.get()
            ),
        )
        .await;

        Ok(())
    }

    /// Cancel the loop task and run the same end path natural expiry uses.
    pub(crate) async fn force_end(&self, guild_id: serenity::GuildId) -> Result<(), RoundError> {
        if let Some((_, handle)) = self.tasks.remove(&guild_id) {
            handle.abort();
        }

        if !self.active.contains_key(&guild_id) {
            return Err(RoundError::NoActiveRound);
        }

        self.finish_round(guild_id).await;
        Ok(())
    }

    /// Install the in-memory round and its loop task. The registry entry
    /// guard makes the membership check and the spawn atomic, so a guild
    /// never runs two loops.
    fn spawn_round_loop(&self, round: &ThroneRound) {
        let Some(engine) = self.weak.upgrade() else {
            // engine is shutting down
            return;
        };

        match self.tasks.entry(round.guild_id) {
            // a finished handle is a loop that ended but hasn't cleared its
            // registry entry yet, treat it as vacant
            Entry::Occupied(entry) if !entry.get().is_finished() => {}
            entry => {
                self.active.insert(round.guild_id, LiveRound::of(round));

                let guild_id = round.guild_id;
                let handle = tokio::spawn(async move { engine.run_round(guild_id).await });
                match entry {
                    Entry::Occupied(mut entry) => {
                        entry.insert(handle.abort_handle());
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(handle.abort_handle());
                    }
                }
            }
        }
    }

    async fn run_round(self: Arc<Self>, guild_id: serenity::GuildId) {
        loop {
            let now = util::now_unix();
            let Some((end_at, last_claim_at)) = self
                .active
                .get(&guild_id)
                .map(|r| (r.end_at, r.last_claim_at))
            else {
                // force-ended from under us
                break;
            };

            // end-check strictly before seize-check, a seize never fires in
            // the tick that ends the round
            if end_window_reached(now, end_at) {
                self.finish_round(guild_id).await;
                break;
            }

            let remaining = end_at - now;
            let sleep_for = match self.settings.load(guild_id).await {
                Ok(settings) => {
                    let since_claim = now - last_claim_at;
                    let until_seize = if since_claim > settings.seize_delay_seconds {
                        if let Err(err) = self.idle_seize_at(guild_id, false, now).await {
                            warn!(guild_id = guild_id.get(), "idle seize failed: {}", err);
                        }
                        settings.seize_delay_seconds
                    } else {
                        settings.seize_delay_seconds - since_claim
                    };
                    sleep_secs(remaining, until_seize)
                }
                Err(err) => {
                    warn!(
                        guild_id = guild_id.get(),
                        "couldn't load throne settings: {}",
                        err,
                    );
                    sleep_secs(remaining, remaining)
                }
            };

            debug!(
                guild_id = guild_id.get(),
                remaining, sleep_for, "throne round check",
            );
            tokio::time::sleep(Duration::from_secs(sleep_for as u64)).await;
        }

        self.tasks.remove(&guild_id);
    }

    /// Shared end path: announce results, revoke the crown, persist the
    /// round inactive, and drop the in-memory entry.
    async fn finish_round(&self, guild_id: serenity::GuildId) {
        let Some((_, round)) = self.active.remove(&guild_id) else {
            return;
        };

        info!(
            guild_id = guild_id.get(),
            round_number = round.round_number,
            "ending throne round",
        );

        match self.settings.load(guild_id).await {
            Ok(settings) => {
                if let Ok(channel_id) = game_channel(&settings) {
                    if round.scores.is_empty() {
                        self.announce(guild_id, channel_id, "The round has ended!").await;
                    } else {
                        self.announce(
                            guild_id,
                            channel_id,
                            &format!(
                                "The round has ended with <@{}> on the throne!\n\n\
                                 Round scoreboard:\n{}",
                                round.holder_id.get(),
                                render_leaderboard(&round.scores, END_LEADERBOARD_LIMIT),
                            ),
                        )
                        .await;
                    }
                }

                if let Some(role_id) = settings.throne_role_id.map(serenity::RoleId::new) {
                    if round.holder_id != self.actor_id {
                        if let Err(err) =
                            self.sink.revoke_role(guild_id, round.holder_id, role_id).await
                        {
                            warn!(
                                guild_id = guild_id.get(),
                                user_id = round.holder_id.get(),
                                "couldn't remove the throne role: {}",
                                err,
                            );
                        }
                    }
                }
            }
            Err(err) => warn!(
                guild_id = guild_id.get(),
                "couldn't load throne settings: {}",
                err,
            ),
        }

        if let Err(err) = self.rounds.mark_inactive(guild_id, round.round_number).await {
            // the row stays active, startup recovery re-ends it on next boot
            error!(
                guild_id = guild_id.get(),
                round_number = round.round_number,
                "failed to persist round end: {}",
                err,
            );
        }
    }

    fn reset_claim_window(
        &self,
        guild_id: serenity::GuildId,
        last_claim_at: i64,
    ) -> Result<LiveRound, RoundError> {
        let mut round = self
            .active
            .get_mut(&guild_id)
            .ok_or(RoundError::NoActiveRound)?;
        round.last_claim_at = last_claim_at;
        Ok(round.clone())
    }

    /// Live state is authoritative while the round runs; a failed write is
    /// overwritten whole by the next one, so log and move on.
    async fn persist_state(&self, guild_id: serenity::GuildId, state: &LiveRound) {
        if let Err(err) = self
            .rounds
            .update_state(
                guild_id,
                state.round_number,
                state.holder_id,
                state.last_claim_at,
                &state.scores,
            )
            .await
        {
            error!(
                guild_id = guild_id.get(),
                round_number = state.round_number,
                "failed to persist round state: {}",
                err,
            );
        }
    }

    async fn announce(
        &self,
        guild_id: serenity::GuildId,
        channel_id: serenity::ChannelId,
        text: &str,
    ) {
        if let Err(err) = self.sink.send(guild_id, channel_id, text).await {
            warn!(
                guild_id = guild_id.get(),
                channel_id = channel_id.get(),
                "couldn't send game announcement: {}",
                err,
            );
        }
    }
}

fn game_channel(settings: &ThroneSettings) -> Result<serenity::ChannelId, RoundError> {
    settings
        .game_channel_id
        .map(serenity::ChannelId::new)
        .ok_or(RoundError::NotConfigured)
}
