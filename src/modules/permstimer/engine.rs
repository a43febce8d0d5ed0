use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use poise::serenity_prelude::{self as serenity};
use thiserror::Error;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::db::{NewPermsTimer, PermsTimer, TimerStore, TimerStoreError};
use crate::sink::NotificationSink;
use crate::util;

/// Upper bound on the sink calls of a single fire, a stalled Discord call
/// must not hold up `mark_finished` forever.
const FIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Subtracted from the poll interval when computing the arming horizon so a
/// timer can't slip into the gap between two polls.
const HORIZON_MARGIN_SECS: i64 = 60;

#[derive(Debug, Error)]
pub(crate) enum TimerError {
    #[error("no timer named `{0}` exists in this server")]
    NotFound(String),
    #[error("timer `{0}` has already fired")]
    AlreadyFinished(String),
    #[error(transparent)]
    Store(#[from] TimerStoreError),
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct TimerKey {
    guild_id: serenity::GuildId,
    name: String,
}

impl TimerKey {
    fn of(timer: &PermsTimer) -> Self {
        Self {
            guild_id: timer.guild_id,
            name: timer.name.clone(),
        }
    }
}

/// Arms in-process countdowns for timers coming due and runs their
/// permission changes exactly once at expiry. Each timer moves through
/// unarmed (row only) -> armed (countdown task) -> firing -> finished
/// (row updated, countdown gone); the armed set below is the in-memory
/// half of that state.
pub(crate) struct TimerEngine {
    store: Arc<dyn TimerStore>,
    sink: Arc<dyn NotificationSink>,
    poll_secs: u32,
    armed: DashMap<TimerKey, AbortHandle>,
    /// Self-handle the countdown tasks are spawned with.
    weak: Weak<TimerEngine>,
}

impl TimerEngine {
    pub(crate) fn new(
        store: Arc<dyn TimerStore>,
        sink: Arc<dyn NotificationSink>,
        poll_secs: u32,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            store,
            sink,
            poll_secs,
            armed: DashMap::new(),
            weak: weak.clone(),
        })
    }

    pub(crate) fn poll_secs(&self) -> u32 {
        self.poll_secs
    }

    fn horizon(&self, now: i64) -> i64 {
        now + i64::from(self.poll_secs) - HORIZON_MARGIN_SECS
    }

    pub(crate) async fn create(&self, timer: NewPermsTimer) -> Result<PermsTimer, TimerError> {
        let timer = self.store.create(timer).await?;

        // a timer due before the next poll would otherwise never get armed
        if timer.due_at < self.horizon(util::now_unix()) {
            self.arm(timer.clone());
        }

        Ok(timer)
    }

    pub(crate) async fn list_unfinished(
        &self,
        guild_id: serenity::GuildId,
    ) -> Result<Vec<PermsTimer>, TimerError> {
        let mut timers = self.store.list_unfinished().await?;
        timers.retain(|t| t.guild_id == guild_id);
        timers.sort_by_key(|t| t.due_at);
        Ok(timers)
    }

    /// One poll cycle: arm every unfinished timer due inside the horizon.
    pub(crate) async fn poll_once(&self, now: i64) -> Result<(), TimerError> {
        let timers = self.store.list_unfinished().await?;
        let horizon = self.horizon(now);

        for timer in timers {
            if timer.due_at < horizon {
                self.arm(timer);
            }
        }

        Ok(())
    }

    /// Cancel any armed countdown for the timer and run the completion path
    /// right away.
    pub(crate) async fn force_fire(
        &self,
        guild_id: serenity::GuildId,
        name: &str,
    ) -> Result<(), TimerError> {
        let key = TimerKey {
            guild_id,
            name: name.to_owned(),
        };
        if let Some((_, handle)) = self.armed.remove(&key) {
            handle.abort();
        }

        let timer = self
            .store
            .get(guild_id, name)
            .await?
            .ok_or_else(|| TimerError::NotFound(name.to_owned()))?;
        if timer.finished {
            return Err(TimerError::AlreadyFinished(name.to_owned()));
        }

        self.complete(&timer).await;
        Ok(())
    }

    /// Unarmed -> armed. The entry guard makes the membership check and the
    /// spawn atomic, so a timer name is never armed twice.
    fn arm(&self, timer: PermsTimer) {
        let Some(engine) = self.weak.upgrade() else {
            // engine is shutting down
            return;
        };

        match self.armed.entry(TimerKey::of(&timer)) {
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                debug!(
                    guild_id = timer.guild_id.get(),
                    name = timer.name,
                    due_at = timer.due_at,
                    "arming timer",
                );

                let handle = tokio::spawn(async move { engine.run_until_due(timer).await });
                slot.insert(handle.abort_handle());
            }
        }
    }

    /// Countdown task: halve the sleep toward the deadline, fire once past
    /// it. Timers already past due fire on the first wake.
    async fn run_until_due(self: Arc<Self>, timer: PermsTimer) {
        loop {
            let now = util::now_unix();
            if timer.due_at < now - 1 {
                self.complete(&timer).await;
                return;
            }

            let wait = (timer.due_at - now) as f64 / 2.0;
            tokio::time::sleep(Duration::from_secs_f64(wait.max(0.5))).await;
        }
    }

    /// Firing -> finished. Shared by natural expiry and force-fire.
    async fn complete(&self, timer: &PermsTimer) {
        info!(
            guild_id = timer.guild_id.get(),
            name = timer.name,
            "timer due, applying permission changes",
        );

        if tokio::time::timeout(FIRE_TIMEOUT, self.fire(timer))
            .await
            .is_err()
        {
            warn!(
                guild_id = timer.guild_id.get(),
                name = timer.name,
                "permission changes still pending after {}s, not waiting",
                FIRE_TIMEOUT.as_secs(),
            );
        }

        if let Err(err) = self
            .store
            .mark_finished(timer.guild_id, &timer.name)
            .await
        {
            // the row stays unfinished, the next poll re-arms it instead of
            // losing the completion
            error!(
                guild_id = timer.guild_id.get(),
                name = timer.name,
                "failed to persist timer completion: {}",
                err,
            );
        }
        self.armed.remove(&TimerKey::of(timer));
    }

    /// Best-effort side effect, failures are logged and never block
    /// completion.
    async fn fire(&self, timer: &PermsTimer) {
        for role_id in &timer.payload.role_ids {
            let role_id = serenity::RoleId::new(*role_id);
            if let Err(err) = self
                .sink
                .set_role_permission(
                    timer.guild_id,
                    timer.channel_id,
                    role_id,
                    timer.payload.send_messages,
                    timer.payload.read_messages,
                )
                .await
            {
                warn!(
                    guild_id = timer.guild_id.get(),
                    channel_id = timer.channel_id.get(),
                    role_id = role_id.get(),
                    "couldn't update channel permissions: {}",
                    err,
                );
                continue;
            }

            if let Err(err) = self
                .sink
                .send(
                    timer.guild_id,
                    timer.channel_id,
                    &format!("<@&{}> can now view this channel", role_id.get()),
                )
                .await
            {
                warn!(
                    guild_id = timer.guild_id.get(),
                    channel_id = timer.channel_id.get(),
                    "couldn't announce permission change: {}",
                    err,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::super::db::testing::MemoryTimerStore;
    use super::super::db::PermsPayload;
    use super::*;
    use crate::sink::testing::{RecordingSink, SinkCall};

    const POLL_SECS: u32 = 600;

    fn guild() -> serenity::GuildId {
        serenity::GuildId::new(801)
    }

    fn channel() -> serenity::ChannelId {
        serenity::ChannelId::new(802)
    }

    fn payload() -> PermsPayload {
        PermsPayload {
            role_ids: vec![42],
            send_messages: Some(true),
            read_messages: Some(true),
        }
    }

    fn new_timer(name: &str, due_at: i64) -> NewPermsTimer {
        NewPermsTimer {
            guild_id: guild(),
            channel_id: channel(),
            name: name.to_owned(),
            due_at,
            payload: payload(),
        }
    }

    fn engine_with(
        store: &Arc<MemoryTimerStore>,
        sink: &Arc<RecordingSink>,
    ) -> Arc<TimerEngine> {
        TimerEngine::new(
            Arc::clone(store) as Arc<dyn TimerStore>,
            Arc::clone(sink) as Arc<dyn NotificationSink>,
            POLL_SECS,
        )
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test]
    async fn duplicate_name_rejected_and_first_timer_untouched() {
        let store = Arc::new(MemoryTimerStore::default());
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(&store, &sink);

        let far = util::now_unix() + 100_000;
        engine.create(new_timer("lockdown", far)).await.unwrap();

        let err = engine
            .create(new_timer("lockdown", far + 50))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TimerError::Store(TimerStoreError::DuplicateName(ref name)) if name == "lockdown"
        ));
        assert_eq!(store.due_at(guild(), "lockdown"), Some(far));
    }

    #[tokio::test]
    async fn poll_arms_only_timers_inside_the_horizon() {
        let store = Arc::new(MemoryTimerStore::default());
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(&store, &sink);

        let now = util::now_unix();
        store.create(new_timer("soon", now + 100)).await.unwrap();
        store
            .create(new_timer("later", now + 100_000))
            .await
            .unwrap();

        engine.poll_once(now).await.unwrap();

        assert_eq!(engine.armed.len(), 1);
        assert!(engine.armed.contains_key(&TimerKey {
            guild_id: guild(),
            name: "soon".to_owned(),
        }));
    }

    #[tokio::test]
    async fn past_due_timer_fires_within_one_poll() {
        let store = Arc::new(MemoryTimerStore::default());
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(&store, &sink);

        let now = util::now_unix();
        store.create(new_timer("overdue", now - 100)).await.unwrap();

        engine.poll_once(now).await.unwrap();
        wait_for(|| store.finished(guild(), "overdue")).await;

        assert_eq!(store.mark_finished_calls(), 1);
        assert_eq!(
            sink.calls(),
            vec![
                SinkCall::SetRolePermission {
                    channel_id: channel().get(),
                    role_id: 42,
                    send: Some(true),
                    read: Some(true),
                },
                SinkCall::Send {
                    channel_id: channel().get(),
                    text: "<@&42> can now view this channel".to_owned(),
                },
            ],
        );
    }

    #[tokio::test]
    async fn duplicate_poll_pickup_arms_once() {
        let store = Arc::new(MemoryTimerStore::default());
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(&store, &sink);

        let now = util::now_unix();
        store.create(new_timer("soon", now + 120)).await.unwrap();

        engine.poll_once(now).await.unwrap();
        engine.poll_once(now).await.unwrap();

        assert_eq!(engine.armed.len(), 1);
        assert_eq!(store.mark_finished_calls(), 0);
    }

    #[tokio::test]
    async fn create_inside_horizon_arms_immediately() {
        let store = Arc::new(MemoryTimerStore::default());
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(&store, &sink);

        let now = util::now_unix();
        engine.create(new_timer("soon", now + 120)).await.unwrap();
        assert_eq!(engine.armed.len(), 1);

        engine
            .create(new_timer("later", now + 100_000))
            .await
            .unwrap();
        assert_eq!(engine.armed.len(), 1);
    }

    #[tokio::test]
    async fn force_fire_cancels_the_countdown_and_completes_once() {
        let store = Arc::new(MemoryTimerStore::default());
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(&store, &sink);

        let now = util::now_unix();
        engine.create(new_timer("soon", now + 120)).await.unwrap();
        assert_eq!(engine.armed.len(), 1);

        engine.force_fire(guild(), "soon").await.unwrap();

        assert!(store.finished(guild(), "soon"));
        assert_eq!(store.mark_finished_calls(), 1);
        assert_eq!(engine.armed.len(), 0);
        assert_eq!(
            sink.count(|c| matches!(c, SinkCall::SetRolePermission { .. })),
            1,
        );

        let err = engine.force_fire(guild(), "soon").await.unwrap_err();
        assert!(matches!(err, TimerError::AlreadyFinished(_)));
        assert_eq!(store.mark_finished_calls(), 1);
    }

    #[tokio::test]
    async fn force_fire_unknown_name_is_rejected() {
        let store = Arc::new(MemoryTimerStore::default());
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(&store, &sink);

        let err = engine.force_fire(guild(), "missing").await.unwrap_err();
        assert!(matches!(err, TimerError::NotFound(_)));
    }

    #[tokio::test]
    async fn failed_completion_leaves_the_timer_rearmable() {
        let store = Arc::new(MemoryTimerStore::default());
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(&store, &sink);

        let now = util::now_unix();
        store.create(new_timer("overdue", now - 100)).await.unwrap();
        store.fail_mark_finished.store(true, Ordering::SeqCst);

        engine.poll_once(now).await.unwrap();
        wait_for(|| store.mark_finished_calls() == 1).await;
        wait_for(|| engine.armed.is_empty()).await;
        assert!(!store.finished(guild(), "overdue"));

        // next poll picks the row up again and this time completion sticks
        store.fail_mark_finished.store(false, Ordering::SeqCst);
        engine.poll_once(util::now_unix()).await.unwrap();
        wait_for(|| store.finished(guild(), "overdue")).await;

        assert_eq!(store.mark_finished_calls(), 2);
        assert_eq!(
            sink.count(|c| matches!(c, SinkCall::SetRolePermission { .. })),
            2,
        );
    }
}
