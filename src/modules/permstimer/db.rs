use poise::serenity_prelude::{self as serenity};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum TimerStoreError {
    #[error("a timer named `{0}` already exists in this server")]
    DuplicateName(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid timer row: {0}")]
    Corrupt(String),
}

impl From<std::num::TryFromIntError> for TimerStoreError {
    fn from(err: std::num::TryFromIntError) -> Self {
        TimerStoreError::Corrupt(err.to_string())
    }
}

/// Role/permission change applied to the timer's channel when it fires.
/// `None` leaves the permission overwrite cleared rather than set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PermsPayload {
    pub(crate) role_ids: Vec<u64>,
    pub(crate) send_messages: Option<bool>,
    pub(crate) read_messages: Option<bool>,
}

#[derive(Debug, Clone)]
pub(crate) struct PermsTimer {
    pub(crate) guild_id: serenity::GuildId,
    pub(crate) channel_id: serenity::ChannelId,
    pub(crate) name: String,
    pub(crate) due_at: i64,
    pub(crate) finished: bool,
    pub(crate) payload: PermsPayload,
}

#[derive(Debug, Clone)]
pub(crate) struct NewPermsTimer {
    pub(crate) guild_id: serenity::GuildId,
    pub(crate) channel_id: serenity::ChannelId,
    pub(crate) name: String,
    pub(crate) due_at: i64,
    pub(crate) payload: PermsPayload,
}

/// The only mutation path engine code may use for timer rows.
#[serenity::async_trait]
pub(crate) trait TimerStore: Send + Sync {
    async fn create(&self, timer: NewPermsTimer) -> Result<PermsTimer, TimerStoreError>;
    async fn get(
        &self,
        guild_id: serenity::GuildId,
        name: &str,
    ) -> Result<Option<PermsTimer>, TimerStoreError>;
    async fn list_unfinished(&self) -> Result<Vec<PermsTimer>, TimerStoreError>;
    /// Idempotent, a no-op when the timer is already finished.
    async fn mark_finished(
        &self,
        guild_id: serenity::GuildId,
        name: &str,
    ) -> Result<(), TimerStoreError>;
}

#[derive(sqlx::FromRow)]
struct PermsTimerRow {
    guild_id: i64,
    channel_id: i64,
    name: String,
    due_at: i64,
    finished: bool,
    payload: serde_json::Value,
}

impl PermsTimerRow {
    fn into_timer(self) -> Result<PermsTimer, TimerStoreError> {
        let payload = serde_json::from_value(self.payload)
            .map_err(|err| TimerStoreError::Corrupt(err.to_string()))?;

        Ok(PermsTimer {
            guild_id: serenity::GuildId::new(u64::try_from(self.guild_id)?),
            channel_id: serenity::ChannelId::new(u64::try_from(self.channel_id)?),
            name: self.name,
            due_at: self.due_at,
            finished: self.finished,
            payload,
        })
    }
}

pub(crate) struct PgTimerStore {
    db: sqlx::PgPool,
}

impl PgTimerStore {
    pub(crate) fn new(db: sqlx::PgPool) -> Self {
        Self { db }
    }
}

#[serenity::async_trait]
impl TimerStore for PgTimerStore {
    async fn create(&self, timer: NewPermsTimer) -> Result<PermsTimer, TimerStoreError> {
        let payload = serde_json::to_value(&timer.payload)
            .map_err(|err| TimerStoreError::Corrupt(err.to_string()))?;

        let row = sqlx::query_as::<_, PermsTimerRow>(
            "INSERT INTO perms_timers (guild_id, channel_id, name, due_at, finished, payload) \
             VALUES ($1, $2, $3, $4, FALSE, $5) \
             RETURNING guild_id, channel_id, name, due_at, finished, payload",
        )
        .bind(i64::try_from(timer.guild_id.get())?)
        .bind(i64::try_from(timer.channel_id.get())?)
        .bind(&timer.name)
        .bind(timer.due_at)
        .bind(payload)
        .fetch_one(&self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                TimerStoreError::DuplicateName(timer.name.clone())
            }
            err => TimerStoreError::Database(err),
        })?;

        row.into_timer()
    }

    async fn get(
        &self,
        guild_id: serenity::GuildId,
        name: &str,
    ) -> Result<Option<PermsTimer>, TimerStoreError> {
        let row = sqlx::query_as::<_, PermsTimerRow>(
            "SELECT guild_id, channel_id, name, due_at, finished, payload \
             FROM perms_timers WHERE guild_id = $1 AND name = $2",
        )
        .bind(i64::try_from(guild_id.get())?)
        .bind(name)
        .fetch_optional(&self.db)
        .await?;

        row.map(PermsTimerRow::into_timer).transpose()
    }

    async fn list_unfinished(&self) -> Result<Vec<PermsTimer>, TimerStoreError> {
        let rows = sqlx::query_as::<_, PermsTimerRow>(
            "SELECT guild_id, channel_id, name, due_at, finished, payload \
             FROM perms_timers WHERE NOT finished",
        )
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(PermsTimerRow::into_timer).collect()
    }

    async fn mark_finished(
        &self,
        guild_id: serenity::GuildId,
        name: &str,
    ) -> Result<(), TimerStoreError> {
        sqlx::query("UPDATE perms_timers SET finished = TRUE WHERE guild_id = $1 AND name = $2")
            .bind(i64::try_from(guild_id.get())?)
            .bind(name)
            .execute(&self.db)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// In-memory [`TimerStore`] with the same duplicate/idempotency semantics
    /// as the Postgres implementation.
    #[derive(Default)]
    pub(crate) struct MemoryTimerStore {
        rows: Mutex<Vec<PermsTimer>>,
        pub(crate) fail_mark_finished: AtomicBool,
        mark_finished_calls: AtomicUsize,
    }

    impl MemoryTimerStore {
        pub(crate) fn finished(&self, guild_id: serenity::GuildId, name: &str) -> bool {
            self.rows
                .lock()
                .unwrap()
                .iter()
                .any(|t| t.guild_id == guild_id && t.name == name && t.finished)
        }

        pub(crate) fn due_at(&self, guild_id: serenity::GuildId, name: &str) -> Option<i64> {
            self.rows
                .lock()
                .unwrap()
                .iter()
                .find(|t| t.guild_id == guild_id && t.name == name)
                .map(|t| t.due_at)
        }

        pub(crate) fn mark_finished_calls(&self) -> usize {
            self.mark_finished_calls.load(Ordering::SeqCst)
        }
    }

    #[serenity::async_trait]
    impl TimerStore for MemoryTimerStore {
        async fn create(&self, timer: NewPermsTimer) -> Result<PermsTimer, TimerStoreError> {
            let mut rows = self.rows.lock().unwrap();
            if rows
                .iter()
                .any(|t| t.guild_id == timer.guild_id && t.name == timer.name)
            {
                return Err(TimerStoreError::DuplicateName(timer.name));
            }

            let timer = PermsTimer {
                guild_id: timer.guild_id,
                channel_id: timer.channel_id,
                name: timer.name,
                due_at: timer.due_at,
                finished: false,
                payload: timer.payload,
            };
            rows.push(timer.clone());
            Ok(timer)
        }

        async fn get(
            &self,
            guild_id: serenity::GuildId,
            name: &str,
        ) -> Result<Option<PermsTimer>, TimerStoreError> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .find(|t| t.guild_id == guild_id && t.name == name)
                .cloned())
        }

        async fn list_unfinished(&self) -> Result<Vec<PermsTimer>, TimerStoreError> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|t| !t.finished)
                .cloned()
                .collect())
        }

        async fn mark_finished(
            &self,
            guild_id: serenity::GuildId,
            name: &str,
        ) -> Result<(), TimerStoreError> {
            self.mark_finished_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_mark_finished.load(Ordering::SeqCst) {
                return Err(TimerStoreError::Corrupt("injected failure".into()));
            }

            let mut rows = self.rows.lock().unwrap();
            if let Some(timer) = rows
                .iter_mut()
                .find(|t| t.guild_id == guild_id && t.name == name)
            {
                timer.finished = true;
            }
            Ok(())
        }
    }
}
