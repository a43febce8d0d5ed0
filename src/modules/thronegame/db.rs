use poise::serenity_prelude::{self as serenity};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum RoundStoreError {
    #[error("an active round already exists for this server")]
    AlreadyActive,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid round row: {0}")]
    Corrupt(String),
}

impl From<std::num::TryFromIntError> for RoundStoreError {
    fn from(err: std::num::TryFromIntError) -> Self {
        RoundStoreError::Corrupt(err.to_string())
    }
}

/// One scorer's tally. Array order in the `scores` column is discovery
/// order, which is also the leaderboard tie-break.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ScoreEntry {
    pub(crate) user_id: u64,
    pub(crate) score: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct ThroneRound {
    pub(crate) guild_id: serenity::GuildId,
    pub(crate) round_number: i32,
    pub(crate) start_at: i64,
    pub(crate) end_at: i64,
    pub(crate) active: bool,
    pub(crate) holder_id: serenity::UserId,
    pub(crate) last_claim_at: i64,
    pub(crate) scores: Vec<ScoreEntry>,
}

#[derive(Debug, Clone)]
pub(crate) struct NewThroneRound {
    pub(crate) guild_id: serenity::GuildId,
    pub(crate) round_number: i32,
    pub(crate) start_at: i64,
    pub(crate) end_at: i64,
    pub(crate) holder_id: serenity::UserId,
    pub(crate) last_claim_at: i64,
}

/// The only mutation path engine code may use for round rows.
#[serenity::async_trait]
pub(crate) trait RoundStore: Send + Sync {
    async fn create(&self, round: NewThroneRound) -> Result<ThroneRound, RoundStoreError>;
    async fn latest(
        &self,
        guild_id: serenity::GuildId,
    ) -> Result<Option<ThroneRound>, RoundStoreError>;
    /// Latest round per guild, for startup recovery.
    async fn latest_all(&self) -> Result<Vec<ThroneRound>, RoundStoreError>;
    async fn update_state(
        &self,
        guild_id: serenity::GuildId,
        round_number: i32,
        holder_id: serenity::UserId,
        last_claim_at: i64,
        scores: &[ScoreEntry],
    ) -> Result<(), RoundStoreError>;
    /// Idempotent, a no-op when the round is already inactive.
    async fn mark_inactive(
        &self,
        guild_id: serenity::GuildId,
        round_number: i32,
    ) -> Result<(), RoundStoreError>;
}

/// Per-server tunables for the throne game. These live in their own blob so
/// round rows only ever carry live game state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ThroneSettings {
    pub(crate) throne_role_id: Option<u64>,
    pub(crate) game_channel_id: Option<u64>,
    #[serde(default = "default_cooldown_seconds")]
    pub(crate) cooldown_seconds: i64,
    #[serde(default = "default_round_length_hours")]
    pub(crate) round_length_hours: f64,
    #[serde(default = "default_seize_delay_seconds")]
    pub(crate) seize_delay_seconds: i64,
    #[serde(default = "default_seize_odds")]
    pub(crate) seize_odds: f64,
}

impl Default for ThroneSettings {
    fn default() -> Self {
        Self {
            throne_role_id: None,
            game_channel_id: None,
            cooldown_seconds: default_cooldown_seconds(),
            round_length_hours: default_round_length_hours(),
            seize_delay_seconds: default_seize_delay_seconds(),
            seize_odds: default_seize_odds(),
        }
    }
}

fn default_cooldown_seconds() -> i64 {
    60
}

fn default_round_length_hours() -> f64 {
    1.0
}

fn default_seize_delay_seconds() -> i64 {
    60 * 60
}

fn default_seize_odds() -> f64 {
    0.5
}

#[serenity::async_trait]
pub(crate) trait SettingsStore: Send + Sync {
    /// Read-through with defaults when the guild has no row yet.
    async fn load(&self, guild_id: serenity::GuildId) -> Result<ThroneSettings, RoundStoreError>;
    async fn save(
        &self,
        guild_id: serenity::GuildId,
        settings: &ThroneSettings,
    ) -> Result<(), RoundStoreError>;
}

#[derive(sqlx::FromRow)]
struct ThroneRoundRow {
    guild_id: i64,
    round_number: i32,
    start_at: i64,
    end_at: i64,
    active: bool,
    holder_id: i64,
    last_claim_at: i64,
    scores: serde_json::Value,
}

impl ThroneRoundRow {
    fn into_round(self) -> Result<ThroneRound, RoundStoreError> {
        let scores = serde_json::from_value(self.scores)
            .map_err(|err| RoundStoreError::Corrupt(err.to_string()))?;

        Ok(ThroneRound {
            guild_id: serenity::GuildId::new(u64::try_from(self.guild_id)?),
            round_number: self.round_number,
            start_at: self.start_at,
            end_at: self.end_at,
            active: self.active,
            holder_id: serenity::UserId::new(u64::try_from(self.holder_id)?),
            last_claim_at: self.last_claim_at,
            scores,
        })
    }
}

const ROUND_COLUMNS: &str =
    "guild_id, round_number, start_at, end_at, active, holder_id, last_claim_at, scores";

pub(crate) struct PgRoundStore {
    db: sqlx::PgPool,
}

impl PgRoundStore {
    pub(crate) fn new(db: sqlx::PgPool) -> Self {
        Self { db }
    }
}

#[serenity::async_trait]
impl RoundStore for PgRoundStore {
    async fn create(&self, round: NewThroneRound) -> Result<ThroneRound, RoundStoreError> {
        let row = sqlx::query_as::<_, ThroneRoundRow>(&format!(
            "INSERT INTO throne_rounds \
             (guild_id, round_number, start_at, end_at, active, holder_id, last_claim_at, scores) \
             VALUES ($1, $2, $3, $4, TRUE, $5, $6, '[]') \
             RETURNING {}",
            ROUND_COLUMNS
        ))
        .bind(i64::try_from(round.guild_id.get())?)
        .bind(round.round_number)
        .bind(round.start_at)
        .bind(round.end_at)
        .bind(i64::try_from(round.holder_id.get())?)
        .bind(round.last_claim_at)
        .fetch_one(&self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                RoundStoreError::AlreadyActive
            }
            err => RoundStoreError::Database(err),
        })?;

        row.into_round()
    }

    async fn latest(
        &self,
        guild_id: serenity::GuildId,
    ) -> Result<Option<ThroneRound>, RoundStoreError> {
        let row = sqlx::query_as::<_, ThroneRoundRow>(&format!(
            "SELECT {} FROM throne_rounds WHERE guild_id = $1 \
             ORDER BY round_number DESC LIMIT 1",
            ROUND_COLUMNS
        ))
        .bind(i64::try_from(guild_id.get())?)
        .fetch_optional(&self.db)
        .await?;

        row.map(ThroneRoundRow::into_round).transpose()
    }

    async fn latest_all(&self) -> Result<Vec<ThroneRound>, RoundStoreError> {
        let rows = sqlx::query_as::<_, ThroneRoundRow>(&format!(
            "SELECT DISTINCT ON (guild_id) {} FROM throne_rounds \
             ORDER BY guild_id, round_number DESC",
            ROUND_COLUMNS
        ))
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(ThroneRoundRow::into_round).collect()
    }

    async fn update_state(
        &self,
        guild_id: serenity::GuildId,
        round_number: i32,
        holder_id: serenity::UserId,
        last_claim_at: i64,
        scores: &[ScoreEntry],
    ) -> Result<(), RoundStoreError> {
        let scores = serde_json::to_value(scores)
            .map_err(|err| RoundStoreError::Corrupt(err.to_string()))?;

        sqlx::query(
            "UPDATE throne_rounds SET holder_id = $3, last_claim_at = $4, scores = $5 \
             WHERE guild_id = $1 AND round_number = $2",
        )
        .bind(i64::try_from(guild_id.get())?)
        .bind(round_number)
        .bind(i64::try_from(holder_id.get())?)
        .bind(last_claim_at)
        .bind(scores)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn mark_inactive(
        &self,
        guild_id: serenity::GuildId,
        round_number: i32,
    ) -> Result<(), RoundStoreError> {
        sqlx::query(
            "UPDATE throne_rounds SET active = FALSE \
             WHERE guild_id = $1 AND round_number = $2",
        )
        .bind(i64::try_from(guild_id.get())?)
        .bind(round_number)
        .execute(&self.db)
        .await?;

        Ok(())
    }
}

#[serenity::async_trait]
impl SettingsStore for PgRoundStore {
    async fn load(&self, guild_id: serenity::GuildId) -> Result<ThroneSettings, RoundStoreError> {
        let config = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT config FROM throne_settings WHERE guild_id = $1",
        )
        .bind(i64::try_from(guild_id.get())?)
        .fetch_optional(&self.db)
        .await?;

        match config {
            Some(config) => serde_json::from_value(config)
                .map_err(|err| RoundStoreError::Corrupt(err.to_string())),
            None => Ok(ThroneSettings::default()),
        }
    }

    async fn save(
        &self,
        guild_id: serenity::GuildId,
        settings: &ThroneSettings,
    ) -> Result<(), RoundStoreError> {
        let config = serde_json::to_value(settings)
            .map_err(|err| RoundStoreError::Corrupt(err.to_string()))?;

        sqlx::query(
            "INSERT INTO throne_settings (guild_id, config) VALUES ($1, $2) \
             ON CONFLICT (guild_id) DO UPDATE SET config = $2",
        )
        .bind(i64::try_from(guild_id.get())?)
        .bind(config)
        .execute(&self.db)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// In-memory [`RoundStore`] with the same one-active-round semantics as
    /// the Postgres implementation.
    #[derive(Default)]
    pub(crate) struct MemoryRoundStore {
        rows: Mutex<Vec<ThroneRound>>,
    }

    impl MemoryRoundStore {
        pub(crate) fn insert(&self, round: ThroneRound) {
            self.rows.lock().unwrap().push(round);
        }

        pub(crate) fn round(
            &self,
            guild_id: serenity::GuildId,
            round_number: i32,
        ) -> Option<ThroneRound> {
            self.rows
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.guild_id == guild_id && r.round_number == round_number)
                .cloned()
        }
    }

    #[serenity::async_trait]
    impl RoundStore for MemoryRoundStore {
        async fn create(&self, round: NewThroneRound) -> Result<ThroneRound, RoundStoreError> {
            let mut rows = self.rows.lock().unwrap();
            if rows.iter().any(|r| r.guild_id == round.guild_id && r.active) {
                return Err(RoundStoreError::AlreadyActive);
            }

            let round = ThroneRound {
                guild_id: round.guild_id,
                round_number: round.round_number,
                start_at: round.start_at,
                end_at: round.end_at,
                active: true,
                holder_id: round.holder_id,
                last_claim_at: round.last_claim_at,
                scores: Vec::new(),
            };
            rows.push(round.clone());
            Ok(round)
        }

        async fn latest(
            &self,
            guild_id: serenity::GuildId,
        ) -> Result<Option<ThroneRound>, RoundStoreError> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.guild_id == guild_id)
                .max_by_key(|r| r.round_number)
                .cloned())
        }

        async fn latest_all(&self) -> Result<Vec<ThroneRound>, RoundStoreError> {
            let rows = self.rows.lock().unwrap();
            let mut latest: HashMap<serenity::GuildId, ThroneRound> = HashMap::new();
            for row in rows.iter() {
                match latest.get(&row.guild_id) {
                    Some(existing) if existing.round_number >= row.round_number => {}
                    _ => {
                        latest.insert(row.guild_id, row.clone());
                    }
                }
            }
            Ok(latest.into_values().collect())
        }

        async fn update_state(
            &self,
            guild_id: serenity::GuildId,
            round_number: i32,
            holder_id: serenity::UserId,
            last_claim_at: i64,
            scores: &[ScoreEntry],
        ) -> Result<(), RoundStoreError> {
            let mut rows = self.rows.lock().unwrap();
            if let Some(round) = rows
                .iter_mut()
                .find(|r| r.guild_id == guild_id && r.round_number == round_number)
            {
                round.holder_id = holder_id;
                round.last_claim_at = last_claim_at;
                round.scores = scores.to_vec();
            }
            Ok(())
        }

        async fn mark_inactive(
            &self,
            guild_id: serenity::GuildId,
            round_number: i32,
        ) -> Result<(), RoundStoreError> {
            let mut rows = self.rows.lock().unwrap();
            if let Some(round) = rows
                .iter_mut()
                .find(|r| r.guild_id == guild_id && r.round_number == round_number)
            {
                round.active = false;
            }
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct MemorySettingsStore {
        settings: Mutex<HashMap<serenity::GuildId, ThroneSettings>>,
    }

    impl MemorySettingsStore {
        pub(crate) fn set(&self, guild_id: serenity::GuildId, settings: ThroneSettings) {
            self.settings.lock().unwrap().insert(guild_id, settings);
        }
    }

    #[serenity::async_trait]
    impl SettingsStore for MemorySettingsStore {
        async fn load(
            &self,
            guild_id: serenity::GuildId,
        ) -> Result<ThroneSettings, RoundStoreError> {
            Ok(self
                .settings
                .lock()
                .unwrap()
                .get(&guild_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn save(
            &self,
            guild_id: serenity::GuildId,
            settings: &ThroneSettings,
        ) -> Result<(), RoundStoreError> {
            self.settings
                .lock()
                .unwrap()
                .insert(guild_id, settings.clone());
            Ok(())
        }
    }
}
