use poise::serenity_prelude::{self as serenity};
use tracing::debug;

use super::engine::{ClaimError, RoundError};
use crate::types::{Context, Error};

#[poise::command(
    slash_command,
    guild_only = true,
    rename = "throne-setup",
    default_member_permissions = "MANAGE_ROLES"
)]
pub(crate) async fn throne_setup(
    ctx: Context<'_>,
    #[description = "role the crown holder wears"] role: serenity::Role,
    #[description = "channel the game is played in"] channel: serenity::Channel,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("couldn't fetch guild")?;
    let channel_id = channel.id();

    let mut settings = ctx.data().throne.load_settings(guild_id).await?;
    settings.throne_role_id = Some(role.id.get());
    settings.game_channel_id = Some(channel_id.get());
    ctx.data().throne.save_settings(guild_id, &settings).await?;

    debug!(
        guild_id = guild_id.get(),
        role_id = role.id.get(),
        channel_id = channel_id.get(),
        "throne game configured",
    );

    ctx.reply(format!(
        "throne game set up, crown role <@&{}> in <#{}>",
        role.id.get(),
        channel_id.get(),
    ))
    .await?;
    Ok(())
}

#[poise::command(
    slash_command,
    guild_only = true,
    rename = "throne-set",
    default_member_permissions = "MANAGE_ROLES"
)]
pub(crate) async fn throne_set(
    ctx: Context<'_>,
    #[description = "seconds between claims"] cooldown_seconds: Option<i64>,
    #[description = "round length in hours"] round_length_hours: Option<f64>,
    #[description = "seconds of quiet before the bot tries a seize"] seize_delay_seconds: Option<
        i64,
    >,
    #[description = "chance (0-1) an idle seize succeeds"] seize_odds: Option<f64>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("couldn't fetch guild")?;

    if let Some(odds) = seize_odds {
        if !(0.0..=1.0).contains(&odds) {
            ctx.reply("error: seize odds must be between 0 and 1").await?;
            return Ok(());
        }
    }
    if matches!(cooldown_seconds, Some(secs) if secs < 0)
        || matches!(seize_delay_seconds, Some(secs) if secs < 0)
        || matches!(round_length_hours, Some(hours) if hours <= 0.0)
    {
        ctx.reply("error: durations must be positive").await?;
        return Ok(());
    }

    let mut settings = ctx.data().throne.load_settings(guild_id).await?;
    if let Some(secs) = cooldown_seconds {
        settings.cooldown_seconds = secs;
    }
    if let Some(hours) = round_length_hours {
        settings.round_length_hours = hours;
    }
    if let Some(secs) = seize_delay_seconds {
        settings.seize_delay_seconds = secs;
    }
    if let Some(odds) = seize_odds {
        settings.seize_odds = odds;
    }
    ctx.data().throne.save_settings(guild_id, &settings).await?;

    ctx.reply(format!(
        "settings updated: cooldown {}s, rounds run {}h, seize after {}s at odds {}",
        settings.cooldown_seconds,
        settings.round_length_hours,
        settings.seize_delay_seconds,
        settings.seize_odds,
    ))
    .await?;
    Ok(())
}

#[poise::command(
    slash_command,
    guild_only = true,
    rename = "throne-round-start",
    default_member_permissions = "MANAGE_ROLES"
)]
pub(crate) async fn throne_round_start(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("couldn't fetch guild")?;

    match ctx.data().throne.start_round(guild_id).await {
        Ok(round) => {
            ctx.reply(format!("round {} started", round.round_number))
                .await?;
        }
        Err(err @ (RoundError::AlreadyActive | RoundError::NotConfigured)) => {
            ctx.reply(err.to_string()).await?;
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

#[poise::command(slash_command, guild_only = true, rename = "claim-throne")]
pub(crate) async fn claim_throne(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("couldn't fetch guild")?;

    // claims only count in the configured game channel
    let settings = ctx.data().throne.load_settings(guild_id).await?;
    if settings.game_channel_id != Some(ctx.channel_id().get()) {
        ctx.reply("the throne game isn't played in this channel")
            .await?;
        return Ok(());
    }

    match ctx.data().throne.claim(guild_id, ctx.author().id).await {
        Ok(_) => {
            // the engine announces the takeover in the game channel
            ctx.reply("the throne is yours!").await?;
        }
        Err(ClaimError::OnCooldown { remaining }) => {
            let holder = ctx.data().throne.holder(guild_id);
            ctx.reply(match holder {
                Some(holder) => format!(
                    "the throne can not yet be claimed, allow <@{}> their {}s of fame!",
                    holder.get(),
                    remaining,
                ),
                None => format!("the throne can not be claimed for another {}s", remaining),
            })
            .await?;
        }
        Err(err @ (ClaimError::AlreadyHolder | ClaimError::NoActiveRound)) => {
            ctx.reply(err.to_string()).await?;
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

#[poise::command(
    slash_command,
    guild_only = true,
    rename = "throne-leaderboard",
    channel_cooldown = 30
)]
pub(crate) async fn throne_leaderboard(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("couldn't fetch guild")?;

    match ctx.data().throne.current_leaderboard(guild_id) {
        Ok(board) if board.is_empty() => {
            ctx.reply("nobody has scored yet this round").await?;
        }
        Ok(board) => {
            ctx.reply(format!("Leaderboard for the current round:\n\n{}", board))
                .await?;
        }
        Err(err @ RoundError::NoActiveRound) => {
            ctx.reply(err.to_string()).await?;
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

#[poise::command(
    slash_command,
    guild_only = true,
    rename = "force-end",
    default_member_permissions = "MANAGE_ROLES"
)]
pub(crate) async fn force_end(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("couldn't fetch guild")?;

    match ctx.data().throne.force_end(guild_id).await {
        Ok(()) => {
            ctx.reply("round ended").await?;
        }
        Err(err @ RoundError::NoActiveRound) => {
            ctx.reply(err.to_string()).await?;
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

#[poise::command(
    slash_command,
    guild_only = true,
    rename = "force-seize",
    default_member_permissions = "MANAGE_ROLES"
)]
pub(crate) async fn force_seize(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("couldn't fetch guild")?;

    match ctx.data().throne.force_seize(guild_id).await {
        Ok(()) => {
            ctx.reply("so it is done").await?;
        }
        Err(err @ (RoundError::NoActiveRound | RoundError::NotConfigured)) => {
            ctx.reply(err.to_string()).await?;
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}
