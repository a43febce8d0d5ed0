use poise::serenity_prelude::{self as serenity};
use sqlx::types::chrono;
use tracing::debug;

use super::db::{NewPermsTimer, PermsPayload, TimerStoreError};
use super::engine::TimerError;
use crate::types::{Context, Error};
use crate::util;

/// Tri-state permission argument: allow, deny, or clear the overwrite.
#[derive(Debug, Clone, Copy, poise::ChoiceParameter)]
pub(crate) enum PermChoice {
    #[name = "allow"]
    Allow,
    #[name = "deny"]
    Deny,
    #[name = "inherit"]
    Inherit,
}

impl PermChoice {
    fn as_overwrite(self) -> Option<bool> {
        match self {
            PermChoice::Allow => Some(true),
            PermChoice::Deny => Some(false),
            PermChoice::Inherit => None,
        }
    }
}

fn parse_role_list(guild: &serenity::Guild, input: &str) -> Result<Vec<u64>, String> {
    let mut role_ids = Vec::new();

    for token in input.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        let id = token
            .trim_start_matches("<@&")
            .trim_end_matches('>')
            .parse::<u64>()
            .ok()
            .filter(|id| *id != 0);

        let role = match id {
            Some(id) => guild.roles.get(&serenity::RoleId::new(id)),
            None => guild
                .roles
                .values()
                .find(|r| r.name.eq_ignore_ascii_case(token)),
        };

        match role {
            Some(role) => role_ids.push(role.id.get()),
            None => return Err(format!("couldn't find a role matching `{}`", token)),
        }
    }

    if role_ids.is_empty() {
        return Err("no roles given".to_owned());
    }

    Ok(role_ids)
}

#[poise::command(
    slash_command,
    guild_only = true,
    rename = "timer-create",
    default_member_permissions = "MANAGE_CHANNELS"
)]
pub(crate) async fn timer_create(
    ctx: Context<'_>,
    #[description = "unique name for this timer"] name: String,
    #[description = "when to fire, RFC 3339 (2020-01-01T12:00:00+00:00)"] due: String,
    #[description = "comma-separated role mentions, ids, or names"] roles: String,
    #[description = "send-messages permission to apply"] send: PermChoice,
    #[description = "read-messages permission to apply"] read: PermChoice,
) -> Result<(), Error> {
    let guild = ctx.guild().ok_or("couldn't fetch guild")?.to_owned();

    debug!(
        guild_id = guild.id.get(),
        command = "timer-create",
        name = name,
        due = due,
    );

    let due_at = match chrono::DateTime::parse_from_rfc3339(due.trim()) {
        Ok(parsed) => parsed.timestamp(),
        Err(err) => {
            ctx.reply(format!(
                "couldn't parse `{}` ({}), expected something like 2020-01-01T12:00:00+00:00",
                due, err
            ))
            .await?;
            return Ok(());
        }
    };

    let role_ids = match parse_role_list(&guild, &roles) {
        Ok(role_ids) => role_ids,
        Err(reason) => {
            ctx.reply(format!("error: {}", reason)).await?;
            return Ok(());
        }
    };

    let new = NewPermsTimer {
        guild_id: guild.id,
        channel_id: ctx.channel_id(),
        name: name.trim().to_owned(),
        due_at,
        payload: PermsPayload {
            role_ids,
            send_messages: send.as_overwrite(),
            read_messages: read.as_overwrite(),
        },
    };

    match ctx.data().timers.create(new).await {
        Ok(timer) => {
            ctx.reply(format!(
                "timer `{}` will fire <t:{}:R> in this channel",
                timer.name, timer.due_at
            ))
            .await?;
        }
        Err(TimerError::Store(TimerStoreError::DuplicateName(name))) => {
            ctx.reply(format!("a timer named `{}` already exists", name))
                .await?;
        }
        Err(err) => return Err(err.into()),
    }

    Ok(())
}

#[poise::command(
    slash_command,
    guild_only = true,
    rename = "timer-list",
    default_member_permissions = "MANAGE_CHANNELS"
)]
pub(crate) async fn timer_list(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("couldn't fetch guild")?;

    let timers = ctx.data().timers.list_unfinished(guild_id).await?;
    if timers.is_empty() {
        ctx.reply("no pending timers").await?;
        return Ok(());
    }

    let now = util::now_unix();
    let lines: Vec<String> = timers
        .iter()
        .map(|t| {
            format!(
                "`{}` fires in {} (<t:{}>) in <#{}>",
                t.name,
                util::fmt_remaining(t.due_at - now),
                t.due_at,
                t.channel_id.get(),
            )
        })
        .collect();

    ctx.reply(lines.join("\n")).await?;
    Ok(())
}

#[poise::command(
    slash_command,
    guild_only = true,
    rename = "timer-fire",
    default_member_permissions = "MANAGE_CHANNELS"
)]
pub(crate) async fn timer_fire(
    ctx: Context<'_>,
    #[description = "name of the timer to fire right now"] name: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("couldn't fetch guild")?;

    match ctx.data().timers.force_fire(guild_id, name.trim()).await {
        Ok(()) => {
            ctx.reply(format!("timer `{}` fired", name)).await?;
        }
        Err(err @ (TimerError::NotFound(_) | TimerError::AlreadyFinished(_))) => {
            ctx.reply(err.to_string()).await?;
        }
        Err(err) => return Err(err.into()),
    }

    Ok(())
}
