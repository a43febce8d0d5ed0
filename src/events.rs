use std::sync::Arc;

use poise::serenity_prelude::{self as serenity};
use tracing::{debug, info};

use crate::types::{Data, Error};

pub(crate) async fn handler(
    _ctx: &serenity::Context,
    event: &serenity::FullEvent,
    _framework: poise::FrameworkContext<'_, Arc<Data>, Error>,
    _data: &Data,
) -> Result<(), Error> {
    match event {
        serenity::FullEvent::Ready { data_about_bot } => {
            info!(
                user_id = data_about_bot.user.id.get(),
                guilds = data_about_bot.guilds.len(),
                "connected to discord as '{}'",
                data_about_bot.user.name,
            );
        }
        serenity::FullEvent::GuildCreate { guild, .. } => {
            debug!(guild_id = guild.id.get(), "guild available: {}", guild.name);
        }
        _ => {}
    }
    Ok(())
}
