use std::{sync::Arc, time::Duration};

use poise::serenity_prelude::{self as serenity};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    ConnectOptions,
};
use tracing::{debug, log::LevelFilter};

use crate::modules::{permstimer, thronegame};
use crate::sink::DiscordSink;
use crate::types::Data;

mod config;
mod events;
mod modules;
mod sink;
mod task;
mod types;
mod util;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = config::load_config().expect("error loading envfile");
    let connect_opts = config
        .db
        .url
        .parse::<PgConnectOptions>()
        .expect(&format!("couldn't parse db url: {}", config.db.url))
        .log_statements(LevelFilter::Trace)
        .log_slow_statements(LevelFilter::Warn, Duration::from_secs(5));

    let db = PgPoolOptions::new()
        .max_connections(5)
        .connect_with(connect_opts)
        .await
        .expect("error connecting to db");

    sqlx::migrate!()
        .run(&db)
        .await
        .expect("error running migrations");

    let timer_poll_secs = config.bot.timer_poll_minutes * 60;

    let intents = serenity::GatewayIntents::all();
    let options = poise::FrameworkOptions {
        pre_command: |ctx| {
            Box::pin(async move {
                debug!("executing command /{}...", ctx.invoked_command_name());
            })
        },
        post_command: |ctx| {
            Box::pin(async move {
                debug!("finished executing command /{}", ctx.invoked_command_name());
            })
        },
        event_handler: |ctx, event, framework, data| {
            Box::pin(events::handler(ctx, event, framework, data))
        },
        commands: [permstimer::commands(), thronegame::commands()]
            .into_iter()
            .flatten()
            .collect(),
        ..Default::default()
    };

    let framework = poise::Framework::builder()
        .options(options)
        .setup(move |ctx, ready, framework| {
            Box::pin(async move {
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;

                let sink = Arc::new(DiscordSink::new(ctx.http.clone()));
                let timer_store = Arc::new(permstimer::db::PgTimerStore::new(db.clone()));
                let round_store = Arc::new(thronegame::db::PgRoundStore::new(db.clone()));

                let timers =
                    permstimer::engine::TimerEngine::new(timer_store, sink.clone(), timer_poll_secs);
                let throne = thronegame::engine::ThroneEngine::new(
                    round_store.clone(),
                    round_store,
                    sink,
                    ready.user.id,
                );

                let data = Arc::new(Data::new(timers, throne));

                permstimer::start_tasks(data.clone());
                thronegame::start_tasks(data.clone());

                Ok(data.clone())
            })
        })
        .build();

    let client = serenity::ClientBuilder::new(config.bot.token, intents)
        .framework(framework)
        .await;

    client.unwrap().start().await.unwrap();
}
