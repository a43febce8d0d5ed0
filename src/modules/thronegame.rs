use std::sync::Arc;

use tracing::error;

use crate::types::{Data, Error};

pub(crate) mod commands;
pub(crate) mod db;
pub(crate) mod engine;
pub(crate) mod tasks;

pub(crate) fn commands() -> Vec<poise::Command<Arc<Data>, Error>> {
    vec![
        commands::throne_setup(),
        commands::throne_set(),
        commands::throne_round_start(),
        commands::claim_throne(),
        commands::throne_leaderboard(),
        commands::force_end(),
        commands::force_seize(),
    ]
}

pub(crate) fn start_tasks(data: Arc<Data>) {
    tokio::spawn(async move {
        if let Err(err) = tasks::resume_rounds(data).await {
            error!("error resuming throne rounds: {}", err);
        }
    });
}
