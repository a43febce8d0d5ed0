use std::sync::Arc;

use tracing::error;

use crate::spawn_task;
use crate::types::{Data, Error};

pub(crate) mod commands;
pub(crate) mod db;
pub(crate) mod engine;
pub(crate) mod tasks;

pub(crate) fn commands() -> Vec<poise::Command<Arc<Data>, Error>> {
    vec![
        commands::timer_create(),
        commands::timer_list(),
        commands::timer_fire(),
    ]
}

pub(crate) fn start_tasks(data: Arc<Data>) {
    // sweep once right away so timers already due fire without waiting out
    // the first poll interval
    {
        let data = data.clone();
        tokio::spawn(async move {
            if let Err(err) = tasks::poll_timers(data).await {
                error!("error running startup timer sweep: {}", err);
            }
        });
    }

    spawn_task!(data.timers.poll_secs(), tasks::poll_timers, data);
}
