use std::sync::Arc;

use crate::modules::permstimer::engine::TimerEngine;
use crate::modules::thronegame::engine::ThroneEngine;

pub(crate) struct Data {
    pub(crate) timers: Arc<TimerEngine>,
    pub(crate) throne: Arc<ThroneEngine>,
}

impl Data {
    pub(crate) fn new(timers: Arc<TimerEngine>, throne: Arc<ThroneEngine>) -> Self {
        Self { timers, throne }
    }
}

pub(crate) type Error = Box<dyn std::error::Error + Send + Sync>;
pub(crate) type Context<'a> = poise::Context<'a, Arc<Data>, Error>;
