use std::sync::Arc;

use crate::types::{Data, Error};
use crate::util;

pub(crate) async fn poll_timers(data: Arc<Data>) -> Result<(), Error> {
    data.timers.poll_once(util::now_unix()).await?;
    Ok(())
}
