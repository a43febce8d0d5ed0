use std::sync::Arc;

use crate::types::{Data, Error};

/// Re-arm the round loops for rounds that were active when the process last
/// stopped.
pub(crate) async fn resume_rounds(data: Arc<Data>) -> Result<(), Error> {
    data.throne.resume().await?;
    Ok(())
}
