//! Cooperative cancellation of a running load.
//!
//! Once the token is cancelled, stream reads fail and no further layer or image is started.

pub use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Fail with [`Error::Cancelled`] if `token` was cancelled.
pub(crate) fn check(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}
