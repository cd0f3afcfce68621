//! Helpers shared by the multi-rank integration tests.

use anyhow::{anyhow, bail, Result};
use crossbeam::channel::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

/// Upper bound for one multi-rank test run.
pub const RANK_TIMEOUT: Duration = Duration::from_secs(120);

/// Run `f` on its own thread and fail if it has not returned within `limit`.
///
/// Local ranks meet on a shared barrier, so one rank returning early leaves
/// the others blocked for good. The stuck threads are left behind and the
/// test fails instead of hanging.
pub fn within<T, F>(limit: Duration, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = channel::bounded(1);
    thread::Builder::new()
        .name("rank-driver".to_string())
        .spawn(move || {
            let _ = tx.send(f());
        })?;

    match rx.recv_timeout(limit) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => bail!("ranks still running after {:?}", limit),
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("rank driver panicked")),
    }
}
