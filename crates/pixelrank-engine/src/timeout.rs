use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};

/// Runs `work` on a detached thread and gives up after `timeout`. A call that
/// overruns keeps running in the background; its result is dropped.
pub(crate) fn call_with_timeout<T, F>(label: &str, timeout: Duration, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    thread::Builder::new()
        .name(format!("pixelrank-{label}"))
        .spawn(move || {
            let _ = tx.send(work());
        })
        .map_err(|err| anyhow!("failed to spawn {label} worker: {err}"))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(anyhow!(
            "{label} timed out after {:.1}s",
            timeout.as_secs_f64()
        )),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(anyhow!("{label} worker exited without a result"))
        }
    }
}
