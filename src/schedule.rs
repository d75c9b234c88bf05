use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Wait `initial_delay`, then run `job`, wait `delay`, and repeat until
/// `token` is cancelled.
///
/// The delay is measured from the end of each run, so a slow run pushes
/// every later run back. Runs never overlap.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    initial_delay: Duration,
    delay: Duration,
    token: CancellationToken,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        log::debug!("Periodic task '{}' started", name);
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(initial_delay) => {}
        }
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = job() => {}
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        log::debug!("Periodic task '{}' stopped", name);
    })
}
