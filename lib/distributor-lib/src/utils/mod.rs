use crate::config::Backoff;
use std::{future::Future, pin::Pin};

pub mod tower_client;

pub use tower_client::TowerClient;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Run `f` until it succeeds, fails with a non-transient error, or the
/// backoff runs out of retries.
pub async fn retry_transient<T, E, F, Fut>(
    backoff: &Backoff,
    what: &str,
    is_transient: impl Fn(&E) -> bool,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < backoff.retries && is_transient(&error) => {
                let delay = backoff.delay(attempt);
                tracing::warn!("{} failed: {}, retrying in {:?}", what, error, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
