use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use tokio::time::sleep;
use tracing::debug;
use tracing::warn;

use super::Database;
use super::Transaction;
use super::TxOptions;
use crate::config::ScopedRetryConfig;
use crate::Result;

/// Runs `f` inside a scoped transaction.
///
/// The transaction is committed when `f` succeeds and left open, and
/// always closed before returning. A deadlocked unit is retried up to
/// `retries.count` times with a jittered pause in between.
pub async fn within_tx<T, F>(
    db: &dyn Database,
    options: &TxOptions,
    retries: ScopedRetryConfig,
    mut f: F,
) -> Result<T>
where
    F: for<'t> FnMut(&'t mut dyn Transaction) -> BoxFuture<'t, Result<T>> + Send,
    T: Send,
{
    let mut attempt = 0;
    loop {
        let result = try_within_tx(db, options, &mut f).await;
        match result {
            Err(e) if e.is_deadlock() && attempt < retries.count => {
                attempt += 1;
                let pause = retry_interval(Duration::from_millis(retries.interval_ms));
                warn!(
                    "scoped transaction deadlocked, retrying {} / {}, after {}ms",
                    attempt,
                    retries.count,
                    pause.as_millis()
                );
                if !pause.is_zero() {
                    sleep(pause).await;
                }
            }
            Err(e) => {
                if e.is_deadlock() && retries.count > 0 {
                    warn!("scoped transaction still deadlocked after {} retries; gave up", retries.count);
                }
                return Err(e);
            }
            Ok(v) => return Ok(v),
        }
    }
}

async fn try_within_tx<T, F>(
    db: &dyn Database,
    options: &TxOptions,
    f: &mut F,
) -> Result<T>
where
    F: for<'t> FnMut(&'t mut dyn Transaction) -> BoxFuture<'t, Result<T>> + Send,
    T: Send,
{
    let mut tx = db.begin_tx(options).await.map_err(|e| {
        warn!("failed to begin scoped transaction: {}", e);
        e
    })?;

    let mut result = f(tx.as_mut()).await;
    if result.is_ok() && !tx.closed() {
        if let Err(e) = tx.commit().await {
            result = Err(e);
        }
    }
    if let Err(e) = &result {
        debug!("scoped database transaction failed with error: {}", e);
    }

    if !tx.closed() {
        if let Err(e) = tx.close().await {
            warn!("close scoped database transaction failed with error: {}", e);
        }
    }
    result
}

/// `interval` plus a random duration in `[0, interval)`.
pub fn retry_interval(interval: Duration) -> Duration {
    if interval.is_zero() {
        return Duration::ZERO;
    }
    let jitter = rand::thread_rng().gen_range(0..interval.as_nanos() as u64);
    interval + Duration::from_nanos(jitter)
}
