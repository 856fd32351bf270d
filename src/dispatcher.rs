//! Request dispatch: pairs a connection pool with the retry and tracker
//! failover policy shared by every operation.
//!
//! A single "exchange" is acquire-connection -> send -> receive -> release.
//! [`Dispatcher::exchange`] runs one exchange against a specific endpoint,
//! retrying up to the configured count when the failure is classified as
//! retryable (see [`FastDFSError::is_retryable`]). [`Dispatcher::exchange_tracker`]
//! additionally fails over across every configured tracker in round-robin
//! order, so a single dead tracker doesn't fail a whole request.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionPool};
use crate::errors::{FastDFSError, Result};
use crate::types::Endpoint;

/// Wraps a [`ConnectionPool`] with the retry/failover policy used by operations.
pub struct Dispatcher {
    pool: Arc<ConnectionPool>,
    retry_count: usize,
}

impl Dispatcher {
    pub fn new(pool: Arc<ConnectionPool>, retry_count: usize) -> Self {
        Self { pool, retry_count }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Runs one request/response exchange against `endpoint`, retrying the
    /// whole acquire-send-recv cycle up to `retry_count` additional times
    /// when the failure is retryable. Non-retryable failures (and the
    /// terminal retryable failure) propagate directly.
    pub async fn exchange<F, Fut, T>(&self, endpoint: &Endpoint, mut op: F) -> Result<T>
    where
        F: FnMut(Connection) -> Fut,
        Fut: Future<Output = (Connection, Result<T>)>,
    {
        let mut attempt = 0usize;
        loop {
            let conn = match self.pool.get(endpoint).await {
                Ok(conn) => conn,
                Err(e) if e.is_retryable() && attempt < self.retry_count => {
                    attempt += 1;
                    debug!(endpoint = %endpoint, attempt, error = %e, "retrying connection acquire");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let (conn, result) = op(conn).await;
            self.pool.put(conn).await;

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.retry_count => {
                    attempt += 1;
                    debug!(endpoint = %endpoint, attempt, error = %e, "retrying exchange");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs `op` against every tracker configured on this dispatcher's pool,
    /// starting from the next round-robin position, until one succeeds, a
    /// non-retryable error is hit, or all trackers have been tried. Each
    /// attempt against an individual tracker still goes through
    /// [`Dispatcher::exchange`]'s own retry policy; only once that's
    /// exhausted with a *retryable* error does this move on to the next
    /// tracker. A non-retryable error (e.g. `Protocol`, `FileNotFound`,
    /// `InvalidArgument`) propagates immediately instead of triggering
    /// failover, since trying another tracker can't change the outcome.
    pub async fn exchange_tracker<F, Fut, T>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(Connection) -> Fut,
        Fut: Future<Output = (Connection, Result<T>)>,
    {
        let trackers = self.pool.configured_endpoints().to_vec();
        if trackers.is_empty() {
            return Err(FastDFSError::NoStorageServer);
        }

        let start = self
            .pool
            .next_round_robin()
            .unwrap_or_else(|| trackers[0].clone());
        let start_idx = trackers.iter().position(|e| *e == start).unwrap_or(0);

        let mut last_err = None;
        for i in 0..trackers.len() {
            let endpoint = &trackers[(start_idx + i) % trackers.len()];
            match self.exchange(endpoint, &mut op).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    warn!(tracker = %endpoint, error = %e, "tracker exchange exhausted retries, trying next tracker");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or(FastDFSError::NoStorageServer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::PoolMode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn dead_endpoint() -> Endpoint {
        // bind then drop immediately: guarantees nothing is listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        Endpoint {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
        }
    }

    #[tokio::test]
    async fn non_retryable_error_short_circuits() {
        let ep = Endpoint {
            host: "127.0.0.1".to_string(),
            port: 1,
        };
        let pool = Arc::new(ConnectionPool::new(
            PoolMode::Strict,
            vec![ep.clone()],
            2,
            Duration::from_millis(100),
            100,
            Duration::from_secs(30),
        ));
        let dispatcher = Dispatcher::new(pool, 3);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result: Result<()> = dispatcher
            .exchange(&ep, move |conn| {
                calls2.fetch_add(1, Ordering::SeqCst);
                async move { (conn, Err(FastDFSError::InvalidArgument("bad".into()))) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0, "connection never acquired for unreachable endpoint implies op body not invoked");
    }

    #[tokio::test]
    async fn tracker_failover_tries_next_on_connect_failure() {
        let dead = dead_endpoint().await;

        let (good_ep, listener) = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            (
                Endpoint {
                    host: "127.0.0.1".to_string(),
                    port: addr.port(),
                },
                listener,
            )
        };
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let pool = Arc::new(ConnectionPool::new(
            PoolMode::Strict,
            vec![dead, good_ep.clone()],
            2,
            Duration::from_millis(200),
            200,
            Duration::from_secs(30),
        ));
        let dispatcher = Dispatcher::new(pool, 0);

        let result: Result<i32> = dispatcher
            .exchange_tracker(|conn| async move { (conn, Ok(42)) })
            .await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn exchange_tracker_does_not_failover_on_non_retryable_error() {
        let (ep_a, listener_a) = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            (
                Endpoint {
                    host: "127.0.0.1".to_string(),
                    port: addr.port(),
                },
                listener,
            )
        };
        let (ep_b, listener_b) = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            (
                Endpoint {
                    host: "127.0.0.1".to_string(),
                    port: addr.port(),
                },
                listener,
            )
        };
        for listener in [listener_a, listener_b] {
            tokio::spawn(async move {
                loop {
                    if listener.accept().await.is_err() {
                        break;
                    }
                }
            });
        }

        let pool = Arc::new(ConnectionPool::new(
            PoolMode::Strict,
            vec![ep_a, ep_b],
            2,
            Duration::from_millis(200),
            200,
            Duration::from_secs(30),
        ));
        let dispatcher = Dispatcher::new(pool, 0);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result: Result<()> = dispatcher
            .exchange_tracker(move |conn| {
                calls2.fetch_add(1, Ordering::SeqCst);
                async move { (conn, Err(FastDFSError::InvalidArgument("bad".into()))) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(
            calls.load(Ordering::SeqCst),
            1,
            "a non-retryable error must propagate immediately instead of trying the next tracker"
        );
    }
}
