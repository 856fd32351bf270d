//! FastDFS Connection Management
//!
//! This module handles TCP connections to FastDFS servers with connection pooling,
//! automatic reconnection, and health checking.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::errors::{FastDFSError, Result};
use crate::types::Endpoint;

/// RAII guard for one claimed slot in a bucket's in-use count.
///
/// A checked-out `Connection` always carries one of these. Whichever way
/// the slot stops being in use — `ConnectionPool::put` consuming it
/// explicitly on a normal return, or the `Connection` simply being dropped
/// mid-exchange because the caller cancelled it (a `tokio::time::timeout`
/// or `select!` arm that didn't win) — `Drop` releases the slot and wakes
/// one waiter. Without this, a cancelled exchange would leak its `in_use`
/// count forever, since nothing else is guaranteed to run on that path.
struct InUseGuard {
    in_use: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl Drop for InUseGuard {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

/// Represents a TCP connection to a FastDFS server (tracker or storage)
///
/// It wraps a TcpStream with additional metadata and async operations.
/// Each connection tracks its last usage time for idle timeout management,
/// and latches unhealthy once an I/O error is observed so it is never
/// returned to the free list. While checked out of the pool it also holds
/// an `InUseGuard`, so dropping a `Connection` anywhere (not just via
/// `ConnectionPool::put`) always releases its slot.
pub struct Connection {
    stream: TcpStream,
    endpoint: Endpoint,
    last_used: Instant,
    healthy: bool,
    guard: Option<InUseGuard>,
}

impl Connection {
    /// Creates a new connection with an established TCP stream. Not yet
    /// checked out of any pool; `ConnectionPool` attaches the in-use guard.
    fn new(stream: TcpStream, endpoint: Endpoint) -> Self {
        Self {
            stream,
            endpoint,
            last_used: Instant::now(),
            healthy: true,
            guard: None,
        }
    }

    /// Transmits data to the server with optional timeout
    ///
    /// This method updates the last_used timestamp on success and latches
    /// the connection unhealthy on any failure.
    pub async fn send(&mut self, data: &[u8], timeout_ms: u64) -> Result<()> {
        let result = timeout(
            Duration::from_millis(timeout_ms),
            self.stream.write_all(data),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                self.last_used = Instant::now();
                Ok(())
            }
            Ok(Err(e)) => {
                self.healthy = false;
                Err(FastDFSError::Network {
                    operation: "write".to_string(),
                    addr: self.endpoint.to_string(),
                    source: e,
                })
            }
            Err(_) => {
                self.healthy = false;
                Err(FastDFSError::NetworkTimeout("write".to_string()))
            }
        }
    }

    /// Reads exactly 'size' bytes from the server
    ///
    /// This method blocks until all bytes are received or an error occurs.
    /// The timeout applies to the entire operation, not individual reads.
    pub async fn receive_full(&mut self, size: usize, timeout_ms: u64) -> Result<Bytes> {
        let mut buf = vec![0u8; size];

        let result = timeout(
            Duration::from_millis(timeout_ms),
            self.stream.read_exact(&mut buf),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                self.last_used = Instant::now();
                Ok(Bytes::from(buf))
            }
            Ok(Err(e)) => {
                self.healthy = false;
                Err(FastDFSError::Network {
                    operation: "read".to_string(),
                    addr: self.endpoint.to_string(),
                    source: e,
                })
            }
            Err(_) => {
                self.healthy = false;
                Err(FastDFSError::NetworkTimeout("read".to_string()))
            }
        }
    }

    /// Returns the timestamp of the last send or receive operation
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Returns the server endpoint this connection is connected to
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Whether this connection is still believed to be usable
    ///
    /// Latched false the moment any send/receive observes an I/O error or
    /// timeout; never resets back to true.
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }
}

/// Whether a pool accepts only its originally configured endpoints or may
/// grow new buckets on demand.
///
/// Tracker pools are `Strict`: the tracker address list is fixed at
/// construction and querying an unknown endpoint is a programming error.
/// Storage pools are `Dynamic`: storage servers are discovered from tracker
/// responses at runtime, so new endpoint buckets are created lazily.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    Strict,
    Dynamic,
}

struct Bucket {
    free: Vec<Connection>,
    /// Shared with every `InUseGuard` currently checked out for this
    /// endpoint, so a guard can release its slot without re-acquiring the
    /// `buckets` mutex.
    in_use: Arc<AtomicUsize>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            free: Vec::new(),
            in_use: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Manages a pool of reusable connections to multiple servers
///
/// It maintains a separate bucket of free connections plus an in-use count
/// per endpoint, and handles:
///   - Connection reuse to minimize handshake overhead
///   - Idle connection cleanup
///   - Bounded per-endpoint concurrency with back-pressure when saturated
///   - Automatic connection health checking
///   - Round-robin endpoint selection when the caller has no preference
pub struct ConnectionPool {
    mode: PoolMode,
    configured: Vec<Endpoint>,
    rr_cursor: std::sync::atomic::AtomicUsize,
    max_conns: usize,
    connect_timeout: Duration,
    network_timeout: u64,
    idle_timeout: Duration,
    buckets: Arc<Mutex<HashMap<Endpoint, Bucket>>>,
    notify: Arc<Notify>,
    closed: Arc<Mutex<bool>>,
}

impl ConnectionPool {
    /// Creates a new connection pool for the specified servers
    ///
    /// The pool starts empty; connections are created on-demand when get is called.
    pub fn new(
        mode: PoolMode,
        endpoints: Vec<Endpoint>,
        max_conns: usize,
        connect_timeout: Duration,
        network_timeout: u64,
        idle_timeout: Duration,
    ) -> Self {
        let mut buckets = HashMap::new();
        for ep in &endpoints {
            buckets.insert(ep.clone(), Bucket::new());
        }

        Self {
            mode,
            configured: endpoints,
            rr_cursor: std::sync::atomic::AtomicUsize::new(0),
            max_conns,
            connect_timeout,
            network_timeout,
            idle_timeout,
            buckets: Arc::new(Mutex::new(buckets)),
            notify: Arc::new(Notify::new()),
            closed: Arc::new(Mutex::new(false)),
        }
    }

    /// Picks the next configured endpoint round-robin
    ///
    /// Only meaningful for pools with more than one configured endpoint
    /// (trackers); storage pools typically have a specific endpoint chosen
    /// by the caller from a tracker response instead.
    pub fn next_round_robin(&self) -> Option<Endpoint> {
        if self.configured.is_empty() {
            return None;
        }
        let i = self
            .rr_cursor
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            % self.configured.len();
        Some(self.configured[i].clone())
    }

    /// All endpoints this pool was configured with
    pub fn configured_endpoints(&self) -> &[Endpoint] {
        &self.configured
    }

    /// Retrieves a connection to the given endpoint from the pool, or
    /// creates a new one, waiting for capacity if the endpoint is saturated.
    ///
    /// Returns `ConnectionTimeout` if no slot frees up within `connect_timeout`.
    pub async fn get(&self, endpoint: &Endpoint) -> Result<Connection> {
        {
            let closed = self.closed.lock().await;
            if *closed {
                return Err(FastDFSError::ClientClosed);
            }
        }

        if self.mode == PoolMode::Strict && !self.configured.contains(endpoint) {
            return Err(FastDFSError::InvalidArgument(format!(
                "endpoint {} is not a configured tracker",
                endpoint
            )));
        }

        let deadline = Instant::now() + self.connect_timeout;

        loop {
            // Try to reuse a fresh, healthy idle connection, or claim a slot
            // to create a new one.
            enum Outcome {
                Reused(Connection, Arc<AtomicUsize>),
                CreateSlot(Arc<AtomicUsize>),
                Wait,
            }

            let outcome = {
                let mut buckets = self.buckets.lock().await;
                let bucket = buckets
                    .entry(endpoint.clone())
                    .or_insert_with(Bucket::new);

                let mut reused = None;
                while let Some(conn) = bucket.free.pop() {
                    if conn.is_healthy() && conn.last_used().elapsed() < self.idle_timeout {
                        reused = Some(conn);
                        break;
                    }
                    debug!(endpoint = %endpoint, "discarding stale or unhealthy pooled connection");
                }

                if let Some(conn) = reused {
                    bucket.in_use.fetch_add(1, Ordering::SeqCst);
                    Outcome::Reused(conn, bucket.in_use.clone())
                } else if bucket.free.len() + bucket.in_use.load(Ordering::SeqCst) < self.max_conns
                {
                    bucket.in_use.fetch_add(1, Ordering::SeqCst);
                    Outcome::CreateSlot(bucket.in_use.clone())
                } else {
                    Outcome::Wait
                }
            };

            match outcome {
                Outcome::Reused(mut conn, in_use) => {
                    conn.guard = Some(InUseGuard {
                        in_use,
                        notify: self.notify.clone(),
                    });
                    return Ok(conn);
                }
                Outcome::CreateSlot(in_use) => {
                    return match self.create_connection(endpoint).await {
                        Ok(mut conn) => {
                            conn.guard = Some(InUseGuard {
                                in_use,
                                notify: self.notify.clone(),
                            });
                            Ok(conn)
                        }
                        Err(e) => {
                            in_use.fetch_sub(1, Ordering::SeqCst);
                            self.notify.notify_one();
                            Err(e)
                        }
                    };
                }
                Outcome::Wait => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(FastDFSError::ConnectionTimeout(endpoint.to_string()));
                    }
                    if timeout(remaining, self.notify.notified()).await.is_err() {
                        return Err(FastDFSError::ConnectionTimeout(endpoint.to_string()));
                    }
                }
            }
        }
    }

    /// Creates a new TCP connection to a server
    async fn create_connection(&self, endpoint: &Endpoint) -> Result<Connection> {
        let addr = endpoint.to_string();
        let result = timeout(self.connect_timeout, TcpStream::connect(&addr)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(Connection::new(stream, endpoint.clone()))
            }
            Ok(Err(e)) => Err(FastDFSError::Network {
                operation: "connect".to_string(),
                addr,
                source: e,
            }),
            Err(_) => Err(FastDFSError::ConnectionTimeout(addr)),
        }
    }

    /// Returns a connection to the pool for reuse
    ///
    /// The connection is only kept in the free list if:
    ///   - The pool is not closed
    ///   - The connection reported itself healthy
    ///   - The free list is not already at capacity
    ///
    /// In every case, the in-use slot is released and a waiter is woken,
    /// via dropping the connection's `InUseGuard` — the same release that
    /// happens if the connection is instead dropped without ever reaching
    /// `put` (a cancelled exchange).
    pub async fn put(&self, mut conn: Connection) {
        let guard = conn.guard.take();
        let endpoint = conn.endpoint().clone();
        let keep = {
            let closed = self.closed.lock().await;
            !*closed && conn.is_healthy()
        };

        let mut buckets = self.buckets.lock().await;
        if let Some(bucket) = buckets.get_mut(&endpoint) {
            if keep && bucket.free.len() < self.max_conns {
                bucket.free.push(conn);
            } else if !keep {
                warn!(endpoint = %endpoint, "dropping unhealthy connection instead of pooling it");
            }
            self.clean_bucket(bucket);
        }
        drop(buckets);

        drop(guard);
    }

    /// Removes stale connections from a bucket's free list
    fn clean_bucket(&self, bucket: &mut Bucket) {
        let idle_timeout = self.idle_timeout;
        bucket
            .free
            .retain(|conn| conn.is_healthy() && conn.last_used().elapsed() <= idle_timeout);
    }

    /// Network I/O timeout in milliseconds to use for connections from this pool
    pub fn network_timeout(&self) -> u64 {
        self.network_timeout
    }

    /// Dynamically adds a new server endpoint to the pool
    ///
    /// This is useful for adding storage servers discovered at runtime. A
    /// no-op for `Strict` pools and for endpoints already known.
    pub async fn add_endpoint(&self, endpoint: Endpoint) {
        if self.mode == PoolMode::Strict {
            return;
        }
        let closed = self.closed.lock().await;
        if *closed {
            return;
        }
        drop(closed);

        let mut buckets = self.buckets.lock().await;
        buckets.entry(endpoint).or_insert_with(Bucket::new);
    }

    /// Shuts down the connection pool and closes all connections
    ///
    /// After close is called, get will return ClientClosed error.
    /// It's safe to call close multiple times.
    pub async fn close(&self) {
        let mut closed = self.closed.lock().await;
        if *closed {
            return;
        }
        *closed = true;
        drop(closed);

        let mut buckets = self.buckets.lock().await;
        buckets.clear();
        drop(buckets);

        self.notify.notify_waiters();
    }
}
