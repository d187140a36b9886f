//! Self-healing connection holder for request/response datastores.
//!
//! One shared connection per pool. Queries that fail with a transient error
//! are retried on a fixed delay; between attempts the connection is rebuilt.
//! Concurrent callers that observe the same broken connection share a single
//! reconnect: whoever arrives second sees the generation moved and reuses the
//! outcome.

use crate::error::{InfraError, InfraErrorKind};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use tracker_core::config::RedisConfig;

/// Opens connections of one kind.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Clone + Send + Sync + 'static;

    /// Label used in logs and metrics.
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<Self::Conn, InfraError>;
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_attempts: 15,
            retry_delay: Duration::from_millis(1000),
            connect_timeout: Duration::from_millis(8000),
        }
    }
}

impl From<&RedisConfig> for PoolConfig {
    fn from(config: &RedisConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        }
    }
}

struct Slot<T> {
    conn: Option<T>,
    /// Bumped on every reconnect attempt, successful or not.
    generation: u64,
    last_error: Option<InfraError>,
}

pub struct ResilientPool<C: Connector> {
    connector: C,
    config: PoolConfig,
    slot: parking_lot::Mutex<Slot<C::Conn>>,
    reconnect_gate: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl<C: Connector> ResilientPool<C> {
    pub fn new(connector: C, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            slot: parking_lot::Mutex::new(Slot {
                conn: None,
                generation: 0,
                last_error: None,
            }),
            reconnect_gate: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Establish the first connection. Fails fast so startup can abort.
    pub async fn init(&self) -> Result<(), InfraError> {
        let seen = self.generation();
        self.reconnect(seen).await.map(|_| ())
    }

    /// Drop the connection; every later query fails with `Shutdown`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut slot = self.slot.lock();
        slot.conn = None;
        slot.last_error = Some(InfraError::shutdown());
        info!(pool = self.connector.name(), "Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn generation(&self) -> u64 {
        self.slot.lock().generation
    }

    pub fn is_connected(&self) -> bool {
        self.slot.lock().conn.is_some()
    }

    /// Current connection, connecting first if there is none.
    async fn current(&self) -> Result<(C::Conn, u64), InfraError> {
        let (conn, generation) = {
            let slot = self.slot.lock();
            (slot.conn.clone(), slot.generation)
        };
        match conn {
            Some(conn) => Ok((conn, generation)),
            None => {
                let conn = self.reconnect(generation).await?;
                Ok((conn, self.generation()))
            }
        }
    }

    /// Rebuild the connection unless someone already did since `seen`.
    pub async fn reconnect(&self, seen: u64) -> Result<C::Conn, InfraError> {
        if self.is_closed() {
            return Err(InfraError::shutdown());
        }

        let _gate = self.reconnect_gate.lock().await;

        {
            let slot = self.slot.lock();
            if slot.generation != seen {
                debug!(pool = self.connector.name(), "Reconnect already performed by another caller");
                return match (&slot.conn, &slot.last_error) {
                    (Some(conn), _) => Ok(conn.clone()),
                    (None, Some(err)) => Err(err.clone()),
                    (None, None) => Err(InfraError::new(InfraErrorKind::Closed, "no connection")),
                };
            }
        }

        let generation = {
            let mut slot = self.slot.lock();
            slot.generation += 1;
            slot.conn = None;
            slot.generation
        };
        metrics::counter!("pool.reconnect_attempts", "pool" => self.connector.name().to_string()).increment(1);

        let outcome = match tokio::time::timeout(self.config.connect_timeout, self.connector.connect()).await {
            Ok(result) => result,
            Err(elapsed) => Err(elapsed.into()),
        };

        let mut slot = self.slot.lock();
        if self.is_closed() {
            return Err(InfraError::shutdown());
        }
        match outcome {
            Ok(conn) => {
                info!(pool = self.connector.name(), generation, "Connection established");
                slot.conn = Some(conn.clone());
                slot.last_error = None;
                Ok(conn)
            }
            Err(err) => {
                warn!(pool = self.connector.name(), generation, error = %err, "Connection attempt failed");
                slot.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Run `op` against the shared connection, retrying transient failures.
    pub async fn query<T, F, Fut>(&self, op: F) -> Result<T, InfraError>
    where
        F: Fn(C::Conn) -> Fut,
        Fut: Future<Output = Result<T, InfraError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if self.is_closed() {
                return Err(InfraError::shutdown());
            }

            let err = match self.current().await {
                Ok((conn, generation)) => match op(conn).await {
                    Ok(value) => return Ok(value),
                    Err(err) => {
                        if err.is_transient() {
                            // Mark this connection broken so the next attempt rebuilds it.
                            let mut slot = self.slot.lock();
                            if slot.generation == generation {
                                slot.conn = None;
                            }
                        }
                        err
                    }
                },
                Err(err) => err,
            };

            if !err.is_transient() || attempt >= self.config.max_attempts {
                if err.is_transient() {
                    warn!(pool = self.connector.name(), attempts = attempt, error = %err, "Retry budget exhausted");
                }
                return Err(err);
            }

            debug!(pool = self.connector.name(), attempt, error = %err, "Transient failure, retrying");
            metrics::counter!("pool.retries", "pool" => self.connector.name().to_string()).increment(1);
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }
}
