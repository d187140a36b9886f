//! Long-lived broker connection with application-level reconnect.
//!
//! Consumers hold the link and run their subscriptions under
//! [`BrokerLink::supervise`]. A subscription that fails on the connection
//! that is still current asks for a reconnect; one that ends because a newer
//! connection was installed just resubscribes. Only one reconnect loop runs
//! per generation, however many consumers share the link.

use crate::error::InfraError;
use crate::pool::Connector;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct BrokerLink<C: Connector> {
    connector: C,
    reconnect_delay: Duration,
    current: RwLock<Option<C::Conn>>,
    reconnecting: AtomicBool,
    closed: AtomicBool,
    generation: watch::Sender<u64>,
}

impl<C: Connector> BrokerLink<C> {
    pub fn new(connector: C, reconnect_delay: Duration) -> Arc<Self> {
        let (generation, _) = watch::channel(0);
        Arc::new(Self {
            connector,
            reconnect_delay,
            current: RwLock::new(None),
            reconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            generation,
        })
    }

    /// First connection, made inline so startup can report failure.
    pub async fn init(&self) -> Result<(), InfraError> {
        let conn = self.connector.connect().await?;
        self.install(conn);
        Ok(())
    }

    fn install(&self, conn: C::Conn) {
        *self.current.write() = Some(conn);
        self.generation.send_modify(|g| *g += 1);
        info!(link = self.connector.name(), generation = *self.generation.borrow(), "Broker connected");
    }

    pub fn connection(&self) -> Option<C::Conn> {
        self.current.read().clone()
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Receiver that changes whenever a new connection is installed or the
    /// link is closed.
    pub fn watch_generation(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    /// Start a delayed reconnect loop for the connection of generation
    /// `seen`. Does nothing when that connection was already replaced or a
    /// loop is running. Returns whether this call started it.
    pub fn schedule_reconnect(self: &Arc<Self>, seen: u64) -> bool {
        if self.is_closed() || self.generation() != seen {
            return false;
        }
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        if self.generation() != seen {
            self.reconnecting.store(false, Ordering::SeqCst);
            return false;
        }

        metrics::counter!("broker.reconnects_scheduled", "link" => self.connector.name().to_string()).increment(1);
        let link = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(link.reconnect_delay).await;
                if link.is_closed() {
                    break;
                }
                match link.connector.connect().await {
                    Ok(conn) => {
                        link.install(conn);
                        break;
                    }
                    Err(e) => {
                        warn!(link = link.connector.name(), error = %e, "Broker reconnect failed, will retry");
                    }
                }
            }
            link.reconnecting.store(false, Ordering::SeqCst);
        });
        true
    }

    /// Keep `subscribe` running on the current connection until the link is
    /// closed. `subscribe` returns `Ok` when it ends because the generation
    /// moved on or the link closed, and `Err` when the subscription died.
    pub async fn supervise<F, Fut>(self: &Arc<Self>, name: &str, mut subscribe: F)
    where
        F: FnMut(C::Conn) -> Fut,
        Fut: Future<Output = Result<(), InfraError>>,
    {
        let mut generations = self.watch_generation();
        loop {
            if self.is_closed() {
                break;
            }
            let started_on = *generations.borrow_and_update();

            match self.connection() {
                Some(conn) => match subscribe(conn).await {
                    Ok(()) => debug!(consumer = name, generation = started_on, "Subscription handed over"),
                    Err(e) => {
                        warn!(consumer = name, generation = started_on, error = %e, "Subscription failed");
                        self.schedule_reconnect(started_on);
                    }
                },
                None => {
                    warn!(consumer = name, "Broker not connected");
                    self.schedule_reconnect(started_on);
                }
            }

            if self.is_closed() {
                break;
            }
            if self.generation() == started_on && generations.changed().await.is_err() {
                break;
            }
        }
    }

    /// Drop the connection and wake everyone waiting on a generation.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        *self.current.write() = None;
        self.generation.send_modify(|_| {});
        info!(link = self.connector.name(), "Broker link closed");
    }
}
