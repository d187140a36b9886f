//! Durable JetStream queue consumer with bounded in-flight work.
//!
//! Messages are handled concurrently up to `prefetch`. Each message is
//! acknowledged only after its handler returns; a retry verdict naks it so
//! the broker redelivers. Long handlers keep extending the ack deadline so
//! the broker does not hand the same message to a second handler. When the
//! subscription dies the consumer asks the link for a reconnect and
//! resubscribes on the next generation. Closing the link stops the consumer.

use crate::broker::BrokerLink;
use crate::error::{InfraError, InfraErrorKind};
use crate::nats::{stream_config, NatsConnector};
use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy, AckKind};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

/// Stream errors in a row after which the subscription counts as dead.
const MAX_CONSECUTIVE_STREAM_ERRORS: u32 = 3;

/// What to tell the broker about a handled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Negative acknowledgement: the broker redelivers.
    Retry,
}

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn handle(&self, payload: &[u8]) -> Disposition;
}

/// Where a consumer reads from.
#[derive(Debug, Clone)]
pub struct ConsumerSpec {
    pub stream: String,
    pub stream_subjects: Vec<String>,
    pub durable: String,
    pub filter_subject: String,
    pub prefetch: usize,
    pub duplicate_window: Duration,
    /// How long the broker waits for an ack before redelivering.
    pub ack_wait: Duration,
}

impl ConsumerSpec {
    pub fn consumer_config(&self) -> pull::Config {
        pull::Config {
            durable_name: Some(self.durable.clone()),
            ack_policy: AckPolicy::Explicit,
            max_ack_pending: self.prefetch as i64,
            filter_subject: self.filter_subject.clone(),
            ack_wait: self.ack_wait,
            ..Default::default()
        }
    }

    /// How often an in-flight message gets a progress ack.
    pub fn progress_interval(&self) -> Duration {
        (self.ack_wait / 2).max(Duration::from_secs(1))
    }
}

pub struct QueueConsumer<H: MessageHandler> {
    link: Arc<BrokerLink<NatsConnector>>,
    spec: ConsumerSpec,
    handler: Arc<H>,
}

impl<H: MessageHandler> QueueConsumer<H> {
    pub fn new(link: Arc<BrokerLink<NatsConnector>>, spec: ConsumerSpec, handler: Arc<H>) -> Self {
        Self { link, spec, handler }
    }

    /// Run until the link is closed.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        info!(
            handler = self.handler.name(),
            stream = %self.spec.stream,
            subject = %self.spec.filter_subject,
            prefetch = self.spec.prefetch,
            "Queue consumer started"
        );

        let link = self.link.clone();
        link.supervise(self.handler.name(), |client| self.consume(client)).await;

        info!(handler = self.handler.name(), "Queue consumer stopped");
    }

    /// One subscription on one connection. Returns `Ok` when a newer
    /// connection is installed or the link closes, `Err` when the
    /// subscription itself is gone.
    async fn consume(&self, client: async_nats::Client) -> Result<(), InfraError> {
        let context = jetstream::new(client);
        let stream = context
            .get_or_create_stream(stream_config(
                &self.spec.stream,
                self.spec.stream_subjects.clone(),
                self.spec.duplicate_window,
            ))
            .await
            .map_err(broker_error)?;
        let consumer: jetstream::consumer::PullConsumer = stream
            .get_or_create_consumer(&self.spec.durable, self.spec.consumer_config())
            .await
            .map_err(broker_error)?;
        let mut messages = consumer.messages().await.map_err(broker_error)?;

        let permits = Arc::new(Semaphore::new(self.spec.prefetch.max(1)));
        let progress_every = self.spec.progress_interval();
        let mut generations = self.link.watch_generation();
        let mut consecutive_errors = 0;
        loop {
            let next = tokio::select! {
                next = messages.next() => next,
                _ = generations.changed() => return Ok(()),
            };
            let message = match next {
                Some(Ok(message)) => {
                    consecutive_errors = 0;
                    message
                }
                Some(Err(e)) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_CONSECUTIVE_STREAM_ERRORS {
                        return Err(broker_error(e));
                    }
                    warn!(handler = self.handler.name(), error = %e, consecutive_errors, "Message stream error");
                    continue;
                }
                None => return Err(InfraError::new(InfraErrorKind::Closed, "message stream ended")),
            };
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| InfraError::shutdown())?;
            let handler = self.handler.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let handling = handler.handle(&message.payload);
                tokio::pin!(handling);
                let mut progress = tokio::time::interval(progress_every);
                progress.tick().await;
                let disposition = loop {
                    tokio::select! {
                        disposition = &mut handling => break disposition,
                        _ = progress.tick() => {
                            if let Err(e) = message.ack_with(AckKind::Progress).await {
                                warn!(handler = handler.name(), error = %e, "Failed to extend ack deadline");
                            }
                        }
                    }
                };
                let result = match disposition {
                    Disposition::Ack => message.ack().await,
                    Disposition::Retry => message.ack_with(AckKind::Nak(None)).await,
                };
                if let Err(e) = result {
                    error!(handler = handler.name(), error = %e, ?disposition, "Failed to settle message");
                }
                metrics::counter!(
                    "consumer.messages",
                    "handler" => handler.name().to_string(),
                    "disposition" => match disposition {
                        Disposition::Ack => "ack",
                        Disposition::Retry => "retry",
                    }
                )
                .increment(1);
            });
        }
    }
}

fn broker_error(err: impl std::fmt::Display) -> InfraError {
    InfraError::new(InfraErrorKind::Closed, err.to_string())
}
