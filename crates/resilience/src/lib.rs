//! Connection resilience for the datastore and the message broker.

pub mod broker;
pub mod consumer;
pub mod error;
pub mod nats;
pub mod pool;
pub mod redis_conn;

pub use broker::BrokerLink;
pub use consumer::{ConsumerSpec, Disposition, MessageHandler, QueueConsumer};
pub use error::{InfraError, InfraErrorKind};
pub use nats::{NatsConnector, NatsJobPublisher};
pub use pool::{Connector, PoolConfig, ResilientPool};
pub use redis_conn::RedisConnector;
