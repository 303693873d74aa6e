//! # Transactional Outbox Engine
//!
//! A durable, partitioned outbox dispatcher: it reads records written by application
//! transactions and delivers each one exactly once to a user-supplied handler, with per-key
//! ordering, partition-based horizontal sharding across a fleet of worker processes, failure
//! isolation, retries, and a fallback path for records that exhaust their delivery attempts.
//!
//! ## What is the Transactional Outbox pattern?
//!
//! Application code writes a durable [`record::OutboxRecord`] in the *same* database transaction
//! as its business-logic change. A background engine running in every process of the fleet then
//! delivers that record to a registered [`handler::Handler`], guaranteeing at-least-once delivery
//! even across crashes, restarts, and transient broker/DB unavailability.
//!
//! This guarantees **at-least-once delivery** and prevents event loss even if:
//! - The service crashes after the business transaction commits but before a handler runs.
//! - The downstream system a handler calls into is temporarily unavailable.
//! - The process hosting a partition dies mid-tick (another instance reclaims its partitions).
//!
//! ## Architecture
//!
//! - [`record`] / [`instance`] / [`partition`]: the three durable data models (§3).
//! - [`store`]: narrow repository traits per table, plus `sqlx`/PostgreSQL implementations.
//! - [`codec`]: the pluggable payload codec (`serde_json` by default); the engine itself only
//!   ever sees opaque bytes.
//! - [`clock`] / [`hash`]: deterministic time and the frozen key→partition hash (§4.12).
//! - [`handler`] / [`retry`] / [`invoker`] / [`fallback`] / [`chain`]: handler registration,
//!   retry policy, invocation with context-scope propagation, fallback dispatch, and the
//!   Primary → Retry → Fallback chain of responsibility (§4.2-4.6).
//! - [`instance_registry`] / [`coordinator`]: fleet liveness and the 256-partition rebalancer
//!   (§4.10-4.11).
//! - [`scheduler`] / [`trigger`]: the per-tick poll loop, per-key fan-out, and the polling cadence
//!   policy (§4.7-4.8).
//! - [`routing`]: pure payload→destination selection for handlers that externalize to a broker
//!   (§4.13).
//! - [`context`]: optional per-record-type key extractors and context providers consulted by
//!   `schedule()` (§4.1).
//! - [`outbox`]: the application-facing façade tying all of the above together (§4.1, §6).
//! - [`config`]: every tunable knob enumerated in §6, loaded via the `config` crate.
//! - [`error`]: the engine's error taxonomy (§7).
//!
//! ## Usage example
//!
//! ### 1. Register handlers and start the engine
//!
//! ```rust,no_run
//! use transactional_outbox::{
//!     EngineConfig, Handler, HandlerKind, Metadata, Outbox, OutboxBuilder, OutboxResult,
//!     SqlxInstanceStore, SqlxPartitionStore, SqlxRecordStore,
//! };
//! use async_trait::async_trait;
//! use sqlx::PgPool;
//! use std::sync::Arc;
//!
//! struct OrderCreatedHandler;
//!
//! #[async_trait]
//! impl Handler for OrderCreatedHandler {
//!     async fn handle(&self, payload: &[u8], metadata: &Metadata) -> OutboxResult<()> {
//!         println!("delivering {} bytes for key {}", payload.len(), metadata.key);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = PgPool::connect("postgresql://localhost/mydb").await?;
//!
//!     let outbox = Arc::new(
//!         OutboxBuilder::new(EngineConfig::default())
//!             .register_handler(
//!                 "order-created",
//!                 HandlerKind::Typed {
//!                     record_type: "OrderCreated".to_string(),
//!                     handler: Arc::new(OrderCreatedHandler),
//!                 },
//!             )
//!             .build(
//!                 Arc::new(SqlxRecordStore::new(pool.clone())),
//!                 Arc::new(SqlxInstanceStore::new(pool.clone())),
//!                 Arc::new(SqlxPartitionStore::new(pool)),
//!             ),
//!     );
//!
//!     outbox.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     outbox.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ### 2. Enqueue a record inside a business transaction
//!
//! ```rust,no_run
//! use transactional_outbox::{Outbox, ScheduleOptions};
//! use sqlx::PgPool;
//!
//! async fn create_order(pool: &PgPool, outbox: &Outbox, order_id: &str) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!
//!     sqlx::query("INSERT INTO orders (id) VALUES ($1)")
//!         .bind(order_id)
//!         .execute(&mut *tx)
//!         .await?;
//!
//!     outbox
//!         .schedule(
//!             &mut tx,
//!             br#"{"orderId":"..."}"#.to_vec(),
//!             ScheduleOptions {
//!                 key: Some(order_id.to_string()),
//!                 record_type: Some("OrderCreated".to_string()),
//!                 handler_id: Some("order-created".to_string()),
//!                 context: Default::default(),
//!             },
//!         )
//!         .await?;
//!
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```

pub mod chain;
pub mod clock;
pub mod codec;
pub mod config;
pub mod context;
pub mod coordinator;
mod error;
pub mod fallback;
pub mod handler;
pub mod hash;
pub mod instance;
pub mod instance_registry;
pub mod invoker;
pub mod macros;
pub mod metrics;
pub mod outbox;
pub mod partition;
pub mod record;
pub mod retry;
pub mod routing;
pub mod scheduler;
pub mod store;
mod store_retry;
pub mod trigger;

pub use chain::{ChainOutcome, ProcessorChain};
pub use clock::{new_id, Clock, SystemClock, TestClock};
pub use codec::{Codec, JsonCodec};
pub use config::{ConcurrencyConfig, EngineConfig, InstanceConfig, PollTriggerConfig, ProcessingConfig, RetryPolicyConfig};
pub use context::{merge_context, ContextProvider, KeyExtractor};
pub use coordinator::PartitionCoordinator;
pub use error::{OutboxError, OutboxResult};
pub use fallback::{FallbackInvoker, FallbackOutcome};
pub use handler::{FailureContext, FallbackHandler, Handler, HandlerKind, HandlerRegistry, HandlerRegistryBuilder, Metadata};
pub use hash::{fnv1a_32, partition_for_key, PARTITION_COUNT};
pub use instance::{InstanceStatus, OutboxInstance};
pub use instance_registry::InstanceRegistry;
pub use invoker::{HandlerInvoker, Scope, ScopeFactory};
pub use outbox::{Outbox, OutboxBuilder, ScheduleOptions};
pub use partition::{PartitionAssignment, PartitionClass};
pub use record::{OutboxRecord, RecordStatus};
pub use retry::{RetryPolicy, RetryPolicyRegistry};
pub use routing::{ResolvedRoute, Route, Routing, Selector};
pub use scheduler::ProcessingScheduler;
pub use store::{InstanceStore, PartitionStore, RecordStore, SqlxInstanceStore, SqlxPartitionStore, SqlxRecordStore};
pub use trigger::PollTrigger;
