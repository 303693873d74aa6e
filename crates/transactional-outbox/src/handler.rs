//! Handler registry: typed/generic handler resolution by the stable `handler_id` stored on each
//! record.

use crate::error::{OutboxError, OutboxResult};
use crate::record::OutboxRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Metadata handed to a handler alongside its payload: everything about the record except the
/// payload bytes themselves.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub record_id: String,
    pub key: String,
    pub handler_id: String,
    pub created_at: DateTime<Utc>,
    pub context: BTreeMap<String, String>,
}

impl Metadata {
    pub fn from_record(record: &OutboxRecord) -> Self {
        Self {
            record_id: record.id.clone(),
            key: record.key.clone(),
            handler_id: record.handler_id.clone(),
            created_at: record.created_at,
            context: record.context.clone(),
        }
    }
}

/// Failure context handed to a fallback handler once the record has exhausted its primary
/// delivery attempts.
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub record_id: String,
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub failure_count: i32,
    pub last_failure: String,
    pub handler_id: String,
    pub retries_exhausted: bool,
    pub non_retryable: bool,
    pub context: BTreeMap<String, String>,
}

/// A user-supplied handler, invoked with the raw payload bytes and [`Metadata`].
///
/// Handlers are registered as typed or generic purely by the caller's choice of
/// [`HandlerKind`] at registration time — the trait itself does not distinguish them.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, payload: &[u8], metadata: &Metadata) -> OutboxResult<()>;
}

/// A fallback handler, invoked with the same payload plus a [`FailureContext`] describing why the
/// primary path gave up.
#[async_trait]
pub trait FallbackHandler: Send + Sync {
    async fn handle(&self, payload: &[u8], ctx: &FailureContext) -> OutboxResult<()>;
}

/// Whether a registered handler accepts exactly one payload/record type or any record routed to
/// its `handler_id`.
pub enum HandlerKind {
    /// Matches only records whose `record_type` equals the given string.
    Typed {
        record_type: String,
        handler: Arc<dyn Handler>,
    },
    /// Matches any record routed to this `handler_id`, regardless of `record_type`.
    Generic { handler: Arc<dyn Handler> },
}

/// Everything registered under one `handler_id`: its primary handler(s) and an optional fallback.
///
/// §4.2: at most one typed and at most one generic handler may exist per `handler_id`; if both are
/// present, BOTH are invoked (typed first) and the record succeeds only if both succeed.
#[derive(Default)]
struct HandlerEntry {
    typed: Option<(String, Arc<dyn Handler>)>,
    generic: Option<Arc<dyn Handler>>,
    fallback_typed: Option<(String, Arc<dyn FallbackHandler>)>,
    fallback_generic: Option<Arc<dyn FallbackHandler>>,
}

/// Immutable (after `build()`) map of `handler_id -> HandlerEntry`.
///
/// Registration happens once at wiring time; the registry is then shared read-only via `Arc`,
/// matching the teacher's startup-scan-then-freeze pattern with no runtime reflection.
pub struct HandlerRegistry {
    entries: HashMap<String, HandlerEntry>,
}

/// Accumulates registrations before [`HandlerRegistryBuilder::build`] freezes them into a
/// [`HandlerRegistry`].
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    entries: HashMap<String, HandlerEntry>,
}

impl HandlerRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(mut self, handler_id: impl Into<String>, kind: HandlerKind) -> Self {
        let entry = self.entries.entry(handler_id.into()).or_default();
        match kind {
            HandlerKind::Typed { record_type, handler } => entry.typed = Some((record_type, handler)),
            HandlerKind::Generic { handler } => entry.generic = Some(handler),
        }
        self
    }

    pub fn register_fallback(mut self, handler_id: impl Into<String>, record_type: Option<String>, fallback: Arc<dyn FallbackHandler>) -> Self {
        let entry = self.entries.entry(handler_id.into()).or_default();
        match record_type {
            Some(record_type) => entry.fallback_typed = Some((record_type, fallback)),
            None => entry.fallback_generic = Some(fallback),
        }
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry { entries: self.entries }
    }
}

impl HandlerRegistry {
    /// Resolve the ordered list of primary handlers to invoke for `record`. Typed match, if the
    /// registered typed handler accepts this `record_type`, always runs before the generic match.
    pub fn resolve(&self, record: &OutboxRecord) -> OutboxResult<Vec<Arc<dyn Handler>>> {
        let entry = self
            .entries
            .get(&record.handler_id)
            .ok_or_else(|| OutboxError::UnknownHandler(record.handler_id.clone()))?;

        let mut handlers = Vec::with_capacity(2);
        if let Some((record_type, handler)) = &entry.typed {
            if record_type == &record.record_type {
                handlers.push(handler.clone());
            }
        }
        if let Some(handler) = &entry.generic {
            handlers.push(handler.clone());
        }

        if handlers.is_empty() {
            return Err(OutboxError::NoMatchingHandler(Some(record.record_type.clone())));
        }
        Ok(handlers)
    }

    /// Resolve the fallback for `record`, if one is registered: exact record-type match first,
    /// then the generic fallback, matching §4.2's resolution order.
    pub fn resolve_fallback(&self, record: &OutboxRecord) -> Option<Arc<dyn FallbackHandler>> {
        let entry = self.entries.get(&record.handler_id)?;
        if let Some((record_type, fallback)) = &entry.fallback_typed {
            if record_type == &record.record_type {
                return Some(fallback.clone());
            }
        }
        entry.fallback_generic.clone()
    }

    pub fn contains(&self, handler_id: &str) -> bool {
        self.entries.contains_key(handler_id)
    }
}
