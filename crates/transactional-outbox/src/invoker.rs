//! Handler invocation: builds metadata, opens/closes context scopes, and calls the resolved
//! handler(s) for a record.

use crate::error::OutboxResult;
use crate::handler::{HandlerRegistry, Metadata};
use crate::record::OutboxRecord;
use std::sync::Arc;
use tracing::{instrument, warn};

/// A context propagation scope, opened before a handler runs and closed afterward in reverse
/// registration order. Mirrors the teacher's trace-context restoration idiom without depending on
/// any specific tracing backend.
pub trait Scope: Send {
    fn on_success(&mut self) {}
    fn on_error(&mut self, _error: &str) {}
    fn close(&mut self) {}
}

/// Builds [`Scope`] instances for a record, in the order they should be opened. Acquired scopes
/// are released in reverse on every exit path, per §4.5.
pub trait ScopeFactory: Send + Sync {
    fn open(&self, metadata: &Metadata) -> Box<dyn Scope>;
}

/// Invokes the handler(s) resolved for a record, threading metadata and scopes through the call.
pub struct HandlerInvoker {
    registry: Arc<HandlerRegistry>,
    scope_factories: Vec<Arc<dyn ScopeFactory>>,
}

impl HandlerInvoker {
    pub fn new(registry: Arc<HandlerRegistry>, scope_factories: Vec<Arc<dyn ScopeFactory>>) -> Self {
        Self { registry, scope_factories }
    }

    /// Run every handler resolved for `record`, typed first then generic (§4.2). The record
    /// succeeds only if all resolved handlers return `Ok`.
    #[instrument(skip(self, record), fields(record_id = %record.id, key = %record.key, handler_id = %record.handler_id))]
    pub async fn invoke(&self, record: &OutboxRecord) -> OutboxResult<()> {
        let metadata = Metadata::from_record(record);
        let handlers = self.registry.resolve(record)?;

        let mut scopes: Vec<Box<dyn Scope>> = self
            .scope_factories
            .iter()
            .map(|factory| factory.open(&metadata))
            .collect();

        let result = self.run_handlers(&handlers, record, &metadata).await;

        match &result {
            Ok(()) => scopes.iter_mut().for_each(|scope| scope.on_success()),
            Err(error) => {
                let message = error.to_string();
                scopes.iter_mut().for_each(|scope| scope.on_error(&message));
            }
        }
        // Close in reverse order; a scope's close error is logged, never propagated (§4.5).
        for mut scope in scopes.into_iter().rev() {
            scope.close();
        }

        result
    }

    async fn run_handlers(
        &self,
        handlers: &[Arc<dyn crate::handler::Handler>],
        record: &OutboxRecord,
        metadata: &Metadata,
    ) -> OutboxResult<()> {
        for handler in handlers {
            if let Err(error) = handler.handle(&record.payload, metadata).await {
                warn!(record_id = %record.id, error = %error, "handler invocation failed");
                return Err(error);
            }
        }
        Ok(())
    }
}
