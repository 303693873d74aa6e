//! Context providers and key extractors consulted by [`crate::outbox::Outbox::schedule`]
//! (§4.1 steps 2 and 4). Both are optional, per-record-type extension points: an engine with none
//! registered behaves exactly as if this module didn't exist (random UUID key, caller-supplied
//! context only).

use std::collections::BTreeMap;

/// Supplies additional context entries merged into a scheduled record's `context` map. Runs for
/// every `schedule()` call regardless of record type; a provider that only applies to some record
/// types should inspect `record_type` and return an empty map otherwise.
pub trait ContextProvider: Send + Sync {
    fn provide(&self, record_type: &str, payload: &[u8]) -> BTreeMap<String, String>;
}

/// Derives a grouping key from a payload for a given record type, used when the caller omits one.
/// Returning `None` defers to the next extractor, then to a random UUID.
pub trait KeyExtractor: Send + Sync {
    fn extract(&self, payload: &[u8]) -> Option<String>;
}

/// Merge caller-supplied context with every registered provider's output. Caller-supplied entries
/// win on key collision: a provider fills gaps, it never overrides what the application already
/// decided to stamp on the record.
pub fn merge_context(
    providers: &[std::sync::Arc<dyn ContextProvider>],
    record_type: &str,
    payload: &[u8],
    caller_context: BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = caller_context;
    for provider in providers {
        for (k, v) in provider.provide(record_type, payload) {
            merged.entry(k).or_insert(v);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct StaticProvider(BTreeMap<String, String>);
    impl ContextProvider for StaticProvider {
        fn provide(&self, _record_type: &str, _payload: &[u8]) -> BTreeMap<String, String> {
            self.0.clone()
        }
    }

    #[test]
    fn caller_context_wins_over_provider() {
        let mut provided = BTreeMap::new();
        provided.insert("traceId".to_string(), "provider-trace".to_string());
        provided.insert("region".to_string(), "us-east-1".to_string());
        let providers: Vec<Arc<dyn ContextProvider>> = vec![Arc::new(StaticProvider(provided))];

        let mut caller = BTreeMap::new();
        caller.insert("traceId".to_string(), "caller-trace".to_string());

        let merged = merge_context(&providers, "OrderCreated", b"{}", caller);
        assert_eq!(merged.get("traceId").map(String::as_str), Some("caller-trace"));
        assert_eq!(merged.get("region").map(String::as_str), Some("us-east-1"));
    }

    #[test]
    fn no_providers_leaves_caller_context_untouched() {
        let mut caller = BTreeMap::new();
        caller.insert("k".to_string(), "v".to_string());
        let merged = merge_context(&[], "Kind", b"{}", caller.clone());
        assert_eq!(merged, caller);
    }
}
