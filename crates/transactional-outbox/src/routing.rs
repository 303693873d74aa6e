//! Routing: optional payload -> external destination selection for handlers that externalize
//! records to a broker (§4.13). Pure functions over `(payload, metadata)`; no persistence.

use crate::handler::Metadata;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Decides whether a route applies to a given payload/metadata pair.
pub enum Selector {
    /// Matches when `metadata.context.get(key) == Some(value)`.
    ContextEquals { key: String, value: String },
    /// Matches any record whose `record_type` (threaded through the caller's own convention, since
    /// `Metadata` does not carry it directly) equals the given discriminant.
    Predicate(Arc<dyn Fn(&[u8], &Metadata) -> bool + Send + Sync>),
}

impl Selector {
    fn matches(&self, payload: &[u8], metadata: &Metadata) -> bool {
        match self {
            Selector::ContextEquals { key, value } => metadata.context.get(key).map(|v| v == value).unwrap_or(false),
            Selector::Predicate(predicate) => predicate(payload, metadata),
        }
    }
}

/// One routing rule: if `selector` matches, compute a target, key, headers, and mapped payload;
/// `filter` may still veto externalization for a matched record.
pub struct Route {
    pub name: String,
    pub selector: Selector,
    pub target_fn: Arc<dyn Fn(&[u8], &Metadata) -> String + Send + Sync>,
    pub key_fn: Arc<dyn Fn(&[u8], &Metadata) -> String + Send + Sync>,
    pub headers_fn: Arc<dyn Fn(&[u8], &Metadata) -> BTreeMap<String, String> + Send + Sync>,
    pub mapper_fn: Arc<dyn Fn(&[u8], &Metadata) -> Vec<u8> + Send + Sync>,
    pub filter: Option<Arc<dyn Fn(&[u8], &Metadata) -> bool + Send + Sync>>,
}

/// The resolved outcome of evaluating a [`Routing`] against one payload/metadata pair.
pub struct ResolvedRoute {
    pub target: String,
    pub key: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}

/// An ordered set of [`Route`]s plus an optional default, evaluated first-match-wins.
pub struct Routing {
    routes: Vec<Route>,
    default_route: Option<Route>,
}

impl Routing {
    pub fn new(routes: Vec<Route>, default_route: Option<Route>) -> Self {
        Self { routes, default_route }
    }

    fn select(&self, payload: &[u8], metadata: &Metadata) -> Option<&Route> {
        self.routes
            .iter()
            .find(|route| route.selector.matches(payload, metadata))
            .or(self.default_route.as_ref())
    }

    /// Whether a matched route would actually externalize this pair (its `filter`, if any, must
    /// also pass).
    pub fn should_externalize(&self, payload: &[u8], metadata: &Metadata) -> bool {
        match self.select(payload, metadata) {
            Some(route) => route.filter.as_ref().map(|f| f(payload, metadata)).unwrap_or(true),
            None => false,
        }
    }

    pub fn resolve_target(&self, payload: &[u8], metadata: &Metadata) -> Option<String> {
        self.select(payload, metadata).map(|route| (route.target_fn)(payload, metadata))
    }

    pub fn extract_key(&self, payload: &[u8], metadata: &Metadata) -> Option<String> {
        self.select(payload, metadata).map(|route| (route.key_fn)(payload, metadata))
    }

    pub fn build_headers(&self, payload: &[u8], metadata: &Metadata) -> Option<BTreeMap<String, String>> {
        self.select(payload, metadata).map(|route| (route.headers_fn)(payload, metadata))
    }

    pub fn map_payload(&self, payload: &[u8], metadata: &Metadata) -> Option<Vec<u8>> {
        self.select(payload, metadata).map(|route| (route.mapper_fn)(payload, metadata))
    }

    /// Resolve every facet of the route in one call, per `schedule`-adjacent callers that want the
    /// full picture rather than individual lookups.
    pub fn resolve(&self, payload: &[u8], metadata: &Metadata) -> Option<ResolvedRoute> {
        if !self.should_externalize(payload, metadata) {
            return None;
        }
        Some(ResolvedRoute {
            target: self.resolve_target(payload, metadata)?,
            key: self.extract_key(payload, metadata)?,
            headers: self.build_headers(payload, metadata)?,
            payload: self.map_payload(payload, metadata)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn metadata_with_context(key: &str, value: &str) -> Metadata {
        let mut context = BTreeMap::new();
        context.insert(key.to_string(), value.to_string());
        Metadata {
            record_id: "r1".into(),
            key: "k1".into(),
            handler_id: "h1".into(),
            created_at: Utc::now(),
            context,
        }
    }

    fn route(name: &str, selector: Selector) -> Route {
        Route {
            name: name.to_string(),
            selector,
            target_fn: Arc::new(|_p, _m| "topic-a".to_string()),
            key_fn: Arc::new(|_p, m| m.key.clone()),
            headers_fn: Arc::new(|_p, _m| BTreeMap::new()),
            mapper_fn: Arc::new(|p, _m| p.to_vec()),
            filter: None,
        }
    }

    #[test]
    fn first_matching_route_wins() {
        let matching = route(
            "match",
            Selector::ContextEquals { key: "kind".into(), value: "order".into() },
        );
        let routing = Routing::new(vec![matching], None);
        let metadata = metadata_with_context("kind", "order");
        assert_eq!(routing.resolve_target(b"payload", &metadata), Some("topic-a".to_string()));
    }

    #[test]
    fn falls_back_to_default_route_when_nothing_matches() {
        let non_matching = route(
            "no-match",
            Selector::ContextEquals { key: "kind".into(), value: "never".into() },
        );
        let default = route("default", Selector::Predicate(Arc::new(|_p, _m| true)));
        let routing = Routing::new(vec![non_matching], Some(default));
        let metadata = metadata_with_context("kind", "order");
        assert_eq!(routing.resolve_target(b"payload", &metadata), Some("topic-a".to_string()));
    }

    #[test]
    fn no_match_and_no_default_does_not_externalize() {
        let non_matching = route(
            "no-match",
            Selector::ContextEquals { key: "kind".into(), value: "never".into() },
        );
        let routing = Routing::new(vec![non_matching], None);
        let metadata = metadata_with_context("kind", "order");
        assert!(!routing.should_externalize(b"payload", &metadata));
        assert!(routing.resolve(b"payload", &metadata).is_none());
    }

    #[test]
    fn filter_can_veto_an_otherwise_matched_route() {
        let mut vetoed = route("vetoed", Selector::Predicate(Arc::new(|_p, _m| true)));
        vetoed.filter = Some(Arc::new(|_p, _m| false));
        let routing = Routing::new(vec![vetoed], None);
        let metadata = metadata_with_context("kind", "order");
        assert!(!routing.should_externalize(b"payload", &metadata));
    }
}
