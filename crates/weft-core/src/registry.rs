//! Handler registry and flow directory.
//!
//! Both are plain lookup tables: populated during setup, read while flows are
//! compiled. Entries accumulate for the life of the registry and a second
//! registration under the same name replaces the first.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, LazyLock, RwLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::Envelope;
use crate::error::FlowError;
use crate::graph::Flow;

/// A named unit of work.
///
/// The handler gets the envelope by value and returns the one that travels
/// on. Returning `Err` aborts the whole `Flow::process` call. `ctx` is
/// cancelled when a sibling loop worker fails or the caller gives up;
/// honouring it is up to the handler.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        ctx: &CancellationToken,
        envelope: Envelope,
    ) -> Result<Envelope, FlowError>;
}

/// Adapter turning an async closure into a `Handler`.
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(CancellationToken, Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Envelope, FlowError>> + Send,
{
    async fn handle(
        &self,
        ctx: &CancellationToken,
        envelope: Envelope,
    ) -> Result<Envelope, FlowError> {
        (self.f)(ctx.clone(), envelope).await
    }
}

/// Wrap an async closure as a handler.
///
/// ```ignore
/// registry.register("upper-case", handler_fn(|_ctx, env: Envelope| async move {
///     let text = env.to_text()?.to_uppercase();
///     Ok(env.with_payload(text))
/// }));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(CancellationToken, Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Envelope, FlowError>> + Send,
{
    FnHandler { f }
}

static GLOBAL: LazyLock<HandlerRegistry> = LazyLock::new(HandlerRegistry::new);

/// Registry of handlers (name -> handler) plus the directory of compiled flows.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    flows: FlowDirectory,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide default registry, for programs that do not want to pass
    /// one around.
    pub fn global() -> &'static HandlerRegistry {
        &GLOBAL
    }

    /// Register `handler` under `name`. Last write wins; the replaced handler,
    /// if any, is returned.
    pub fn register(
        &self,
        name: impl Into<String>,
        handler: impl Handler + 'static,
    ) -> Option<Arc<dyn Handler>> {
        self.register_arc(name, Arc::new(handler))
    }

    pub fn register_arc(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Option<Arc<dyn Handler>> {
        let name = name.into();
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let previous = handlers.insert(name.clone(), handler);
        if previous.is_some() {
            warn!(handler = %name, "handler re-registered; previous one replaced");
        } else {
            debug!(handler = %name, "handler registered");
        }
        previous
    }

    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F) -> Option<Arc<dyn Handler>>
    where
        F: Fn(CancellationToken, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Envelope, FlowError>> + Send + 'static,
    {
        self.register(name, handler_fn(f))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compiled flows, keyed by name.
    pub fn flows(&self) -> &FlowDirectory {
        &self.flows
    }
}

/// Directory of compiled flows. `Flow::build` inserts into it on success.
#[derive(Default)]
pub struct FlowDirectory {
    flows: RwLock<HashMap<String, Flow>>,
}

impl FlowDirectory {
    /// Insert under the flow's own name, replacing any previous flow.
    pub fn insert(&self, flow: Flow) -> Option<Flow> {
        let name = flow.name().to_string();
        self.flows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, flow)
    }

    pub fn get(&self, name: &str) -> Option<Flow> {
        self.flows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .flows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.flows.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(
            &self,
            _ctx: &CancellationToken,
            envelope: Envelope,
        ) -> Result<Envelope, FlowError> {
            Ok(envelope)
        }
    }

    #[tokio::test]
    async fn register_and_invoke() {
        let registry = HandlerRegistry::new();
        assert!(registry.register("echo", Echo).is_none());

        let handler = registry.get("echo").expect("registered");
        let out = handler
            .handle(&CancellationToken::new(), Envelope::new("hi"))
            .await
            .unwrap();
        assert_eq!(out.to_text().unwrap(), "hi");
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let registry = HandlerRegistry::new();
        registry.register_fn("step", |_ctx, env: Envelope| async move {
            Ok(env.with_payload("first"))
        });
        let previous = registry.register_fn("step", |_ctx, env: Envelope| async move {
            Ok(env.with_payload("second"))
        });
        assert!(previous.is_some());
        assert_eq!(registry.len(), 1);

        let out = registry
            .get("step")
            .unwrap()
            .handle(&CancellationToken::new(), Envelope::default())
            .await
            .unwrap();
        assert_eq!(out.to_text().unwrap(), "second");
    }

    #[test]
    fn names_are_sorted() {
        let registry = HandlerRegistry::new();
        registry.register("b", Echo);
        registry.register("a", Echo);
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.contains("a"));
        assert!(registry.flows().is_empty());
    }

    #[test]
    fn global_registry_is_shared() {
        HandlerRegistry::global().register("registry-test-global", Echo);
        assert!(HandlerRegistry::global().contains("registry-test-global"));
    }
}
