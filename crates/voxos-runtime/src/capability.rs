//! Host capability registry.
//!
//! Device services (text-to-speech, media, lights, ...) are exposed to
//! applications as named methods grouped by namespace.  The registry maps
//! `(namespace, method)` to an async handler and is populated once at
//! startup.  Invocation is a lookup plus a call; a missing namespace or
//! method fails softly with [`RuntimeError::UnknownNamespace`] or
//! [`RuntimeError::UnknownMethod`] so the calling application receives a
//! rejection instead of the host failing.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::{Result, RuntimeError};
use crate::types::AppId;

/// Arguments handed to a capability handler.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// The application making the call.
    pub app_id: AppId,
    /// Call parameters as sent by the application.
    pub args: Value,
}

/// An async capability handler.
pub type CapabilityFn =
    Arc<dyn Fn(InvocationContext) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Registry of host capabilities keyed by namespace, then method.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    inner: Arc<DashMap<String, HashMap<String, CapabilityFn>>>,
}

impl CapabilityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler.  Re-registering a method replaces it.
    pub fn register<F, Fut>(&self, namespace: &str, method: &str, handler: F)
    where
        F: Fn(InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: CapabilityFn = Arc::new(move |ctx| handler(ctx).boxed());
        self.inner
            .entry(namespace.to_string())
            .or_default()
            .insert(method.to_string(), handler);
        tracing::debug!(namespace, method, "capability registered");
    }

    /// Resolve a handler without calling it.
    pub fn resolve(&self, namespace: &str, method: &str) -> Result<CapabilityFn> {
        let methods = self
            .inner
            .get(namespace)
            .ok_or_else(|| RuntimeError::UnknownNamespace {
                namespace: namespace.to_string(),
            })?;
        methods
            .get(method)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownMethod {
                namespace: namespace.to_string(),
                method: method.to_string(),
            })
    }

    /// Invoke `namespace.method` on behalf of an application.
    pub async fn invoke(&self, namespace: &str, method: &str, ctx: InvocationContext) -> Result<Value> {
        // The map guard must not live across the handler's await.
        let handler = self.resolve(namespace, method)?;
        handler(ctx).await
    }

    /// Descriptor sent to applications during their `initiating` handshake:
    /// `{ "<namespace>": ["<method>", ...] }`, sorted.
    pub fn descriptor(&self) -> Value {
        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in self.inner.iter() {
            let mut methods: Vec<String> = entry.value().keys().cloned().collect();
            methods.sort();
            out.insert(entry.key().clone(), methods);
        }
        serde_json::to_value(out).unwrap_or(Value::Null)
    }

    pub fn namespace_count(&self) -> usize {
        self.inner.len()
    }
}
