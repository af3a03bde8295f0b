//! Method-name to handler lookup.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::handler::Handler;

/// Maps method names to handlers.
///
/// A failed lookup yields `None`, which the dispatcher reports to the client
/// as a method-not-found error.
pub trait Assigner: Send + Sync {
    /// Look up the handler for `method`.
    fn assign(&self, method: &str) -> Option<Arc<dyn Handler>>;

    /// The names this assigner serves, in lexicographic order.
    fn names(&self) -> Vec<String>;
}

/// A static map from method name to handler.
#[derive(Default)]
pub struct MethodMap {
    methods: BTreeMap<String, Arc<dyn Handler>>,
}

impl MethodMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous registration.
    pub fn insert(mut self, name: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.methods.insert(name.into(), Arc::new(handler));
        self
    }

    /// Register an already-shared handler under `name`.
    pub fn insert_arc(mut self, name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.methods.insert(name.into(), handler);
        self
    }
}

impl Assigner for MethodMap {
    fn assign(&self, method: &str) -> Option<Arc<dyn Handler>> {
        self.methods.get(method).cloned()
    }

    fn names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }
}

/// Combines named sub-assigners into one, exporting each service's methods
/// as `svc.method`.
///
/// Lookup splits the inbound name on the first `.` and delegates the
/// remainder to the matching service; exactly one dot is consumed per
/// composition level, and there is no partial-prefix matching. A name with
/// no dot, or with an unknown service prefix, fails the lookup.
#[derive(Default)]
pub struct ServiceMap {
    services: BTreeMap<String, Arc<dyn Assigner>>,
}

impl ServiceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `assigner` as the service named `name`.
    pub fn insert(mut self, name: impl Into<String>, assigner: impl Assigner + 'static) -> Self {
        self.services.insert(name.into(), Arc::new(assigner));
        self
    }
}

impl Assigner for ServiceMap {
    fn assign(&self, method: &str) -> Option<Arc<dyn Handler>> {
        let (service, rest) = method.split_once('.')?;
        self.services.get(service)?.assign(rest)
    }

    fn names(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .services
            .iter()
            .flat_map(|(service, assigner)| {
                assigner
                    .names()
                    .into_iter()
                    .map(move |name| format!("{}.{}", service, name))
            })
            .collect();
        all.sort();
        all
    }
}
