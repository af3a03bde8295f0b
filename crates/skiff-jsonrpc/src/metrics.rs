//! A concurrently-accessible metrics collector.
//!
//! Tracks integer counters, maximum-value gauges and free-form labels under
//! caller-assigned string names the collector does not interpret. The server
//! engine emits a small stable set of names (`rpc.requests`,
//! `rpc.notifications`, `rpc.errors`, `handler.panic`, `rpc.batch-size`);
//! embeddings are free to record their own alongside.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

#[derive(Default)]
struct Inner {
    counters: HashMap<String, i64>,
    max_values: HashMap<String, i64>,
    labels: HashMap<String, Value>,
}

/// A thread-safe counter, maximum-value and label store. The collector has
/// its own lock, unrelated to any dispatcher state.
#[derive(Default)]
pub struct Metrics {
    inner: Mutex<Inner>,
}

/// A point-in-time copy of the collected metrics.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub counters: HashMap<String, i64>,
    pub max_values: HashMap<String, i64>,
    pub labels: HashMap<String, Value>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut inner)
    }

    /// Add `delta` to the named counter, defining it if needed.
    pub fn count(&self, name: &str, delta: i64) {
        self.with_inner(|inner| *inner.counters.entry(name.to_string()).or_default() += delta);
    }

    /// Raise the named maximum-value gauge to `n` if `n` exceeds its current
    /// value, defining it if needed.
    pub fn set_max_value(&self, name: &str, n: i64) {
        self.with_inner(|inner| {
            let slot = inner.max_values.entry(name.to_string()).or_insert(n);
            if n > *slot {
                *slot = n;
            }
        });
    }

    /// Add `delta` to the named counter and raise the same-named maximum
    /// gauge in one step.
    pub fn count_and_set_max(&self, name: &str, delta: i64) {
        self.with_inner(|inner| {
            let slot = inner.max_values.entry(name.to_string()).or_insert(delta);
            if delta > *slot {
                *slot = delta;
            }
            *inner.counters.entry(name.to_string()).or_default() += delta;
        });
    }

    /// Set the named label. A null value removes the label.
    pub fn set_label(&self, name: &str, value: Value) {
        self.with_inner(|inner| {
            if value.is_null() {
                inner.labels.remove(name);
            } else {
                inner.labels.insert(name.to_string(), value);
            }
        });
    }

    /// Replace the named label with `edit(current)`; the argument is null if
    /// the label was unset, and a null return removes it.
    pub fn edit_label(&self, name: &str, edit: impl FnOnce(Value) -> Value) {
        self.with_inner(|inner| {
            let current = inner.labels.remove(name).unwrap_or(Value::Null);
            let next = edit(current);
            if !next.is_null() {
                inner.labels.insert(name.to_string(), next);
            }
        });
    }

    /// Copy an atomic snapshot of the collected metrics into `snap`.
    pub fn snapshot(&self, snap: &mut Snapshot) {
        self.with_inner(|inner| {
            snap.counters.extend(inner.counters.iter().map(|(k, v)| (k.clone(), *v)));
            snap.max_values
                .extend(inner.max_values.iter().map(|(k, v)| (k.clone(), *v)));
            snap.labels
                .extend(inner.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        });
    }
}
