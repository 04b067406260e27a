use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;

// Timestamps kept per method; older ones are dropped but the counter keeps going.
const MAX_TIMESTAMPS: usize = 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MethodStats {
    pub counter: u64,
    /// Unix seconds of the most recent calls, oldest first.
    pub calls: Vec<i64>,
}

/// Per-command call counters exposed by the `statistics` command.
#[derive(Default)]
pub struct CallStats {
    methods: Mutex<BTreeMap<String, MethodStats>>,
}

impl CallStats {
    pub fn record(&self, method: &str) {
        let now = chrono::Utc::now().timestamp();
        let mut methods = self.methods.lock();
        let entry = methods.entry(method.to_string()).or_default();
        entry.counter += 1;
        entry.calls.push(now);
        if entry.calls.len() > MAX_TIMESTAMPS {
            let excess = entry.calls.len() - MAX_TIMESTAMPS;
            entry.calls.drain(..excess);
        }
    }

    pub fn method(&self, method: &str) -> Option<MethodStats> {
        self.methods.lock().get(method).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, MethodStats> {
        self.methods.lock().clone()
    }
}
