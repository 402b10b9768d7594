// Deferred applies: updates found outside the maintenance window, parked until it opens.
// Drained by the driver; the checker and executor never schedule anything themselves.

use crate::models::ImageVersion;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredApply {
    pub due: DateTime<Utc>,
    pub service: String,
    pub target: ImageVersion,
}

/// At most one pending entry per service; a newer deferral replaces the older one.
#[derive(Debug, Default)]
pub struct DeferredQueue {
    entries: BTreeMap<String, DeferredApply>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `entry`; returns the entry it replaced, if any.
    pub fn schedule(&mut self, entry: DeferredApply) -> Option<DeferredApply> {
        self.entries.insert(entry.service.clone(), entry)
    }

    pub fn cancel(&mut self, service: &str) -> Option<DeferredApply> {
        self.entries.remove(service)
    }

    pub fn get(&self, service: &str) -> Option<&DeferredApply> {
        self.entries.get(service)
    }

    /// Remove and return entries due at or before `now`, earliest first.
    pub fn drain_due(&mut self, now: DateTime<Utc>) -> Vec<DeferredApply> {
        let due: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.due <= now)
            .map(|e| e.service.clone())
            .collect();
        let mut out: Vec<DeferredApply> = due
            .iter()
            .filter_map(|service| self.entries.remove(service))
            .collect();
        out.sort_by(|a, b| a.due.cmp(&b.due).then_with(|| a.service.cmp(&b.service)));
        out
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.entries.values().map(|e| e.due).min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
