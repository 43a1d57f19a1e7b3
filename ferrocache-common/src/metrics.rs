//  Copyright 2024 ferrocache contributors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::sync::atomic::{AtomicU64, Ordering};

/// Relaxed-counter bundle for the store. Mirrors the counter-per-event shape used by the
/// per-shard bookkeeping in a sharded cache, collapsed to one instance since this store is
/// singular rather than sharded.
#[derive(Debug, Default)]
pub struct Metrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub inserts: AtomicU64,
    pub replaces: AtomicU64,
    pub deletes: AtomicU64,
    pub evictions: AtomicU64,
    pub combine_passes: AtomicU64,
    pub combined_ops: AtomicU64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            replaces: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            combine_passes: AtomicU64::new(0),
            combined_ops: AtomicU64::new(0),
        }
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ferrocache_hits_total").increment(1);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ferrocache_misses_total").increment(1);
    }

    pub fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ferrocache_inserts_total").increment(1);
    }

    pub fn record_replace(&self) {
        self.replaces.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ferrocache_replaces_total").increment(1);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ferrocache_deletes_total").increment(1);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ferrocache_evictions_total").increment(1);
    }

    pub fn record_combine_pass(&self, batch_size: u64) {
        self.combine_passes.fetch_add(1, Ordering::Relaxed);
        self.combined_ops.fetch_add(batch_size, Ordering::Relaxed);
        metrics::histogram!("ferrocache_combine_batch_size").record(batch_size as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let m = Metrics::new();
        assert_eq!(m.hits.load(Ordering::Relaxed), 0);
        m.record_hit();
        m.record_hit();
        m.record_miss();
        assert_eq!(m.hits.load(Ordering::Relaxed), 2);
        assert_eq!(m.misses.load(Ordering::Relaxed), 1);
    }
}
