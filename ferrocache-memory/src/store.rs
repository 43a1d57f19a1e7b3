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

//! Thread-safe LRU store: wraps [`crate::lru::LruStore`] behind [`crate::combiner::FlatCombiner`]
//! so the five-operation storage contract (§4.1) can be called concurrently without a mutex
//! guarding the store itself — only the thread currently holding the combiner role ever touches
//! it (§5).

use std::cell::UnsafeCell;

use ferrocache_common::error::CombineError;

use crate::combiner::FlatCombiner;
use crate::lru::LruStore;

/// Wraps the raw `LruStore` so the combine closure can be `Send + Sync` (required to share the
/// combiner across threads) without an actual lock: the flat combiner's own protocol already
/// guarantees only the thread holding the combiner role ever calls into the closure that reaches
/// this cell (§5), so this is sound without `Mutex`'s runtime bookkeeping.
struct ExclusiveCell<T>(UnsafeCell<T>);

unsafe impl<T: Send> Sync for ExclusiveCell<T> {}

impl<T> ExclusiveCell<T> {
    fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// # Safety
    /// Caller must guarantee exclusive access, i.e. be the thread currently holding the flat
    /// combiner's lock.
    unsafe fn get_mut(&self) -> &mut T {
        &mut *self.0.get()
    }
}

/// One pending request against the store. Ordered by key so the combiner's optional sort groups
/// operations on the same key adjacent (§4.2) — this store does not currently coalesce them, but
/// the ordering is available to a future combine function that wants to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Op {
    Put { key: Vec<u8>, value: Vec<u8> },
    PutIfAbsent { key: Vec<u8>, value: Vec<u8> },
    Set { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    Get { key: Vec<u8> },
}

/// Result of executing an [`Op`] against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    Stored(bool),
    Value(Option<Vec<u8>>),
}

impl OpResult {
    pub fn as_bool(&self) -> bool {
        match self {
            OpResult::Stored(b) => *b,
            OpResult::Value(v) => v.is_some(),
        }
    }

    pub fn into_value(self) -> Option<Vec<u8>> {
        match self {
            OpResult::Value(v) => v,
            OpResult::Stored(_) => None,
        }
    }
}

type Combine = Box<dyn Fn(&mut [Op]) -> Vec<OpResult> + Send + Sync>;

/// A capacity-bounded LRU store safe to share across threads via flat combining.
pub struct FlatCombinedStore {
    combiner: FlatCombiner<Op, OpResult, Combine>,
}

impl FlatCombinedStore {
    pub fn new(max_size: u64) -> Self {
        Self::with_params(
            max_size,
            crate::combiner::DEFAULT_BATCH_SIZE,
            crate::combiner::DEFAULT_SAVING_TIME,
        )
    }

    pub fn with_params(max_size: u64, batch_size: usize, saving_time: u64) -> Self {
        let inner = ExclusiveCell::new(LruStore::new(max_size));
        let combine: Combine = Box::new(move |ops: &mut [Op]| {
            let _span = tracing::trace_span!("combine_pass", batch_size = ops.len()).entered();
            // Safety: this closure is only ever invoked by the thread currently holding the
            // flat combiner's lock (§5), so `get_mut` never aliases.
            let store = unsafe { inner.get_mut() };
            let results = ops.iter().map(|op| apply(store, op)).collect::<Vec<_>>();
            store.metrics().record_combine_pass(ops.len() as u64);
            results
        });
        Self {
            combiner: FlatCombiner::with_params(combine, batch_size, saving_time, true),
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<bool, CombineError> {
        self.submit(Op::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        })
        .map(|r| r.as_bool())
    }

    pub fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool, CombineError> {
        self.submit(Op::PutIfAbsent {
            key: key.to_vec(),
            value: value.to_vec(),
        })
        .map(|r| r.as_bool())
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<bool, CombineError> {
        self.submit(Op::Set {
            key: key.to_vec(),
            value: value.to_vec(),
        })
        .map(|r| r.as_bool())
    }

    pub fn delete(&self, key: &[u8]) -> Result<bool, CombineError> {
        self.submit(Op::Delete { key: key.to_vec() })
            .map(|r| r.as_bool())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CombineError> {
        self.submit(Op::Get { key: key.to_vec() })
            .map(|r| r.into_value())
    }

    /// Detach the calling thread's slot. Call on connection-handler thread exit in a
    /// thread-per-connection dispatcher so short-lived threads don't leak slots.
    pub fn detach(&self) {
        self.combiner.detach();
    }

    fn submit(&self, op: Op) -> Result<OpResult, CombineError> {
        self.combiner.submit(op)
    }
}

fn apply(store: &mut LruStore, op: &Op) -> OpResult {
    match op {
        Op::Put { key, value } => OpResult::Stored(store.put(key, value)),
        Op::PutIfAbsent { key, value } => OpResult::Stored(store.put_if_absent(key, value)),
        Op::Set { key, value } => OpResult::Stored(store.set(key, value)),
        Op::Delete { key } => OpResult::Stored(store.delete(key)),
        Op::Get { key } => OpResult::Value(store.get(key)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn sequential_contract_matches_raw_lru_store() {
        let s = FlatCombinedStore::new(10);
        assert!(s.put(b"a", b"1").unwrap());
        assert!(s.put(b"bb", b"22").unwrap());
        assert!(s.put(b"ccc", b"333").unwrap());
        assert!(s.put(b"dddd", b"4444").unwrap());
        assert_eq!(s.get(b"a").unwrap(), None);
        assert_eq!(s.get(b"dddd").unwrap(), Some(b"4444".to_vec()));
    }

    #[test]
    fn put_if_absent_and_delete() {
        let s = FlatCombinedStore::new(100);
        assert!(s.put_if_absent(b"x", b"1").unwrap());
        assert!(!s.put_if_absent(b"x", b"2").unwrap());
        assert!(s.delete(b"x").unwrap());
        assert!(!s.delete(b"x").unwrap());
    }

    #[test]
    fn two_threads_never_exceed_capacity_and_every_call_returns() {
        let store = Arc::new(FlatCombinedStore::new(1_000));
        let mut handles = Vec::new();
        for t in 0..2 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                let mut rng_state: u64 = 0x9e3779b97f4a7c15 ^ (t as u64);
                for _ in 0..10_000 {
                    rng_state ^= rng_state << 13;
                    rng_state ^= rng_state >> 7;
                    rng_state ^= rng_state << 17;
                    let key = format!("k{}", rng_state % 50).into_bytes();
                    match rng_state % 3 {
                        0 => {
                            store.put(&key, b"v").unwrap();
                        }
                        1 => {
                            store.get(&key).unwrap();
                        }
                        _ => {
                            store.delete(&key).unwrap();
                        }
                    }
                }
                store.detach();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
