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

//! Generic flat-combining synchronization primitive.
//!
//! Many threads publish one pending operation each into a per-thread [`Slot`]; whichever
//! thread first captures the "combiner" role walks the slot queue and applies every ready
//! slot's operation on its own stack, serially, in a single batch. Callers that don't win the
//! race spin-yield until either they win it themselves or the current combiner finishes their
//! slot for them.
//!
//! There is no mutex anywhere on the hot path: the lock word is a single `AtomicU64` (high bit
//! is the busy flag, low 63 bits are a monotonically increasing epoch), and the slot queue is a
//! lock-free singly-linked list with combiner-only removal. One bit of each slot's `next`
//! pointer is stolen to record whether the owning thread is still alive, which is how the
//! combiner and a departing thread agree on who frees a slot (§4.2/§9 of the design docs: a
//! two-state ownership bit instead of a general-purpose shared pointer).

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use ferrocache_common::error::CombineError;

/// Default cap on how many slots one combine pass applies before yielding to sort+apply and
/// starting a fresh batch. Mirrors the source's `QMS` template default.
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Default number of epochs a slot may sit idle in the queue before the combiner reaps it.
pub const DEFAULT_SAVING_TIME: u64 = 100_000;

const STATE_COMPLETE: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_EXECUTING: u8 = 2;

const ALIVE_BIT: usize = 1;
const PTR_MASK: usize = !ALIVE_BIT;

const LOCK_BIT: u64 = 1 << 63;
const EPOCH_MASK: u64 = !LOCK_BIT;

/// One thread's pending operation, its lifecycle state, and the result of its last execution.
/// Request (`T`) and response (`R`) live on the same node so a completed submission never needs
/// to touch any shared structure other than the slot it already owns.
struct Slot<T, R> {
    state: AtomicU8,
    /// Steals the low bit of the raw pointer to mean "owning thread still alive". See the
    /// module doc for the four resulting (queued?, alive?) states.
    next_and_alive: AtomicPtr<Slot<T, R>>,
    last_active: AtomicU64,
    operation: Cell<Option<T>>,
    outcome: Cell<Option<Result<R, CombineError>>>,
}

unsafe impl<T: Send, R: Send> Send for Slot<T, R> {}
unsafe impl<T: Send, R: Send> Sync for Slot<T, R> {}

impl<T, R> Slot<T, R> {
    fn new_alive() -> Self {
        Self {
            state: AtomicU8::new(STATE_COMPLETE),
            next_and_alive: AtomicPtr::new(ALIVE_BIT as *mut Slot<T, R>),
            last_active: AtomicU64::new(0),
            operation: Cell::new(None),
            outcome: Cell::new(None),
        }
    }

    fn raw(&self) -> *mut Slot<T, R> {
        self.next_and_alive.load(Ordering::Relaxed)
    }

    fn next_ptr(&self) -> *mut Slot<T, R> {
        ((self.raw() as usize) & PTR_MASK) as *mut Slot<T, R>
    }

    fn is_alive(&self) -> bool {
        (self.raw() as usize) & ALIVE_BIT != 0
    }

    /// Acquire ordering: pairs with the submitter's `Release` store of `STATE_READY` (§5) so a
    /// combiner that observes `READY` here is guaranteed to see the `operation` Cell write that
    /// preceded it.
    fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_READY
    }

    /// Acquire ordering: pairs with the combiner's `Release` store of `STATE_COMPLETE` (§5) so a
    /// submitter that observes `COMPLETE` here is guaranteed to see the `outcome` Cell write that
    /// preceded it.
    fn is_complete(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_COMPLETE
    }

    /// CAS this slot's next pointer, preserving the alive bit. Only the combiner (sole queue
    /// writer while it holds the lock) calls this with `allow_dead = false`, so a CAS failure
    /// there is a logic bug, not a race to retry.
    fn set_next(&self, node: *mut Slot<T, R>, allow_dead: bool) -> bool {
        let cur = self.raw();
        let alive_bit = (cur as usize) & ALIVE_BIT;
        if !allow_dead {
            debug_assert_eq!(alive_bit, ALIVE_BIT);
        }
        let new_val = ((node as usize) | alive_bit) as *mut Slot<T, R>;
        self.next_and_alive
            .compare_exchange(cur, new_val, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// Combiner-side unlink: clears the "in queue" state while leaving the alive bit. Returns
    /// `true` if the owning thread might still reference this slot (so the combiner must not
    /// free it), `false` if the slot is already dead (caller must free it).
    fn try_purge(&self) -> bool {
        loop {
            let cur = self.raw();
            if (cur as usize) & ALIVE_BIT == 0 {
                return false;
            }
            let purged = ALIVE_BIT as *mut Slot<T, R>;
            if self
                .next_and_alive
                .compare_exchange(cur, purged, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Owner thread (or its destructor) marks itself dead. Returns `true` if the slot is still
    /// reachable from the queue (combiner will free it later); `false` if it was already
    /// unlinked (caller must free it now).
    fn invalidate(&self) -> bool {
        loop {
            let cur = self.raw();
            let next = ((cur as usize) & PTR_MASK) as *mut Slot<T, R>;
            if self
                .next_and_alive
                .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return !next.is_null();
            }
        }
    }
}

/// A per-thread handle into one [`FlatCombiner`]'s slot. Dropping it (on thread exit, via the
/// process-wide registry below, or explicit [`FlatCombiner::detach`]) invalidates the slot; the
/// combiner frees it on its next pass if the queue still holds it.
struct ThreadSlot<T, R> {
    ptr: *mut Slot<T, R>,
}

impl<T, R> Drop for ThreadSlot<T, R> {
    fn drop(&mut self) {
        unsafe {
            if !(*self.ptr).invalidate() {
                drop(Box::from_raw(self.ptr));
            }
        }
    }
}

static NEXT_COMBINER_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Every thread that ever calls `submit`/`detach` on any combiner registers its slot here,
    /// keyed by that combiner's unique id. A real OS `thread_local!` can't itself be generic
    /// over `T`/parameterized per `FlatCombiner` instance, so instead one process-wide registry
    /// holds type-erased `ThreadSlot<T, R>` boxes; on thread exit this table drops, running each
    /// entry's `Drop` (invalidate-or-free) exactly as an explicit `detach()` would. Mirrors the
    /// source's `ThreadLocalPointer`, which is likewise one slot per (combiner, thread) pair.
    static SLOT_REGISTRY: RefCell<HashMap<usize, Box<dyn Any>>> = RefCell::new(HashMap::new());
}

/// One `*mut Slot<T, R>` per (combiner instance, thread) pair, addressed through the process-wide
/// [`SLOT_REGISTRY`] by this combiner's unique id rather than a field owned by the combiner
/// itself — this is what lets [`FlatCombiner`] stay `Sync` without a mutex on the submit path.
struct ThreadSlots<T, R> {
    id: usize,
    _marker: std::marker::PhantomData<fn() -> (T, R)>,
}

impl<T: 'static, R: 'static> ThreadSlots<T, R> {
    fn new() -> Self {
        Self {
            id: NEXT_COMBINER_ID.fetch_add(1, Ordering::Relaxed),
            _marker: std::marker::PhantomData,
        }
    }

    fn get_or_create(&self) -> *mut Slot<T, R> {
        SLOT_REGISTRY.with(|reg| {
            let mut map = reg.borrow_mut();
            if let Some(existing) = map.get(&self.id) {
                return existing.downcast_ref::<ThreadSlot<T, R>>().unwrap().ptr;
            }
            let ptr = Box::into_raw(Box::new(Slot::new_alive()));
            map.insert(self.id, Box::new(ThreadSlot { ptr }) as Box<dyn Any>);
            ptr
        })
    }

    fn detach(&self) {
        SLOT_REGISTRY.with(|reg| {
            reg.borrow_mut().remove(&self.id);
        });
    }
}

/// A batched mutual-exclusion primitive: `T` is the operation payload, `R` the per-operation
/// result. `combine` is invoked by whichever thread holds the combiner role with up to
/// `batch_size` ready operations at a time, sorted by `Ord` first when `sort_batch` is set.
pub struct FlatCombiner<T, R, F>
where
    T: 'static,
    R: 'static,
    F: Fn(&mut [T]) -> Vec<R>,
{
    // Cache-line padded: the lock word and the queue head are the two words every submitting
    // thread hammers with CAS attempts, so keeping them off the same cache line as the
    // rarely-written configuration fields below avoids false sharing under contention.
    queue: crossbeam::utils::CachePadded<AtomicPtr<Slot<T, R>>>,
    lock: crossbeam::utils::CachePadded<AtomicU64>,
    sentinel: *mut Slot<T, R>,
    alive: AtomicU8,
    combine: F,
    batch_size: usize,
    saving_time: u64,
    sort_batch: bool,
    slots: ThreadSlots<T, R>,
}

// The struct holds raw pointers (`sentinel`, and indirectly the queue nodes), so auto traits
// don't apply; the actual safety argument is the combiner protocol itself (§5): every live node
// is either owned by exactly one thread's `ThreadSlot` or reachable only through the
// lock-protected queue, so `Send + Sync` hold whenever the payload/result/combine function do.
unsafe impl<T, R, F> Send for FlatCombiner<T, R, F>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(&mut [T]) -> Vec<R> + Send,
{
}
unsafe impl<T, R, F> Sync for FlatCombiner<T, R, F>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(&mut [T]) -> Vec<R> + Send + Sync,
{
}

impl<T, R, F> FlatCombiner<T, R, F>
where
    T: 'static,
    R: 'static,
    F: Fn(&mut [T]) -> Vec<R>,
{
    pub fn new(combine: F) -> Self {
        Self::with_params(combine, DEFAULT_BATCH_SIZE, DEFAULT_SAVING_TIME, true)
    }

    pub fn with_params(combine: F, batch_size: usize, saving_time: u64, sort_batch: bool) -> Self {
        assert!(batch_size > 0);
        let sentinel = Box::into_raw(Box::new(Slot::new_alive()));
        Self {
            queue: crossbeam::utils::CachePadded::new(AtomicPtr::new(sentinel)),
            sentinel,
            lock: crossbeam::utils::CachePadded::new(AtomicU64::new(0)),
            alive: AtomicU8::new(1),
            combine,
            batch_size,
            saving_time,
            sort_batch,
            slots: ThreadSlots::new(),
        }
    }

    /// Detach the calling thread from this combiner, freeing its slot (or marking it for the
    /// combiner to free, if still queued).
    pub fn detach(&self) {
        self.slots.detach();
    }

    fn try_lock(&self) -> Option<u64> {
        let cur = self.lock.load(Ordering::Relaxed);
        if cur & LOCK_BIT != 0 {
            return None;
        }
        self.lock
            .compare_exchange(cur, cur | LOCK_BIT, Ordering::Relaxed, Ordering::Relaxed)
            .ok()
            .map(|_| cur & EPOCH_MASK)
    }

    fn unlock(&self) {
        let cur = self.lock.load(Ordering::Relaxed);
        debug_assert!(cur & LOCK_BIT != 0);
        let next_epoch = (cur & EPOCH_MASK).wrapping_add(1) & EPOCH_MASK;
        self.lock.store(next_epoch, Ordering::Relaxed);
    }

    fn insert_slot(&self, slot: *mut Slot<T, R>) {
        unsafe {
            (*slot).last_active.store(0, Ordering::Relaxed);
        }
        loop {
            let head = self.queue.load(Ordering::Relaxed);
            unsafe {
                debug_assert!((*slot).set_next(head, false));
            }
            if self
                .queue
                .compare_exchange(head, slot, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Submit `op` and block (spin-yielding) until some combine pass has executed it, or the
    /// combiner has been shut down. Returns the result `combine` produced for this operation.
    pub fn submit(&self, op: T) -> Result<R, CombineError>
    where
        T: Ord,
    {
        let slot_ptr = self.slots.get_or_create();
        let slot = unsafe { &*slot_ptr };

        slot.operation.set(Some(op));
        slot.state.store(STATE_READY, Ordering::Release);

        loop {
            // Checked first, every iteration: a thread that wins the combiner role below always
            // re-wins `try_lock` on an uncontended path, so completion can only ever be observed
            // here, never in the (never-reached-again) `try_lock`-failure arm below it.
            if slot.is_complete() {
                break;
            } else if self.alive.load(Ordering::Relaxed) == 0 {
                slot.operation.take();
                slot.outcome.set(Some(Err(CombineError::ShutDown)));
                slot.state.store(STATE_COMPLETE, Ordering::Release);
                break;
            } else if let Some(epoch) = self.try_lock() {
                if slot.next_ptr().is_null() && !ptr::eq(slot_ptr, self.sentinel) {
                    self.insert_slot(slot_ptr);
                }
                self.run_combine_pass(epoch);
                self.unlock();
            } else if slot.next_ptr().is_null() {
                self.insert_slot(slot_ptr);
            } else {
                std::thread::yield_now();
            }
        }

        slot.outcome
            .take()
            .expect("combiner completed slot without recording an outcome")
    }

    /// Runs one pass over the queue: reaps dead/stale slots, applies up to `batch_size` ready
    /// slots per call to `combine`, flushes any partial trailing batch. Caller must hold the
    /// lock.
    fn run_combine_pass(&self, epoch: u64) {
        let mut parent: *mut Slot<T, R> = ptr::null_mut();
        let mut current = self.queue.load(Ordering::Relaxed);

        let mut batch_slots: Vec<*mut Slot<T, R>> = Vec::with_capacity(self.batch_size);
        let mut batch_ops: Vec<T> = Vec::with_capacity(self.batch_size);

        while !ptr::eq(current, self.sentinel) {
            let slot = unsafe { &*current };
            let next = slot.next_ptr();

            let stale = !slot.is_ready()
                && epoch.wrapping_sub(slot.last_active.load(Ordering::Relaxed)) > self.saving_time;
            if !slot.is_alive() || stale {
                self.dequeue_slot(parent, current);
                current = next;
                continue;
            }

            if slot.is_ready() {
                let op = slot.operation.take().expect("ready slot with no operation");
                batch_slots.push(current);
                batch_ops.push(op);
                slot.last_active.store(epoch, Ordering::Relaxed);
                slot.state.store(STATE_EXECUTING, Ordering::Relaxed);
            }

            if batch_ops.len() == self.batch_size {
                self.flush_batch(&mut batch_slots, &mut batch_ops);
            }

            parent = current;
            current = next;
        }

        if !batch_ops.is_empty() {
            self.flush_batch(&mut batch_slots, &mut batch_ops);
        }
    }

    fn flush_batch(&self, slots: &mut Vec<*mut Slot<T, R>>, ops: &mut Vec<T>)
    where
        T: Ord,
    {
        // Sorting groups operations on the same key adjacent so a domain combiner can coalesce
        // redundant work; this generic primitive only provides the hook (§4.2) — the cache's
        // own combine function does not currently exploit it.
        if self.sort_batch {
            let mut paired: Vec<(*mut Slot<T, R>, T)> = slots.drain(..).zip(ops.drain(..)).collect();
            paired.sort_by(|a, b| a.1.cmp(&b.1));
            slots.extend(paired.iter().map(|(s, _)| *s));
            ops.extend(paired.into_iter().map(|(_, op)| op));
        }

        let results = (self.combine)(ops.as_mut_slice());
        debug_assert_eq!(results.len(), slots.len());
        ops.clear();

        for (slot_ptr, result) in slots.drain(..).zip(results.into_iter()) {
            unsafe {
                (*slot_ptr).outcome.set(Some(Ok(result)));
                (*slot_ptr).state.store(STATE_COMPLETE, Ordering::Release);
            }
        }
    }

    /// Unlink `slot` (the parent-less case removes the head via CAS, retrying against a fresh
    /// head if another insert raced it). Frees the slot immediately if it was already dead.
    fn dequeue_slot(&self, parent: *mut Slot<T, R>, slot: *mut Slot<T, R>) {
        debug_assert!(!ptr::eq(slot, self.sentinel));
        let slot_ref = unsafe { &*slot };
        let next = slot_ref.next_ptr();

        if parent.is_null() {
            if self
                .queue
                .compare_exchange(slot, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_err()
            {
                let mut cur = self.queue.load(Ordering::Relaxed);
                loop {
                    let cur_ref = unsafe { &*cur };
                    if ptr::eq(cur_ref.next_ptr(), slot) {
                        break;
                    }
                    cur = cur_ref.next_ptr();
                    debug_assert!(!ptr::eq(cur, self.sentinel));
                }
                self.dequeue_slot(cur, slot);
                return;
            }
        } else {
            let parent_ref = unsafe { &*parent };
            if !parent_ref.set_next(next, true) {
                debug_assert!(!parent_ref.is_alive());
                parent_ref.set_next(next, true);
            }
        }

        if !slot_ref.try_purge() {
            unsafe { drop(Box::from_raw(slot)) };
        }
    }

    /// Tear down the combiner: blocks any further thread from ever becoming combiner again,
    /// drains the queue, fails every still-`READY` slot with [`CombineError::ShutDown`]. Any
    /// submission racing a concurrent teardown is undefined per §4.2; submissions that begin
    /// strictly after `shutdown()` returns fail fast rather than spinning forever.
    pub fn shutdown(&self) {
        if self.alive.swap(0, Ordering::Relaxed) == 0 {
            return;
        }
        while self.try_lock().is_none() {
            std::thread::yield_now();
        }

        // Detach the queue from `self.queue` first (swap to null, so no racing insert can reach
        // these nodes through the head anymore), then walk the detached chain and free each
        // slot directly — `dequeue_slot` assumes a live, still-linked queue, which this no
        // longer is.
        let mut current = self.queue.swap(ptr::null_mut(), Ordering::Relaxed);
        while !ptr::eq(current, self.sentinel) {
            let slot_ref = unsafe { &*current };
            let next = slot_ref.next_ptr();
            if slot_ref.is_ready() {
                slot_ref.state.store(STATE_EXECUTING, Ordering::Relaxed);
                slot_ref.operation.take();
                slot_ref.outcome.set(Some(Err(CombineError::ShutDown)));
                slot_ref.state.store(STATE_COMPLETE, Ordering::Release);
            }
            if !slot_ref.try_purge() {
                unsafe { drop(Box::from_raw(current)) };
            }
            current = next;
        }
    }
}

impl<T, R, F> Drop for FlatCombiner<T, R, F>
where
    T: 'static,
    R: 'static,
    F: Fn(&mut [T]) -> Vec<R>,
{
    fn drop(&mut self) {
        self.shutdown();
        unsafe { drop(Box::from_raw(self.sentinel)) };
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicI64;
    use std::sync::Arc;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    struct Delta(i64);

    fn sum_combiner() -> (Arc<AtomicI64>, impl Fn(&mut [Delta]) -> Vec<()>) {
        let total = Arc::new(AtomicI64::new(0));
        let total2 = total.clone();
        (total, move |ops: &mut [Delta]| {
            for op in ops.iter() {
                total2.fetch_add(op.0, Ordering::Relaxed);
            }
            vec![(); ops.len()]
        })
    }

    #[test]
    fn single_thread_submits_apply_in_order() {
        let (total, combine) = sum_combiner();
        let fc = FlatCombiner::new(combine);
        for i in 0..100 {
            fc.submit(Delta(i)).unwrap();
        }
        assert_eq!(total.load(Ordering::Relaxed), (0..100).sum::<i64>());
    }

    #[test]
    fn concurrent_submits_all_land() {
        let (total, combine) = sum_combiner();
        let fc = Arc::new(FlatCombiner::new(combine));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let fc = fc.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..1000 {
                    fc.submit(Delta(i)).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(total.load(Ordering::Relaxed), 8 * (0..1000).sum::<i64>());
    }

    #[test]
    fn shutdown_fails_outstanding_submissions() {
        let (_total, combine) = sum_combiner();
        let fc = FlatCombiner::new(combine);
        fc.shutdown();
        let err = fc.submit(Delta(1));
        assert_eq!(err, Err(CombineError::ShutDown));
    }

    #[test]
    fn detach_then_resubmit_gets_a_fresh_slot() {
        let (total, combine) = sum_combiner();
        let fc = FlatCombiner::new(combine);
        fc.submit(Delta(1)).unwrap();
        fc.detach();
        fc.submit(Delta(2)).unwrap();
        assert_eq!(total.load(Ordering::Relaxed), 3);
    }
}
