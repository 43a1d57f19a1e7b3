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

//! Context-switch machinery. One OS stack, many tasks: switching away from a task copies its
//! live stack extent into a heap buffer; switching into a task copies that buffer back onto the
//! same addresses before jumping into its saved machine context.
//!
//! The save/restore pair below is a setjmp/longjmp emulation written directly in x86_64 asm
//! (System V callee-saved registers `rbx`, `rbp`, `r12`-`r15`, `rsp`, plus a resume address).
//! `save_context` returns 0 the first time it is called and returns 1 when control later arrives
//! via `restore_context` jumping straight back into it — at that point the stack bytes around the
//! call site have already been copied back by the caller, so the trailing `ret` pops the correct
//! return address and execution continues exactly where it left off.

use std::ptr;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        core::arch::global_asm!(
            ".global ferrocache_coro_save",
            ".p2align 4",
            "ferrocache_coro_save:",
            "mov [rdi], rbx",
            "mov [rdi+8], rbp",
            "mov [rdi+16], r12",
            "mov [rdi+24], r13",
            "mov [rdi+32], r14",
            "mov [rdi+40], r15",
            "mov [rdi+48], rsp",
            "lea rax, [rip + 2f]",
            "mov [rdi+56], rax",
            "xor eax, eax",
            "ret",
            "2:",
            "mov eax, 1",
            "ret",
        );

        core::arch::global_asm!(
            ".global ferrocache_coro_restore",
            ".p2align 4",
            "ferrocache_coro_restore:",
            "mov rbx, [rdi]",
            "mov rbp, [rdi+8]",
            "mov r12, [rdi+16]",
            "mov r13, [rdi+24]",
            "mov r14, [rdi+32]",
            "mov r15, [rdi+40]",
            "mov rsp, [rdi+48]",
            "jmp qword ptr [rdi+56]",
        );
    } else {
        compile_error!("ferrocache-coroutine's context switch is implemented in x86_64 assembly only");
    }
}

extern "C" {
    fn ferrocache_coro_save(ctx: *mut Context) -> u64;
    fn ferrocache_coro_restore(ctx: *const Context) -> !;
}

/// A saved machine context: the callee-saved register set plus the address execution should
/// resume at. Laid out to match the offsets baked into the asm above.
#[repr(C)]
#[derive(Default)]
struct Context {
    rbx: u64,
    rbp: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    rsp: u64,
    rip: u64,
}

/// Whether the OS stack grows toward lower or higher addresses, probed once at engine
/// construction (§4.3). x86_64 always grows down in practice; this is still probed rather than
/// hard-coded so the frontier arithmetic below reads as direction-agnostic.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Direction {
    Down,
    Up,
}

#[inline(never)]
fn probe_direction(caller_local: usize) -> Direction {
    let callee_local: u8 = 0;
    let callee_addr = &callee_local as *const u8 as usize;
    if caller_local > callee_addr {
        Direction::Down
    } else {
        Direction::Up
    }
}

/// An independent logical execution: a saved machine context, a heap copy of its live stack
/// extent while suspended, prev/next links in the runnable list, and (until first scheduled) the
/// closure it was created to run.
struct Task {
    ctx: Context,
    /// Byte range `[frontier, frontier + stack.len())` this task's stack occupied at its last
    /// suspension, saved here so a later restore knows where to copy `stack` back to.
    frontier: usize,
    stack: Vec<u8>,
    closure: Option<Box<dyn FnOnce()>>,
    prev: *mut Task,
    next: *mut Task,
}

impl Task {
    fn idle() -> Self {
        Task {
            ctx: Context::default(),
            frontier: 0,
            stack: Vec::new(),
            closure: None,
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        }
    }

    fn new(closure: Box<dyn FnOnce()>) -> Self {
        Task {
            ctx: Context::default(),
            frontier: 0,
            stack: Vec::new(),
            closure: Some(closure),
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        }
    }
}

/// Opaque reference to a task, returned by [`Engine::run`] and accepted by [`Engine::sched`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle(*mut Task);

/// Single-threaded cooperative scheduler sharing one OS stack across many [`Task`]s (§3.3, §4.3).
///
/// Must be driven from exactly one OS thread for its whole lifetime. The raw task pointers below
/// already make this `!Send`/`!Sync` without any marker type.
pub struct Engine {
    stack_bottom: usize,
    direction: Direction,
    current: *mut Task,
    alive: *mut Task,
    idle: Box<Task>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        let caller_local: u8 = 0;
        let direction = probe_direction(&caller_local as *const u8 as usize);
        Engine {
            stack_bottom: 0,
            direction,
            current: ptr::null_mut(),
            alive: ptr::null_mut(),
            idle: Box::new(Task::idle()),
        }
    }

    /// The task currently executing, or `None` if it is the idle (scheduler-driving) context.
    /// Dispatchers that block a connection's task on an external event (e.g. `EWOULDBLOCK`) use
    /// this to remember which task to [`Engine::sched`] back in once the event fires.
    pub fn current_handle(&mut self) -> Option<TaskHandle> {
        let idle = self.idle_ptr();
        if self.current == idle || self.current.is_null() {
            None
        } else {
            Some(TaskHandle(self.current))
        }
    }

    fn idle_ptr(&mut self) -> *mut Task {
        &mut *self.idle as *mut Task
    }

    /// Capture `stack_bottom`, spawn `entry` as the first task, then run the scheduler until no
    /// task remains runnable. Returns once every spawned task has exited.
    pub fn start<F>(&mut self, entry: F)
    where
        F: FnOnce() + 'static,
    {
        let anchor: u8 = 0;
        self.stack_bottom = &anchor as *const u8 as usize;

        let first = self.run(entry);

        // Capture the idle context. Every time a task retires it jumps back to this exact point
        // (see `retire_current`), landing here with `ferrocache_coro_save` "returning" 1. Schedule
        // another runnable task if one remains; once none do, `yield_now` is a no-op and we fall
        // through and return out of `start` for good.
        if unsafe { ferrocache_coro_save(&mut self.idle.ctx) } != 0 {
            self.yield_now();
            return;
        }
        let idle_ptr = self.idle_ptr();
        self.current = idle_ptr;
        self.store_live_stack(idle_ptr);
        self.sched(Some(first));
    }

    /// Create a new task whose saved context, once restored, runs `f` to completion and then
    /// retires itself. Links the task into the runnable list and returns its handle; does not
    /// run `f` yet.
    pub fn run<F>(&mut self, f: F) -> TaskHandle
    where
        F: FnOnce() + 'static,
    {
        let task = Box::into_raw(Box::new(Task::new(Box::new(f))));

        // The first time through, `ferrocache_coro_save` returns 0 and we fall through to link
        // the task without running it. Every later time execution lands here is because
        // `restore_task` jumped back into this exact point — i.e. we have been scheduled.
        if unsafe { ferrocache_coro_save(&mut (*task).ctx) } != 0 {
            let f = unsafe { (*task).closure.take() }.expect("task scheduled before it had a body");
            f();
            self.retire_current(task);
            unreachable!("retire_current transfers control to the idle task and never returns");
        }

        self.store_live_stack(task);
        self.link_alive(task);
        tracing::trace!(task = ?task, "task spawned");
        TaskHandle(task)
    }

    /// If any other task is runnable, schedule it; otherwise a no-op.
    pub fn yield_now(&mut self) {
        let head = self.alive;
        if head.is_null() {
            return;
        }
        let next = if self.current == head {
            unsafe { (*head).next }
        } else {
            head
        };
        if next.is_null() {
            return;
        }
        self.sched(Some(TaskHandle(next)));
    }

    /// Save the current task (unless it is the idle context, which has no live frame to
    /// preserve) and transfer control to `handle`. `None` behaves like [`Engine::yield_now`].
    pub fn sched(&mut self, handle: Option<TaskHandle>) {
        let target = match handle {
            Some(TaskHandle(t)) => t,
            None => return self.yield_now(),
        };

        let current = self.current;
        if current != self.idle_ptr() {
            self.store_live_stack(current);
            if unsafe { ferrocache_coro_save(&mut (*current).ctx) } != 0 {
                // We are the task that got resumed back into here; nothing left to do.
                return;
            }
        }
        self.restore_task(target);
    }

    /// Record `[low, high)` around the current frame and `task`'s bottom anchor, copy that range
    /// into a heap buffer, and remember the low bound as this task's frontier.
    fn store_live_stack(&self, task: *mut Task) {
        let marker: u8 = 0;
        let frontier_addr = &marker as *const u8 as usize;
        let (low, high) = match self.direction {
            Direction::Down => (frontier_addr, self.stack_bottom),
            Direction::Up => (self.stack_bottom, frontier_addr),
        };
        let len = high.saturating_sub(low);
        let mut buf = vec![0u8; len];
        if len > 0 {
            unsafe { ptr::copy_nonoverlapping(low as *const u8, buf.as_mut_ptr(), len) };
        }
        unsafe {
            (*task).frontier = low;
            (*task).stack = buf;
        }
    }

    /// Rewind past `task`'s frontier, copy its saved stack buffer back, and jump into its
    /// context. Never returns to the caller: control either lands in `run`'s resumed branch or
    /// in the `ferrocache_coro_save` call site this task last suspended at.
    fn restore_task(&mut self, task: *mut Task) {
        self.current = task;
        let low = unsafe { (*task).frontier };
        let stack = unsafe { std::mem::take(&mut (*task).stack) };
        let ctx = unsafe { &(*task).ctx as *const Context };
        rewind_and_restore(self.direction, low, &stack, ctx);
    }

    fn link_alive(&mut self, task: *mut Task) {
        unsafe {
            (*task).next = self.alive;
            (*task).prev = ptr::null_mut();
            if !self.alive.is_null() {
                (*self.alive).prev = task;
            }
        }
        self.alive = task;
    }

    fn unlink_alive(&mut self, task: *mut Task) {
        unsafe {
            let prev = (*task).prev;
            let next = (*task).next;
            if !prev.is_null() {
                (*prev).next = next;
            } else {
                self.alive = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
        }
    }

    /// The running task's entry function has returned: unlink it, free it, and hand control back
    /// to the idle context, which either schedules the next runnable task or returns out of
    /// `start`.
    fn retire_current(&mut self, task: *mut Task) -> ! {
        tracing::trace!(task = ?task, "task retired");
        self.unlink_alive(task);
        let idle_ptr = self.idle_ptr();
        unsafe { drop(Box::from_raw(task)) };
        self.restore_task(idle_ptr);
        unreachable!("restore_task diverges")
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let mut cursor = self.alive;
        while !cursor.is_null() {
            let next = unsafe { (*cursor).next };
            unsafe { drop(Box::from_raw(cursor)) };
            cursor = next;
        }
    }
}

/// Advance one stack frame at a time, in the direction of growth, until the current frame lies
/// beyond `low` — only then is it safe to copy `stack` back onto `[low, low + stack.len())`
/// without clobbering this very function's own live locals and return address.
///
/// The explicit asm barrier after the recursive call exists because, without it, an optimizer is
/// free to turn self-tail-recursion into a loop, which would not actually grow the stack and
/// would defeat the entire point of rewinding past the target's frontier.
#[inline(never)]
fn rewind_and_restore(direction: Direction, low: usize, stack: &[u8], ctx: *const Context) {
    let marker: u8 = 0;
    let marker_addr = &marker as *const u8 as usize;
    let past = match direction {
        Direction::Down => marker_addr < low,
        Direction::Up => marker_addr > low,
    };
    if !past {
        rewind_and_restore(direction, low, stack, ctx);
        unsafe { core::arch::asm!("", options(nomem, nostack, preserves_flags)) };
        return;
    }
    if !stack.is_empty() {
        unsafe { ptr::copy_nonoverlapping(stack.as_ptr(), low as *mut u8, stack.len()) };
    }
    unsafe { ferrocache_coro_restore(ctx) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn start_with_no_task_runs_and_returns() {
        let mut engine = Engine::new();
        let ran = Rc::new(RefCell::new(false));
        let flag = ran.clone();
        engine.start(move || {
            *flag.borrow_mut() = true;
        });
        assert!(*ran.borrow());
    }

    #[test]
    fn two_tasks_yield_back_and_forth_to_two_hundred() {
        // A task's closure needs to call back into the engine that is driving it (to yield). The
        // engine can't be borrowed twice, so the closure captures a raw pointer to it instead —
        // sound here because the engine never moves once `start` begins running tasks, and
        // everything runs on this one thread.
        let mut engine = Engine::new();
        let engine_ptr: *mut Engine = &mut engine;
        let counter = Rc::new(RefCell::new(0u32));

        let c1 = counter.clone();
        let c2 = counter.clone();

        engine.start(move || {
            let engine = unsafe { &mut *engine_ptr };
            engine.run(move || {
                let engine = unsafe { &mut *engine_ptr };
                for _ in 0..100 {
                    *c1.borrow_mut() += 1;
                    engine.yield_now();
                }
            });
            engine.run(move || {
                let engine = unsafe { &mut *engine_ptr };
                for _ in 0..100 {
                    *c2.borrow_mut() += 1;
                    engine.yield_now();
                }
            });
            engine.yield_now();
        });

        assert_eq!(*counter.borrow(), 200);
        assert!(engine.alive.is_null());
    }

    #[test]
    fn run_inside_start_links_both_tasks_before_either_runs() {
        let mut engine = Engine::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let engine_ptr: *mut Engine = &mut engine;

        let o1 = order.clone();
        let o2 = order.clone();
        engine.start(move || {
            let engine = unsafe { &mut *engine_ptr };
            engine.run(move || o1.borrow_mut().push(1));
            engine.run(move || o2.borrow_mut().push(2));
        });

        assert_eq!(*order.borrow(), vec![1, 2]);
    }
}
