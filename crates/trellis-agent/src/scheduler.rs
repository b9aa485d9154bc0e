// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! First-come-first-served work queue.
//!
//! The scheduler is the boundary between I/O threads (framing only) and
//! worker threads (reliability bookkeeping and tree operations). `push`
//! accepts a priority for interface compatibility with priority-aware
//! schedulers, but this variant ignores it.
//!
//! Shutdown is an explicit closed state checked under the same lock as the
//! wait predicate: `deinit` wakes every blocked worker, which then observes
//! `None` and exits. Items already queued (or pushed while stopped) are
//! retained and become drainable again after a new `init`; `deinit`
//! itself never loses items.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct SchedulerState<T> {
    queue: VecDeque<T>,
    running: bool,
}

/// Unbounded FCFS scheduler with blocking consumers.
#[derive(Debug)]
pub struct FcfsScheduler<T> {
    state: Mutex<SchedulerState<T>>,
    cond: Condvar,
}

impl<T> FcfsScheduler<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                queue: VecDeque::new(),
                running: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Start accepting `pop`s. Idempotent.
    pub fn init(&self) {
        let mut state = self.state.lock();
        state.running = true;
        // Parked workers re-check the predicate and may now drain.
        self.cond.notify_all();
    }

    /// Stop the scheduler. Wakes all blocked workers, which observe `None`.
    /// Idempotent; queued items are retained.
    pub fn deinit(&self) {
        let mut state = self.state.lock();
        state.running = false;
        self.cond.notify_all();
    }

    /// Enqueue an item. The priority is accepted and ignored (FCFS).
    pub fn push(&self, item: T, _priority: u8) {
        let mut state = self.state.lock();
        state.queue.push_back(item);
        self.cond.notify_one();
    }

    /// Block until an item is available or the scheduler stops. Returns
    /// `None` only when stopped.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if !state.running {
                return None;
            }
            if let Some(item) = state.queue.pop_front() {
                return Some(item);
            }
            self.cond.wait(&mut state);
        }
    }

    /// Non-blocking variant; `None` when stopped or empty.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        if !state.running {
            return None;
        }
        state.queue.pop_front()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }
}

impl<T> Default for FcfsScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}
