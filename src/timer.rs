// Copyright 2026 the hurtig authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Min-heap timer expiring idle connections.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Fired at most once, when the owning entry expires.
pub type TimeoutCallback = Box<dyn FnOnce() + Send>;

struct TimerNode {
    id: RawFd,
    expires: Instant,
    cb: TimeoutCallback,
}

/// Deadline-ordered heap of per-connection timers.
///
/// A secondary `id → heap index` map is kept in lockstep through every swap,
/// so resetting or cancelling an entry by its descriptor is `O(log n)`.
#[derive(Default)]
pub struct HeapTimer {
    heap: Vec<TimerNode>,
    refs: HashMap<RawFd, usize>,
}

impl HeapTimer {
    /// Creates an empty timer.
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(64),
            refs: HashMap::new(),
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether no entries are pending.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Schedules `cb` to fire in `timeout_ms` milliseconds. An existing
    /// entry for `id` has its deadline and callback replaced instead.
    pub fn add(&mut self, id: RawFd, timeout_ms: u64, cb: TimeoutCallback) {
        let expires = Instant::now() + Duration::from_millis(timeout_ms);
        if let Some(&i) = self.refs.get(&id) {
            self.heap[i].expires = expires;
            self.heap[i].cb = cb;
            self.resift(i);
        } else {
            let i = self.heap.len();
            self.refs.insert(id, i);
            self.heap.push(TimerNode { id, expires, cb });
            self.sift_up(i);
        }
    }

    /// Pushes the deadline of an existing entry out to `now + timeout_ms`.
    /// Unknown ids are ignored.
    pub fn adjust(&mut self, id: RawFd, timeout_ms: u64) {
        if let Some(&i) = self.refs.get(&id) {
            self.heap[i].expires = Instant::now() + Duration::from_millis(timeout_ms);
            self.resift(i);
        }
    }

    /// Removes the entry for `id` without firing its callback.
    pub fn cancel(&mut self, id: RawFd) {
        if let Some(&i) = self.refs.get(&id) {
            self.remove(i);
        }
    }

    /// Fires every entry whose deadline has passed, in deadline order.
    pub fn tick(&mut self) {
        while let Some(top) = self.heap.first() {
            if top.expires > Instant::now() {
                break;
            }
            let node = self.remove(0);
            (node.cb)();
        }
    }

    /// Expires due entries, then returns the milliseconds until the next
    /// deadline, or −1 when none is pending.
    pub fn next_tick_ms(&mut self) -> i64 {
        self.tick();
        match self.heap.first() {
            None => -1,
            Some(node) => node
                .expires
                .saturating_duration_since(Instant::now())
                .as_millis() as i64,
        }
    }

    /// Drops every entry without firing callbacks.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.refs.clear();
    }

    fn remove(&mut self, i: usize) -> TimerNode {
        let last = self.heap.len() - 1;
        if i < last {
            self.swap_nodes(i, last);
        }
        let node = self.heap.pop().expect("heap is non-empty here");
        self.refs.remove(&node.id);
        if i < self.heap.len() {
            self.resift(i);
        }
        node
    }

    fn resift(&mut self, i: usize) {
        if !self.sift_down(i) {
            self.sift_up(i);
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap_nodes(parent, i);
            i = parent;
        }
    }

    /// Returns whether the node moved.
    fn sift_down(&mut self, mut i: usize) -> bool {
        let start = i;
        let n = self.heap.len();
        loop {
            let mut child = 2 * i + 1;
            if child >= n {
                break;
            }
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
        }
        i > start
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.refs.insert(self.heap[i].id, i);
        self.refs.insert(self.heap[j].id, j);
    }
}

impl fmt::Debug for HeapTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapTimer")
            .field("len", &self.heap.len())
            .finish()
    }
}
