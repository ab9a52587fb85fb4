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

//! Bounded pool of worker threads draining a shared task queue.
//!
//! Workers run request parsing and response assembly off the reactor
//! thread. A task owns its connection for the duration of the call and must
//! re-arm the descriptor (or close it) before returning; the pool itself
//! has no completion handles.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    tasks: VecDeque<Task>,
    is_closed: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Fixed-size worker pool. Dropping it drains the remaining queue, then
/// joins every thread.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` threads.
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0);
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                tasks: VecDeque::new(),
                is_closed: false,
            }),
            available: Condvar::new(),
        });

        let handles = (0..workers)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { shared, handles }
    }

    /// Enqueues a task and wakes one worker. Tasks submitted after shutdown
    /// has begun are dropped silently.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        {
            let Ok(mut state) = self.shared.state.lock() else {
                return;
            };
            if state.is_closed {
                return;
            }
            state.tasks.push_back(Box::new(task));
        }
        self.shared.available.notify_one();
    }
}

fn worker_loop(shared: &PoolShared) {
    let Ok(mut state) = shared.state.lock() else {
        return;
    };
    loop {
        if let Some(task) = state.tasks.pop_front() {
            drop(state);
            task();
            state = match shared.state.lock() {
                Ok(s) => s,
                Err(_) => return,
            };
        } else if state.is_closed {
            return;
        } else {
            state = match shared.available.wait(state) {
                Ok(s) => s,
                Err(_) => return,
            };
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.is_closed = true;
        }
        self.shared.available.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.handles.len())
            .finish()
    }
}
