//! Worker pool for long-running syscalls.
//!
//! Router handlers must not block; anything that would (EXEC, HTTP) is
//! submitted here as a thunk together with a request id, and the produced
//! response is appended to the submitting agent's result queue for later
//! ASYNC_POLL. Tasks from one agent may run on different workers in
//! parallel and complete out of order; the request id is the only
//! correlation handle.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use roost_protocol::SyscallOp;

/// A completed asynchronous syscall response.
#[derive(Debug, Clone)]
pub struct AsyncResult {
    pub request_id: u64,
    pub opcode: SyscallOp,
    pub payload: String,
}

type TaskFn = Box<dyn FnOnce() -> String + Send>;

struct Task {
    agent_id: u32,
    request_id: u64,
    opcode: SyscallOp,
    thunk: TaskFn,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<VecDeque<Task>>,
    available: Condvar,
    stopping: AtomicBool,
    results: Mutex<HashMap<u32, VecDeque<AsyncResult>>>,
    next_request_id: AtomicU64,
}

/// Fixed-size worker pool with a shared FIFO and per-agent result queues.
pub struct AsyncTaskManager {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncTaskManager {
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let shared = Arc::new(Shared {
            next_request_id: AtomicU64::new(1),
            ..Shared::default()
        });

        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let shared = Arc::clone(&shared);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("roost-async-{i}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn async worker thread"),
            );
        }

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Allocate the next request id. Strictly monotone for the process
    /// lifetime.
    pub fn next_request_id(&self) -> u64 {
        self.shared.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue a task. Returns false when the manager is shutting down.
    pub fn submit(
        &self,
        agent_id: u32,
        opcode: SyscallOp,
        request_id: u64,
        thunk: impl FnOnce() -> String + Send + 'static,
    ) -> bool {
        if self.shared.stopping.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.push_back(Task {
                agent_id,
                request_id,
                opcode,
                thunk: Box::new(thunk),
            });
        }
        self.shared.available.notify_one();
        true
    }

    /// Drain up to `max` completed results for `agent_id`, FIFO, without
    /// blocking.
    pub fn poll(&self, agent_id: u32, max: usize) -> Vec<AsyncResult> {
        let mut results = self.shared.results.lock().unwrap();
        let Some(queue) = results.get_mut(&agent_id) else {
            return Vec::new();
        };
        let count = max.min(queue.len());
        queue.drain(..count).collect()
    }

    /// Discard any undelivered results for a removed agent.
    pub fn discard(&self, agent_id: u32) {
        self.shared.results.lock().unwrap().remove(&agent_id);
    }

    /// Signal workers to stop and join them. Queued tasks still in the
    /// FIFO are abandoned; the task each worker holds runs to completion.
    pub fn shutdown(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.available.notify_all();
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for AsyncTaskManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if shared.stopping.load(Ordering::Acquire) {
                    return;
                }
                if let Some(task) = queue.pop_front() {
                    break task;
                }
                queue = shared.available.wait(queue).unwrap();
            }
        };

        let payload = (task.thunk)();
        let mut results = shared.results.lock().unwrap();
        results.entry(task.agent_id).or_default().push_back(AsyncResult {
            request_id: task.request_id,
            opcode: task.opcode,
            payload,
        });
    }
}
