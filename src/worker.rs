// src/worker.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

type Task = Box<dyn FnOnce() + Send>;

struct Inner {
    quit: AtomicBool,
    tasks: Mutex<Vec<Task>>,
    ready: Condvar,
}

/// Small blocking pool for handler-initiated offload of CPU or blocking
/// work. The usual pattern is to enqueue a task that signals the
/// session's wake-upper, then `yield_now` until it fires.
pub struct ThreadWorker {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadWorker {
    pub fn new(workers: u32) -> Self {
        let workers = workers.max(1);
        let inner = Arc::new(Inner {
            quit: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            ready: Condvar::new(),
        });
        let handles = (0..workers)
            .map(|_| {
                let inner = Arc::clone(&inner);
                thread::spawn(move || loop {
                    let Some(task) = next_task(&inner) else {
                        break;
                    };
                    task();
                })
            })
            .collect();
        Self {
            inner,
            workers: handles,
        }
    }

    /// Enqueues a task to run on one of the worker threads.
    pub fn insert_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut tasks = self.inner.tasks.lock().unwrap();
            tasks.push(Box::new(task));
        }
        self.inner.ready.notify_one();
    }
}

fn next_task(inner: &Inner) -> Option<Task> {
    let mut tasks = inner.tasks.lock().unwrap();
    loop {
        if inner.quit.load(Ordering::Acquire) {
            return None;
        }
        if let Some(task) = tasks.pop() {
            return Some(task);
        }
        tasks = inner.ready.wait(tasks).unwrap();
    }
}

impl Drop for ThreadWorker {
    fn drop(&mut self) {
        self.inner.quit.store(true, Ordering::Release);
        self.inner.ready.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
