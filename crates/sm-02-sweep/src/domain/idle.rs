//! Idle-time work queue.
//!
//! Callers queue `(start, done)` callback pairs; the engine runs them once,
//! in order, at the next point where no asynchronous work is outstanding
//! (a phase boundary or an idle engine).

use std::collections::VecDeque;
use std::fmt;

pub type IdleCallback = Box<dyn FnOnce() + Send>;

pub struct IdleWork {
    start: IdleCallback,
    done: Option<IdleCallback>,
}

impl IdleWork {
    pub fn new(start: impl FnOnce() + Send + 'static) -> Self {
        Self {
            start: Box::new(start),
            done: None,
        }
    }

    /// Callback run right after `start`.
    pub fn then(mut self, done: impl FnOnce() + Send + 'static) -> Self {
        self.done = Some(Box::new(done));
        self
    }

    fn run(self) {
        (self.start)();
        if let Some(done) = self.done {
            done();
        }
    }
}

impl fmt::Debug for IdleWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleWork")
            .field("has_done", &self.done.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct IdleQueue {
    items: VecDeque<IdleWork>,
}

impl IdleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, work: IdleWork) {
        self.items.push_back(work);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Run everything queued so far. Returns the number of items run.
    pub fn run_all(&mut self) -> usize {
        let batch: Vec<IdleWork> = self.items.drain(..).collect();
        let count = batch.len();
        for work in batch {
            work.run();
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_runs_start_then_done_in_queue_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = IdleQueue::new();
        for i in 0..2 {
            let (a, b) = (Arc::clone(&log), Arc::clone(&log));
            queue.push(
                IdleWork::new(move || a.lock().unwrap().push(format!("start{}", i)))
                    .then(move || b.lock().unwrap().push(format!("done{}", i))),
            );
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.run_all(), 2);
        assert!(queue.is_empty());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start0", "done0", "start1", "done1"]
        );
        assert_eq!(queue.run_all(), 0);
    }
}
