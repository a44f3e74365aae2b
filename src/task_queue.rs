use lockfree::queue::Queue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{Error, Result};
use crate::reactor::Reactor;

/// Default bound for a loop's task channel.
pub const DEFAULT_TASK_QUEUE_CAP: usize = 1024;

/// Work marshalled onto an owning loop from a foreign thread.
pub type Task = Box<dyn FnOnce(&mut Reactor) -> Result<()> + Send + 'static>;

/// Priority classes for submitted tasks. The consumer drains `Urgent`
/// entries before `Normal` entries on each wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPriority {
    Normal,
    Urgent,
}

/// Bounded multi-producer / single-consumer channel bound to one loop.
///
/// Two lock-free lanes share a single atomic length so the bound covers both
/// priority classes. The producer that observes the empty-to-non-empty
/// transition wins the wake signal and owes the poller a wake; the consumer
/// re-arms the signal before draining, so a submission racing the drain
/// produces a fresh wake rather than a lost task.
pub struct TaskQueue<T = Task> {
    urgent: Queue<T>,
    normal: Queue<T>,
    len: AtomicUsize,
    capacity: usize,
    wake_sig: AtomicBool,
}

impl<T> TaskQueue<T> {
    pub fn new(capacity: usize) -> Self {
        TaskQueue {
            urgent: Queue::new(),
            normal: Queue::new(),
            len: AtomicUsize::new(0),
            capacity,
            wake_sig: AtomicBool::new(false),
        }
    }

    /// Enqueues at the given priority. Returns `Ok(true)` when the caller
    /// owes the poller a wake, and [`Error::QueueFull`] at capacity.
    pub fn submit_with(&self, priority: TaskPriority, task: T) -> Result<bool> {
        match priority {
            TaskPriority::Normal => self.push(&self.normal, task),
            TaskPriority::Urgent => self.push(&self.urgent, task),
        }
    }

    pub fn submit(&self, task: T) -> Result<bool> {
        self.submit_with(TaskPriority::Normal, task)
    }

    /// Enqueues ahead of all normal-priority work.
    pub fn submit_urgent(&self, task: T) -> Result<bool> {
        self.submit_with(TaskPriority::Urgent, task)
    }

    fn push(&self, lane: &Queue<T>, task: T) -> Result<bool> {
        if self.len.fetch_add(1, Ordering::AcqRel) >= self.capacity {
            self.len.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::QueueFull);
        }
        lane.push(task);
        Ok(self
            .wake_sig
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    /// Re-arms the wake signal; the consumer calls this before draining so
    /// that submissions landing mid-drain trigger a fresh wake.
    pub fn begin_drain(&self) {
        self.wake_sig.store(false, Ordering::Release);
    }

    /// Pops the next task, urgent lane first. The urgent lane is re-checked
    /// on every call, so urgent work submitted mid-drain still jumps ahead.
    pub fn pop(&self) -> Option<T> {
        let task = self.urgent.pop().or_else(|| self.normal.pop())?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(task)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_submit_and_pop() {
        let q: TaskQueue<u32> = TaskQueue::new(8);
        assert!(q.submit(1).unwrap());
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), None);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_wake_owed_only_on_empty_transition() {
        let q: TaskQueue<u32> = TaskQueue::new(8);
        assert!(q.submit(1).unwrap(), "first submit owes a wake");
        assert!(!q.submit(2).unwrap(), "queue already armed");
        q.begin_drain();
        while q.pop().is_some() {}
        assert!(q.submit(3).unwrap(), "re-armed after drain");
    }

    #[test]
    fn test_full_queue_rejects() {
        let q: TaskQueue<u32> = TaskQueue::new(2);
        q.submit(1).unwrap();
        q.submit(2).unwrap();
        assert!(matches!(q.submit(3), Err(Error::QueueFull)));
        // A pop frees a slot.
        assert_eq!(q.pop(), Some(1));
        q.submit(4).unwrap();
    }

    #[test]
    fn test_urgent_drains_first() {
        let q: TaskQueue<&str> = TaskQueue::new(8);
        q.submit("n0").unwrap();
        q.submit_with(TaskPriority::Normal, "n1").unwrap();
        q.submit_urgent("u0").unwrap();
        q.submit_with(TaskPriority::Urgent, "u1").unwrap();
        q.submit("n2").unwrap();

        q.begin_drain();
        let mut order = Vec::new();
        while let Some(t) = q.pop() {
            order.push(t);
        }
        assert_eq!(order, vec!["u0", "u1", "n0", "n1", "n2"]);
    }

    #[test]
    fn test_per_producer_fifo_within_class() {
        let q: Arc<TaskQueue<(usize, usize)>> = Arc::new(TaskQueue::new(4096));

        let handles: Vec<_> = (0..4)
            .map(|producer| {
                let q = q.clone();
                std::thread::spawn(move || {
                    for seq in 0..200usize {
                        q.submit((producer, seq)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut last_seq = [None::<usize>; 4];
        while let Some((producer, seq)) = q.pop() {
            if let Some(prev) = last_seq[producer] {
                assert!(prev < seq, "producer {} reordered: {} before {}", producer, prev, seq);
            }
            last_seq[producer] = Some(seq);
        }
        for (producer, seen) in last_seq.iter().enumerate() {
            assert_eq!(*seen, Some(199), "producer {} lost tasks", producer);
        }
    }
}
