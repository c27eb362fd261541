use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use crate::job::{Fqid, JobId};

/// What a task serializes on. Two tasks with the same key never run at the
/// same time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKey {
    Job(JobId),
    Backend(String),
}

impl TaskKey {
    pub fn fqid(&self) -> Option<Fqid> {
        match self {
            TaskKey::Job(id) => Some(Fqid::master(*id)),
            TaskKey::Backend(_) => None,
        }
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKey::Job(id) => write!(f, "job {}", id),
            TaskKey::Backend(name) => write!(f, "backend {}", name),
        }
    }
}

/// A queued task with its scheduling metadata.
#[derive(Debug)]
pub struct Entry<T> {
    pub key: TaskKey,
    pub priority: u8,
    pub seq: u64,
    pub payload: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Lower priority numbers first, then submission order.
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority queue that hands out at most one task per key at a time.
///
/// Tasks whose key is busy are parked until the running task for that key
/// completes, then return to the heap in submission order.
#[derive(Debug)]
pub struct TaskQueue<T> {
    heap: BinaryHeap<Entry<T>>,
    parked: HashMap<TaskKey, VecDeque<Entry<T>>>,
    active: HashSet<TaskKey>,
    next_seq: u64,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            parked: HashMap::new(),
            active: HashSet::new(),
            next_seq: 0,
        }
    }

    pub fn push(&mut self, key: TaskKey, priority: u8, payload: T) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            key,
            priority,
            seq,
            payload,
        });
        seq
    }

    /// Next task whose key is idle. The key becomes active until
    /// [`complete`](Self::complete) is called for it.
    pub fn pop_ready(&mut self) -> Option<Entry<T>> {
        while let Some(entry) = self.heap.pop() {
            if self.active.contains(&entry.key) {
                let parked = self.parked.entry(entry.key.clone()).or_default();
                let at = parked
                    .iter()
                    .position(|p| p.seq > entry.seq)
                    .unwrap_or(parked.len());
                parked.insert(at, entry);
                continue;
            }
            self.active.insert(entry.key.clone());
            return Some(entry);
        }
        None
    }

    /// Mark the running task for `key` finished, releasing the next parked
    /// task for the same key.
    pub fn complete(&mut self, key: &TaskKey) {
        self.active.remove(key);
        if let Some(parked) = self.parked.get_mut(key) {
            if let Some(next) = parked.pop_front() {
                self.heap.push(next);
            }
            if parked.is_empty() {
                self.parked.remove(key);
            }
        }
    }

    pub fn is_active(&self, key: &TaskKey) -> bool {
        self.active.contains(key)
    }

    /// Whether a task for `key` is running or waiting.
    pub fn is_busy(&self, key: &TaskKey) -> bool {
        self.active.contains(key)
            || self.parked.contains_key(key)
            || self.heap.iter().any(|e| &e.key == key)
    }

    pub fn has_ready(&self) -> bool {
        self.heap.iter().any(|e| !self.active.contains(&e.key))
    }

    /// Number of queued tasks, parked ones included.
    pub fn len(&self) -> usize {
        self.heap.len() + self.parked.values().map(VecDeque::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Remove every queued task that has not started.
    pub fn clear(&mut self) -> Vec<Entry<T>> {
        let mut drained: Vec<Entry<T>> = self.heap.drain().collect();
        for (_, parked) in self.parked.drain() {
            drained.extend(parked);
        }
        drained.sort_by_key(|e| e.seq);
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_by_priority_then_order() {
        let mut queue = TaskQueue::new();
        queue.push(TaskKey::Job(1), 5, "a");
        queue.push(TaskKey::Job(2), 1, "b");
        queue.push(TaskKey::Job(3), 5, "c");

        let order: Vec<&str> = std::iter::from_fn(|| queue.pop_ready().map(|e| e.payload)).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn same_key_waits_for_completion() {
        let mut queue = TaskQueue::new();
        queue.push(TaskKey::Job(7), 5, "first");
        queue.push(TaskKey::Job(7), 5, "second");
        queue.push(TaskKey::Job(8), 5, "other");

        let first = queue.pop_ready().unwrap();
        assert_eq!(first.payload, "first");
        let next = queue.pop_ready().unwrap();
        assert_eq!(next.payload, "other");
        assert!(queue.pop_ready().is_none());
        assert_eq!(queue.len(), 1);
        assert!(!queue.has_ready());
        assert!(queue.is_busy(&TaskKey::Job(7)));
        assert!(!queue.is_busy(&TaskKey::Job(9)));

        queue.complete(&TaskKey::Job(7));
        assert!(queue.has_ready());
        assert_eq!(queue.pop_ready().unwrap().payload, "second");
    }

    #[test]
    fn parked_tasks_keep_submission_order() {
        let mut queue = TaskQueue::new();
        queue.push(TaskKey::Job(1), 5, "running");
        let _running = queue.pop_ready().unwrap();
        queue.push(TaskKey::Job(1), 5, "low");
        queue.push(TaskKey::Job(1), 0, "urgent");
        assert!(queue.pop_ready().is_none());

        queue.complete(&TaskKey::Job(1));
        assert_eq!(queue.pop_ready().unwrap().payload, "low");
        queue.complete(&TaskKey::Job(1));
        assert_eq!(queue.pop_ready().unwrap().payload, "urgent");
    }

    #[test]
    fn clear_returns_unstarted_tasks() {
        let mut queue = TaskQueue::new();
        queue.push(TaskKey::Backend("local".into()), 5, 1);
        let _running = queue.pop_ready().unwrap();
        queue.push(TaskKey::Backend("local".into()), 5, 2);
        queue.push(TaskKey::Job(4), 5, 3);
        queue.pop_ready();

        let cleared: Vec<i32> = queue.clear().into_iter().map(|e| e.payload).collect();
        assert_eq!(cleared, vec![2]);
        assert!(queue.is_empty());
        assert_eq!(queue.active_count(), 2);
    }
}
