use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::scheduler::task::{Task, TaskId, TaskStatus};

/// Position of a task in the pending heap. Higher priority first, then
/// submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub priority: i64,
    pub seq: u64,
    pub task_id: TaskId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Task table plus the priority queue of pending work.
///
/// Heap entries are never removed eagerly: a task that left PENDING (for
/// example through cancellation) is skipped when it reaches the top.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: HashMap<TaskId, Task>,
    pending: BinaryHeap<QueueEntry>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task as PENDING and enqueue it.
    pub fn add_task(&mut self, mut task: Task) -> TaskId {
        let task_id = task.task_id;
        task.status = TaskStatus::Pending;
        let entry = QueueEntry {
            priority: task.priority,
            seq: self.next_seq,
            task_id,
        };
        self.next_seq += 1;
        self.tasks.insert(task_id, task);
        self.pending.push(entry);
        task_id
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    /// Take the best pending task off the heap.
    pub fn pop_pending(&mut self) -> Option<QueueEntry> {
        while let Some(entry) = self.pending.pop() {
            let still_pending = self
                .tasks
                .get(&entry.task_id)
                .is_some_and(|t| t.status == TaskStatus::Pending);
            if still_pending {
                return Some(entry);
            }
        }
        None
    }

    /// Put an entry back after a failed assignment. It keeps its original
    /// sequence number, so it does not lose its place among equal priorities.
    pub fn requeue(&mut self, entry: QueueEntry) {
        self.pending.push(entry);
    }

    /// Get all tasks sorted chronologically by creation time
    pub fn all_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn pending_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    pub fn all_finished(&self) -> bool {
        self.tasks.values().all(Task::is_finished)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
