//! The bounded agent pool: a fixed set of execution slots plus a priority
//! queue of tasks waiting for one.
//!
//! The pool is a plain in-process structure owned by the scheduler; it
//! never blocks. Observers subscribe to a broadcast channel of
//! [`PoolEvent`]s instead of registering callbacks, so a slow or panicking
//! observer can never re-enter or poison the pool.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use specforge_db::models::{AgentRole, Task};

/// What happened to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEventKind {
    Assigned,
    Released,
}

/// One slot transition, published to subscribers.
#[derive(Debug, Clone)]
pub struct PoolEvent {
    pub slot_id: i64,
    pub task_id: String,
    pub kind: PoolEventKind,
}

/// State of one slot.
#[derive(Debug, Clone)]
enum SlotState {
    Idle,
    Running {
        task_id: String,
        role: AgentRole,
        worktree: String,
        started_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
struct Slot {
    id: i64,
    state: SlotState,
}

/// Snapshot of one slot for status reporting.
#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    pub slot_id: i64,
    pub task_id: Option<String>,
    pub role: Option<AgentRole>,
    pub worktree: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Snapshot of the whole pool.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub capacity: usize,
    pub active: usize,
    pub available: usize,
    pub queued: usize,
    pub slots: Vec<SlotSnapshot>,
}

/// Fixed-capacity pool of agent slots with a FIFO-within-priority queue.
#[derive(Debug)]
pub struct AgentPool {
    slots: Vec<Slot>,
    queue: Vec<Task>,
    events: broadcast::Sender<PoolEvent>,
}

impl AgentPool {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(4) * 4);
        Self {
            slots: (0..capacity)
                .map(|i| Slot {
                    id: (i + 1) as i64,
                    state: SlotState::Idle,
                })
                .collect(),
            queue: Vec::new(),
            events,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Subscribe to slot transition events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Assign a task to an idle slot, returning the slot id, or `None`
    /// when every slot is busy.
    pub fn assign(&mut self, task: &Task, role: AgentRole, worktree: &str) -> Option<i64> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| matches!(s.state, SlotState::Idle))?;

        slot.state = SlotState::Running {
            task_id: task.id.clone(),
            role,
            worktree: worktree.to_owned(),
            started_at: Utc::now(),
        };
        let slot_id = slot.id;

        // Send failures just mean nobody is listening.
        let _ = self.events.send(PoolEvent {
            slot_id,
            task_id: task.id.clone(),
            kind: PoolEventKind::Assigned,
        });
        Some(slot_id)
    }

    /// Free whichever slot holds the task. Unknown tasks are a no-op.
    pub fn release(&mut self, task_id: &str) {
        let Some(slot) = self.slots.iter_mut().find(|s| {
            matches!(&s.state, SlotState::Running { task_id: held, .. } if held == task_id)
        }) else {
            return;
        };

        let slot_id = slot.id;
        slot.state = SlotState::Idle;
        let _ = self.events.send(PoolEvent {
            slot_id,
            task_id: task_id.to_owned(),
            kind: PoolEventKind::Released,
        });
    }

    /// Append a task to the waiting queue.
    pub fn queue(&mut self, task: Task) {
        self.queue.push(task);
    }

    /// Remove and return the highest-priority queued task; equal
    /// priorities dequeue in insertion order.
    pub fn dequeue(&mut self) -> Option<Task> {
        if self.queue.is_empty() {
            return None;
        }
        let mut best = 0;
        for (idx, task) in self.queue.iter().enumerate() {
            if task.priority > self.queue[best].priority {
                best = idx;
            }
        }
        Some(self.queue.remove(best))
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !matches!(s.state, SlotState::Idle))
            .count()
    }

    pub fn has_idle_slot(&self) -> bool {
        self.slots
            .iter()
            .any(|s| matches!(s.state, SlotState::Idle))
    }

    pub fn status(&self) -> PoolStatus {
        let active = self.active_count();
        PoolStatus {
            capacity: self.slots.len(),
            active,
            available: self.slots.len() - active,
            queued: self.queue.len(),
            slots: self
                .slots
                .iter()
                .map(|slot| match &slot.state {
                    SlotState::Idle => SlotSnapshot {
                        slot_id: slot.id,
                        task_id: None,
                        role: None,
                        worktree: None,
                        started_at: None,
                    },
                    SlotState::Running {
                        task_id,
                        role,
                        worktree,
                        started_at,
                    } => SlotSnapshot {
                        slot_id: slot.id,
                        task_id: Some(task_id.clone()),
                        role: Some(*role),
                        worktree: Some(worktree.clone()),
                        started_at: Some(*started_at),
                    },
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, priority: i64) -> Task {
        let mut task = Task::new(id, "spec-1", format!("Task {id}"));
        task.priority = priority;
        task
    }

    #[test]
    fn assign_until_capacity_then_none() {
        let mut pool = AgentPool::new(2);
        assert!(pool.assign(&task("a", 1), AgentRole::Coder, "/wt/a").is_some());
        assert!(pool.assign(&task("b", 1), AgentRole::Coder, "/wt/b").is_some());
        assert!(pool.assign(&task("c", 1), AgentRole::Coder, "/wt/c").is_none());
        assert_eq!(pool.active_count(), 2);
    }

    #[test]
    fn zero_capacity_pool_never_assigns_but_queues() {
        let mut pool = AgentPool::new(0);
        assert!(pool.assign(&task("a", 1), AgentRole::Coder, "/wt/a").is_none());

        pool.queue(task("a", 1));
        pool.queue(task("b", 2));
        assert_eq!(pool.queued_len(), 2);
        assert_eq!(pool.dequeue().unwrap().id, "b");
        assert_eq!(pool.dequeue().unwrap().id, "a");
        assert!(pool.dequeue().is_none());
    }

    #[test]
    fn release_frees_the_slot() {
        let mut pool = AgentPool::new(1);
        pool.assign(&task("a", 1), AgentRole::Coder, "/wt/a");
        assert!(!pool.has_idle_slot());

        pool.release("a");
        assert!(pool.has_idle_slot());
        assert!(pool.assign(&task("b", 1), AgentRole::Tester, "/wt/b").is_some());
    }

    #[test]
    fn release_unknown_task_is_noop() {
        let mut pool = AgentPool::new(1);
        pool.release("never-assigned");
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn dequeue_prefers_priority_then_insertion_order() {
        let mut pool = AgentPool::new(1);
        pool.queue(task("first-low", 1));
        pool.queue(task("tie-a", 5));
        pool.queue(task("tie-b", 5));
        pool.queue(task("high", 9));

        assert_eq!(pool.dequeue().unwrap().id, "high");
        assert_eq!(pool.dequeue().unwrap().id, "tie-a");
        assert_eq!(pool.dequeue().unwrap().id, "tie-b");
        assert_eq!(pool.dequeue().unwrap().id, "first-low");
    }

    #[test]
    fn status_snapshot_reflects_slots() {
        let mut pool = AgentPool::new(2);
        pool.assign(&task("a", 1), AgentRole::Reviewer, "/wt/a");

        let status = pool.status();
        assert_eq!(status.capacity, 2);
        assert_eq!(status.active, 1);
        assert_eq!(status.available, 1);
        let busy: Vec<_> = status
            .slots
            .iter()
            .filter(|s| s.task_id.is_some())
            .collect();
        assert_eq!(busy.len(), 1);
        assert_eq!(busy[0].role, Some(AgentRole::Reviewer));
    }

    #[tokio::test]
    async fn events_are_broadcast_to_subscribers() {
        let mut pool = AgentPool::new(1);
        let mut rx = pool.subscribe();

        pool.assign(&task("a", 1), AgentRole::Coder, "/wt/a");
        pool.release("a");

        let first = rx.recv().await.expect("assigned event");
        assert_eq!(first.kind, PoolEventKind::Assigned);
        assert_eq!(first.task_id, "a");
        let second = rx.recv().await.expect("released event");
        assert_eq!(second.kind, PoolEventKind::Released);
    }

    #[test]
    fn events_without_subscribers_are_dropped_silently() {
        let mut pool = AgentPool::new(1);
        pool.assign(&task("a", 1), AgentRole::Coder, "/wt/a");
        pool.release("a");
    }
}
