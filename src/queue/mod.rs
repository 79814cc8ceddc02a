//! Task Queue (C4): a bounded priority queue, FIFO within each priority
//! class. Capacity is global. The starvation guard bumps a task's
//! *effective* priority at dequeue time only — the stored priority never
//! changes.

use crate::config::QueueConfig;
use crate::error::{ArbiterError, Result};
use crate::events::{Event, EventBus, Payload, Severity, Topic};
use crate::models::{Priority, Task};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

struct Enqueued {
    task: Task,
    enqueued_at: Instant,
}

struct Lanes {
    critical: VecDeque<Enqueued>,
    high: VecDeque<Enqueued>,
    normal: VecDeque<Enqueued>,
    low: VecDeque<Enqueued>,
}

impl Lanes {
    fn new() -> Self {
        Self {
            critical: VecDeque::new(),
            high: VecDeque::new(),
            normal: VecDeque::new(),
            low: VecDeque::new(),
        }
    }

    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<Enqueued> {
        match priority {
            Priority::Critical => &mut self.critical,
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn len(&self) -> usize {
        self.critical.len() + self.high.len() + self.normal.len() + self.low.len()
    }
}

#[derive(Debug, Clone)]
pub struct DequeuedTask {
    pub task: Task,
    pub wait_time: std::time::Duration,
    pub effective_priority: Priority,
}

pub struct TaskQueue {
    config: QueueConfig,
    lanes: Mutex<Lanes>,
    events: Arc<EventBus>,
}

impl TaskQueue {
    pub fn new(config: QueueConfig, events: Arc<EventBus>) -> Self {
        Self {
            config,
            lanes: Mutex::new(Lanes::new()),
            events,
        }
    }

    fn admit(&self, task: &Task) -> Result<()> {
        if task.description.len() > self.config.max_description_bytes {
            return Err(ArbiterError::Validation("description exceeds max_description_bytes".into()));
        }
        if task.metadata_size_bytes() > self.config.max_metadata_bytes {
            return Err(ArbiterError::Validation("metadata exceeds max_metadata_bytes".into()));
        }
        if !self.config.allowed_task_types.iter().any(|t| t == &task.task_type) {
            return Err(ArbiterError::Validation(format!("task_type {} not allowed", task.task_type)));
        }
        if task.max_attempts < 1 {
            return Err(ArbiterError::Validation("max_attempts must be >= 1".into()));
        }
        Ok(())
    }

    pub async fn enqueue(&self, task: Task) -> Result<()> {
        self.admit(&task)?;
        let mut lanes = self.lanes.lock().await;
        if lanes.len() >= self.config.max_queue_size {
            self.events.publish(Event::new(
                Topic::Task,
                task.id.clone(),
                Severity::Warn,
                Payload::TaskQueueFull {
                    capacity: self.config.max_queue_size,
                },
            ));
            return Err(ArbiterError::QueueFull {
                capacity: self.config.max_queue_size,
            });
        }
        let priority = task.priority;
        lanes.lane_mut(priority).push_back(Enqueued {
            task,
            enqueued_at: Instant::now(),
        });
        Ok(())
    }

    /// Dequeues the head of the highest-priority non-empty lane. A task
    /// Pending longer than `starvation_threshold` is dequeued from its
    /// stored lane but reported with a bumped `effective_priority`; the
    /// stored task itself is never rewritten.
    pub async fn dequeue(&self) -> Option<DequeuedTask> {
        let mut lanes = self.lanes.lock().await;
        for priority in [Priority::Critical, Priority::High, Priority::Normal, Priority::Low] {
            if let Some(entry) = lanes.lane_mut(priority).pop_front() {
                let wait_time = entry.enqueued_at.elapsed();
                let effective_priority = if wait_time >= self.config.starvation_threshold {
                    entry.task.priority.bump()
                } else {
                    entry.task.priority
                };
                return Some(DequeuedTask {
                    task: entry.task,
                    wait_time,
                    effective_priority,
                });
            }
        }
        None
    }

    pub async fn size(&self) -> usize {
        self.lanes.lock().await.len()
    }

    pub async fn peek(&self) -> Option<Task> {
        let lanes = self.lanes.lock().await;
        for lane in [&lanes.critical, &lanes.high, &lanes.normal, &lanes.low] {
            if let Some(entry) = lane.front() {
                return Some(entry.task.clone());
            }
        }
        None
    }

    /// Removes every task matching `predicate`, across all lanes, and
    /// emits one `task.queue_cleared` event with the total removed.
    pub async fn clear(&self, predicate: impl Fn(&Task) -> bool) -> usize {
        let mut lanes = self.lanes.lock().await;
        let mut removed = 0;
        let Lanes { critical, high, normal, low } = &mut *lanes;
        for lane in [critical, high, normal, low] {
            let before = lane.len();
            lane.retain(|entry| !predicate(&entry.task));
            removed += before - lane.len();
        }
        if removed > 0 {
            self.events.publish(Event::new(
                Topic::Task,
                "queue-clear",
                Severity::Info,
                Payload::TaskQueueCleared { count: removed },
            ));
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(priority: Priority) -> Task {
        Task::new("do the thing", "file_editing", priority)
    }

    fn test_queue(max: usize) -> TaskQueue {
        TaskQueue::new(
            QueueConfig {
                max_queue_size: max,
                ..QueueConfig::default()
            },
            Arc::new(EventBus::new(16)),
        )
    }

    #[tokio::test]
    async fn fifo_within_priority_class() {
        let queue = test_queue(10);
        let mut t1 = task(Priority::Normal);
        t1.id = "t1".into();
        let mut t2 = task(Priority::Normal);
        t2.id = "t2".into();
        queue.enqueue(t1).await.unwrap();
        queue.enqueue(t2).await.unwrap();
        assert_eq!(queue.dequeue().await.unwrap().task.id, "t1");
        assert_eq!(queue.dequeue().await.unwrap().task.id, "t2");
    }

    #[tokio::test]
    async fn higher_priority_dequeues_first() {
        let queue = test_queue(10);
        queue.enqueue(task(Priority::Low)).await.unwrap();
        let mut critical = task(Priority::Critical);
        critical.id = "urgent".into();
        queue.enqueue(critical).await.unwrap();
        assert_eq!(queue.dequeue().await.unwrap().task.id, "urgent");
    }

    #[tokio::test]
    async fn rejects_beyond_capacity() {
        let queue = test_queue(1);
        queue.enqueue(task(Priority::Low)).await.unwrap();
        let err = queue.enqueue(task(Priority::Low)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn rejects_disallowed_task_type() {
        let queue = test_queue(10);
        let task = Task::new("x", "not_allowed", Priority::Low);
        let err = queue.enqueue(task).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn clear_removes_matching_and_emits_count() {
        let queue = test_queue(10);
        let mut t1 = task(Priority::Low);
        t1.tenant = Some("a".into());
        let mut t2 = task(Priority::Low);
        t2.tenant = Some("b".into());
        queue.enqueue(t1).await.unwrap();
        queue.enqueue(t2).await.unwrap();
        let removed = queue.clear(|t| t.tenant.as_deref() == Some("a")).await;
        assert_eq!(removed, 1);
        assert_eq!(queue.size().await, 1);
    }
}
