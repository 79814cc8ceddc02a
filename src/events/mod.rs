//! Event Bus (C8): an in-process topic broadcaster. Each topic family is
//! owned by exactly one component's vocabulary (`task.*` by the
//! orchestrator, `agent.*` by the registry, `security.*` by the security
//! gate, `system.*` by the resilient store, `caws.*` by the verdict
//! generator) per the single-writer-per-topic rule. Publishers never
//! block: [`tokio::sync::broadcast`] already implements bounded buffers
//! with a drop-oldest policy for slow subscribers, surfaced here as a
//! `dropped` counter instead of a raw lag error.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Task,
    Agent,
    Security,
    System,
    Caws,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Task => "task",
            Topic::Agent => "agent",
            Topic::Security => "security",
            Topic::System => "system",
            Topic::Caws => "caws",
        }
    }
}

/// Closed registry of event payloads. The variant name plus [`Topic`]
/// forms the dotted type string (e.g. `task.assigned`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    TaskAssigned {
        task_id: String,
        agent_id: String,
        assignment_id: String,
        attempt_number: u32,
    },
    TaskAcknowledged {
        assignment_id: String,
        acknowledgment_time_ms: i64,
    },
    TaskProgress {
        assignment_id: String,
        progress: f64,
    },
    TaskCompleted {
        assignment_id: String,
        task_id: String,
        quality_score: f64,
    },
    TaskFailed {
        assignment_id: String,
        task_id: String,
        reason: String,
        retriable: bool,
    },
    TaskTimeout {
        assignment_id: String,
        timeout_type: String,
    },
    TaskReassigned {
        old_assignment_id: String,
        new_assignment_id: String,
        new_agent_id: String,
        attempt_number: u32,
    },
    TaskQueueFull {
        capacity: usize,
    },
    TaskQueueCleared {
        count: usize,
    },
    AgentRegistered {
        agent_id: String,
    },
    AgentUnregistered {
        agent_id: String,
    },
    AgentUpdateFailed {
        agent_id: String,
        reason: String,
    },
    AgentLoadChanged {
        agent_id: String,
        active_tasks: u32,
        queued_tasks: u32,
    },
    SecurityRateLimitExceeded {
        identity: String,
        operation: String,
        retry_after_ms: u64,
    },
    SecurityAuthzFailed {
        identity: String,
        operation: String,
        reason: String,
    },
    SecurityAudit {
        identity: String,
        operation: String,
        target_id: String,
        payload_fingerprint: String,
    },
    SystemDegraded {
        component: String,
        detail: String,
    },
    SystemResourceAlert {
        resource: String,
        detail: String,
    },
    SystemEventsDropped {
        topic: String,
        count: u64,
    },
    SystemBreakerStateChanged {
        from: String,
        to: String,
    },
    CawsVerdict {
        assignment_id: String,
        decision: String,
        quality_score: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub topic: Topic,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub correlation_id: String,
    pub severity: Severity,
    pub payload: Payload,
}

impl Event {
    pub fn new(topic: Topic, correlation_id: impl Into<String>, severity: Severity, payload: Payload) -> Self {
        Self {
            topic,
            timestamp: chrono::Utc::now(),
            correlation_id: correlation_id.into(),
            severity,
            payload,
        }
    }
}

struct TopicChannel {
    sender: broadcast::Sender<Event>,
    dropped: AtomicU64,
}

/// Bounded, multi-reader, single-writer-per-topic broadcaster.
pub struct EventBus {
    buffer: usize,
    channels: std::sync::RwLock<std::collections::HashMap<Topic, Arc<TopicChannel>>>,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer,
            channels: std::sync::RwLock::new(std::collections::HashMap::new()),
        }
    }

    fn channel_for(&self, topic: Topic) -> Arc<TopicChannel> {
        if let Some(channel) = self.channels.read().unwrap().get(&topic) {
            return channel.clone();
        }
        let mut channels = self.channels.write().unwrap();
        channels
            .entry(topic)
            .or_insert_with(|| {
                let (sender, _) = broadcast::channel(self.buffer);
                Arc::new(TopicChannel {
                    sender,
                    dropped: AtomicU64::new(0),
                })
            })
            .clone()
    }

    /// Publishes without ever suspending the caller: `broadcast::Sender::send`
    /// is synchronous and never blocks on a slow receiver, it drops the
    /// oldest buffered item for that receiver instead.
    pub fn publish(&self, event: Event) {
        let channel = self.channel_for(event.topic);
        // send() only errors when there are zero receivers, which is not
        // a failure for a publish-and-forget bus.
        let _ = channel.sender.send(event);
    }

    /// Subscribes to one topic. The returned [`Subscription`] surfaces
    /// lagged (dropped) events as a counter rather than an error.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let channel = self.channel_for(topic);
        let receiver = channel.sender.subscribe();
        let system_channel = self.channel_for(Topic::System);
        Subscription {
            topic,
            channel,
            receiver,
            system_channel,
        }
    }

    pub fn dropped_count(&self, topic: Topic) -> u64 {
        self.channel_for(topic).dropped.load(Ordering::Relaxed)
    }
}

pub struct Subscription {
    topic: Topic,
    channel: Arc<TopicChannel>,
    receiver: broadcast::Receiver<Event>,
    /// Target for `SystemEventsDropped`, published directly rather than
    /// through [`EventBus::publish`]: a subscription outlives the bus
    /// reference it was built from.
    system_channel: Arc<TopicChannel>,
}

impl Subscription {
    /// Awaits the next event on this topic. Returns `None` only if the
    /// bus itself has been dropped (no publishers remain).
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.channel.dropped.fetch_add(n, Ordering::Relaxed);
                    let _ = self.system_channel.sender.send(Event::new(
                        Topic::System,
                        format!("{}-lag", self.topic.as_str()),
                        Severity::Warn,
                        Payload::SystemEventsDropped {
                            topic: self.topic.as_str().to_string(),
                            count: n,
                        },
                    ));
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_subscribe_delivers_in_order() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe(Topic::Task);
        bus.publish(Event::new(
            Topic::Task,
            "corr-1",
            Severity::Info,
            Payload::TaskQueueFull { capacity: 10 },
        ));
        bus.publish(Event::new(
            Topic::Task,
            "corr-2",
            Severity::Info,
            Payload::TaskQueueCleared { count: 3 },
        ));
        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(first.correlation_id, "corr-1");
        assert_eq!(second.correlation_id, "corr-2");
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_without_blocking_publisher() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe(Topic::System);
        for i in 0..10 {
            bus.publish(Event::new(
                Topic::System,
                format!("corr-{i}"),
                Severity::Info,
                Payload::SystemDegraded {
                    component: "store".into(),
                    detail: "test".into(),
                },
            ));
        }
        // Draining must not panic or block; some events were dropped.
        let mut drained = 0;
        while let Ok(Some(_)) =
            tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv()).await
        {
            drained += 1;
        }
        assert!(drained > 0);
        assert!(bus.dropped_count(Topic::System) > 0);
    }

    #[tokio::test]
    async fn unsubscribed_receiver_is_dropped_immediately() {
        let bus = EventBus::new(4);
        {
            let _sub = bus.subscribe(Topic::Agent);
        }
        // Publishing after the only subscriber is gone must not panic.
        bus.publish(Event::new(
            Topic::Agent,
            "corr",
            Severity::Info,
            Payload::AgentRegistered {
                agent_id: "a1".into(),
            },
        ));
    }
}
