use crate::types::StreamMessage;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<StreamMessage>,
}

impl EventBus {
    /// A zero capacity is raised to one; broadcast channels need room for
    /// at least one message.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: StreamMessage) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StreamMessage> {
        self.tx.subscribe()
    }

    /// Whether anyone is listening; used to skip work that only feeds previews.
    pub fn has_subscribers(&self) -> bool {
        self.tx.receiver_count() > 0
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StreamMessageKind, TaskId};

    fn text(t: &str) -> StreamMessage {
        StreamMessage {
            task_id: TaskId::from_str("t"),
            agent_name: "Chat".into(),
            agent_id: None,
            kind: StreamMessageKind::Text {
                text: t.into(),
                stream_done: true,
            },
        }
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        assert!(!bus.has_subscribers());
        let mut rx = bus.subscribe();
        assert!(bus.has_subscribers());

        bus.publish(text("hello"));
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.kind.tag(), "text");
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new(4);
        bus.publish(text("dropped"));
    }

    #[tokio::test]
    async fn zero_capacity_still_delivers() {
        let bus = EventBus::new(0);
        let mut rx = bus.subscribe();
        bus.publish(text("one"));
        assert_eq!(rx.recv().await.unwrap().kind.tag(), "text");
    }
}
