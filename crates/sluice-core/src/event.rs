use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{trace, warn};

use crate::types::{EngineEvent, SessionId};

/// Fan-out of engine progress events.
///
/// Publishing never blocks the engine. Slow subscribers lose the oldest
/// events once `capacity` is exceeded.
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns how many subscribers received the event.
    pub fn publish(&self, event: EngineEvent) -> usize {
        let session_id = event.session_id().clone();
        let delivered = self.tx.send(event).unwrap_or(0);
        trace!(session_id = %session_id, delivered, "Engine event published");
        delivered
    }

    /// Every event from every session.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Events for one session, ending with its `SessionFinished`.
    pub fn subscribe_session(&self, session_id: SessionId) -> SessionEvents {
        SessionEvents {
            rx: self.tx.subscribe(),
            session_id,
            finished: false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Subscription filtered to a single session.
pub struct SessionEvents {
    rx: broadcast::Receiver<EngineEvent>,
    session_id: SessionId,
    finished: bool,
}

impl SessionEvents {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Next event for this session.
    ///
    /// `None` once the session's `SessionFinished` has been returned or the
    /// bus is gone. Lag is logged and skipped.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        if self.finished {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(event) if event.session_id() == &self.session_id => {
                    self.finished = matches!(event, EngineEvent::SessionFinished { .. });
                    return Some(event);
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(session_id = %self.session_id, skipped, "Event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionStatus;

    fn started(id: &SessionId) -> EngineEvent {
        EngineEvent::NodeStarted {
            session_id: id.clone(),
            node_id: "n".into(),
            node_type: "start".into(),
        }
    }

    fn finished(id: &SessionId) -> EngineEvent {
        EngineEvent::SessionFinished {
            session_id: id.clone(),
            status: SessionStatus::Completed,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_subscribers_see_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let sid = SessionId::from_str("s1");
        assert_eq!(
            bus.publish(EngineEvent::SessionStarted {
                session_id: sid.clone(),
                workflow_id: "wf".into(),
            }),
            1
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id(), &sid);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(started(&SessionId::from_str("s1"))), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_session_subscription_filters_and_ends() {
        let bus = EventBus::new(8);
        let mine = SessionId::from_str("mine");
        let other = SessionId::from_str("other");
        let mut events = bus.subscribe_session(mine.clone());

        bus.publish(started(&other));
        bus.publish(started(&mine));
        bus.publish(finished(&other));
        bus.publish(finished(&mine));
        bus.publish(started(&mine));

        assert!(matches!(events.recv().await, Some(EngineEvent::NodeStarted { .. })));
        assert!(matches!(events.recv().await, Some(EngineEvent::SessionFinished { .. })));
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_session_subscription_survives_lag() {
        let bus = EventBus::new(1);
        let sid = SessionId::from_str("s1");
        let mut events = bus.subscribe_session(sid.clone());

        bus.publish(started(&sid));
        bus.publish(finished(&sid));
        assert!(matches!(events.recv().await, Some(EngineEvent::SessionFinished { .. })));
    }

    #[tokio::test]
    async fn test_closed_bus_ends_subscription() {
        let bus = EventBus::new(4);
        let mut events = bus.subscribe_session(SessionId::from_str("s1"));
        drop(bus);
        assert!(events.recv().await.is_none());
    }
}
