// events/mod.rs
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Typed publish/subscribe stream owned by a single stateful entity.
///
/// Publishing never blocks and never fails: with no subscribers the event is
/// simply dropped, and slow subscribers observe `RecvError::Lagged`.
#[derive(Debug)]
pub struct EventBus<E: Clone> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: E) {
        let _ = self.sender.send(event);
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = E>) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_every_subscriber() {
        let bus = EventBus::<u8>::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish_all([1, 2]);
        assert_eq!(a.recv().await.unwrap(), 1);
        assert_eq!(b.recv().await.unwrap(), 1);
        assert_eq!(a.recv().await.unwrap(), 2);
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        EventBus::<u8>::new().publish(7);
    }
}
