//! Subscription channels between the network and its consumers.
//!
//! A subscription is a message stream plus a shared close flag. Closing is
//! idempotent, and once closed every later message is silently dropped on
//! both ends, so in-flight deliveries never reach a stopped consumer.

use nostr::Event;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Messages delivered by a read subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionMessage {
    /// An event matching the subscription filters, with `seen_on` set.
    Event(Event),
    /// A relay finished sending stored events.
    Eose(String),
    /// The subscription finished: every relay reached EOSE or the timeout
    /// elapsed.
    Complete,
}

/// Messages delivered by a publish subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishMessage {
    /// A relay acknowledged the event. A relay may send a later correction.
    Ok {
        relay: String,
        event_id: String,
        ok: bool,
        message: String,
    },
    /// The relay could not be reached or dropped the connection.
    Error { relay: String, message: String },
}

/// Cloneable close handle for a subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: String,
    closed: Arc<watch::Sender<bool>>,
}

impl SubscriptionHandle {
    fn new(id: String) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            closed: Arc::new(closed),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Close the subscription. Returns `true` only for the first call.
    pub fn close(&self) -> bool {
        !self.closed.send_replace(true)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the subscription is closed.
    pub async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

/// Consumer side of a subscription.
#[derive(Debug)]
pub struct Subscription<M> {
    handle: SubscriptionHandle,
    receiver: mpsc::UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    /// Next message, or `None` once closed or once the producer is gone.
    pub async fn recv(&mut self) -> Option<M> {
        if self.handle.is_closed() {
            return None;
        }

        tokio::select! {
            biased;
            () = self.handle.closed() => None,
            message = self.receiver.recv() => message,
        }
    }

    pub fn close(&self) -> bool {
        self.handle.close()
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

impl<M> Drop for Subscription<M> {
    fn drop(&mut self) {
        self.handle.close();
    }
}

/// Producer side of a subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionSender<M> {
    handle: SubscriptionHandle,
    sender: mpsc::UnboundedSender<M>,
}

impl<M> SubscriptionSender<M> {
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    /// Deliver a message. Returns `false` when the subscription is closed and
    /// the message was dropped.
    pub fn send(&self, message: M) -> bool {
        if self.handle.is_closed() {
            return false;
        }
        self.sender.send(message).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    pub async fn closed(&self) {
        self.handle.closed().await;
    }
}

/// Create a connected sender/subscription pair with a fresh id.
pub fn channel<M>() -> (SubscriptionSender<M>, Subscription<M>) {
    let handle = SubscriptionHandle::new(Uuid::new_v4().to_string());
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        SubscriptionSender {
            handle: handle.clone(),
            sender,
        },
        Subscription { handle, receiver },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_until_closed() {
        let (sender, mut subscription) = channel::<u32>();
        assert!(sender.send(1));
        assert_eq!(subscription.recv().await, Some(1));

        assert!(subscription.close());
        assert!(!subscription.close());
        assert!(!sender.send(2));
        assert_eq!(subscription.recv().await, None);
        assert!(sender.is_closed());
    }

    #[tokio::test]
    async fn close_wakes_pending_receiver() {
        let (sender, mut subscription) = channel::<u32>();
        let handle = subscription.handle();

        let waiter = tokio::spawn(async move { subscription.recv().await });
        tokio::task::yield_now().await;
        handle.close();

        assert_eq!(waiter.await.ok().flatten(), None);
        sender.closed().await;
    }

    #[tokio::test]
    async fn dropping_subscription_closes_it() {
        let (sender, subscription) = channel::<u32>();
        drop(subscription);
        assert!(!sender.send(1));
    }
}
