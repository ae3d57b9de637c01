//! Observer notifications for renderers.
//!
//! The coordinator publishes a [Notification::Updated] view after every public
//! operation and channel event instead of having a UI poll its fields.

use crate::coordinator::Phase;
use rochambeau_types::{AutoplayConfig, Balances, Round};
use tokio::sync::broadcast;
use tracing::trace;

/// What a renderer needs to draw the game.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateView {
    pub phase: Phase,
    pub round: Round,
    pub balances: Balances,
    pub autoplay: AutoplayConfig,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    Updated(StateView),
    /// A round resolved; carries the round as it was completed.
    RoundFinished(Round),
    /// A failure the user should see.
    Error(String),
}

pub(crate) struct Notifier {
    sender: broadcast::Sender<Notification>,
}

impl Notifier {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    pub(crate) fn send(&self, notification: Notification) {
        if self.sender.send(notification).is_err() {
            trace!("no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_without_subscribers() {
        let notifier = Notifier::new(4);
        notifier.send(Notification::Error("nobody listens".into()));

        let mut receiver = notifier.subscribe();
        notifier.send(Notification::Error("boom".into()));
        assert_eq!(
            receiver.try_recv().unwrap(),
            Notification::Error("boom".into())
        );
        assert!(receiver.try_recv().is_err());
    }
}
