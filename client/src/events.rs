use futures::Stream as FutStream;
use rochambeau_types::ChannelEvent;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{trace, warn};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

fn capacity_or_default(capacity: usize) -> usize {
    if capacity == 0 {
        DEFAULT_CHANNEL_CAPACITY
    } else {
        capacity
    }
}

/// Create a connected sender/stream pair for one channel session.
pub fn channel(capacity: usize) -> (EventSender, EventStream) {
    let (tx, rx) = mpsc::channel(capacity_or_default(capacity));
    let dropped = Arc::new(AtomicUsize::new(0));
    (
        EventSender {
            sender: tx,
            dropped: dropped.clone(),
        },
        EventStream {
            receiver: rx,
            dropped,
        },
    )
}

/// Producer half, held by the channel transport.
#[derive(Clone, Debug)]
pub struct EventSender {
    sender: mpsc::Sender<ChannelEvent>,
    dropped: Arc<AtomicUsize>,
}

impl EventSender {
    /// Queue an event without waiting. Returns false if it was dropped.
    ///
    /// Transports call this from inside request handlers, so it must never
    /// block on a consumer that is itself awaiting that request.
    pub fn emit(&self, event: ChannelEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                self.discard(event);
                false
            }
            Err(TrySendError::Closed(_)) => {
                trace!("event stream dropped");
                false
            }
        }
    }

    /// Give up on `event`, counting it so the consumer can resynchronise.
    pub fn discard(&self, event: ChannelEvent) {
        warn!(?event, "event buffer full, dropping channel event");
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Ordered stream of events delivered by a channel session.
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::Receiver<ChannelEvent>,
    dropped: Arc<AtomicUsize>,
}

impl EventStream {
    /// Receive the next event from the stream.
    pub async fn next(&mut self) -> Option<ChannelEvent> {
        self.receiver.recv().await
    }

    /// Receive an event if one is already queued.
    pub fn try_next(&mut self) -> Option<ChannelEvent> {
        self.receiver.try_recv().ok()
    }

    /// Number of events dropped since the last call.
    pub fn take_dropped(&self) -> usize {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}

impl FutStream for EventStream {
    type Item = ChannelEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
