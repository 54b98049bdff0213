use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bosun_model::EntityId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{BosunError, Result};

/// Channels state changes are announced on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Topic {
    JobUpserted,
    JobMetricsUpdated,
    ProcessUpserted,
    ProcessGroupUpserted,
    ProcessMetricsUpdated,
    LogEntryAdded,
    LogMetricsUpdated,
    ProjectUpserted,
    WorkspaceUpserted,
}

/// A published message. Sequence numbers are bus-wide and strictly increasing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage<P> {
    pub sequence: u64,
    pub topic: Topic,
    pub payload: P,
}

struct Subscriber<P> {
    id: u64,
    sender: mpsc::Sender<Arc<BusMessage<P>>>,
}

struct BusState<P> {
    last_sequence: u64,
    history: VecDeque<Arc<BusMessage<P>>>,
    subscribers: HashMap<Topic, Vec<Subscriber<P>>>,
}

/// In-process publish/subscribe bus with a bounded replay history.
///
/// Publishing never blocks on subscribers: each subscriber owns a bounded
/// delivery buffer and messages that do not fit are dropped for that
/// subscriber only. Reconnecting consumers pass the last sequence they saw to
/// [`EventBus::subscribe`] and get everything newer that is still retained.
pub struct EventBus<P = EntityId> {
    state: Arc<Mutex<BusState<P>>>,
    history_cap: usize,
    subscriber_buffer: usize,
    next_subscriber_id: AtomicU64,
}

impl<P> fmt::Debug for EventBus<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EventBus")
            .field("history_cap", &self.history_cap)
            .field("history_len", &state.history.len())
            .field("last_sequence", &state.last_sequence)
            .field("subscriber_buffer", &self.subscriber_buffer)
            .field(
                "subscribers",
                &state.subscribers.values().map(Vec::len).sum::<usize>(),
            )
            .finish()
    }
}

impl<P> EventBus<P>
where
    P: Send + Sync + 'static,
{
    pub fn new(history_cap: usize, subscriber_buffer: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                last_sequence: 0,
                history: VecDeque::with_capacity(history_cap.min(4096)),
                subscribers: HashMap::new(),
            })),
            history_cap,
            subscriber_buffer: subscriber_buffer.max(1),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Appends a message to the history and forwards it to live subscribers
    /// of `topic`. Returns the assigned sequence number.
    pub fn publish(&self, topic: Topic, payload: P) -> u64 {
        let mut state = self.state.lock();
        state.last_sequence += 1;
        let message = Arc::new(BusMessage {
            sequence: state.last_sequence,
            topic,
            payload,
        });

        state.history.push_back(Arc::clone(&message));
        while state.history.len() > self.history_cap {
            state.history.pop_front();
        }

        if let Some(subscribers) = state.subscribers.get_mut(&topic) {
            subscribers.retain(|subscriber| {
                match subscriber.sender.try_send(Arc::clone(&message)) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        debug!(
                            target: "bosun::bus",
                            subscriber = subscriber.id,
                            ?topic,
                            sequence = message.sequence,
                            "subscriber buffer full; dropping message"
                        );
                        true
                    }
                    Err(TrySendError::Closed(_)) => false,
                }
            });
        }

        trace!(target: "bosun::bus", ?topic, sequence = message.sequence, "published");
        message.sequence
    }

    /// Replays retained `topic` messages newer than `last_seen`, then delivers
    /// live messages to `handler` until `cancel` fires.
    ///
    /// If `last_seen` predates the oldest retained message, replay starts at
    /// the oldest retained one; compare sequences to detect the gap. Must be
    /// called from within a Tokio runtime.
    pub fn subscribe<F>(
        &self,
        cancel: CancellationToken,
        topic: Topic,
        last_seen: u64,
        mut handler: F,
    ) -> Subscription
    where
        F: FnMut(Arc<BusMessage<P>>) + Send + 'static,
    {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (sender, mut receiver) = mpsc::channel(self.subscriber_buffer);

        // Snapshot and registration happen under one lock so nothing published
        // in between is missed or delivered twice.
        let replay: Vec<_> = {
            let mut state = self.state.lock();
            let replay = state
                .history
                .iter()
                .filter(|message| message.topic == topic && message.sequence > last_seen)
                .cloned()
                .collect();
            state
                .subscribers
                .entry(topic)
                .or_default()
                .push(Subscriber { id, sender });
            replay
        };

        debug!(
            target: "bosun::bus",
            subscriber = id,
            ?topic,
            last_seen,
            replay = replay.len(),
            "subscribed"
        );

        let state = Arc::clone(&self.state);
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            for message in replay {
                if task_cancel.is_cancelled() {
                    break;
                }
                handler(message);
            }

            loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => break,
                    message = receiver.recv() => match message {
                        Some(message) => handler(message),
                        None => break,
                    },
                }
            }

            let mut state = state.lock();
            if let Some(subscribers) = state.subscribers.get_mut(&topic) {
                subscribers.retain(|subscriber| subscriber.id != id);
                if subscribers.is_empty() {
                    state.subscribers.remove(&topic);
                }
            }
            debug!(target: "bosun::bus", subscriber = id, ?topic, "unsubscribed");
        });

        Subscription { id, cancel, handle }
    }

    /// Sequence of the most recent publish, `0` before the first one.
    pub fn last_sequence(&self) -> u64 {
        self.state.lock().last_sequence
    }

    /// Sequence of the oldest message still available for replay.
    pub fn oldest_retained(&self) -> Option<u64> {
        self.state.lock().history.front().map(|message| message.sequence)
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.state
            .lock()
            .subscribers
            .get(&topic)
            .map(Vec::len)
            .unwrap_or_default()
    }

    pub fn history_cap(&self) -> usize {
        self.history_cap
    }
}

/// Handle to a running subscription.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancels the subscription and waits for it to deregister.
    pub async fn unsubscribe(self) {
        self.cancel.cancel();
        self.join().await;
    }

    /// Waits for the subscription to end on its own.
    pub async fn join(self) {
        if let Err(err) = self.handle.await {
            debug!(target: "bosun::bus", subscriber = self.id, error = %err, "subscription task ended abnormally");
        }
    }
}

/// Encodes a sequence number as the opaque message ID handed to API clients.
pub fn encode_message_id(sequence: u64) -> String {
    URL_SAFE_NO_PAD.encode(sequence.to_string())
}

pub fn decode_message_id(message_id: &str) -> Result<u64> {
    let bytes = URL_SAFE_NO_PAD
        .decode(message_id)
        .map_err(|err| BosunError::InvalidArgument(format!("message id {message_id}: {err}")))?;
    std::str::from_utf8(&bytes)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| BosunError::InvalidArgument(format!("message id {message_id} is malformed")))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;

    fn collect(
        bus: &EventBus<u32>,
        cancel: &CancellationToken,
        topic: Topic,
        last_seen: u64,
    ) -> (Subscription, UnboundedReceiver<u64>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = bus.subscribe(cancel.clone(), topic, last_seen, move |message| {
            let _ = tx.send(message.sequence);
        });
        (subscription, rx)
    }

    async fn next(rx: &mut UnboundedReceiver<u64>) -> u64 {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn replays_missed_messages_before_live_ones() {
        let bus = EventBus::<u32>::new(100, 16);
        for n in 1..=10 {
            bus.publish(Topic::JobUpserted, n);
        }

        let cancel = CancellationToken::new();
        let (_subscription, mut rx) = collect(&bus, &cancel, Topic::JobUpserted, 7);
        bus.publish(Topic::JobUpserted, 11);

        assert_eq!(next(&mut rx).await, 8);
        assert_eq!(next(&mut rx).await, 9);
        assert_eq!(next(&mut rx).await, 10);
        assert_eq!(next(&mut rx).await, 11);
        cancel.cancel();
    }

    #[tokio::test]
    async fn replay_starts_from_oldest_retained_after_eviction() {
        let bus = EventBus::<u32>::new(3, 16);
        for n in 1..=10 {
            bus.publish(Topic::LogEntryAdded, n);
        }
        assert_eq!(bus.oldest_retained(), Some(8));

        let cancel = CancellationToken::new();
        let (_subscription, mut rx) = collect(&bus, &cancel, Topic::LogEntryAdded, 2);

        assert_eq!(next(&mut rx).await, 8);
        assert_eq!(next(&mut rx).await, 9);
        assert_eq!(next(&mut rx).await, 10);
        cancel.cancel();
    }

    #[tokio::test]
    async fn only_delivers_subscribed_topic() {
        let bus = EventBus::<u32>::new(10, 16);
        let cancel = CancellationToken::new();
        let (_subscription, mut rx) = collect(&bus, &cancel, Topic::ProcessUpserted, 0);

        bus.publish(Topic::JobUpserted, 1);
        let wanted = bus.publish(Topic::ProcessUpserted, 2);

        assert_eq!(next(&mut rx).await, wanted);
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancel_deregisters_subscriber() {
        let bus = EventBus::<u32>::new(10, 16);
        let cancel = CancellationToken::new();
        let (subscription, _rx) = collect(&bus, &cancel, Topic::JobUpserted, 0);
        assert_eq!(bus.subscriber_count(Topic::JobUpserted), 1);

        subscription.unsubscribe().await;
        assert_eq!(bus.subscriber_count(Topic::JobUpserted), 0);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_subscriber_does_not_block_publisher() {
        let bus = EventBus::<u32>::new(1000, 2);
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let _subscription = bus.subscribe(cancel.clone(), Topic::JobUpserted, 0, move |message| {
            // Hold the first delivery until the publisher is done.
            if message.sequence == 1 {
                let _ = gate_rx.recv();
            }
            let _ = seen_tx.send(message.sequence);
        });

        bus.publish(Topic::JobUpserted, 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        for n in 1..100 {
            bus.publish(Topic::JobUpserted, n);
        }
        assert_eq!(bus.last_sequence(), 100);
        gate_tx.send(()).expect("release gate");

        let mut delivered = Vec::new();
        while let Ok(Some(sequence)) =
            tokio::time::timeout(Duration::from_millis(200), seen_rx.recv()).await
        {
            delivered.push(sequence);
        }
        cancel.cancel();

        assert_eq!(delivered.first(), Some(&1));
        assert!(delivered.len() < 100, "overflowing messages should be dropped");
        assert!(delivered.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn message_ids_round_trip_and_reject_garbage() {
        let encoded = encode_message_id(42);
        assert_eq!(decode_message_id(&encoded).expect("decode"), 42);
        assert!(matches!(
            decode_message_id("%%%"),
            Err(BosunError::InvalidArgument(_))
        ));
        assert!(matches!(
            decode_message_id(&URL_SAFE_NO_PAD.encode("abc")),
            Err(BosunError::InvalidArgument(_))
        ));
    }
}
