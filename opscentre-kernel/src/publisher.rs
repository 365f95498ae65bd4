/**
 * Real-time publisher
 *
 * Fan-out of per-cycle events to live dashboard subscribers. Every event
 * carries a global sequence number. Each subscriber owns a bounded queue:
 * a slow reader loses its oldest events and is told so with a gap notice,
 * it never holds up the cycle or other subscribers. A replay ring lets a
 * reconnecting client resume from its Last-Event-ID.
 */

use crate::aggregator::AggregateSnapshot;
use crate::alerts::AlertDelta;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleEvent {
    pub sequence: u64,
    pub aggregate: AggregateSnapshot,
    pub alerts: Vec<AlertDelta>,
}

/// Events a subscriber will never receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapNotice {
    pub missed_from: u64,
    pub missed_to: u64,
    pub missed_count: u64,
}

impl GapNotice {
    fn single(sequence: u64) -> Self {
        Self { missed_from: sequence, missed_to: sequence, missed_count: 1 }
    }

    fn extend(&mut self, sequence: u64) {
        self.missed_from = self.missed_from.min(sequence);
        self.missed_to = self.missed_to.max(sequence);
        self.missed_count += 1;
    }
}

#[derive(Debug, Clone)]
pub enum Delivery {
    Gap(GapNotice),
    Event(Arc<CycleEvent>),
}

#[derive(Debug, Clone)]
pub struct PublisherSettings {
    /// events buffered per subscriber before drop-oldest kicks in
    pub buffer_capacity: usize,
    /// recent events kept for Last-Event-ID resume
    pub replay_capacity: usize,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self { buffer_capacity: 16, replay_capacity: 64 }
    }
}

#[derive(Default)]
struct QueueState {
    events: VecDeque<Arc<CycleEvent>>,
    gap: Option<GapNotice>,
    closed: bool,
}

struct SubscriberQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), state: Mutex::new(QueueState::default()), notify: Notify::new() }
    }

    /// Enqueue, dropping the oldest event on overflow. Returns true if one was dropped.
    fn push(&self, event: Arc<CycleEvent>) -> bool {
        let mut dropped = false;
        {
            let mut q = self.state.lock();
            if q.events.len() >= self.capacity {
                if let Some(oldest) = q.events.pop_front() {
                    match q.gap.as_mut() {
                        Some(gap) => gap.extend(oldest.sequence),
                        None => q.gap = Some(GapNotice::single(oldest.sequence)),
                    }
                    dropped = true;
                }
            }
            q.events.push_back(event);
        }
        self.notify.notify_one();
        dropped
    }

    fn mark_gap(&self, gap: GapNotice) {
        self.state.lock().gap = Some(gap);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    fn pop(&self) -> Result<Delivery, bool> {
        let mut q = self.state.lock();
        if let Some(gap) = q.gap.take() {
            return Ok(Delivery::Gap(gap));
        }
        match q.events.pop_front() {
            Some(event) => Ok(Delivery::Event(event)),
            None => Err(q.closed),
        }
    }
}

struct PublisherInner {
    settings: PublisherSettings,
    next_sequence: AtomicU64,
    dropped_total: AtomicU64,
    subscribers: RwLock<HashMap<Uuid, Arc<SubscriberQueue>>>,
    /// also serialises publish against subscribe so resume never skips or repeats
    replay: Mutex<VecDeque<Arc<CycleEvent>>>,
}

#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

impl Publisher {
    pub fn new(settings: PublisherSettings) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                settings,
                next_sequence: AtomicU64::new(1),
                dropped_total: AtomicU64::new(0),
                subscribers: RwLock::new(HashMap::new()),
                replay: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Push one cycle's output to every subscriber. Returns its sequence number.
    pub fn publish(&self, aggregate: AggregateSnapshot, alerts: Vec<AlertDelta>) -> u64 {
        let inner = &self.inner;
        let mut replay = inner.replay.lock();

        let sequence = inner.next_sequence.fetch_add(1, Ordering::SeqCst);
        let event = Arc::new(CycleEvent { sequence, aggregate, alerts });

        replay.push_back(event.clone());
        while replay.len() > inner.settings.replay_capacity {
            replay.pop_front();
        }

        let subscribers: Vec<(Uuid, Arc<SubscriberQueue>)> =
            inner.subscribers.read().iter().map(|(id, q)| (*id, q.clone())).collect();
        for (id, queue) in &subscribers {
            if queue.push(event.clone()) {
                inner.dropped_total.fetch_add(1, Ordering::Relaxed);
                debug!(subscriber = %id, sequence, "subscriber buffer full, dropped oldest event");
            }
        }
        sequence
    }

    /// Register a subscriber, optionally resuming after `last_event_id`.
    pub fn subscribe(&self, last_event_id: Option<u64>) -> Subscription {
        let inner = &self.inner;
        let id = Uuid::new_v4();
        let queue = Arc::new(SubscriberQueue::new(inner.settings.buffer_capacity));

        let replay = inner.replay.lock();
        if let Some(last) = last_event_id {
            let newest = inner.next_sequence.load(Ordering::SeqCst).saturating_sub(1);
            if last < newest {
                let oldest_kept = replay.front().map_or(newest + 1, |e| e.sequence);
                if last + 1 < oldest_kept {
                    let missed_to = oldest_kept - 1;
                    queue.mark_gap(GapNotice {
                        missed_from: last + 1,
                        missed_to,
                        missed_count: missed_to - last,
                    });
                }
                for event in replay.iter().filter(|e| e.sequence > last) {
                    queue.push(event.clone());
                }
            }
        }
        inner.subscribers.write().insert(id, queue.clone());
        drop(replay);

        info!(subscriber = %id, resume_after = ?last_event_id, "stream subscriber connected");
        Subscription { id, queue, publisher: self.inner.clone() }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    pub fn last_sequence(&self) -> u64 {
        self.inner.next_sequence.load(Ordering::SeqCst).saturating_sub(1)
    }

    pub fn dropped_total(&self) -> u64 {
        self.inner.dropped_total.load(Ordering::Relaxed)
    }

    /// End every open stream.
    pub fn close_all(&self) {
        for queue in self.inner.subscribers.read().values() {
            queue.close();
        }
    }
}

/// A live subscriber. Dropping it unregisters immediately.
pub struct Subscription {
    id: Uuid,
    queue: Arc<SubscriberQueue>,
    publisher: Arc<PublisherInner>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next delivery; `None` once the publisher has closed the stream.
    pub async fn next(&mut self) -> Option<Delivery> {
        loop {
            match self.queue.pop() {
                Ok(delivery) => return Some(delivery),
                Err(true) => return None,
                Err(false) => self.queue.notify.notified().await,
            }
        }
    }

    /// Non-waiting variant of `next`.
    pub fn try_next(&mut self) -> Option<Delivery> {
        self.queue.pop().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.publisher.subscribers.write().remove(&self.id);
        debug!(subscriber = %self.id, "stream subscriber released");
    }
}
