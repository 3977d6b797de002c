//! In-memory state for one bridge session.
//!
//! Holds the activity log, the feedback queue and the set of long-poll
//! waiters. Every operation takes the inner lock once and never awaits
//! while holding it, so appends, dequeues and waiter bookkeeping are atomic
//! with respect to each other no matter how many connection handlers run.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use tokio::sync::oneshot;

use crate::events::{ActivityEvent, BridgeStatus, ControlEvent, FeedbackEvent, now_timestamp};

/// Identifies a registered waiter so its connection can deregister on hang-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterId(u64);

/// How a pending wait was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// New activity past the waiter's cursor.
    Activities(Vec<ActivityEvent>),
    /// The session ended while waiting.
    Stopped(ControlEvent),
}

/// Result of asking for activity past a cursor.
#[derive(Debug)]
pub enum WaitTicket {
    /// Unseen activity was already there.
    Ready(Vec<ActivityEvent>),
    /// Nothing unseen; resolved by the next append that reaches the cursor,
    /// or by the session closing.
    Pending {
        id: WaiterId,
        rx: oneshot::Receiver<WaitOutcome>,
    },
    /// The session is closed.
    Stopped(ControlEvent),
}

struct Waiter {
    id: WaiterId,
    last_seen: u64,
    tx: oneshot::Sender<WaitOutcome>,
}

struct Inner {
    activities: VecDeque<ActivityEvent>,
    next_sequence: u64,
    feedback: VecDeque<FeedbackEvent>,
    waiters: Vec<Waiter>,
    next_waiter_id: u64,
    closed: bool,
}

impl Inner {
    /// Sequence number of the oldest retained activity.
    fn first_retained(&self) -> u64 {
        self.next_sequence - self.activities.len() as u64
    }

    fn unseen_since(&self, last_seen: u64) -> Vec<ActivityEvent> {
        if last_seen >= self.next_sequence {
            return Vec::new();
        }
        let skip = usize::try_from(last_seen.saturating_sub(self.first_retained())).unwrap_or(usize::MAX);
        self.activities.iter().skip(skip).cloned().collect()
    }
}

/// State owned by a single session.
pub struct SessionState {
    id: String,
    started_at: Instant,
    max_history: Option<usize>,
    inner: Mutex<Inner>,
}

impl SessionState {
    /// Create an empty session.
    ///
    /// `max_history` caps how many activities stay in memory; sequence
    /// numbers keep counting past evicted entries.
    #[must_use]
    pub fn new(id: impl Into<String>, max_history: Option<usize>) -> Self {
        Self {
            id: id.into(),
            started_at: Instant::now(),
            max_history: max_history.filter(|cap| *cap > 0),
            inner: Mutex::new(Inner {
                activities: VecDeque::with_capacity(32),
                next_sequence: 0,
                feedback: VecDeque::new(),
                waiters: Vec::new(),
                next_waiter_id: 0,
                closed: false,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an activity and hand it to every waiter it satisfies.
    ///
    /// Returns the stored event with its assigned sequence number.
    pub fn append(&self, mut event: ActivityEvent) -> ActivityEvent {
        let mut inner = self.lock();

        event.sequence = inner.next_sequence;
        event.session_id.clone_from(&self.id);
        if event.timestamp.is_none() {
            event.timestamp = Some(now_timestamp());
        }

        inner.next_sequence += 1;
        inner.activities.push_back(event.clone());
        if let Some(cap) = self.max_history {
            while inner.activities.len() > cap {
                inner.activities.pop_front();
            }
        }

        let waiters = std::mem::take(&mut inner.waiters);
        let mut still_waiting = Vec::new();
        let mut delivered = 0usize;
        for waiter in waiters {
            let unseen = inner.unseen_since(waiter.last_seen);
            if unseen.is_empty() {
                still_waiting.push(waiter);
            } else if waiter.tx.send(WaitOutcome::Activities(unseen)).is_ok() {
                delivered += 1;
            }
        }
        inner.waiters = still_waiting;

        tracing::debug!(
            session_id = %self.id,
            sequence = event.sequence,
            delivered,
            "Appended activity"
        );
        event
    }

    /// Queue feedback for the main agent.
    pub fn enqueue_feedback(&self, mut event: FeedbackEvent) {
        if event.timestamp.is_none() {
            event.timestamp = Some(now_timestamp());
        }
        self.lock().feedback.push_back(event);
    }

    /// Pop the oldest queued feedback, if any.
    pub fn dequeue_feedback(&self) -> Option<FeedbackEvent> {
        self.lock().feedback.pop_front()
    }

    /// Retained activities with a sequence number at or after `last_seen`.
    #[must_use]
    pub fn unseen_since(&self, last_seen: u64) -> Vec<ActivityEvent> {
        self.lock().unseen_since(last_seen)
    }

    /// Return unseen activity now, or register a waiter for it.
    ///
    /// The check and the registration happen under one lock, so an append
    /// can never slip in between them.
    pub fn wait(&self, last_seen: u64) -> WaitTicket {
        let mut inner = self.lock();

        if inner.closed {
            return WaitTicket::Stopped(ControlEvent::stop(self.id.clone()));
        }

        let unseen = inner.unseen_since(last_seen);
        if !unseen.is_empty() {
            return WaitTicket::Ready(unseen);
        }

        let id = WaiterId(inner.next_waiter_id);
        inner.next_waiter_id += 1;
        let (tx, rx) = oneshot::channel();
        inner.waiters.push(Waiter { id, last_seen, tx });
        WaitTicket::Pending { id, rx }
    }

    /// Drop a waiter whose connection went away. Returns whether it was
    /// still registered.
    pub fn remove_waiter(&self, id: WaiterId) -> bool {
        let mut inner = self.lock();
        let before = inner.waiters.len();
        inner.waiters.retain(|w| w.id != id);
        inner.waiters.len() != before
    }

    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Last `n` retained activities, oldest first.
    #[must_use]
    pub fn tail(&self, n: usize) -> Vec<ActivityEvent> {
        let inner = self.lock();
        let skip = inner.activities.len().saturating_sub(n);
        inner.activities.iter().skip(skip).cloned().collect()
    }

    #[must_use]
    pub fn snapshot(&self) -> BridgeStatus {
        let inner = self.lock();
        BridgeStatus {
            session_id: self.id.clone(),
            activity_count: inner.next_sequence,
            pending_feedback: inner.feedback.len(),
            pair_connected: !inner.waiters.is_empty(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Close the session and resolve every waiter with a stop event.
    ///
    /// Returns how many waiters were notified. Later `wait` calls resolve
    /// with stop immediately.
    pub fn close(&self) -> usize {
        let mut inner = self.lock();
        inner.closed = true;
        let waiters = std::mem::take(&mut inner.waiters);
        drop(inner);

        let mut notified = 0;
        for waiter in waiters {
            if waiter.tx.send(WaitOutcome::Stopped(ControlEvent::stop(self.id.clone()))).is_ok() {
                notified += 1;
            }
        }
        notified
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
