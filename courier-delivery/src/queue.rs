//! Multi-lane in-memory job queue with delayed re-entry.
//!
//! Jobs are drained strictly by lane order (tier 10 first, retry lane
//! last). Deferred jobs sit in a time-ordered heap and are promoted
//! into the retry lane once due.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::job::{DeliveryJob, Priority};

struct DelayedJob {
    due: Instant,
    job: DeliveryJob,
}

// BinaryHeap is a max-heap, so order by reversed due time to pop the
// earliest deadline first.
impl PartialEq for DelayedJob {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}

impl Eq for DelayedJob {}

impl PartialOrd for DelayedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        other.due.cmp(&self.due)
    }
}

pub struct JobQueue {
    lanes: Vec<Mutex<VecDeque<DeliveryJob>>>,
    delayed: Mutex<BinaryHeap<DelayedJob>>,
    notify: Notify,
}

impl JobQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lanes: (0..Priority::LANES).map(|_| Mutex::new(VecDeque::new())).collect(),
            delayed: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        }
    }

    /// Make a job immediately claimable in its priority lane.
    pub fn enqueue(&self, job: DeliveryJob) {
        self.lanes[job.priority.lane()].lock().push_back(job);
        self.notify.notify_one();
    }

    /// Park a job until `delay` has elapsed, then surface it in the
    /// retry lane. The job's priority is rewritten so repeated
    /// deferrals cannot starve fresh traffic.
    pub fn enqueue_delayed(&self, mut job: DeliveryJob, delay: Duration) {
        job.priority = Priority::Retry;
        self.delayed.lock().push(DelayedJob {
            due: Instant::now() + delay,
            job,
        });
        self.notify.notify_one();
    }

    fn promote_due(&self) {
        let now = Instant::now();
        let mut delayed = self.delayed.lock();
        while delayed.peek().is_some_and(|d| d.due <= now) {
            if let Some(d) = delayed.pop() {
                self.lanes[d.job.priority.lane()].lock().push_back(d.job);
            }
        }
    }

    /// Claim the highest-priority ready job, if any.
    pub fn try_claim(&self) -> Option<DeliveryJob> {
        self.promote_due();
        self.lanes.iter().find_map(|lane| lane.lock().pop_front())
    }

    /// Claim a job, waiting up to `wait` for one to become available.
    pub async fn claim(&self, wait: Duration) -> Option<DeliveryJob> {
        if let Some(job) = self.try_claim() {
            return Some(job);
        }

        // Cap the wait at the next delayed deadline so promotions are
        // not missed while parked on the notifier.
        let wait = self.next_due_in().map_or(wait, |due| due.min(wait));
        let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        self.try_claim()
    }

    /// Time until the earliest parked job becomes due.
    #[must_use]
    pub fn next_due_in(&self) -> Option<Duration> {
        self.delayed
            .lock()
            .peek()
            .map(|d| d.due.saturating_duration_since(Instant::now()))
    }

    /// Jobs currently held, ready and parked alike.
    #[must_use]
    pub fn len(&self) -> usize {
        let ready: usize = self.lanes.iter().map(|lane| lane.lock().len()).sum();
        ready + self.delayed.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}
