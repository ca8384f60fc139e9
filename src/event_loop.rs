//! Scheduling primitives shared by the client and server loops.
//!
//! Both processes are single-threaded cooperative loops: one task selects
//! over transport readability, timer expiry and outbound work, and every
//! handler runs to completion without blocking. [`TimerQueue`] supplies the
//! timer half of that contract: absolute deadlines keyed by a caller-chosen
//! type, fired in deadline order with ties broken by insertion order.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;

/// Read from an optional source; pends forever when the source is absent,
/// so the arm can sit in a `select!` unconditionally.
pub async fn read_opt<R: AsyncRead + Unpin + ?Sized>(
    src: Option<&mut R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match src {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Verdict a message or timer handler hands back to its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    /// Keep iterating.
    Continue,
    /// Leave the loop; the session tears down.
    Quit,
}

struct Entry<K> {
    deadline: Instant,
    /// Monotonic arm counter; orders ties and invalidates superseded entries.
    seq: u64,
    key: K,
}

impl<K> PartialEq for Entry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<K> Eq for Entry<K> {}

impl<K> PartialOrd for Entry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Entry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap and we want the earliest
        // deadline (then lowest seq) on top.
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

/// A set of single-shot timers addressed by key.
///
/// Re-arming a key replaces its previous deadline; an expired key is removed
/// before being reported, so handlers can re-arm without ceremony.
pub struct TimerQueue<K> {
    heap: BinaryHeap<Entry<K>>,
    armed: HashMap<K, u64>,
    seq: u64,
}

impl<K: Copy + Eq + Hash> TimerQueue<K> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            armed: HashMap::new(),
            seq: 0,
        }
    }

    /// Arm (or re-arm) `key` to fire at `deadline`.
    pub fn arm(&mut self, key: K, deadline: Instant) {
        self.seq += 1;
        self.armed.insert(key, self.seq);
        self.heap.push(Entry {
            deadline,
            seq: self.seq,
            key,
        });
    }

    /// Disarm `key`. No effect when the key is not armed.
    pub fn cancel(&mut self, key: K) {
        self.armed.remove(&key);
    }

    /// Whether `key` is currently armed.
    #[inline]
    pub fn is_armed(&self, key: K) -> bool {
        self.armed.contains_key(&key)
    }

    /// Earliest pending deadline, if any timer is armed.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.drop_stale();
        self.heap.peek().map(|e| e.deadline)
    }

    /// Wait for the earliest timer and report its key.
    ///
    /// Pends forever when no timer is armed, so this can sit in a `select!`
    /// arm unconditionally. Cancel safe: nothing is consumed until the
    /// deadline has actually passed.
    pub async fn expired(&mut self) -> K {
        let deadline = match self.next_deadline() {
            Some(deadline) => deadline,
            None => return std::future::pending().await,
        };

        tokio::time::sleep_until(deadline).await;

        // The head cannot have changed: this method holds the only
        // mutable reference while sleeping.
        let entry = match self.heap.pop() {
            Some(entry) => entry,
            None => return std::future::pending().await,
        };
        self.armed.remove(&entry.key);
        entry.key
    }

    /// Drop heap entries superseded by a re-arm or cancel.
    fn drop_stale(&mut self) {
        while let Some(head) = self.heap.peek() {
            if self.armed.get(&head.key) == Some(&head.seq) {
                return;
            }
            self.heap.pop();
        }
    }
}

impl<K: Copy + Eq + Hash> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Key {
        A,
        B,
        C,
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_in_deadline_order() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.arm(Key::B, now + Duration::from_secs(2));
        timers.arm(Key::A, now + Duration::from_secs(1));
        timers.arm(Key::C, now + Duration::from_secs(3));

        assert_eq!(timers.expired().await, Key::A);
        assert_eq!(timers.expired().await, Key::B);
        assert_eq!(timers.expired().await, Key::C);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ties_fire_in_insertion_order() {
        let mut timers = TimerQueue::new();
        let deadline = Instant::now() + Duration::from_secs(1);
        timers.arm(Key::C, deadline);
        timers.arm(Key::A, deadline);
        timers.arm(Key::B, deadline);

        assert_eq!(timers.expired().await, Key::C);
        assert_eq!(timers.expired().await, Key::A);
        assert_eq!(timers.expired().await, Key::B);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_deadline() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.arm(Key::A, now + Duration::from_secs(1));
        timers.arm(Key::B, now + Duration::from_secs(2));

        // Push A past B before anything fires.
        timers.arm(Key::A, now + Duration::from_secs(5));

        assert_eq!(timers.expired().await, Key::B);
        assert_eq!(timers.expired().await, Key::A);
        // A's original entry must not fire a second time.
        assert_eq!(timers.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_after_fire_is_clean() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.arm(Key::A, now + Duration::from_secs(1));

        assert_eq!(timers.expired().await, Key::A);
        assert!(!timers.is_armed(Key::A));

        timers.arm(Key::A, Instant::now() + Duration::from_secs(1));
        assert_eq!(timers.expired().await, Key::A);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_before_expiry_prevents_spurious_fire() {
        let mut timers = TimerQueue::new();
        let interval = Duration::from_secs(10);
        timers.arm(Key::A, Instant::now() + interval);

        // Activity at t+9s pushes the deadline out.
        tokio::time::sleep(Duration::from_secs(9)).await;
        timers.arm(Key::A, Instant::now() + interval);

        // Nothing may fire within the new interval.
        let premature = tokio::time::timeout(interval - Duration::from_millis(1), timers.expired());
        assert!(premature.await.is_err());
        assert_eq!(timers.expired().await, Key::A);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.arm(Key::A, now + Duration::from_secs(1));
        timers.arm(Key::B, now + Duration::from_secs(2));
        timers.cancel(Key::A);

        assert_eq!(timers.expired().await, Key::B);
        assert_eq!(timers.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pends_when_empty() {
        let mut timers: TimerQueue<Key> = TimerQueue::new();
        let wait = tokio::time::timeout(Duration::from_secs(3600), timers.expired());
        assert!(wait.await.is_err());
    }
}
