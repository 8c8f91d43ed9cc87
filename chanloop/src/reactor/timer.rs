use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

/// Handle of a scheduled timer.
///
/// Ids increase monotonically, which makes them the tie-breaker between equal deadlines:
/// the timer scheduled first fires first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

const COMPACT_SLACK: usize = 64;

/// Min-heap of deadlines, each carrying a payload.
///
/// Cancellation is lazy: the payload is dropped right away and the heap entry is skipped
/// when it reaches the top. Once cancelled entries outnumber live ones by more than a
/// fixed slack the heap is rebuilt, so a long-lived timer at the top cannot pin an
/// unbounded tail of dead entries behind it.
pub struct TimerQueue<T> {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    live: HashMap<TimerId, T>,
    next_id: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn schedule(&mut self, deadline: Instant, payload: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(Reverse((deadline, id)));
        self.live.insert(id, payload);
        id
    }

    /// Cancels a pending timer. Cancelling a fired or already cancelled timer is a no-op.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        let payload = self.live.remove(&id);
        if self.heap.len() > 2 * self.live.len() + COMPACT_SLACK {
            let live = &self.live;
            self.heap.retain(|Reverse((_, id))| live.contains_key(id));
        }
        payload
    }

    pub fn peek_earliest(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek() {
            if self.live.contains_key(id) {
                return Some(*deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Removes every timer due at `now`, earliest deadline first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<(TimerId, T)> {
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek() {
            if *deadline > now {
                break;
            }
            let id = *id;
            self.heap.pop();
            if let Some(payload) = self.live.remove(&id) {
                expired.push((id, payload));
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
