//! A TimeQ is a queue datastructure where the contained items are time
//! ordered: items become poppable once their due time arrives, extraction
//! is strictly due-ascending, and ties are broken by insertion order.
//! Entries can be cancelled by id.
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::time::Duration;
use thiserror::Error;

/// Implemented by the items stored in a TimeQ.
pub trait TimerEntry {
    type Id: Eq + Hash + Clone;

    fn id(&self) -> &Self::Id;

    /// The instant at which the entry becomes ready.
    /// `None` means ready immediately.
    fn due(&self) -> Option<DateTime<Utc>>;
}

#[derive(Error, Debug)]
pub enum TimerError<E> {
    /// The entry was due at or before the time of insertion
    #[error("entry is already due")]
    Expired(E),
    /// No live entry with that id is present
    #[error("no such entry")]
    NotFound,
}

#[must_use]
pub enum PopResult<E> {
    /// These items are ready for immediate action,
    /// in due order
    Items(Vec<E>),
    /// No items will be ready for the specified duration
    Sleep(Duration),
    /// The queue is empty
    Empty,
}

struct QueueEntry<E> {
    due: DateTime<Utc>,
    seq: u64,
    entry: E,
}

impl<E> PartialEq for QueueEntry<E> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl<E> Eq for QueueEntry<E> {}
impl<E> PartialOrd for QueueEntry<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<E> Ord for QueueEntry<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so that the earliest due
        // (and, within a due time, the earliest insertion) pops first
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

pub struct TimeQ<E: TimerEntry> {
    heap: BinaryHeap<QueueEntry<E>>,
    /// Maps live ids to their current seq, so that stale heap entries
    /// (cancelled, or re-inserted with a new due time) can be skipped
    /// lazily when they surface
    live: HashMap<E::Id, u64>,
    next_seq: u64,
}

impl<E: TimerEntry> Default for TimeQ<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: TimerEntry> TimeQ<E> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Insert a new entry. If the entry is due now (or in the past),
    /// it is not inserted; the caller should process it immediately.
    pub fn insert(&mut self, entry: E) -> Result<(), TimerError<E>> {
        self.insert_at(Utc::now(), entry)
    }

    fn insert_at(&mut self, now: DateTime<Utc>, entry: E) -> Result<(), TimerError<E>> {
        let due = match entry.due() {
            Some(due) if due > now => due,
            _ => return Err(TimerError::Expired(entry)),
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(entry.id().clone(), seq);
        self.heap.push(QueueEntry { due, seq, entry });
        Ok(())
    }

    /// Cancel the entry with the given id
    pub fn cancel_by_id(&mut self, id: &E::Id) -> Result<(), TimerError<std::convert::Infallible>> {
        match self.live.remove(id) {
            Some(_) => Ok(()),
            None => Err(TimerError::NotFound),
        }
    }

    fn is_live(live: &HashMap<E::Id, u64>, item: &QueueEntry<E>) -> bool {
        live.get(item.entry.id()) == Some(&item.seq)
    }

    /// The due time of the earliest live entry
    pub fn peek_next_due(&mut self) -> Option<DateTime<Utc>> {
        while let Some(item) = self.heap.peek() {
            if Self::is_live(&self.live, item) {
                return Some(item.due);
            }
            self.heap.pop();
        }
        None
    }

    /// Returns the set of items that are due at `now`
    pub fn pop_at(&mut self, now: DateTime<Utc>) -> PopResult<E> {
        let mut items = vec![];
        loop {
            match self.heap.peek() {
                None => break,
                Some(item) => {
                    if !Self::is_live(&self.live, item) {
                        self.heap.pop();
                        continue;
                    }
                    if item.due > now {
                        break;
                    }
                }
            }
            let item = self.heap.pop().expect("peeked entry is present");
            self.live.remove(item.entry.id());
            items.push(item.entry);
        }

        if !items.is_empty() {
            return PopResult::Items(items);
        }

        match self.peek_next_due() {
            Some(due) => {
                PopResult::Sleep((due - now).to_std().unwrap_or(Duration::from_millis(1)))
            }
            None => PopResult::Empty,
        }
    }

    /// Returns the set of items that need immediate action
    pub fn pop(&mut self) -> PopResult<E> {
        self.pop_at(Utc::now())
    }

    /// Remove and return all live entries, in due order
    pub fn drain(&mut self) -> Vec<E>  {
        let mut items = vec![];
        while let Some(item) = self.heap.pop() {
            if Self::is_live(&self.live, &item) {
                items.push(item.entry);
            }
        }
        self.live.clear();
        self.next_seq = 0;
        items
    }

}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeDelta;

    #[derive(Debug, PartialEq, Clone)]
    struct Entry {
        id: u64,
        due: Option<DateTime<Utc>>,
    }

    impl TimerEntry for Entry {
        type Id = u64;
        fn id(&self) -> &u64 {
            &self.id
        }
        fn due(&self) -> Option<DateTime<Utc>> {
            self.due
        }
    }

    fn entry(id: u64, due_in_secs: i64) -> Entry {
        Entry {
            id,
            due: Some(Utc::now() + TimeDelta::seconds(due_in_secs)),
        }
    }

    #[test]
    fn due_ordering() {
        let mut q = TimeQ::new();
        let one = entry(1, 10);
        let two = entry(2, 30);
        let three = entry(3, 20);
        q.insert(one.clone()).unwrap();
        q.insert(two.clone()).unwrap();
        q.insert(three.clone()).unwrap();
        assert_eq!(q.len(), 3);

        let now = Utc::now() + TimeDelta::seconds(60);
        match q.pop_at(now) {
            PopResult::Items(items) => assert_eq!(items, vec![one, three, two]),
            _ => panic!("expected items"),
        }
        assert!(q.is_empty());
        assert!(matches!(q.pop_at(now), PopResult::Empty));
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let due = Utc::now() + TimeDelta::seconds(5);
        let mut q = TimeQ::new();
        for id in 0..8u64 {
            q.insert(Entry { id, due: Some(due) }).unwrap();
        }
        match q.pop_at(due) {
            PopResult::Items(items) => {
                let ids: Vec<u64> = items.iter().map(|e| e.id).collect();
                assert_eq!(ids, vec![0, 1, 2, 3, 4, 5, 6, 7]);
            }
            _ => panic!("expected items"),
        }
    }

    #[test]
    fn immediately_due_is_rejected() {
        let mut q = TimeQ::new();
        let past = Entry {
            id: 1,
            due: Some(Utc::now() - TimeDelta::seconds(1)),
        };
        assert!(matches!(q.insert(past), Err(TimerError::Expired(_))));

        let no_due = Entry { id: 2, due: None };
        assert!(matches!(q.insert(no_due), Err(TimerError::Expired(_))));
        assert!(q.is_empty());
    }

    #[test]
    fn cancel() {
        let mut q = TimeQ::new();
        let one = entry(1, 10);
        let two = entry(2, 20);
        q.insert(one.clone()).unwrap();
        q.insert(two.clone()).unwrap();
        q.cancel_by_id(&1).unwrap();
        assert_eq!(q.len(), 1);
        assert!(matches!(q.cancel_by_id(&1), Err(TimerError::NotFound)));

        let items = q.drain();
        assert_eq!(items, vec![two]);
        assert!(q.is_empty());
    }

    #[test]
    fn sleep_hint() {
        let mut q = TimeQ::new();
        q.insert(entry(1, 30)).unwrap();
        match q.pop() {
            PopResult::Sleep(d) => assert!(d <= Duration::from_secs(30)),
            _ => panic!("expected sleep"),
        }
    }

    #[test]
    fn peek() {
        let mut q: TimeQ<Entry> = TimeQ::new();
        assert_eq!(q.peek_next_due(), None);
        let one = entry(1, 10);
        q.insert(one.clone()).unwrap();
        assert_eq!(q.peek_next_due(), one.due);
    }
}
