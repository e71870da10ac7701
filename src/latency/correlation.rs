//! Pending timestamp records, keyed by sequence id.
//!
//! Records wait here until a frame with the same id is decoded or until they
//! outlive the retention window. Expiry is checked on every insert and match;
//! there is no background timer. Insertion order is kept in a deque next to
//! the map, so eviction only ever looks at the front.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{SessionId, TimestampRecord};

/// Replaced sessions remembered so their late datagrams can be ignored.
const RETIRED_SESSIONS: usize = 2;

#[derive(Debug, Clone, Copy)]
struct Pending {
    record: TimestampRecord,
    inserted_at: Instant,
}

/// What an insert did besides storing the record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Entries dropped for age or capacity
    pub evicted: usize,
    /// The record came from a new sender session and the table was cleared
    pub session_reset: bool,
    /// The record belonged to an already replaced session and was discarded
    pub stale: bool,
}

/// Receiver-side map of outstanding `sequence_id -> TimestampRecord`.
#[derive(Debug)]
pub struct CorrelationTable {
    retention: Duration,
    max_entries: usize,
    session: Option<SessionId>,
    retired: VecDeque<SessionId>,
    entries: HashMap<u64, Pending>,
    order: VecDeque<(Instant, u64)>,
}

impl CorrelationTable {
    /// Create a table that forgets records after `retention` and never holds
    /// more than `max_entries`.
    pub fn new(retention: Duration, max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            retention,
            max_entries,
            session: None,
            retired: VecDeque::with_capacity(RETIRED_SESSIONS),
            entries: HashMap::with_capacity(max_entries),
            order: VecDeque::with_capacity(max_entries),
        }
    }

    /// Size the table for a stream: twice the records a `framerate` stream
    /// produces within `retention`.
    pub fn for_framerate(framerate: u32, retention: Duration) -> Self {
        let expected = (framerate as f64 * retention.as_secs_f64()).ceil() as usize;
        Self::new(retention, expected.max(1) * 2)
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Session of the records currently held.
    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn insert(&mut self, record: TimestampRecord) -> InsertOutcome {
        self.insert_at(record, Instant::now())
    }

    /// Add or overwrite the entry for `record.sequence_id`, received at `now`.
    pub fn insert_at(&mut self, record: TimestampRecord, now: Instant) -> InsertOutcome {
        let mut outcome = InsertOutcome::default();

        if self.session != Some(record.session) {
            if self.retired.contains(&record.session) {
                debug!(
                    "Ignoring late record {} from replaced session {}",
                    record.sequence_id, record.session
                );
                outcome.stale = true;
                outcome.evicted = self.evict_expired(now);
                return outcome;
            }
            if let Some(previous) = self.session {
                info!(
                    "Sender session changed ({} -> {}), dropping {} pending records",
                    previous,
                    record.session,
                    self.entries.len()
                );
                self.clear();
                if self.retired.len() == RETIRED_SESSIONS {
                    self.retired.pop_front();
                }
                self.retired.push_back(previous);
                outcome.session_reset = true;
            }
            self.session = Some(record.session);
        }

        outcome.evicted += self.evict_expired(now);

        self.entries.insert(record.sequence_id, Pending { record, inserted_at: now });
        self.order.push_back((now, record.sequence_id));

        while self.entries.len() > self.max_entries {
            if self.pop_oldest().is_none() {
                break;
            }
            outcome.evicted += 1;
        }

        outcome
    }

    pub fn match_id(&mut self, sequence_id: u64) -> Option<TimestampRecord> {
        self.match_id_at(sequence_id, Instant::now()).0
    }

    /// Remove and return the record for `sequence_id`, unless it has expired.
    /// The second value is the number of entries evicted on the way.
    pub fn match_id_at(
        &mut self,
        sequence_id: u64,
        now: Instant,
    ) -> (Option<TimestampRecord>, usize) {
        let evicted = self.evict_expired(now);
        let record = self.entries.remove(&sequence_id).map(|pending| pending.record);
        (record, evicted)
    }

    /// Remove and return the oldest live record, for arrival-order pairing.
    pub fn take_oldest_at(&mut self, now: Instant) -> (Option<TimestampRecord>, usize) {
        let evicted = self.evict_expired(now);
        (self.pop_oldest(), evicted)
    }

    /// Drop every entry that has been waiting longer than the retention window.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let mut evicted = 0;
        while let Some(&(inserted_at, id)) = self.order.front() {
            if now.saturating_duration_since(inserted_at) <= self.retention {
                break;
            }
            self.order.pop_front();
            // Skip deque slots whose entry was matched or overwritten since
            if self.entries.get(&id).is_some_and(|p| p.inserted_at == inserted_at) {
                self.entries.remove(&id);
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!("Evicted {} expired timestamp records", evicted);
        }
        evicted
    }

    fn pop_oldest(&mut self) -> Option<TimestampRecord> {
        while let Some((inserted_at, id)) = self.order.pop_front() {
            if self.entries.get(&id).is_some_and(|p| p.inserted_at == inserted_at) {
                return self.entries.remove(&id).map(|pending| pending.record);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn record(session: SessionId, id: u64, send_time: f64) -> TimestampRecord {
        TimestampRecord { session, sequence_id: id, send_time }
    }

    #[test]
    fn match_consumes_at_most_once() {
        let session = Uuid::new_v4();
        let mut table = CorrelationTable::new(Duration::from_secs(2), 100);
        let t0 = Instant::now();

        table.insert_at(record(session, 3, 1.0), t0);
        assert_eq!(table.len(), 1);

        let (first, _) = table.match_id_at(3, t0);
        assert_eq!(first.map(|r| r.sequence_id), Some(3));
        let (second, _) = table.match_id_at(3, t0);
        assert!(second.is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn insert_overwrites_same_id() {
        let session = Uuid::new_v4();
        let mut table = CorrelationTable::new(Duration::from_secs(2), 100);
        let t0 = Instant::now();

        table.insert_at(record(session, 1, 1.0), t0);
        table.insert_at(record(session, 1, 2.0), t0 + Duration::from_millis(100));
        assert_eq!(table.len(), 1);
        let (found, _) = table.match_id_at(1, t0 + Duration::from_millis(200));
        assert_eq!(found.unwrap().send_time, 2.0);
    }

    #[test]
    fn expired_record_is_not_returned() {
        // retention 1.0s, inserted at t=0, matched at t=1.5
        let session = Uuid::new_v4();
        let mut table = CorrelationTable::new(Duration::from_secs(1), 100);
        let t0 = Instant::now();

        table.insert_at(record(session, 7, 0.0), t0);
        let (found, evicted) = table.match_id_at(7, t0 + Duration::from_millis(1500));
        assert!(found.is_none());
        assert_eq!(evicted, 1);
        assert!(table.is_empty());
    }

    #[test]
    fn overwritten_entry_expires_from_its_latest_insert() {
        let session = Uuid::new_v4();
        let mut table = CorrelationTable::new(Duration::from_secs(1), 100);
        let t0 = Instant::now();

        table.insert_at(record(session, 2, 0.0), t0);
        table.insert_at(record(session, 2, 0.9), t0 + Duration::from_millis(900));
        // The first slot expires but must not take the fresh entry with it
        let (found, evicted) = table.match_id_at(2, t0 + Duration::from_millis(1200));
        assert_eq!(evicted, 0);
        assert_eq!(found.unwrap().send_time, 0.9);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let session = Uuid::new_v4();
        let mut table = CorrelationTable::new(Duration::from_secs(10), 3);
        let t0 = Instant::now();

        for id in 0..3 {
            table.insert_at(record(session, id, 0.0), t0);
        }
        let outcome = table.insert_at(record(session, 3, 0.0), t0);
        assert_eq!(outcome.evicted, 1);
        assert_eq!(table.len(), 3);
        assert!(table.match_id_at(0, t0).0.is_none());
        assert!(table.match_id_at(3, t0).0.is_some());
    }

    #[test]
    fn new_session_clears_table() {
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let mut table = CorrelationTable::new(Duration::from_secs(2), 100);
        let t0 = Instant::now();

        assert!(!table.insert_at(record(first, 0, 0.0), t0).session_reset);
        table.insert_at(record(first, 1, 0.0), t0);
        let outcome = table.insert_at(record(second, 0, 5.0), t0);
        assert!(outcome.session_reset);
        assert_eq!(table.len(), 1);
        assert_eq!(table.session(), Some(second));
        assert!(table.match_id_at(1, t0).0.is_none());
    }

    #[test]
    fn late_record_from_replaced_session_is_ignored() {
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        let mut table = CorrelationTable::new(Duration::from_secs(2), 100);
        let t0 = Instant::now();

        table.insert_at(record(old, 10, 0.0), t0);
        table.insert_at(record(new, 0, 1.0), t0);
        table.insert_at(record(new, 1, 1.1), t0);

        let outcome = table.insert_at(record(old, 11, 0.1), t0);
        assert!(outcome.stale);
        assert!(!outcome.session_reset);
        assert_eq!(table.session(), Some(new));
        assert_eq!(table.len(), 2);

        // The current session keeps going without another reset
        let outcome = table.insert_at(record(new, 2, 1.2), t0);
        assert!(!outcome.session_reset);
        assert_eq!(table.len(), 3);
        assert!(table.match_id_at(11, t0).0.is_none());
    }

    #[test]
    fn only_recent_sessions_are_remembered() {
        let sessions: Vec<SessionId> = (0..4).map(|_| Uuid::new_v4()).collect();
        let mut table = CorrelationTable::new(Duration::from_secs(2), 100);
        let t0 = Instant::now();
        for &session in &sessions {
            table.insert_at(record(session, 0, 0.0), t0);
        }

        // The oldest session has dropped out of memory and counts as new again
        let outcome = table.insert_at(record(sessions[0], 1, 0.0), t0);
        assert!(outcome.session_reset);
        assert_eq!(table.session(), Some(sessions[0]));
    }

    #[test]
    fn insert_evicts_expired_entries() {
        let session = Uuid::new_v4();
        let mut table = CorrelationTable::new(Duration::from_secs(1), 100);
        let t0 = Instant::now();

        table.insert_at(record(session, 1, 0.0), t0);
        let outcome = table.insert_at(record(session, 2, 1.5), t0 + Duration::from_millis(1500));
        assert_eq!(outcome.evicted, 1);
        assert_eq!(table.len(), 1);
        assert!(table.match_id_at(2, t0 + Duration::from_millis(1500)).0.is_some());
    }

    #[test]
    fn take_oldest_follows_insertion_order() {
        let session = Uuid::new_v4();
        let mut table = CorrelationTable::new(Duration::from_secs(2), 100);
        let t0 = Instant::now();

        for id in [4, 5, 6] {
            table.insert_at(record(session, id, 0.0), t0);
        }
        table.match_id_at(4, t0);

        assert_eq!(table.take_oldest_at(t0).0.unwrap().sequence_id, 5);
        assert_eq!(table.take_oldest_at(t0).0.unwrap().sequence_id, 6);
        assert!(table.take_oldest_at(t0).0.is_none());
    }

    #[test]
    fn sized_from_framerate() {
        let table = CorrelationTable::for_framerate(30, Duration::from_secs(2));
        assert_eq!(table.capacity(), 120);
        assert_eq!(table.retention(), Duration::from_secs(2));
    }

    proptest! {
        #[test]
        fn every_id_matches_at_most_once(ids in prop::collection::vec(0u64..50, 1..200)) {
            let session = Uuid::new_v4();
            let mut table = CorrelationTable::new(Duration::from_secs(60), 1000);
            let t0 = Instant::now();
            for &id in &ids {
                table.insert_at(record(session, id, 0.0), t0);
            }

            let mut distinct = ids.clone();
            distinct.sort_unstable();
            distinct.dedup();
            for &id in &distinct {
                prop_assert!(table.match_id_at(id, t0).0.is_some());
                prop_assert!(table.match_id_at(id, t0).0.is_none());
            }
            prop_assert!(table.is_empty());
        }

        #[test]
        fn size_stays_within_capacity(count in 1usize..500, cap in 1usize..64) {
            let session = Uuid::new_v4();
            let mut table = CorrelationTable::new(Duration::from_secs(60), cap);
            let t0 = Instant::now();
            for id in 0..count as u64 {
                table.insert_at(record(session, id, 0.0), t0);
                prop_assert!(table.len() <= cap);
            }
        }
    }
}
