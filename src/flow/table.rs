use thiserror::Error;
use tracing::debug;

use super::entry::{FlowEntry, FlowKey, Occupancy, PACKET_COUNT_MAX};
use super::hash::fnv1a_32;

/// Number of slots in the table. Fixed at construction, never resized.
pub const CAPACITY: usize = 4096;

/// Bound on probe-sequence length for both lookup and insert.
pub const MAX_PROBES: usize = 32;

/// Linear and quadratic probing coefficients:
/// `slot(i) = (hash + C1*i + C2*i*i) mod CAPACITY`.
pub const C1: u32 = 1;
pub const C2: u32 = 1;

/// Entries untouched for longer than this are lazily deleted on probe contact.
pub const EXPIRATION_SECONDS: i64 = 300;

/// Representable range of a per-entry last-update offset (24-bit signed).
pub const MAX_OFFSET: i64 = (1 << 23) - 1;
pub const MIN_OFFSET: i64 = -(1 << 23);

/// Unsent flows at or above this packet count appear in the heavy-hitter
/// report. Must not exceed [`PACKET_COUNT_MAX`].
pub const FLOW_THRESHOLD: u8 = 32;

/// Why `process_flow` refused a packet. Both kinds count toward
/// [`FlowTable::dropped`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// `now - base_timestamp` is outside the representable offset range.
    /// The caller should rebase via `advance_base_timestamp` and retry.
    #[error("timestamp outside representable offset range")]
    TimestampOutOfRange,

    /// The probe budget was exhausted without finding a reusable slot.
    #[error("probe budget exhausted")]
    TableFull,
}

/// Fixed-capacity open-addressed flow table.
///
/// One pre-allocated slot array, quadratic probing with a hard probe budget,
/// lazy time-based expiration along probe paths, and a rebasable base
/// timestamp that keeps per-entry offsets inside their narrow range.
///
/// All operations take `&mut self`; callers interleaving packet ingestion
/// with reporting must serialize whole calls (the agent does this by
/// confining the table to a single task).
pub struct FlowTable {
    entries: Box<[FlowEntry]>,
    base_timestamp: i64,
    live: u32,
    expired: u64,
    dropped: u64,
    hash_fn: fn(&[u8]) -> u32,
}

impl std::fmt::Debug for FlowTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowTable")
            .field("base_timestamp", &self.base_timestamp)
            .field("live", &self.live)
            .field("expired", &self.expired)
            .field("dropped", &self.dropped)
            .finish()
    }
}

impl FlowTable {
    /// Creates an empty table with the production FNV-1a hash.
    pub fn new() -> Self {
        Self::with_hash_fn(fnv1a_32)
    }

    /// Creates an empty table with an alternate hash function. Test hook for
    /// forcing collisions; production code uses [`FlowTable::new`].
    pub fn with_hash_fn(hash_fn: fn(&[u8]) -> u32) -> Self {
        Self {
            entries: vec![FlowEntry::default(); CAPACITY].into_boxed_slice(),
            base_timestamp: 0,
            live: 0,
            expired: 0,
            dropped: 0,
            hash_fn,
        }
    }

    /// Epoch offset all per-entry offsets are measured from.
    pub fn base_timestamp(&self) -> i64 {
        self.base_timestamp
    }

    /// Number of live (sent or unsent) entries.
    pub fn live(&self) -> u32 {
        self.live
    }

    /// Cumulative count of lazy expirations since construction.
    pub fn expired(&self) -> u64 {
        self.expired
    }

    /// Cumulative count of refused inserts since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Read-only view of the slot array, in index order.
    pub fn entries(&self) -> &[FlowEntry] {
        &self.entries
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [FlowEntry] {
        &mut self.entries
    }

    /// The slot at `idx`, if in range.
    pub fn entry(&self, idx: usize) -> Option<&FlowEntry> {
        self.entries.get(idx)
    }

    /// Locates the live entry matching `key` and refreshes it, or inserts a
    /// new unsent entry. Returns the slot index.
    ///
    /// Along the probe path, stale entries (sent or unsent) are deleted
    /// before the key comparison, so a stale entry with the incoming key is
    /// replaced rather than refreshed.
    pub fn process_flow(&mut self, key: &FlowKey, now_seconds: i64) -> Result<usize, InsertError> {
        let hash = (self.hash_fn)(&key.hash_bytes());

        // Safety net: refuse timestamps the offset field cannot represent.
        // Callers are expected to rebase first; this keeps invariant 3 even
        // when they don't.
        if self.live > 0 {
            let offset = now_seconds - self.base_timestamp;
            if !(MIN_OFFSET..=MAX_OFFSET).contains(&offset) {
                self.dropped += 1;
                debug!(now_seconds, base = self.base_timestamp, "dropping flow, timestamp out of range");
                return Err(InsertError::TimestampOutOfRange);
            }
        }

        let mut first_reusable: Option<usize> = None;
        for probe in 0..MAX_PROBES as u32 {
            let idx = hash
                .wrapping_add(C1.wrapping_mul(probe))
                .wrapping_add(C2.wrapping_mul(probe).wrapping_mul(probe))
                as usize
                % CAPACITY;
            let entry = &mut self.entries[idx];

            // Lazy expiration fires for both occupied variants; an unsent
            // entry expiring here is discarded without ever being written.
            if entry.occupancy.is_live()
                && self.base_timestamp + i64::from(entry.last_update_offset) + EXPIRATION_SECONDS
                    < now_seconds
            {
                if entry.occupancy == Occupancy::Unsent {
                    debug!(slot = idx, "expiring unsent flow");
                }
                entry.occupancy = Occupancy::Deleted;
                self.live -= 1;
                self.expired += 1;
            }

            if entry.occupancy.is_live() && entry.key == *key {
                entry.last_update_offset = (now_seconds - self.base_timestamp) as i32;
                if cfg!(feature = "thresholding")
                    && entry.occupancy == Occupancy::Unsent
                    && entry.packet_count < PACKET_COUNT_MAX
                {
                    entry.packet_count += 1;
                }
                return Ok(idx);
            }

            if !entry.occupancy.is_live() {
                if first_reusable.is_none() {
                    first_reusable = Some(idx);
                }
                // An empty slot proves the key is absent.
                if entry.occupancy == Occupancy::Empty {
                    break;
                }
            }
        }

        let Some(idx) = first_reusable else {
            self.dropped += 1;
            debug!("dropping flow, probe budget exhausted");
            return Err(InsertError::TableFull);
        };

        // First entry after the table drains re-anchors the base so its
        // offset is zero.
        if self.live == 0 {
            self.base_timestamp = now_seconds;
        }

        let entry = &mut self.entries[idx];
        entry.key = *key;
        entry.occupancy = Occupancy::Unsent;
        entry.packet_count = if cfg!(feature = "thresholding") { 1 } else { 0 };
        entry.last_update_offset = (now_seconds - self.base_timestamp) as i32;
        self.live += 1;

        Ok(idx)
    }

    /// Rebases all live entries onto `new_base_seconds`.
    ///
    /// Entries whose rebased offset would fall below [`MIN_OFFSET`] are too
    /// old to represent and are deleted; they decrement the live count but
    /// are not counted as expirations. Surviving entries keep their absolute
    /// last-update time, occupancy variant, and packet count.
    pub fn advance_base_timestamp(&mut self, new_base_seconds: i64) {
        let shift = new_base_seconds - self.base_timestamp;

        for (idx, entry) in self.entries.iter_mut().enumerate() {
            if !entry.occupancy.is_live() {
                continue;
            }

            let rebased = i64::from(entry.last_update_offset) - shift;
            if rebased < MIN_OFFSET {
                debug!(slot = idx, "dropping flow too old to rebase");
                entry.occupancy = Occupancy::Deleted;
                self.live -= 1;
            } else {
                entry.last_update_offset = rebased as i32;
            }
        }

        self.base_timestamp = new_base_seconds;
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn key(last_octet: u8) -> FlowKey {
        FlowKey {
            src_ip: Ipv4Addr::new(10, 0, 0, last_octet),
            dst_ip: Ipv4Addr::new(192, 168, 1, 1),
            protocol: 6,
            src_port: 40_000,
            dst_port: 443,
        }
    }

    /// Counts live slots the slow way, for invariant checks.
    fn live_slots(table: &FlowTable) -> usize {
        table
            .entries()
            .iter()
            .filter(|e| e.occupancy.is_live())
            .count()
    }

    fn constant_hash(_data: &[u8]) -> u32 {
        7
    }

    #[test]
    fn test_first_insert_anchors_base_timestamp() {
        let mut table = FlowTable::new();
        let idx = table.process_flow(&key(1), 1_000).expect("insert");

        assert_eq!(table.live(), 1);
        assert_eq!(table.base_timestamp(), 1_000);

        let entry = table.entry(idx).expect("slot in range");
        assert_eq!(entry.occupancy, Occupancy::Unsent);
        assert_eq!(entry.last_update_offset, 0);
        #[cfg(feature = "thresholding")]
        assert_eq!(entry.packet_count, 1);
    }

    #[test]
    fn test_repeat_observations_refresh_in_place() {
        let mut table = FlowTable::new();
        let k = key(1);

        let idx = table.process_flow(&k, 100).expect("insert");
        for t in 101..110 {
            let again = table.process_flow(&k, t).expect("refresh");
            assert_eq!(again, idx);
        }

        assert_eq!(table.live(), 1);
        let entry = table.entry(idx).expect("slot in range");
        assert_eq!(entry.last_update_offset, 9);
        #[cfg(feature = "thresholding")]
        assert_eq!(entry.packet_count, 10);
    }

    #[cfg(feature = "thresholding")]
    #[test]
    fn test_packet_count_saturates_at_63() {
        let mut table = FlowTable::new();
        let k = key(1);

        for t in 0..100 {
            table.process_flow(&k, t).expect("refresh");
        }

        let idx = table.process_flow(&k, 100).expect("lookup");
        assert_eq!(
            table.entry(idx).expect("slot in range").packet_count,
            PACKET_COUNT_MAX
        );
    }

    #[test]
    fn test_timestamp_gate_refuses_unrepresentable_offsets() {
        let mut table = FlowTable::new();
        let t0 = 1_000_000_000;

        table.process_flow(&key(1), t0).expect("first insert");

        let err = table
            .process_flow(&key(2), t0 + MAX_OFFSET + 1)
            .expect_err("gate should refuse");
        assert_eq!(err, InsertError::TimestampOutOfRange);
        assert_eq!(table.dropped(), 1);
        assert_eq!(table.live(), 1);

        // In range again after a rebase.
        table.advance_base_timestamp(t0 + MAX_OFFSET);
        table
            .process_flow(&key(2), t0 + MAX_OFFSET + 1)
            .expect("insert after rebase");
        assert_eq!(table.live(), 2);
    }

    #[test]
    fn test_gate_is_inactive_while_empty() {
        let mut table = FlowTable::new();

        // Far-future timestamp on an empty table re-anchors instead of failing.
        table.process_flow(&key(1), i64::from(i32::MAX)).expect("insert");
        assert_eq!(table.base_timestamp(), i64::from(i32::MAX));
    }

    #[test]
    fn test_collision_chain_drops_at_probe_budget() {
        let mut table = FlowTable::with_hash_fn(constant_hash);

        for i in 0..MAX_PROBES {
            table
                .process_flow(&key(i as u8), 10)
                .expect("within probe budget");
        }
        assert_eq!(table.live(), MAX_PROBES as u32);

        let err = table
            .process_flow(&key(MAX_PROBES as u8), 10)
            .expect_err("budget exhausted");
        assert_eq!(err, InsertError::TableFull);
        assert_eq!(table.dropped(), 1);
    }

    #[test]
    fn test_lazy_expiration_on_probe_contact() {
        let mut table = FlowTable::with_hash_fn(constant_hash);

        let old_idx = table.process_flow(&key(1), 0).expect("insert old");

        // A different key probing through the stale slot expires it and
        // reuses it.
        let new_idx = table
            .process_flow(&key(2), EXPIRATION_SECONDS + 5)
            .expect("insert new");

        assert_eq!(new_idx, old_idx);
        assert_eq!(table.expired(), 1);
        assert_eq!(table.live(), 1);
        assert_eq!(table.entry(new_idx).expect("slot in range").key, key(2));
    }

    #[test]
    fn test_stale_entry_with_same_key_is_reinserted_fresh() {
        let mut table = FlowTable::new();
        let k = key(1);

        let idx = table.process_flow(&k, 0).expect("insert");
        for t in 1..20 {
            table.process_flow(&k, t).expect("refresh");
        }

        // Past the horizon the same key is expired first, then reinserted.
        let again = table
            .process_flow(&k, EXPIRATION_SECONDS + 100)
            .expect("reinsert");
        assert_eq!(again, idx);
        assert_eq!(table.expired(), 1);
        assert_eq!(table.live(), 1);
        #[cfg(feature = "thresholding")]
        assert_eq!(table.entry(idx).expect("slot in range").packet_count, 1);
    }

    #[test]
    fn test_expiration_applies_to_sent_entries() {
        let mut table = FlowTable::with_hash_fn(constant_hash);

        let idx = table.process_flow(&key(1), 0).expect("insert");
        table.entries_mut()[idx].occupancy = Occupancy::Sent;

        table
            .process_flow(&key(2), EXPIRATION_SECONDS + 1)
            .expect("insert through stale sent slot");
        assert_eq!(table.expired(), 1);
    }

    #[test]
    fn test_deleted_slot_does_not_terminate_probe() {
        let mut table = FlowTable::with_hash_fn(constant_hash);

        table.process_flow(&key(1), 0).expect("insert a");
        let idx_b = table.process_flow(&key(2), 200).expect("insert b");

        // Looking up b past the horizon first expires a into a tombstone on
        // probe 0, then must keep probing past it to reach b.
        let found = table
            .process_flow(&key(2), EXPIRATION_SECONDS + 1)
            .expect("lookup behind tombstone");
        assert_eq!(found, idx_b);
        assert_eq!(table.expired(), 1);
        assert_eq!(table.live(), 1);
    }

    #[test]
    fn test_rebase_preserves_absolute_update_times() {
        let mut table = FlowTable::new();

        let idx = table.process_flow(&key(1), 1_000).expect("insert");
        table.process_flow(&key(1), 1_040).expect("refresh");

        let before = table.base_timestamp()
            + i64::from(table.entry(idx).expect("slot in range").last_update_offset);

        table.advance_base_timestamp(1_100);

        assert_eq!(table.base_timestamp(), 1_100);
        let after = table.base_timestamp()
            + i64::from(table.entry(idx).expect("slot in range").last_update_offset);
        assert_eq!(before, after);
        assert_eq!(
            table.entry(idx).expect("slot in range").last_update_offset,
            -60
        );
    }

    #[test]
    fn test_rebase_evicts_entries_below_min_offset() {
        let mut table = FlowTable::new();

        table.process_flow(&key(1), 0).expect("insert old");
        table.process_flow(&key(2), 5_000).expect("insert newer");

        // Shift chosen so the old entry lands below MIN_OFFSET and the
        // newer one lands exactly on it.
        table.advance_base_timestamp(5_000 - MIN_OFFSET);

        assert_eq!(table.live(), 1, "only the newer entry survives");
        // Rebase evictions are not expirations.
        assert_eq!(table.expired(), 0);
        assert_eq!(live_slots(&table), 1);

        let survivor = table
            .entries()
            .iter()
            .find(|e| e.occupancy.is_live())
            .expect("survivor");
        assert_eq!(survivor.key, key(2));
        assert_eq!(i64::from(survivor.last_update_offset), MIN_OFFSET);
    }

    #[test]
    fn test_rebase_past_full_offset_range_drains_the_table() {
        let mut table = FlowTable::new();

        for i in 0..10u8 {
            table.process_flow(&key(i), 100).expect("insert");
        }

        // A delta wider than the representable range leaves nothing behind.
        table.advance_base_timestamp(100 + (MAX_OFFSET - MIN_OFFSET) + 1);

        assert_eq!(table.live(), 0);
        assert_eq!(table.expired(), 0);
        assert_eq!(live_slots(&table), 0);
    }

    #[test]
    fn test_rebase_does_not_touch_occupancy_or_count() {
        let mut table = FlowTable::new();

        let idx = table.process_flow(&key(1), 100).expect("insert");
        table.process_flow(&key(1), 101).expect("refresh");
        table.entries_mut()[idx].occupancy = Occupancy::Sent;

        table.advance_base_timestamp(200);

        let entry = table.entry(idx).expect("slot in range");
        assert_eq!(entry.occupancy, Occupancy::Sent);
        #[cfg(feature = "thresholding")]
        assert_eq!(entry.packet_count, 2);
    }

    #[test]
    fn test_live_count_matches_slot_scan() {
        let mut table = FlowTable::new();

        for i in 0..50u8 {
            table.process_flow(&key(i), 10).expect("insert");
        }
        table.process_flow(&key(0), EXPIRATION_SECONDS + 20).ok();

        assert_eq!(table.live() as usize, live_slots(&table));
    }

    #[test]
    fn test_counters_are_monotonic() {
        let mut table = FlowTable::with_hash_fn(constant_hash);

        let mut last_expired = 0;
        let mut last_dropped = 0;

        for t in 0..10 {
            for i in 0..40u8 {
                let _ = table.process_flow(&key(i), t * EXPIRATION_SECONDS);
            }
            assert!(table.expired() >= last_expired);
            assert!(table.dropped() >= last_dropped);
            last_expired = table.expired();
            last_dropped = table.dropped();
        }
    }

    #[test]
    fn test_no_duplicate_live_keys() {
        let mut table = FlowTable::with_hash_fn(constant_hash);
        let k = key(1);

        for t in 0..5 {
            table.process_flow(&k, t).expect("process");
        }

        let matching = table
            .entries()
            .iter()
            .filter(|e| e.occupancy.is_live() && e.key == k)
            .count();
        assert_eq!(matching, 1);
    }
}
