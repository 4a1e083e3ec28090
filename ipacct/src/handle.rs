//! Snapshot handles and record export.
//!
//! A handle owns a counter trie that no table references any more, either a
//! deep copy or the trie moved out by a flush. Handles live in a fixed slot
//! array guarded by the realm's slow lock. Slots go through a `Reserved`
//! state while a snapshot is being produced under the fast lock, so a full
//! handle table is detected before any counters are moved.

use std::net::Ipv4Addr;

use tracing::{debug, warn};

use crate::config::AccountConfig;
use crate::error::{AccountError, Result, SlotKind};
use crate::table::Network;
use crate::trie::{CounterTrie, Depth, LeafCounter};

/// Size of one exported record on the wire.
pub const RECORD_SIZE: usize = 36;

/// One exported per-address counter record.
///
/// Wire layout, packed and native-endian: address (u32, host order),
/// src_packets, src_bytes, dst_packets, dst_bytes (u64 each).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountRecord {
    pub address: Ipv4Addr,
    pub src_packets: u64,
    pub src_bytes: u64,
    pub dst_packets: u64,
    pub dst_bytes: u64,
}

impl AccountRecord {
    pub fn new(address: u32, leaf: &LeafCounter) -> Self {
        AccountRecord {
            address: Ipv4Addr::from(address),
            src_packets: leaf.src_packets,
            src_bytes: leaf.src_bytes,
            dst_packets: leaf.dst_packets,
            dst_bytes: leaf.dst_bytes,
        }
    }

    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[0..4].copy_from_slice(&u32::from(self.address).to_ne_bytes());
        out[4..12].copy_from_slice(&self.src_packets.to_ne_bytes());
        out[12..20].copy_from_slice(&self.src_bytes.to_ne_bytes());
        out[20..28].copy_from_slice(&self.dst_packets.to_ne_bytes());
        out[28..36].copy_from_slice(&self.dst_bytes.to_ne_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; RECORD_SIZE]) -> Self {
        let u64_at = |at: usize| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[at..at + 8]);
            u64::from_ne_bytes(word)
        };
        AccountRecord {
            address: Ipv4Addr::from(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            src_packets: u64_at(4),
            src_bytes: u64_at(12),
            dst_packets: u64_at(20),
            dst_bytes: u64_at(28),
        }
    }

    /// Decode a buffer holding a whole number of records.
    pub fn decode_all(bytes: &[u8]) -> Result<Vec<AccountRecord>> {
        if bytes.len() % RECORD_SIZE != 0 {
            return Err(AccountError::SizeMismatch {
                expected: bytes.len().next_multiple_of(RECORD_SIZE),
                actual: bytes.len(),
            });
        }
        Ok(bytes
            .chunks_exact(RECORD_SIZE)
            .filter_map(|chunk| <&[u8; RECORD_SIZE]>::try_from(chunk).ok())
            .map(AccountRecord::from_bytes)
            .collect())
    }
}

/// Destination for exported record bytes.
pub trait RecordSink {
    /// Accept a batch of whole records.
    fn write_records(&mut self, bytes: &[u8]) -> Result<()>;
}

impl RecordSink for Vec<u8> {
    fn write_records(&mut self, bytes: &[u8]) -> Result<()> {
        self.try_reserve(bytes.len())
            .map_err(|_| AccountError::OutOfMemory)?;
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Sink writing into a caller-provided buffer.
#[derive(Debug)]
pub struct SliceSink<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> SliceSink<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        SliceSink { buf, pos: 0 }
    }

    /// Bytes written so far.
    pub fn written(&self) -> usize {
        self.pos
    }
}

impl RecordSink for SliceSink<'_> {
    fn write_records(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.pos + bytes.len();
        let Some(dst) = self.buf.get_mut(self.pos..end) else {
            return Err(AccountError::SizeMismatch {
                expected: end,
                actual: self.buf.len(),
            });
        };
        dst.copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }
}

/// A snapshot of one table, owned by a handle slot.
#[derive(Debug)]
pub struct Handle {
    network: Network,
    item_count: u32,
    trie: CounterTrie,
}

impl Handle {
    pub(crate) fn new(network: Network, item_count: u32, trie: CounterTrie) -> Self {
        Handle {
            network,
            item_count,
            trie,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Base address used to rebuild exported addresses.
    pub fn base(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network.network_addr())
    }

    pub fn depth(&self) -> Depth {
        self.trie.depth()
    }

    /// Number of records an export of this handle produces.
    pub fn item_count(&self) -> u32 {
        self.item_count
    }

    pub fn trie(&self) -> &CounterTrie {
        &self.trie
    }
}

/// Index of a handle slot, as exchanged with the control caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub u32);

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Default)]
enum HandleSlot {
    #[default]
    Empty,
    Reserved,
    Occupied(Handle),
}

/// A handle slot claimed for a snapshot still being produced.
///
/// Must be passed to [`HandleManager::install`] or
/// [`HandleManager::release`]; it cannot be copied.
#[derive(Debug)]
#[must_use = "a reserved handle slot stays unusable until installed or released"]
pub struct SlotReservation {
    index: usize,
}

/// Fixed-capacity handle slots plus the export scratch buffer.
#[derive(Debug)]
pub struct HandleManager {
    slots: Vec<HandleSlot>,
    scratch: Vec<u8>,
    export_buffer_size: usize,
}

impl HandleManager {
    pub fn new(config: &AccountConfig) -> Self {
        let mut slots = Vec::with_capacity(config.max_handles);
        slots.resize_with(config.max_handles, HandleSlot::default);
        HandleManager {
            slots,
            scratch: Vec::with_capacity(config.export_buffer_size),
            export_buffer_size: config.export_buffer_size,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim the first empty slot.
    pub fn reserve(&mut self) -> Result<SlotReservation> {
        let index = self
            .slots
            .iter()
            .position(|slot| matches!(slot, HandleSlot::Empty))
            .ok_or(AccountError::CapacityExceeded {
                kind: SlotKind::Handle,
                capacity: self.slots.len(),
            })?;
        self.slots[index] = HandleSlot::Reserved;
        Ok(SlotReservation { index })
    }

    /// Store a finished snapshot in its reserved slot.
    pub fn install(&mut self, reservation: SlotReservation, handle: Handle) -> HandleId {
        let id = HandleId(reservation.index as u32);
        debug!(handle = %id, items = handle.item_count, "Installed handle");
        self.slots[reservation.index] = HandleSlot::Occupied(handle);
        id
    }

    /// Give a reserved slot back after a failed snapshot.
    pub fn release(&mut self, reservation: SlotReservation) {
        self.slots[reservation.index] = HandleSlot::Empty;
    }

    /// Free one handle. Freeing an empty or reserved slot does nothing.
    ///
    /// A reserved slot belongs to a snapshot in flight and is only given
    /// back through [`install`](Self::install) or [`release`](Self::release).
    pub fn free(&mut self, id: HandleId) -> Result<()> {
        let slot = self
            .slots
            .get_mut(id.0 as usize)
            .ok_or(AccountError::HandleNotFound(id.0))?;
        if !matches!(slot, HandleSlot::Occupied(_)) {
            return Ok(());
        }
        if let HandleSlot::Occupied(handle) = std::mem::take(slot) {
            debug!(handle = %id, items = handle.item_count, "Freed handle");
        }
        Ok(())
    }

    /// Free every occupied slot and return how many there were.
    ///
    /// Reserved slots are left alone; their owner installs or releases them.
    pub fn free_all(&mut self) -> usize {
        let mut freed = 0;
        for slot in &mut self.slots {
            if matches!(slot, HandleSlot::Occupied(_)) {
                *slot = HandleSlot::Empty;
                freed += 1;
            }
        }
        if freed > 0 {
            debug!(freed, "Freed all handles");
        }
        freed
    }

    /// Number of occupied slots.
    pub fn usage(&self) -> u32 {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, HandleSlot::Occupied(_)))
            .count() as u32
    }

    pub fn get(&self, id: HandleId) -> Result<&Handle> {
        match self.slots.get(id.0 as usize) {
            Some(HandleSlot::Occupied(handle)) => Ok(handle),
            _ => Err(AccountError::HandleNotFound(id.0)),
        }
    }

    /// Write every record of a handle to `sink` in ascending address order.
    ///
    /// Records are batched in the scratch buffer and handed to the sink each
    /// time the next record would not fit, then once more at the end.
    /// Returns the number of records written.
    pub fn export<S>(&mut self, id: HandleId, sink: &mut S) -> Result<u32>
    where
        S: RecordSink + ?Sized,
    {
        let handle = match self.slots.get(id.0 as usize) {
            Some(HandleSlot::Occupied(handle)) => handle,
            _ => return Err(AccountError::HandleNotFound(id.0)),
        };
        let scratch = &mut self.scratch;
        let limit = self.export_buffer_size;
        scratch.clear();

        let mut records = 0u32;
        let result = handle
            .trie
            .for_each_record(handle.network.network_addr(), |addr, leaf| {
                if scratch.len() + RECORD_SIZE > limit {
                    sink.write_records(scratch)?;
                    scratch.clear();
                }
                scratch.extend_from_slice(&AccountRecord::new(addr, leaf).to_bytes());
                records += 1;
                Ok(())
            })
            .and_then(|()| {
                if scratch.is_empty() {
                    Ok(())
                } else {
                    sink.write_records(scratch)
                }
            });
        scratch.clear();
        result?;

        debug!(handle = %id, records, "Exported handle");
        Ok(records)
    }

    /// Export a handle into `buf`, which must hold every record.
    ///
    /// The size check and the export happen under the same borrow, so `buf`
    /// is left untouched when it is too small. Returns the bytes written.
    pub fn export_into(&mut self, id: HandleId, buf: &mut [u8]) -> Result<usize> {
        let needed = self.get(id)?.item_count as usize * RECORD_SIZE;
        if buf.len() < needed {
            warn!(handle = %id, len = buf.len(), needed, "Buffer too small for handle data");
            return Err(AccountError::SizeMismatch {
                expected: needed,
                actual: buf.len(),
            });
        }
        let mut sink = SliceSink::new(buf);
        self.export(id, &mut sink)?;
        Ok(sink.written())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockPool;

    fn network(s: &str) -> Network {
        Network::from(s.parse::<ipnet::Ipv4Net>().unwrap())
    }

    fn ip(s: &str) -> u32 {
        u32::from(s.parse::<Ipv4Addr>().unwrap())
    }

    fn handle_with(net: &str, addrs: &[&str]) -> Handle {
        let pool = BlockPool::new(None);
        let net = network(net);
        let mut trie = CounterTrie::new(net.depth().unwrap(), &pool).unwrap();
        let mut items = 0;
        for addr in addrs {
            items += trie.insert(&net, ip(addr), 0, 100).new_items;
        }
        Handle::new(net, items, trie)
    }

    /// Sink that records the size of every batch it receives.
    #[derive(Default)]
    struct BatchSink {
        data: Vec<u8>,
        batches: Vec<usize>,
    }

    impl RecordSink for BatchSink {
        fn write_records(&mut self, bytes: &[u8]) -> Result<()> {
            self.batches.push(bytes.len());
            self.data.extend_from_slice(bytes);
            Ok(())
        }
    }

    #[test]
    fn test_record_wire_layout() {
        let record = AccountRecord {
            address: Ipv4Addr::new(10, 0, 0, 5),
            src_packets: 1,
            src_bytes: 100,
            dst_packets: 1,
            dst_bytes: 50,
        };
        let bytes = record.to_bytes();
        assert_eq!(&bytes[0..4], &0x0a00_0005u32.to_ne_bytes());
        assert_eq!(&bytes[12..20], &100u64.to_ne_bytes());
        assert_eq!(AccountRecord::decode_all(&bytes).unwrap(), [record]);
        assert!(matches!(
            AccountRecord::decode_all(&bytes[..35]),
            Err(AccountError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_reserve_until_full() {
        let config = AccountConfig {
            max_handles: 2,
            ..Default::default()
        };
        let mut mgr = HandleManager::new(&config);

        let a = mgr.reserve().unwrap();
        let b = mgr.reserve().unwrap();
        assert!(matches!(
            mgr.reserve(),
            Err(AccountError::CapacityExceeded {
                kind: SlotKind::Handle,
                capacity: 2
            })
        ));
        // Reserved slots are not counted as in use.
        assert_eq!(mgr.usage(), 0);

        mgr.release(a);
        let id = mgr.install(b, handle_with("10.0.0.0/24", &["10.0.0.1"]));
        assert_eq!(id, HandleId(1));
        assert_eq!(mgr.usage(), 1);
        assert_eq!(mgr.reserve().unwrap().index, 0);
    }

    #[test]
    fn test_free_semantics() {
        let mut mgr = HandleManager::new(&AccountConfig::default());

        // Empty slot: no-op.
        assert!(mgr.free(HandleId(3)).is_ok());
        // Outside the slot array.
        assert!(matches!(
            mgr.free(HandleId(10)),
            Err(AccountError::HandleNotFound(10))
        ));

        let slot = mgr.reserve().unwrap();
        let id = mgr.install(slot, handle_with("10.0.0.0/24", &["10.0.0.1"]));
        mgr.free(id).unwrap();
        assert_eq!(mgr.usage(), 0);
        assert!(mgr.free(id).is_ok());
        assert!(matches!(mgr.get(id), Err(AccountError::HandleNotFound(0))));
    }

    #[test]
    fn test_free_leaves_reserved_slot_alone() {
        let mut mgr = HandleManager::new(&AccountConfig::default());

        let in_flight = mgr.reserve().unwrap();
        assert_eq!(in_flight.index, 0);
        // A stray free of the in-flight slot must not hand it out again.
        mgr.free(HandleId(0)).unwrap();
        let next = mgr.reserve().unwrap();
        assert_eq!(next.index, 1);

        let first = mgr.install(in_flight, handle_with("10.0.0.0/24", &["10.0.0.1"]));
        let second = mgr.install(next, handle_with("10.0.1.0/24", &["10.0.1.1", "10.0.1.2"]));
        assert_ne!(first, second);
        assert_eq!(mgr.usage(), 2);
        assert_eq!(mgr.get(first).unwrap().item_count(), 1);
        assert_eq!(mgr.get(second).unwrap().item_count(), 2);
    }

    #[test]
    fn test_free_releases_blocks() {
        let pool = BlockPool::new(None);
        let net = network("10.0.0.0/16");
        let mut trie = CounterTrie::new(Depth::One, &pool).unwrap();
        trie.insert(&net, ip("10.0.1.1"), ip("10.0.2.2"), 1);
        assert_eq!(pool.live_blocks(), 3);

        let mut mgr = HandleManager::new(&AccountConfig::default());
        let slot = mgr.reserve().unwrap();
        let id = mgr.install(slot, Handle::new(net, 2, trie));
        mgr.free(id).unwrap();
        assert_eq!(pool.live_blocks(), 0);
    }

    #[test]
    fn test_free_all_keeps_reservations() {
        let mut mgr = HandleManager::new(&AccountConfig::default());
        for _ in 0..3 {
            let slot = mgr.reserve().unwrap();
            mgr.install(slot, handle_with("10.0.0.0/24", &["10.0.0.1"]));
        }
        let pending = mgr.reserve().unwrap();

        assert_eq!(mgr.free_all(), 3);
        assert_eq!(mgr.usage(), 0);
        assert_eq!(mgr.free_all(), 0);

        let id = mgr.install(pending, handle_with("10.0.0.0/24", &[]));
        assert_eq!(id, HandleId(3));
    }

    #[test]
    fn test_export_ascending_with_base() {
        let mut mgr = HandleManager::new(&AccountConfig::default());
        let slot = mgr.reserve().unwrap();
        let id = mgr.install(
            slot,
            handle_with("172.16.0.0/12", &["172.20.1.1", "172.16.0.9", "172.31.255.255"]),
        );

        let mut out = Vec::new();
        assert_eq!(mgr.export(id, &mut out).unwrap(), 3);
        let records = AccountRecord::decode_all(&out).unwrap();
        let addrs: Vec<_> = records.iter().map(|r| r.address.to_string()).collect();
        assert_eq!(addrs, ["172.16.0.9", "172.20.1.1", "172.31.255.255"]);
        assert!(records.iter().all(|r| r.src_packets == 1 && r.src_bytes == 100));
    }

    #[test]
    fn test_export_batches_through_scratch() {
        let config = AccountConfig {
            export_buffer_size: 2 * RECORD_SIZE + 10,
            ..Default::default()
        };
        let mut mgr = HandleManager::new(&config);
        let addrs: Vec<String> = (1..=5).map(|i| format!("10.0.0.{i}")).collect();
        let addrs: Vec<&str> = addrs.iter().map(String::as_str).collect();
        let slot = mgr.reserve().unwrap();
        let id = mgr.install(slot, handle_with("10.0.0.0/24", &addrs));

        let mut sink = BatchSink::default();
        assert_eq!(mgr.export(id, &mut sink).unwrap(), 5);
        assert_eq!(
            sink.batches,
            [2 * RECORD_SIZE, 2 * RECORD_SIZE, RECORD_SIZE]
        );
        assert_eq!(sink.data.len(), 5 * RECORD_SIZE);
    }

    #[test]
    fn test_export_into_short_slice() {
        let mut mgr = HandleManager::new(&AccountConfig::default());
        let slot = mgr.reserve().unwrap();
        let id = mgr.install(slot, handle_with("10.0.0.0/24", &["10.0.0.1", "10.0.0.2"]));

        let mut buf = [0u8; RECORD_SIZE];
        let mut sink = SliceSink::new(&mut buf);
        assert!(matches!(
            mgr.export(id, &mut sink),
            Err(AccountError::SizeMismatch { expected: 72, actual: 36 })
        ));

        let mut buf = [0u8; 2 * RECORD_SIZE];
        let mut sink = SliceSink::new(&mut buf);
        assert_eq!(mgr.export(id, &mut sink).unwrap(), 2);
        assert_eq!(sink.written(), 2 * RECORD_SIZE);
    }

    #[test]
    fn test_export_into_rejects_short_buffer_untouched() {
        let mut mgr = HandleManager::new(&AccountConfig::default());
        let slot = mgr.reserve().unwrap();
        let id = mgr.install(slot, handle_with("10.0.0.0/24", &["10.0.0.1", "10.0.0.2"]));

        let mut short = [0xAAu8; RECORD_SIZE + 10];
        assert!(matches!(
            mgr.export_into(id, &mut short),
            Err(AccountError::SizeMismatch { expected: 72, actual: 46 })
        ));
        assert!(short.iter().all(|&b| b == 0xAA));

        let mut buf = [0u8; 3 * RECORD_SIZE];
        assert_eq!(mgr.export_into(id, &mut buf).unwrap(), 2 * RECORD_SIZE);
        let records = AccountRecord::decode_all(&buf[..2 * RECORD_SIZE]).unwrap();
        assert_eq!(u32::from(records[0].address), ip("10.0.0.1"));
        assert_eq!(u32::from(records[1].address), ip("10.0.0.2"));
    }

    #[test]
    fn test_export_unknown_handle() {
        let mut mgr = HandleManager::new(&AccountConfig::default());
        let mut out = Vec::new();
        assert!(matches!(
            mgr.export(HandleId(0), &mut out),
            Err(AccountError::HandleNotFound(0))
        ));
        let pending = mgr.reserve().unwrap();
        assert!(mgr.export(HandleId(0), &mut out).is_err());
        mgr.release(pending);
    }
}
