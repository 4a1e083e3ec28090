//! Per-realm accounting context.
//!
//! A realm owns one table registry behind the fast (spinning) lock and one
//! handle manager behind the slow (blocking) lock. No method holds both
//! locks at once: snapshots are produced under the fast lock as owned
//! [`Handle`] values and installed afterwards under the slow lock.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ipnet::Ipv4Net;
use tracing::{debug, info};

use crate::block::BlockPool;
use crate::config::AccountConfig;
use crate::error::Result;
use crate::handle::{HandleId, HandleManager, RecordSink};
use crate::packet::{PacketInfo, Verdict};
use crate::table::{Network, TableRef, TableRegistry};
use crate::trie::LeafCounter;

/// Identifier of an isolated accounting realm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RealmId(pub u64);

impl fmt::Display for RealmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tables, handles and both lock domains of one realm.
pub struct Realm {
    id: RealmId,
    config: AccountConfig,
    pool: Arc<BlockPool>,
    tables: spin::Mutex<TableRegistry>,
    handles: Mutex<HandleManager>,
}

impl Realm {
    /// Create a realm with validated configuration.
    pub fn new(id: RealmId, config: AccountConfig) -> Result<Self> {
        config.validate()?;
        let pool = BlockPool::new(config.max_blocks);
        let tables = TableRegistry::new(id, &config, Arc::clone(&pool));
        let handles = HandleManager::new(&config);

        info!(
            realm = %id,
            max_tables = config.max_tables,
            max_handles = config.max_handles,
            "Created accounting realm"
        );

        Ok(Realm {
            id,
            config,
            pool,
            tables: spin::Mutex::new(tables),
            handles: Mutex::new(handles),
        })
    }

    pub fn id(&self) -> RealmId {
        self.id
    }

    pub fn config(&self) -> &AccountConfig {
        &self.config
    }

    /// Counter blocks currently allocated by tables and handles.
    pub fn live_blocks(&self) -> usize {
        self.pool.live_blocks()
    }

    // Rule lifecycle

    /// Attach a rule to table `name` covering `base`/`mask`.
    pub fn attach(&self, name: &str, base: Ipv4Addr, mask: Ipv4Addr) -> Result<TableRef> {
        self.tables.lock().attach(name, Network::new(base, mask))
    }

    pub fn attach_net(&self, name: &str, net: Ipv4Net) -> Result<TableRef> {
        self.tables.lock().attach(name, Network::from(net))
    }

    pub fn detach(&self, table: TableRef) {
        let removed = self.tables.lock().detach(table);
        // Freed here, after the fast lock is released.
        drop(removed);
    }

    // Packet path

    /// Count one packet. Never fails and never drops the packet.
    pub fn count(&self, table: &TableRef, packet: &PacketInfo) -> Verdict {
        self.tables.lock().count(table, packet);
        Verdict::Continue
    }

    /// Count a raw IPv4 packet; unparseable packets are passed through.
    pub fn count_raw(&self, table: &TableRef, bytes: &[u8]) -> Verdict {
        match PacketInfo::parse(bytes) {
            Ok(packet) => self.count(table, &packet),
            Err(e) => {
                self.tables.lock().note_malformed(&e, bytes.len());
                Verdict::Continue
            }
        }
    }

    // Control path

    /// Copy a table into a new handle. Returns the handle and its item count.
    pub fn prepare_read(&self, name: &str) -> Result<(HandleId, u32)> {
        self.prepare(name, false)
    }

    /// Move a table's counters into a new handle and reset the table.
    pub fn prepare_read_flush(&self, name: &str) -> Result<(HandleId, u32)> {
        self.prepare(name, true)
    }

    fn prepare(&self, name: &str, flush: bool) -> Result<(HandleId, u32)> {
        let reservation = self.handles().reserve()?;

        let snapshot = {
            let mut tables = self.tables.lock();
            if flush {
                tables.snapshot_read_and_flush(name)
            } else {
                tables.snapshot_read(name)
            }
        };

        let mut handles = self.handles();
        match snapshot {
            Ok(handle) => {
                let items = handle.item_count();
                let id = handles.install(reservation, handle);
                debug!(realm = %self.id, table = %name, handle = %id, items, flush, "Prepared handle");
                Ok((id, items))
            }
            Err(e) => {
                handles.release(reservation);
                Err(e)
            }
        }
    }

    pub fn free_handle(&self, id: HandleId) -> Result<()> {
        self.handles().free(id)
    }

    /// Free every handle; returns how many were freed.
    pub fn free_all_handles(&self) -> usize {
        self.handles().free_all()
    }


    /// Export a handle's records into `sink`.
    pub fn get_data<S>(&self, id: HandleId, sink: &mut S) -> Result<u32>
    where
        S: RecordSink + ?Sized,
    {
        self.handles().export(id, sink)
    }

    /// Export a handle into `buf`, failing without writing if it is too small.
    pub fn get_data_into(&self, id: HandleId, buf: &mut [u8]) -> Result<usize> {
        self.handles().export_into(id, buf)
    }

    pub fn handle_usage(&self) -> u32 {
        self.handles().usage()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.lock().names()
    }

    /// Addresses currently counted in table `name`.
    pub fn table_item_count(&self, name: &str) -> Result<u32> {
        self.tables.lock().get(name).map(|t| t.item_count())
    }

    /// Rules currently attached to table `name`.
    pub fn table_refcount(&self, name: &str) -> Result<u32> {
        self.tables.lock().get(name).map(|t| t.refcount())
    }

    /// Counters of one address in table `name`, if it has been seen.
    pub fn table_counter(&self, name: &str, addr: Ipv4Addr) -> Result<Option<LeafCounter>> {
        let tables = self.tables.lock();
        let table = tables.get(name)?;
        let network = table.network();
        let addr = u32::from(addr);
        // A match-all table keeps everything under the unspecified address.
        if !network.contains(addr) || (network.is_match_all() && addr != 0) {
            return Ok(None);
        }
        Ok(table.trie().get(addr).filter(LeafCounter::is_occupied))
    }

    pub fn table_network(&self, name: &str) -> Result<Network> {
        self.tables.lock().get(name).map(|t| t.network())
    }

    fn handles(&self) -> MutexGuard<'_, HandleManager> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Realm")
            .field("id", &self.id)
            .field("live_blocks", &self.live_blocks())
            .finish_non_exhaustive()
    }
}

impl Drop for Realm {
    fn drop(&mut self) {
        let freed = self
            .handles
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .free_all();
        info!(realm = %self.id, freed_handles = freed, "Tearing down accounting realm");
    }
}
