//! Named accounting tables.
//!
//! The registry is a bounded slot array. A table is created by the first
//! rule that attaches its name, shared by every later rule attaching the same
//! name and network, and destroyed when the last rule detaches.
//!
//! All methods here run under the realm's fast lock. Nothing in this module
//! can reach the handle slots, so snapshot methods hand back owned
//! [`Handle`] values and the caller installs them after unlocking.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use tracing::{debug, warn};

use crate::block::BlockPool;
use crate::config::AccountConfig;
use crate::error::{AccountError, Result, SlotKind};
use crate::handle::Handle;
use crate::packet::PacketInfo;
use crate::ratelimit::RateLimit;
use crate::realm::RealmId;
use crate::trie::{CounterTrie, Depth};

/// The address range a table accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    base: Ipv4Addr,
    mask: Ipv4Addr,
}

impl Network {
    pub fn new(base: Ipv4Addr, mask: Ipv4Addr) -> Self {
        Network { base, mask }
    }

    /// Base address as configured (host bits are kept).
    pub fn base(&self) -> Ipv4Addr {
        self.base
    }

    pub fn mask(&self) -> Ipv4Addr {
        self.mask
    }

    /// Leading one bits of the mask.
    pub fn prefix_len(&self) -> u8 {
        u32::from(self.mask).leading_ones() as u8
    }

    /// Base address with host bits cleared.
    pub fn network_addr(&self) -> u32 {
        u32::from(self.base) & u32::from(self.mask)
    }

    /// The 0.0.0.0/0 network, which counts source traffic only.
    pub fn is_match_all(&self) -> bool {
        self.mask.is_unspecified()
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr & u32::from(self.mask) == self.network_addr()
    }

    pub fn depth(&self) -> Result<Depth> {
        Depth::from_prefix_len(self.prefix_len())
    }
}

impl From<Ipv4Net> for Network {
    fn from(net: Ipv4Net) -> Self {
        Network::new(net.addr(), net.netmask())
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.mask)
    }
}

/// Reference held by one attached rule.
///
/// Not `Clone`: each attach yields exactly one reference and detaching
/// consumes it, so a rule cannot release a table twice.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping a TableRef without detaching keeps the table alive"]
pub struct TableRef {
    realm: RealmId,
    index: usize,
    generation: u32,
}

impl TableRef {
    /// Slot index of the referenced table.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn realm(&self) -> RealmId {
        self.realm
    }
}

/// One live accounting table.
#[derive(Debug)]
pub struct NetworkTable {
    name: String,
    network: Network,
    refcount: u32,
    item_count: u32,
    trie: CounterTrie,
}

impl NetworkTable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn depth(&self) -> Depth {
        self.trie.depth()
    }

    /// Number of rules currently attached.
    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    /// Number of addresses with at least one counted packet.
    pub fn item_count(&self) -> u32 {
        self.item_count
    }

    pub fn trie(&self) -> &CounterTrie {
        &self.trie
    }
}

#[derive(Debug, Default)]
struct TableSlot {
    generation: u32,
    table: Option<NetworkTable>,
}

/// Bounded set of named tables for one realm.
pub struct TableRegistry {
    realm: RealmId,
    slots: Vec<TableSlot>,
    max_name_len: usize,
    pool: Arc<BlockPool>,
    oom_log: RateLimit,
    stale_log: RateLimit,
    malformed_log: RateLimit,
}

impl TableRegistry {
    pub fn new(realm: RealmId, config: &AccountConfig, pool: Arc<BlockPool>) -> Self {
        let mut slots = Vec::with_capacity(config.max_tables);
        slots.resize_with(config.max_tables, TableSlot::default);
        TableRegistry {
            realm,
            slots,
            max_name_len: config.max_name_len,
            pool,
            oom_log: RateLimit::new(config.oom_log_interval()),
            stale_log: RateLimit::new(config.oom_log_interval()),
            malformed_log: RateLimit::new(config.oom_log_interval()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of active tables.
    pub fn len(&self) -> usize {
        self.tables().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attach a rule to the table `name`, creating it on first use.
    pub fn attach(&mut self, name: &str, network: Network) -> Result<TableRef> {
        self.validate_name(name)?;

        if let Some(index) = self.position(name) {
            let slot = &mut self.slots[index];
            let Some(table) = slot.table.as_mut() else {
                return Err(AccountError::TableNotFound(name.to_string()));
            };
            if table.network != network {
                warn!(
                    %name,
                    existing = %table.network,
                    requested = %network,
                    "Table exists with a different network"
                );
                return Err(AccountError::ConfigConflict {
                    name: name.to_string(),
                    existing: table.network,
                    requested: network,
                });
            }
            table.refcount += 1;
            debug!(%name, index, refcount = table.refcount, "Attached to existing table");
            return Ok(TableRef {
                realm: self.realm,
                index,
                generation: slot.generation,
            });
        }

        let Some(index) = self.slots.iter().position(|slot| slot.table.is_none()) else {
            warn!(%name, capacity = self.slots.len(), "No free table slot");
            return Err(AccountError::CapacityExceeded {
                kind: SlotKind::Table,
                capacity: self.slots.len(),
            });
        };

        let depth = network.depth()?;
        let trie = CounterTrie::new(depth, &self.pool).inspect_err(|_| {
            warn!(%name, "Out of memory for table root block");
        })?;

        let slot = &mut self.slots[index];
        slot.table = Some(NetworkTable {
            name: name.to_string(),
            network,
            refcount: 1,
            item_count: 0,
            trie,
        });
        debug!(%name, %network, %depth, index, "Created table");

        Ok(TableRef {
            realm: self.realm,
            index,
            generation: slot.generation,
        })
    }

    /// Release one rule's reference.
    ///
    /// The last reference frees the slot and hands the table back, so the
    /// caller can drop its trie after releasing the fast lock.
    pub fn detach(&mut self, table: TableRef) -> Option<NetworkTable> {
        let Some(slot) = self.slot_mut(&table) else {
            warn!(index = table.index, realm = ?table.realm, "Detach of unknown table reference");
            return None;
        };
        let entry = slot.table.as_mut()?;

        entry.refcount -= 1;
        debug!(name = %entry.name, refcount = entry.refcount, "Detached from table");

        if entry.refcount > 0 {
            return None;
        }
        slot.generation = slot.generation.wrapping_add(1);
        let removed = slot.table.take();
        if let Some(entry) = &removed {
            debug!(name = %entry.name, index = table.index, "Removed table");
        }
        removed
    }

    /// Slot index of the table called `name`.
    pub fn lookup(&self, name: &str) -> Result<usize> {
        self.position(name)
            .ok_or_else(|| AccountError::TableNotFound(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Result<&NetworkTable> {
        let index = self.lookup(name)?;
        self.slots[index]
            .table
            .as_ref()
            .ok_or_else(|| AccountError::TableNotFound(name.to_string()))
    }

    /// The table a rule reference points at, if it is still live.
    pub fn resolve(&self, table: &TableRef) -> Option<&NetworkTable> {
        if table.realm != self.realm {
            return None;
        }
        let slot = self.slots.get(table.index)?;
        if slot.generation != table.generation {
            return None;
        }
        slot.table.as_ref()
    }

    /// Names of active tables, in slot order.
    pub fn names(&self) -> Vec<String> {
        self.tables().map(|t| t.name.clone()).collect()
    }

    /// Count one packet into the referenced table.
    pub fn count(&mut self, table: &TableRef, packet: &PacketInfo) {
        let realm = self.realm;
        let entry = self
            .slots
            .get_mut(table.index)
            .filter(|slot| table.realm == realm && slot.generation == table.generation)
            .and_then(|slot| slot.table.as_mut());

        let Some(entry) = entry else {
            if let Some(suppressed) = self.stale_log.check() {
                warn!(
                    index = table.index,
                    src = %packet.src,
                    dst = %packet.dst,
                    suppressed,
                    "Packet for invalid table reference"
                );
            }
            return;
        };

        let outcome = entry.trie.insert(
            &entry.network,
            u32::from(packet.src),
            u32::from(packet.dst),
            u32::from(packet.total_len),
        );
        entry.item_count += outcome.new_items;

        if outcome.dropped()
            && let Some(suppressed) = self.oom_log.check()
        {
            warn!(
                table = %entry.name,
                src = %packet.src,
                dst = %packet.dst,
                dropped_src = outcome.dropped_src,
                dropped_dst = outcome.dropped_dst,
                suppressed,
                "Out of memory, counter update dropped"
            );
        }
    }

    /// Log a raw packet whose IPv4 header could not be parsed.
    pub fn note_malformed(&mut self, error: &smoltcp::wire::Error, len: usize) {
        if let Some(suppressed) = self.malformed_log.check() {
            debug!(error = ?error, len, suppressed, "Failed to parse IPv4 header");
        }
    }

    /// Deep copy of a table's counters; the table is left untouched.
    pub fn snapshot_read(&self, name: &str) -> Result<Handle> {
        let table = self.get(name)?;
        let trie = table.trie.try_clone().inspect_err(|_| {
            warn!(%name, "Out of memory while copying table");
        })?;
        debug!(%name, items = table.item_count, "Copied table for read");
        Ok(Handle::new(table.network, table.item_count, trie))
    }

    /// Move a table's counters out and replace them with an empty trie.
    pub fn snapshot_read_and_flush(&mut self, name: &str) -> Result<Handle> {
        let index = self.lookup(name)?;
        let Some(table) = self.slots[index].table.as_mut() else {
            return Err(AccountError::TableNotFound(name.to_string()));
        };

        let fresh = CounterTrie::new(table.trie.depth(), &self.pool).inspect_err(|_| {
            warn!(%name, "Out of memory for flush root block");
        })?;
        let trie = std::mem::replace(&mut table.trie, fresh);
        let item_count = std::mem::take(&mut table.item_count);
        debug!(%name, items = item_count, "Flushed table");

        Ok(Handle::new(table.network, item_count, trie))
    }

    fn tables(&self) -> impl Iterator<Item = &NetworkTable> {
        self.slots.iter().filter_map(|slot| slot.table.as_ref())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.table.as_ref().is_some_and(|t| t.name == name))
    }

    fn slot_mut(&mut self, table: &TableRef) -> Option<&mut TableSlot> {
        if table.realm != self.realm {
            return None;
        }
        self.slots
            .get_mut(table.index)
            .filter(|slot| slot.generation == table.generation)
    }

    fn validate_name(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.len() > self.max_name_len || name.contains('\0') {
            return Err(AccountError::InvalidTableName(name.to_string()));
        }
        Ok(())
    }
}

impl fmt::Debug for TableRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableRegistry")
            .field("realm", &self.realm)
            .field("tables", &self.names())
            .field("capacity", &self.slots.len())
            .finish()
    }
}
