//! Per-address IPv4 packet and byte accounting.
//!
//! Rules attach to named tables in a [`Realm`]; every packet a rule matches
//! is counted per source and destination address inside the table's
//! network. A privileged caller takes snapshots of a table as handles
//! (optionally flushing the live counters) and exports them as fixed-size
//! records.

pub mod block;
pub mod config;
pub mod control;
pub mod error;
pub mod handle;
pub mod packet;
mod ratelimit;
pub mod realm;
pub mod realms;
pub mod table;
pub mod trie;

pub use config::AccountConfig;
pub use error::{AccountError, Result};
pub use handle::{AccountRecord, HandleId, RECORD_SIZE};
pub use packet::{PacketInfo, Verdict};
pub use realm::{Realm, RealmId};
pub use realms::RealmRegistry;
pub use table::{Network, TableRef};
