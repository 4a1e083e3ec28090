//! Error types for ipacct.

use nix::errno::Errno;
use thiserror::Error;

use crate::table::Network;

/// Which bounded slot array ran out of room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Table,
    Handle,
}

impl std::fmt::Display for SlotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotKind::Table => write!(f, "table"),
            SlotKind::Handle => write!(f, "handle"),
        }
    }
}

/// Errors returned by registry, handle and control operations.
///
/// The packet path never returns these; it logs and continues.
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("table {name} already exists for {existing}, requested {requested}")]
    ConfigConflict {
        name: String,
        existing: Network,
        requested: Network,
    },

    #[error("prefix length /{0} is not supported, at least /8 (or /0) required")]
    UnsupportedPrefix(u8),

    #[error("invalid table name: {0:?}")]
    InvalidTableName(String),

    #[error("no free {kind} slot (capacity {capacity})")]
    CapacityExceeded { kind: SlotKind, capacity: usize },

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("handle not found: {0}")]
    HandleNotFound(u32),

    #[error("out of memory for counter block")]
    OutOfMemory,

    #[error("buffer size mismatch: need {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("operation requires CAP_NET_ADMIN")]
    PermissionDenied,

    #[error("unknown control command {0}")]
    UnknownCommand(i32),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cannot read configuration: {0}")]
    ConfigIo(#[source] std::io::Error),

    #[error("cannot parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl AccountError {
    /// Errno reported to callers of the control transport.
    pub fn errno(&self) -> Errno {
        match self {
            AccountError::ConfigConflict { .. }
            | AccountError::UnsupportedPrefix(_)
            | AccountError::InvalidTableName(_)
            | AccountError::UnknownCommand(_)
            | AccountError::InvalidConfig(_)
            | AccountError::ConfigParse(_) => Errno::EINVAL,
            AccountError::CapacityExceeded { .. } => Errno::ENOSPC,
            AccountError::TableNotFound(_) | AccountError::HandleNotFound(_) => Errno::ENOENT,
            AccountError::OutOfMemory => Errno::ENOMEM,
            AccountError::SizeMismatch { .. } => Errno::EMSGSIZE,
            AccountError::PermissionDenied => Errno::EPERM,
            AccountError::ConfigIo(e) => e
                .raw_os_error()
                .map(Errno::from_raw)
                .unwrap_or(Errno::EIO),
        }
    }

    /// True for the unknown-table and unknown-handle cases.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            AccountError::TableNotFound(_) | AccountError::HandleNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AccountError>;
