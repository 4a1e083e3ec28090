//! Byte-level control protocol.
//!
//! Mirrors a get/set socket-option interface: `set` commands carry input
//! bytes only, `get` commands read a request from the front of the caller's
//! buffer and write the response back into it. Every command checks the
//! caller's privilege first, then validates buffer sizes before any data is
//! read or written.

use std::fmt;

use tracing::{debug, warn};

use crate::error::{AccountError, Result};
use crate::handle::HandleId;
use crate::realm::Realm;

/// First command number of the accounting control range.
pub const SO_ACCOUNT_BASE_CTL: i32 = 90;

/// Size of the NUL-padded table name field on the wire.
pub const TABLE_NAME_LEN: usize = 32;

/// Size of an encoded [`HandleRequest`].
pub const HANDLE_REQUEST_SIZE: usize = 4 + TABLE_NAME_LEN + 4;

/// Largest table-name list a single request may return.
pub const TABLE_NAMES_LIMIT: usize = 4096;

/// Commands accepted by [`set_ctl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SetCommand {
    FreeHandle = SO_ACCOUNT_BASE_CTL + 1,
    FreeAllHandles = SO_ACCOUNT_BASE_CTL + 2,
}

impl SetCommand {
    pub const ALL: [SetCommand; 2] = [SetCommand::FreeHandle, SetCommand::FreeAllHandles];
}

impl TryFrom<i32> for SetCommand {
    type Error = AccountError;

    fn try_from(cmd: i32) -> Result<Self> {
        SetCommand::ALL
            .into_iter()
            .find(|c| *c as i32 == cmd)
            .ok_or(AccountError::UnknownCommand(cmd))
    }
}

/// Commands accepted by [`get_ctl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum GetCommand {
    PrepareRead = SO_ACCOUNT_BASE_CTL + 4,
    PrepareReadFlush = SO_ACCOUNT_BASE_CTL + 5,
    GetData = SO_ACCOUNT_BASE_CTL + 6,
    GetHandleUsage = SO_ACCOUNT_BASE_CTL + 7,
    GetTableNames = SO_ACCOUNT_BASE_CTL + 8,
}

impl GetCommand {
    pub const ALL: [GetCommand; 5] = [
        GetCommand::PrepareRead,
        GetCommand::PrepareReadFlush,
        GetCommand::GetData,
        GetCommand::GetHandleUsage,
        GetCommand::GetTableNames,
    ];
}

impl TryFrom<i32> for GetCommand {
    type Error = AccountError;

    fn try_from(cmd: i32) -> Result<Self> {
        GetCommand::ALL
            .into_iter()
            .find(|c| *c as i32 == cmd)
            .ok_or(AccountError::UnknownCommand(cmd))
    }
}

/// Request and response record for handle commands.
///
/// Wire layout, native-endian: handle_nr (u32), name ([u8; 32] NUL-padded),
/// itemcount (u32).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleRequest {
    pub handle_nr: u32,
    pub name: String,
    pub item_count: u32,
}

impl HandleRequest {
    pub fn for_table(name: &str) -> Self {
        HandleRequest {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn for_handle(id: HandleId) -> Self {
        HandleRequest {
            handle_nr: id.0,
            ..Default::default()
        }
    }

    /// Decode from the first [`HANDLE_REQUEST_SIZE`] bytes of `bytes`.
    ///
    /// The name ends at the first NUL; the last byte of the field is always
    /// treated as a terminator.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let Some(bytes) = bytes.get(..HANDLE_REQUEST_SIZE) else {
            return Err(AccountError::SizeMismatch {
                expected: HANDLE_REQUEST_SIZE,
                actual: bytes.len(),
            });
        };
        let word = |at: usize| u32::from_ne_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);

        let field = &bytes[4..4 + TABLE_NAME_LEN - 1];
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        let name = std::str::from_utf8(&field[..end])
            .map_err(|_| AccountError::InvalidTableName(String::from_utf8_lossy(&field[..end]).into_owned()))?
            .to_string();

        Ok(HandleRequest {
            handle_nr: word(0),
            name,
            item_count: word(4 + TABLE_NAME_LEN),
        })
    }

    pub fn encode(&self) -> Result<[u8; HANDLE_REQUEST_SIZE]> {
        if self.name.len() >= TABLE_NAME_LEN || self.name.contains('\0') {
            return Err(AccountError::InvalidTableName(self.name.clone()));
        }
        let mut out = [0u8; HANDLE_REQUEST_SIZE];
        out[..4].copy_from_slice(&self.handle_nr.to_ne_bytes());
        out[4..4 + self.name.len()].copy_from_slice(self.name.as_bytes());
        out[4 + TABLE_NAME_LEN..].copy_from_slice(&self.item_count.to_ne_bytes());
        Ok(out)
    }
}

/// Privilege check for control callers.
pub trait Caller {
    /// Whether the caller holds network administration privilege.
    fn has_net_admin(&self) -> bool;
}

/// Fixed privilege level, for transports that authenticate up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    NetAdmin,
    Unprivileged,
}

impl Caller for Privilege {
    fn has_net_admin(&self) -> bool {
        matches!(self, Privilege::NetAdmin)
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Privilege::NetAdmin => write!(f, "net-admin"),
            Privilege::Unprivileged => write!(f, "unprivileged"),
        }
    }
}

fn check_privilege<C: Caller + ?Sized>(caller: &C, cmd: i32) -> Result<()> {
    if caller.has_net_admin() {
        return Ok(());
    }
    warn!(cmd, "Control request without privilege");
    Err(AccountError::PermissionDenied)
}

fn require_len(actual: usize, expected: usize) -> Result<()> {
    if actual < expected {
        return Err(AccountError::SizeMismatch { expected, actual });
    }
    Ok(())
}

/// Handle a `set` command.
pub fn set_ctl<C: Caller + ?Sized>(realm: &Realm, caller: &C, cmd: i32, data: &[u8]) -> Result<()> {
    check_privilege(caller, cmd)?;

    match SetCommand::try_from(cmd)? {
        SetCommand::FreeHandle => {
            if data.len() != HANDLE_REQUEST_SIZE {
                warn!(len = data.len(), expected = HANDLE_REQUEST_SIZE, "Wrong free-handle request size");
                return Err(AccountError::SizeMismatch {
                    expected: HANDLE_REQUEST_SIZE,
                    actual: data.len(),
                });
            }
            let request = HandleRequest::decode(data)?;
            realm.free_handle(HandleId(request.handle_nr))
        }
        SetCommand::FreeAllHandles => {
            realm.free_all_handles();
            Ok(())
        }
    }
}

/// Handle a `get` command. Returns the number of bytes written to `buf`.
pub fn get_ctl<C: Caller + ?Sized>(realm: &Realm, caller: &C, cmd: i32, buf: &mut [u8]) -> Result<usize> {
    check_privilege(caller, cmd)?;
    let command = GetCommand::try_from(cmd)?;

    match command {
        GetCommand::PrepareRead | GetCommand::PrepareReadFlush => {
            require_len(buf.len(), HANDLE_REQUEST_SIZE)?;
            let request = HandleRequest::decode(buf)?;
            let (id, item_count) = if command == GetCommand::PrepareReadFlush {
                realm.prepare_read_flush(&request.name)?
            } else {
                realm.prepare_read(&request.name)?
            };
            let response = HandleRequest {
                handle_nr: id.0,
                item_count,
                ..request
            };
            write_request(buf, &response)
        }
        GetCommand::GetData => {
            require_len(buf.len(), HANDLE_REQUEST_SIZE)?;
            let request = HandleRequest::decode(buf)?;
            let id = HandleId(request.handle_nr);
            let written = realm.get_data_into(id, buf)?;
            debug!(handle = %id, bytes = written, "Copied handle data");
            Ok(written)
        }
        GetCommand::GetHandleUsage => {
            require_len(buf.len(), HANDLE_REQUEST_SIZE)?;
            let request = HandleRequest::decode(buf)?;
            let response = HandleRequest {
                item_count: realm.handle_usage(),
                ..request
            };
            write_request(buf, &response)
        }
        GetCommand::GetTableNames => {
            let list = encode_table_names(&realm.table_names());
            if list.len() > TABLE_NAMES_LIMIT || buf.len() < list.len() {
                warn!(len = buf.len(), size = list.len(), "Not enough space for table names");
                return Err(AccountError::SizeMismatch {
                    expected: list.len(),
                    actual: buf.len(),
                });
            }
            buf[..list.len()].copy_from_slice(&list);
            Ok(list.len())
        }
    }
}

fn write_request(buf: &mut [u8], response: &HandleRequest) -> Result<usize> {
    let bytes = response.encode()?;
    buf[..HANDLE_REQUEST_SIZE].copy_from_slice(&bytes);
    Ok(HANDLE_REQUEST_SIZE)
}

/// Encode names as NUL-terminated strings followed by one more NUL.
pub fn encode_table_names<S: AsRef<str>>(names: &[S]) -> Vec<u8> {
    let size = names.iter().map(|n| n.as_ref().len() + 1).sum::<usize>() + 1;
    let mut out = Vec::with_capacity(size);
    for name in names {
        out.extend_from_slice(name.as_ref().as_bytes());
        out.push(0);
    }
    out.push(0);
    out
}

/// Split a NUL-separated table-name list.
pub fn decode_table_names(bytes: &[u8]) -> Vec<String> {
    bytes
        .split(|&b| b == 0)
        .take_while(|name| !name.is_empty())
        .map(|name| String::from_utf8_lossy(name).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccountConfig;
    use crate::realm::RealmId;

    fn realm() -> Realm {
        Realm::new(RealmId(1), AccountConfig::default()).unwrap()
    }

    #[test]
    fn test_command_numbers() {
        assert_eq!(SetCommand::FreeHandle as i32, 91);
        assert_eq!(SetCommand::FreeAllHandles as i32, 92);
        assert_eq!(GetCommand::PrepareRead as i32, 94);
        assert_eq!(GetCommand::GetTableNames as i32, 98);
        assert_eq!(GetCommand::try_from(96).unwrap(), GetCommand::GetData);
        assert!(matches!(
            SetCommand::try_from(93),
            Err(AccountError::UnknownCommand(93))
        ));
    }

    #[test]
    fn test_command_decoding_follows_discriminants() {
        for cmd in SetCommand::ALL {
            assert_eq!(SetCommand::try_from(cmd as i32).unwrap(), cmd);
            assert!(GetCommand::try_from(cmd as i32).is_err());
        }
        for cmd in GetCommand::ALL {
            assert_eq!(GetCommand::try_from(cmd as i32).unwrap(), cmd);
            assert!(SetCommand::try_from(cmd as i32).is_err());
        }
        for unused in [SO_ACCOUNT_BASE_CTL, SO_ACCOUNT_BASE_CTL + 3, SO_ACCOUNT_BASE_CTL + 9] {
            assert!(SetCommand::try_from(unused).is_err());
            assert!(GetCommand::try_from(unused).is_err());
        }
    }

    #[test]
    fn test_handle_request_layout() {
        let request = HandleRequest {
            handle_nr: 3,
            name: "lan".into(),
            item_count: 17,
        };
        let bytes = request.encode().unwrap();
        assert_eq!(bytes.len(), 40);
        assert_eq!(&bytes[0..4], &3u32.to_ne_bytes());
        assert_eq!(&bytes[4..8], b"lan\0");
        assert_eq!(&bytes[36..40], &17u32.to_ne_bytes());
        assert_eq!(HandleRequest::decode(&bytes).unwrap(), request);
    }

    #[test]
    fn test_decode_unterminated_name() {
        let mut bytes = [b'a'; HANDLE_REQUEST_SIZE];
        bytes[..4].copy_from_slice(&0u32.to_ne_bytes());
        let request = HandleRequest::decode(&bytes).unwrap();
        assert_eq!(request.name.len(), TABLE_NAME_LEN - 1);

        assert!(matches!(
            HandleRequest::decode(&bytes[..39]),
            Err(AccountError::SizeMismatch {
                expected: 40,
                actual: 39
            })
        ));
        assert!(HandleRequest::for_table(&"x".repeat(32)).encode().is_err());
    }

    #[test]
    fn test_privilege_checked_first() {
        let realm = realm();
        assert!(matches!(
            set_ctl(&realm, &Privilege::Unprivileged, 91, &[]),
            Err(AccountError::PermissionDenied)
        ));
        assert!(matches!(
            get_ctl(&realm, &Privilege::Unprivileged, 12345, &mut []),
            Err(AccountError::PermissionDenied)
        ));
        assert!(matches!(
            get_ctl(&realm, &Privilege::NetAdmin, 12345, &mut []),
            Err(AccountError::UnknownCommand(12345))
        ));
    }

    #[test]
    fn test_free_handle_requires_exact_size() {
        let realm = realm();
        let mut data = HandleRequest::for_handle(HandleId(0)).encode().unwrap().to_vec();
        assert!(set_ctl(&realm, &Privilege::NetAdmin, 91, &data).is_ok());

        data.push(0);
        assert!(matches!(
            set_ctl(&realm, &Privilege::NetAdmin, 91, &data),
            Err(AccountError::SizeMismatch {
                expected: 40,
                actual: 41
            })
        ));

        let data = HandleRequest::for_handle(HandleId(10)).encode().unwrap();
        assert!(matches!(
            set_ctl(&realm, &Privilege::NetAdmin, 91, &data),
            Err(AccountError::HandleNotFound(10))
        ));
    }

    #[test]
    fn test_table_names_list() {
        let realm = realm();
        let mut buf = [0xffu8; 64];
        assert_eq!(get_ctl(&realm, &Privilege::NetAdmin, 98, &mut buf).unwrap(), 1);
        assert_eq!(buf[0], 0);

        let a = realm.attach_net("lan", "10.0.0.0/24".parse().unwrap()).unwrap();
        let b = realm.attach_net("dmz", "10.1.0.0/24".parse().unwrap()).unwrap();
        let n = get_ctl(&realm, &Privilege::NetAdmin, 98, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"lan\0dmz\0\0");
        assert_eq!(decode_table_names(&buf[..n]), ["lan", "dmz"]);

        let mut short = [0u8; 8];
        assert!(matches!(
            get_ctl(&realm, &Privilege::NetAdmin, 98, &mut short),
            Err(AccountError::SizeMismatch {
                expected: 9,
                actual: 8
            })
        ));

        realm.detach(a);
        realm.detach(b);
    }
}
