//! On-disk key and value layouts, frozen at schema v1.
//!
//! The store orders keys lexicographically and prefix scans are the only
//! query primitive, so fields are laid out to make the byte order equal
//! the tuple order (table tag, AddrId, kind, outpoint). The AddrId is
//! big-endian for that reason, and the kind byte sits after it so one
//! prefix seek covers created and spent entries alike.

use addrindex_primitives::outpoint::OutPoint;

use crate::flatfiles::DiskTxPos;

/// Namespaces the index inside the key-value store.
pub const TABLE_TAG: u8 = b'a';

const KIND_SEED: u8 = b'K';
const KIND_SPENT: u8 = b'S';
const KIND_CREATED: u8 = b'C';

pub const ADDR_PREFIX_LEN: usize = 9;
const OUTPOINT_LEN: usize = 36;
pub const ENTRY_KEY_LEN: usize = ADDR_PREFIX_LEN + 1 + OUTPOINT_LEN;

/// Singleton record holding the fingerprint seed.
pub const SEED_KEY: [u8; 2] = [TABLE_TAG, KIND_SEED];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryKind {
    /// The outpoint is an output of the transaction the value points at.
    Created,
    /// The outpoint was consumed as an input of that transaction.
    Spent,
}

impl EntryKind {
    const fn as_byte(self) -> u8 {
        match self {
            EntryKind::Created => KIND_CREATED,
            EntryKind::Spent => KIND_SPENT,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            KIND_CREATED => Some(EntryKind::Created),
            KIND_SPENT => Some(EntryKind::Spent),
            _ => None,
        }
    }
}

/// Every entry key for `addr_id` starts with exactly these bytes.
pub fn addr_prefix(addr_id: u64) -> [u8; ADDR_PREFIX_LEN] {
    let mut out = [0u8; ADDR_PREFIX_LEN];
    out[0] = TABLE_TAG;
    out[1..].copy_from_slice(&addr_id.to_be_bytes());
    out
}

pub fn entry_key(addr_id: u64, kind: EntryKind, outpoint: &OutPoint) -> [u8; ENTRY_KEY_LEN] {
    let mut out = [0u8; ENTRY_KEY_LEN];
    out[..ADDR_PREFIX_LEN].copy_from_slice(&addr_prefix(addr_id));
    out[ADDR_PREFIX_LEN] = kind.as_byte();
    out[10..42].copy_from_slice(&outpoint.hash);
    out[42..].copy_from_slice(&outpoint.index.to_le_bytes());
    out
}

pub fn parse_entry_key(key: &[u8]) -> Option<(u64, EntryKind, OutPoint)> {
    if key.len() != ENTRY_KEY_LEN || key[0] != TABLE_TAG {
        return None;
    }
    let addr_id = u64::from_be_bytes(key[1..9].try_into().ok()?);
    let kind = EntryKind::from_byte(key[9])?;
    let hash = key[10..42].try_into().ok()?;
    let index = u32::from_le_bytes(key[42..46].try_into().ok()?);
    Some((addr_id, kind, OutPoint { hash, index }))
}

/// Entry payload: where the transaction lives on disk, plus the script
/// itself so lookups can reject fingerprint collisions byte-for-byte.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EntryValue {
    pub pos: DiskTxPos,
    pub script_pubkey: Vec<u8>,
}

impl EntryValue {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DiskTxPos::LEN + self.script_pubkey.len());
        out.extend_from_slice(&self.pos.encode());
        out.extend_from_slice(&self.script_pubkey);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < DiskTxPos::LEN {
            return None;
        }
        let pos = DiskTxPos::decode(&bytes[..DiskTxPos::LEN])?;
        Some(Self {
            pos,
            script_pubkey: bytes[DiskTxPos::LEN..].to_vec(),
        })
    }
}
