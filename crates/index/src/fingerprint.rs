//! Seeded script fingerprint.
//!
//! The fingerprint is a lossy digest: it only narrows a lookup to a key
//! prefix, and every match is re-verified against the script bytes stored
//! in the entry value. The per-database seed keeps outsiders from
//! precomputing scripts that pile into one prefix.

use std::io::Cursor;

use addrindex_storage::{Column, KeyValueStore};
use rand::RngCore;

use crate::error::IndexError;
use crate::keys::SEED_KEY;

pub fn addr_id(seed: u32, script_pubkey: &[u8]) -> u64 {
    let mut cursor = Cursor::new(script_pubkey);
    murmur3::murmur3_x64_128(&mut cursor, seed)
        .map(|hash| hash as u64)
        .unwrap_or(0)
}

/// Loads the per-database seed, drawing and persisting a fresh one on
/// first use. An existing seed is never overwritten; wiping the database
/// is the only way to rotate it.
pub fn load_or_create_seed<S: KeyValueStore>(store: &S) -> Result<u32, IndexError> {
    if let Some(bytes) = store.get(Column::AddrIndex, &SEED_KEY)? {
        let bytes: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IndexError::Corruption("invalid fingerprint seed record".to_string()))?;
        return Ok(u32::from_le_bytes(bytes));
    }
    let seed = rand::rngs::OsRng.next_u32();
    store.put(Column::AddrIndex, &SEED_KEY, &seed.to_le_bytes())?;
    Ok(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use addrindex_storage::memory::MemoryStore;

    #[test]
    fn fingerprint_is_deterministic() {
        let script = [0x76, 0xa9, 0x14, 0x01, 0x02];
        assert_eq!(addr_id(7, &script), addr_id(7, &script));
        assert_eq!(addr_id(7, &[]), addr_id(7, &[]));
    }

    #[test]
    fn seed_changes_the_fingerprint() {
        let script = [0x51];
        assert_ne!(addr_id(1, &script), addr_id(2, &script));
    }

    #[test]
    fn seed_survives_a_reload() {
        let store = MemoryStore::new();
        let first = load_or_create_seed(&store).expect("create");
        let second = load_or_create_seed(&store).expect("reload");
        assert_eq!(first, second);
    }

    #[test]
    fn corrupt_seed_record_is_fatal() {
        let store = MemoryStore::new();
        store
            .put(Column::AddrIndex, &SEED_KEY, b"too long to be a seed")
            .expect("put");
        assert!(matches!(
            load_or_create_seed(&store),
            Err(IndexError::Corruption(_))
        ));
    }
}
