//! Script-keyed transaction index.
//!
//! Maps every pubkey script that appeared in the best chain to the
//! transactions that created or spent outputs under it. Entries for one
//! block are committed in a single atomic batch together with the sync
//! marker, and physically removed again when the block is disconnected.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use addrindex_primitives::block::{Block, BlockHeader, HEADER_SIZE};
use addrindex_primitives::encoding::{compact_size_len, Decodable, Decoder};
use addrindex_primitives::outpoint::OutPoint;
use addrindex_primitives::transaction::Transaction;
use addrindex_primitives::Hash256;
use addrindex_storage::fjall::{FjallOptions, FjallStore};
use addrindex_storage::memory::MemoryStore;
use addrindex_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::coins::CoinsView;
use crate::error::IndexError;
use crate::fingerprint;
use crate::flatfiles::{BlockStore, DiskTxPos, FileLocation};
use crate::keys::{self, EntryKind, EntryValue};
use crate::undo::BlockUndo;
use crate::worker::{ChainNotifier, SyncState, WorkerHandle};

const SYNC_MARKER_KEY: &[u8] = b"best_block";

/// Last block the index is known consistent with. Advanced in the same
/// batch as the entries it covers, so "marker at height h" implies every
/// entry for heights <= h is durable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SyncMarker {
    pub hash: Hash256,
    pub height: i32,
}

impl SyncMarker {
    fn encode(&self) -> [u8; 36] {
        let mut out = [0u8; 36];
        out[..32].copy_from_slice(&self.hash);
        out[32..].copy_from_slice(&self.height.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 36 {
            return None;
        }
        Some(Self {
            hash: bytes[..32].try_into().ok()?,
            height: i32::from_le_bytes(bytes[32..].try_into().ok()?),
        })
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct IndexOptions {
    pub cache_bytes: Option<u64>,
    pub in_memory: bool,
    pub wipe: bool,
}

/// An indexed transaction, the outpoint that put it in the result, and
/// the hash of the block it was found in.
#[derive(Clone, Debug)]
pub struct ScriptMatch {
    pub outpoint: OutPoint,
    pub tx: Transaction,
    pub block_hash: Hash256,
}

#[derive(Clone, Debug, Default)]
pub struct ScriptHistory {
    pub spent: Vec<ScriptMatch>,
    pub created: Vec<ScriptMatch>,
}

pub struct AddrIndex<S> {
    store: S,
    blocks: Arc<dyn BlockStore>,
    seed: u32,
    pub(crate) sync: SyncState,
    pub(crate) worker: Mutex<Option<WorkerHandle>>,
    pub(crate) notifier: Mutex<Option<Arc<ChainNotifier>>>,
}

impl AddrIndex<Arc<dyn KeyValueStore>> {
    /// Opens (or creates) the index database under
    /// `<data_dir>/indexes/addrindex`. `wipe` deletes any existing
    /// database first, which is also the only way to rotate the
    /// fingerprint seed.
    pub fn open(
        data_dir: &Path,
        blocks: Arc<dyn BlockStore>,
        options: IndexOptions,
    ) -> Result<Self, IndexError> {
        if options.in_memory {
            let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
            return Self::new(store, blocks);
        }
        let db_dir = data_dir.join("indexes").join("addrindex");
        if options.wipe && db_dir.exists() {
            std::fs::remove_dir_all(&db_dir)
                .map_err(|err| IndexError::Store(StoreError::Backend(err.to_string())))?;
        }
        let store = FjallStore::open_with_options(
            &db_dir,
            FjallOptions {
                cache_bytes: options.cache_bytes,
            },
        )?;
        let store: Arc<dyn KeyValueStore> = Arc::new(store);
        Self::new(store, blocks)
    }
}

impl<S: KeyValueStore> AddrIndex<S> {
    /// Wraps an already-open store, loading the fingerprint seed or
    /// generating one on first use.
    pub fn new(store: S, blocks: Arc<dyn BlockStore>) -> Result<Self, IndexError> {
        let seed = fingerprint::load_or_create_seed(&store)?;
        Ok(Self {
            store,
            blocks,
            seed,
            sync: SyncState::new(),
            worker: Mutex::new(None),
            notifier: Mutex::new(None),
        })
    }

    pub fn addr_id(&self, script_pubkey: &[u8]) -> u64 {
        fingerprint::addr_id(self.seed, script_pubkey)
    }

    pub fn sync_marker(&self) -> Result<Option<SyncMarker>, IndexError> {
        match self.store.get(Column::Meta, SYNC_MARKER_KEY)? {
            Some(bytes) => SyncMarker::decode(&bytes)
                .ok_or_else(|| IndexError::Corruption("invalid sync marker record".to_string()))
                .map(Some),
            None => Ok(None),
        }
    }

    /// Indexes one connected block. The block must extend the indexed
    /// tip and `undo` must mirror `block.transactions[1..]`; everything
    /// is committed in one batch, marker included.
    pub fn connect_block(
        &self,
        block: &Block,
        undo: &BlockUndo,
        location: FileLocation,
    ) -> Result<(), IndexError> {
        let height = match self.sync_marker()? {
            Some(tip) if tip.hash == block.header.prev_block => tip.height + 1,
            Some(_) => {
                return Err(IndexError::Corruption(
                    "connected block does not extend the indexed tip".to_string(),
                ));
            }
            None => 0,
        };
        if undo.tx_undos.len() != block.transactions.len().saturating_sub(1) {
            return Err(IndexError::Corruption(
                "undo record does not match block".to_string(),
            ));
        }

        let mut batch = WriteBatch::new();
        let mut pos = DiskTxPos {
            block: location,
            tx_offset: compact_size_len(block.transactions.len() as u64) as u32,
        };
        for (i, tx) in block.transactions.iter().enumerate() {
            let tx_hash = tx.txid();
            for (vout, output) in tx.vout.iter().enumerate() {
                let outpoint = OutPoint {
                    hash: tx_hash,
                    index: vout as u32,
                };
                self.put_entry(
                    &mut batch,
                    EntryKind::Created,
                    &output.script_pubkey,
                    &outpoint,
                    pos,
                );
            }
            if i > 0 {
                let tx_undo = &undo.tx_undos[i - 1];
                if tx_undo.prevouts.len() != tx.vin.len() {
                    return Err(IndexError::Corruption(
                        "undo record does not match block".to_string(),
                    ));
                }
                for (input, prevout) in tx.vin.iter().zip(&tx_undo.prevouts) {
                    self.put_entry(
                        &mut batch,
                        EntryKind::Spent,
                        &prevout.script_pubkey,
                        &input.prevout,
                        pos,
                    );
                }
            }
            pos.tx_offset += tx.serialized_size() as u32;
        }

        let marker = SyncMarker {
            hash: block.header.hash(),
            height,
        };
        batch.put(Column::Meta, SYNC_MARKER_KEY, marker.encode());
        self.store.write_batch(&batch)?;
        Ok(())
    }

    fn put_entry(
        &self,
        batch: &mut WriteBatch,
        kind: EntryKind,
        script_pubkey: &[u8],
        outpoint: &OutPoint,
        pos: DiskTxPos,
    ) {
        let key = keys::entry_key(self.addr_id(script_pubkey), kind, outpoint);
        let value = EntryValue {
            pos,
            script_pubkey: script_pubkey.to_vec(),
        };
        batch.put(Column::AddrIndex, key, value.encode());
    }

    /// Removes everything the block contributed. Prior-output scripts
    /// come from the undo record when available; otherwise the coins
    /// view must still hold the spent coins (true only for the tip).
    pub fn disconnect_block(
        &self,
        block: &Block,
        undo: Option<&BlockUndo>,
        coins: &dyn CoinsView,
        location: FileLocation,
    ) -> Result<(), IndexError> {
        let marker = self.sync_marker()?.ok_or_else(|| {
            IndexError::Corruption("disconnect with no indexed blocks".to_string())
        })?;
        if marker.hash != block.header.hash() {
            return Err(IndexError::Corruption(
                "disconnected block is not the indexed tip".to_string(),
            ));
        }

        let mut batch = WriteBatch::new();
        for addr_id in self.touched_addr_ids(block, undo, coins)? {
            let entries = self
                .store
                .scan_prefix(Column::AddrIndex, &keys::addr_prefix(addr_id))?;
            for (key, value) in entries {
                let entry = EntryValue::decode(&value).ok_or_else(|| {
                    IndexError::Corruption("invalid index entry value".to_string())
                })?;
                if entry.pos.block == location {
                    batch.delete(Column::AddrIndex, key);
                }
            }
        }

        if marker.height == 0 {
            batch.delete(Column::Meta, SYNC_MARKER_KEY);
        } else {
            let parent = SyncMarker {
                hash: block.header.prev_block,
                height: marker.height - 1,
            };
            batch.put(Column::Meta, SYNC_MARKER_KEY, parent.encode());
        }
        self.store.write_batch(&batch)?;
        Ok(())
    }

    /// Every AddrId the block can have written entries under: all output
    /// scripts, plus the prior-output script of every non-coinbase input.
    fn touched_addr_ids(
        &self,
        block: &Block,
        undo: Option<&BlockUndo>,
        coins: &dyn CoinsView,
    ) -> Result<BTreeSet<u64>, IndexError> {
        let mut ids = BTreeSet::new();
        for (i, tx) in block.transactions.iter().enumerate() {
            for output in &tx.vout {
                ids.insert(self.addr_id(&output.script_pubkey));
            }
            if i == 0 {
                continue;
            }
            match undo {
                Some(undo) => {
                    let tx_undo = undo.tx_undos.get(i - 1).ok_or_else(|| {
                        IndexError::Corruption("undo record does not match block".to_string())
                    })?;
                    for prevout in &tx_undo.prevouts {
                        ids.insert(self.addr_id(&prevout.script_pubkey));
                    }
                }
                None => {
                    for input in &tx.vin {
                        let coin = coins.coin(&input.prevout)?.ok_or_else(|| {
                            IndexError::Corruption(
                                "spent output missing from coins view during disconnect"
                                    .to_string(),
                            )
                        })?;
                        ids.insert(self.addr_id(&coin.script_pubkey));
                    }
                }
            }
        }
        Ok(ids)
    }

    /// Looks up every indexed transaction that created or spent an
    /// output under `script_pubkey`. The scan runs over one consistent
    /// view of the store; matches are ordered (kind, outpoint) within
    /// the fingerprint prefix. Block store failures abort the call.
    pub fn find_by_script(&self, script_pubkey: &[u8]) -> Result<ScriptHistory, IndexError> {
        let prefix = keys::addr_prefix(self.addr_id(script_pubkey));
        let entries = self.store.scan_prefix(Column::AddrIndex, &prefix)?;

        let mut history = ScriptHistory::default();
        for (key, value) in entries {
            let (_, kind, outpoint) = keys::parse_entry_key(&key)
                .ok_or_else(|| IndexError::Corruption("invalid index entry key".to_string()))?;
            let entry = EntryValue::decode(&value)
                .ok_or_else(|| IndexError::Corruption("invalid index entry value".to_string()))?;
            if entry.script_pubkey != script_pubkey {
                // Fingerprint collision with a different script.
                continue;
            }
            let (tx, block_hash) = self.read_transaction(entry.pos)?;
            let hit = ScriptMatch {
                outpoint,
                tx,
                block_hash,
            };
            match kind {
                EntryKind::Spent => history.spent.push(hit),
                EntryKind::Created => history.created.push(hit),
            }
        }
        Ok(history)
    }

    fn read_transaction(&self, pos: DiskTxPos) -> Result<(Transaction, Hash256), IndexError> {
        let bytes = self.blocks.read_block(pos.block)?;
        let header_bytes = bytes.get(..HEADER_SIZE).ok_or_else(|| {
            IndexError::BlockStoreIo("block record shorter than a header".to_string())
        })?;
        let mut decoder = Decoder::new(header_bytes);
        let header = BlockHeader::consensus_decode(&mut decoder)
            .map_err(|err| IndexError::BlockStoreIo(format!("bad block header: {err}")))?;

        let tx_start = HEADER_SIZE + pos.tx_offset as usize;
        let tx_bytes = bytes.get(tx_start..).ok_or_else(|| {
            IndexError::BlockStoreIo("transaction offset past end of block record".to_string())
        })?;
        let mut decoder = Decoder::new(tx_bytes);
        let tx = Transaction::consensus_decode(&mut decoder)
            .map_err(|err| IndexError::BlockStoreIo(format!("bad transaction: {err}")))?;
        Ok((tx, header.hash()))
    }
}
