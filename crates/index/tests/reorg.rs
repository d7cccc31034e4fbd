use std::sync::Arc;

use addrindex::coins::{Coin, MemoryCoins};
use addrindex::flatfiles::{BlockFileStore, BlockStore, FileLocation};
use addrindex::keys::{self, EntryValue};
use addrindex::undo::{BlockUndo, TxUndo};
use addrindex::worker::ChainNotifier;
use addrindex::{AddrIndex, IndexError};
use addrindex_primitives::block::{Block, BlockHeader};
use addrindex_primitives::encoding;
use addrindex_primitives::outpoint::OutPoint;
use addrindex_primitives::transaction::{Transaction, TxIn, TxOut};
use addrindex_primitives::Hash256;
use addrindex_storage::memory::MemoryStore;
use addrindex_storage::{Column, KeyValueStore};

fn p2pkh_script(tag: u8) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[0x76, 0xa9, 0x14]);
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

fn coinbase_tx(height: u32, fork_tag: u8, script_pubkey: &[u8]) -> Transaction {
    let mut script_sig = height.to_le_bytes().to_vec();
    script_sig.push(fork_tag);
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 50,
            script_pubkey: script_pubkey.to_vec(),
        }],
        lock_time: 0,
    }
}

fn spend_tx(prevout: OutPoint, script_pubkey: &[u8]) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout,
            script_sig: vec![0x00],
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 49,
            script_pubkey: script_pubkey.to_vec(),
        }],
        lock_time: 0,
    }
}

fn make_block(prev_block: Hash256, time: u32, transactions: Vec<Transaction>) -> Block {
    Block {
        header: BlockHeader {
            version: 4,
            prev_block,
            merkle_root: [0u8; 32],
            time,
            bits: 0x1d00_ffff,
            nonce: 0,
        },
        transactions,
    }
}

fn coinbase_coin(script_pubkey: &[u8], height: u32) -> Coin {
    Coin {
        value: 50,
        script_pubkey: script_pubkey.to_vec(),
        height,
        is_coinbase: true,
    }
}

/// Full dump of both columns, for byte-for-byte state comparison.
fn dump_state(store: &MemoryStore) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = store.scan_prefix(Column::AddrIndex, &[]).expect("scan");
    out.extend(store.scan_prefix(Column::Meta, &[]).expect("scan"));
    out
}

struct Harness {
    store: Arc<MemoryStore>,
    files: Arc<BlockFileStore>,
    index: Arc<AddrIndex<Arc<MemoryStore>>>,
    coins: Arc<MemoryCoins>,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let files = Arc::new(BlockFileStore::open(dir.path(), 10_000_000).expect("block files"));
    let index = Arc::new(
        AddrIndex::new(Arc::clone(&store), Arc::clone(&files) as Arc<dyn BlockStore>)
            .expect("open index"),
    );
    Harness {
        store,
        files,
        index,
        coins: Arc::new(MemoryCoins::new()),
        _dir: dir,
    }
}

impl Harness {
    fn store_block(&self, block: &Block) -> FileLocation {
        self.files.append(&encoding::encode(block)).expect("append")
    }
}

#[test]
fn disconnect_erases_and_reconnect_is_idempotent() {
    let h = harness();
    let script_a = p2pkh_script(0xa1);
    let script_b = p2pkh_script(0xb2);
    let miner = p2pkh_script(0x33);

    let cb0 = coinbase_tx(0, 0, &script_a);
    let block0 = make_block([0u8; 32], 1_700_000_000, vec![cb0.clone()]);
    let loc0 = h.store_block(&block0);
    h.index
        .connect_block(&block0, &BlockUndo::default(), loc0)
        .expect("connect genesis");
    let state_before = dump_state(&h.store);

    let spend = spend_tx(
        OutPoint {
            hash: cb0.txid(),
            index: 0,
        },
        &script_b,
    );
    let block1 = make_block(
        block0.hash(),
        1_700_000_060,
        vec![coinbase_tx(1, 0, &miner), spend],
    );
    let loc1 = h.store_block(&block1);
    let undo1 = BlockUndo {
        tx_undos: vec![TxUndo {
            prevouts: vec![coinbase_coin(&script_a, 0)],
        }],
    };
    h.index.connect_block(&block1, &undo1, loc1).expect("connect");
    let state_after = dump_state(&h.store);
    assert_ne!(state_before, state_after);

    h.index
        .disconnect_block(&block1, Some(&undo1), h.coins.as_ref(), loc1)
        .expect("disconnect");
    assert_eq!(dump_state(&h.store), state_before);

    let history = h.index.find_by_script(&script_b).expect("lookup");
    assert!(history.created.is_empty());
    let history = h.index.find_by_script(&script_a).expect("lookup");
    assert!(history.spent.is_empty());
    assert_eq!(history.created.len(), 1);

    h.index
        .connect_block(&block1, &undo1, loc1)
        .expect("reconnect");
    assert_eq!(dump_state(&h.store), state_after);
}

#[test]
fn disconnect_falls_back_to_the_coins_view() {
    let h = harness();
    let script_a = p2pkh_script(0x0a);
    let script_b = p2pkh_script(0x0b);

    let cb0 = coinbase_tx(0, 0, &script_a);
    let block0 = make_block([0u8; 32], 1_700_000_000, vec![cb0.clone()]);
    let loc0 = h.store_block(&block0);
    h.index
        .connect_block(&block0, &BlockUndo::default(), loc0)
        .expect("connect genesis");

    let spent_outpoint = OutPoint {
        hash: cb0.txid(),
        index: 0,
    };
    let spend = spend_tx(spent_outpoint.clone(), &script_b);
    let block1 = make_block(
        block0.hash(),
        1_700_000_060,
        vec![coinbase_tx(1, 0, &script_a), spend],
    );
    let loc1 = h.store_block(&block1);
    let undo1 = BlockUndo {
        tx_undos: vec![TxUndo {
            prevouts: vec![coinbase_coin(&script_a, 0)],
        }],
    };
    h.index.connect_block(&block1, &undo1, loc1).expect("connect");

    // Without undo data and without the coin, the spent entry cannot be
    // located; the disconnect must refuse rather than go stale.
    assert!(matches!(
        h.index
            .disconnect_block(&block1, None, h.coins.as_ref(), loc1),
        Err(IndexError::Corruption(_))
    ));

    h.coins
        .insert(spent_outpoint, coinbase_coin(&script_a, 0));
    h.index
        .disconnect_block(&block1, None, h.coins.as_ref(), loc1)
        .expect("disconnect via coins view");

    let history = h.index.find_by_script(&script_b).expect("lookup");
    assert!(history.created.is_empty());
    let history = h.index.find_by_script(&script_a).expect("lookup");
    assert!(history.spent.is_empty());
}

#[test]
fn reorg_to_a_longer_fork_replaces_all_entries() {
    let h = harness();
    let notifier = Arc::new(ChainNotifier::new());
    Arc::clone(&h.index)
        .start(&notifier, Arc::clone(&h.coins) as _)
        .expect("start worker");

    let cb_script = p2pkh_script(0xcc);
    let scripts: Vec<Vec<u8>> = (0..10u8).map(p2pkh_script).collect();

    // Common ancestry: 20 coinbase blocks.
    let mut prev = [0u8; 32];
    let mut coinbases = Vec::new();
    for height in 0..20u32 {
        let coinbase = coinbase_tx(height, 0, &cb_script);
        let block = make_block(prev, 1_700_000_000 + height, vec![coinbase.clone()]);
        prev = block.hash();
        let location = h.store_block(&block);
        notifier.connect_block(block, BlockUndo::default(), location);
        coinbases.push(coinbase);
    }
    let fork_point = prev;

    // Fork A: ten blocks, the first of which pays all ten scripts.
    let mut fork_a = Vec::new();
    let mut prev_a = fork_point;
    for i in 0..10u32 {
        let mut txs = vec![coinbase_tx(20 + i, 0xa, &cb_script)];
        let mut tx_undos = Vec::new();
        if i == 0 {
            for (j, script) in scripts.iter().enumerate() {
                txs.push(spend_tx(
                    OutPoint {
                        hash: coinbases[j].txid(),
                        index: 0,
                    },
                    script,
                ));
                tx_undos.push(TxUndo {
                    prevouts: vec![coinbase_coin(&cb_script, j as u32)],
                });
            }
        }
        let block = make_block(prev_a, 1_700_001_000 + i, txs);
        prev_a = block.hash();
        let undo = BlockUndo { tx_undos };
        let location = h.store_block(&block);
        notifier.connect_block(block.clone(), undo.clone(), location);
        fork_a.push((block, undo, location));
    }
    assert!(h.index.block_until_synced_to_current_chain());
    for script in &scripts {
        let history = h.index.find_by_script(script).expect("lookup");
        assert_eq!(history.created.len(), 1);
    }

    // The chain adopts fork B: twenty blocks paying only the first five
    // scripts. Fork A unwinds first, tip to fork point.
    for (block, undo, location) in fork_a.iter().rev() {
        notifier.disconnect_block(block.clone(), Some(undo.clone()), *location);
    }
    let mut prev_b = fork_point;
    let mut first_b_hash = None;
    for i in 0..20u32 {
        let mut txs = vec![coinbase_tx(20 + i, 0xb, &cb_script)];
        let mut tx_undos = Vec::new();
        if i == 0 {
            for (j, script) in scripts.iter().take(5).enumerate() {
                txs.push(spend_tx(
                    OutPoint {
                        hash: coinbases[j].txid(),
                        index: 0,
                    },
                    script,
                ));
                tx_undos.push(TxUndo {
                    prevouts: vec![coinbase_coin(&cb_script, j as u32)],
                });
            }
        }
        let block = make_block(prev_b, 1_700_002_000 + i, txs);
        prev_b = block.hash();
        if first_b_hash.is_none() {
            first_b_hash = Some(block.hash());
        }
        let location = h.store_block(&block);
        notifier.connect_block(block, BlockUndo { tx_undos }, location);
    }
    assert!(h.index.block_until_synced_to_current_chain());

    for (i, script) in scripts.iter().enumerate() {
        let history = h.index.find_by_script(script).expect("lookup");
        if i < 5 {
            assert_eq!(history.created.len(), 1, "script {i}");
            assert_eq!(history.created[0].block_hash, first_b_hash.expect("fork b"));
        } else {
            assert!(history.created.is_empty(), "script {i}");
            assert!(history.spent.is_empty(), "script {i}");
        }
    }

    // Nothing written by fork A survives anywhere in the table.
    let fork_a_locations: Vec<FileLocation> =
        fork_a.iter().map(|(_, _, location)| *location).collect();
    let entries = h
        .store
        .scan_prefix(Column::AddrIndex, &[])
        .expect("full scan");
    for (key, value) in entries {
        if keys::parse_entry_key(&key).is_none() {
            continue; // the seed record
        }
        let entry = EntryValue::decode(&value).expect("entry value");
        assert!(!fork_a_locations.contains(&entry.pos.block));
    }

    h.index.stop();
}
