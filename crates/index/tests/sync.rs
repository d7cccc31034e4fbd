use std::sync::Arc;

use addrindex::coins::{Coin, MemoryCoins};
use addrindex::flatfiles::{BlockFileStore, BlockStore, FileLocation};
use addrindex::undo::{BlockUndo, TxUndo};
use addrindex::{AddrIndex, IndexOptions};
use addrindex::worker::ChainNotifier;
use addrindex_primitives::block::{Block, BlockHeader};
use addrindex_primitives::encoding;
use addrindex_primitives::outpoint::OutPoint;
use addrindex_primitives::transaction::{Transaction, TxIn, TxOut};
use addrindex_primitives::Hash256;
use addrindex_storage::memory::MemoryStore;

fn p2pkh_script(tag: u8) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[0x76, 0xa9, 0x14]);
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

fn coinbase_tx(height: u32, script_pubkey: &[u8]) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: height.to_le_bytes().to_vec(),
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

struct Harness {
    files: Arc<BlockFileStore>,
    index: Arc<AddrIndex<Arc<MemoryStore>>>,
    notifier: Arc<ChainNotifier>,
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
        files,
        index,
        notifier: Arc::new(ChainNotifier::new()),
        coins: Arc::new(MemoryCoins::new()),
        _dir: dir,
    }
}

impl Harness {
    fn start(&self) {
        Arc::clone(&self.index)
            .start(&self.notifier, Arc::clone(&self.coins) as _)
            .expect("start worker");
    }

    fn emit_connect(&self, block: &Block, undo: BlockUndo) -> FileLocation {
        let location = self.files.append(&encoding::encode(block)).expect("append");
        self.notifier.connect_block(block.clone(), undo, location);
        location
    }
}

#[test]
fn query_before_start_returns_empty_and_unsynced() {
    let h = harness();
    let history = h
        .index
        .find_by_script(&p2pkh_script(1))
        .expect("lookup on idle index");
    assert!(history.created.is_empty() && history.spent.is_empty());
    assert!(!h.index.block_until_synced_to_current_chain());
}

#[test]
fn initial_sync_indexes_the_whole_chain() {
    let h = harness();
    h.start();

    let mut prev = [0u8; 32];
    let mut coinbases = Vec::new();
    for height in 0..101u32 {
        let script = p2pkh_script(height as u8);
        let coinbase = coinbase_tx(height, &script);
        let block = make_block(prev, 1_700_000_000 + height, vec![coinbase.clone()]);
        prev = block.hash();
        h.emit_connect(&block, BlockUndo::default());
        coinbases.push((script, coinbase));
    }

    assert!(h.index.block_until_synced_to_current_chain());
    for (script, coinbase) in &coinbases {
        let history = h.index.find_by_script(script).expect("lookup");
        let matches: Vec<_> = history
            .created
            .iter()
            .filter(|hit| hit.tx.txid() == coinbase.txid())
            .collect();
        assert_eq!(matches.len(), 1);
    }
}

#[test]
fn many_spends_in_one_block_and_repeated_addresses() {
    let h = harness();
    h.start();

    let cb_script = p2pkh_script(0xcc);
    let mut prev = [0u8; 32];
    let mut coinbases = Vec::new();
    for height in 0..15u32 {
        let coinbase = coinbase_tx(height, &cb_script);
        let block = make_block(prev, 1_700_000_000 + height, vec![coinbase.clone()]);
        prev = block.hash();
        h.emit_connect(&block, BlockUndo::default());
        coinbases.push(coinbase);
    }

    let scripts: Vec<Vec<u8>> = (0..10u8).map(p2pkh_script).collect();

    // One block spending ten coinbases into ten distinct scripts.
    let mut txs = vec![coinbase_tx(15, &cb_script)];
    let mut tx_undos = Vec::new();
    let mut spent_outpoints = Vec::new();
    for (i, script) in scripts.iter().enumerate() {
        let prevout = OutPoint {
            hash: coinbases[i].txid(),
            index: 0,
        };
        spent_outpoints.push(prevout.clone());
        txs.push(spend_tx(prevout, script));
        tx_undos.push(TxUndo {
            prevouts: vec![coinbase_coin(&cb_script, i as u32)],
        });
    }
    let block15 = make_block(prev, 1_700_000_015, txs);
    prev = block15.hash();
    h.emit_connect(&block15, BlockUndo { tx_undos });
    assert!(h.index.block_until_synced_to_current_chain());

    for script in &scripts {
        let history = h.index.find_by_script(script).expect("lookup");
        assert_eq!(history.created.len(), 1);
    }
    let cb_history = h.index.find_by_script(&cb_script).expect("lookup");
    assert!(cb_history.spent.len() >= 10);
    for outpoint in &spent_outpoints {
        assert!(cb_history.spent.iter().any(|hit| hit.outpoint == *outpoint));
    }

    // A second block pays five of the same scripts again.
    let mut txs = vec![coinbase_tx(16, &cb_script)];
    let mut tx_undos = Vec::new();
    for (i, script) in scripts.iter().take(5).enumerate() {
        let prevout = OutPoint {
            hash: coinbases[10 + i].txid(),
            index: 0,
        };
        txs.push(spend_tx(prevout, script));
        tx_undos.push(TxUndo {
            prevouts: vec![coinbase_coin(&cb_script, 10 + i as u32)],
        });
    }
    let block16 = make_block(prev, 1_700_000_016, txs);
    h.emit_connect(&block16, BlockUndo { tx_undos });
    assert!(h.index.block_until_synced_to_current_chain());

    for (i, script) in scripts.iter().enumerate() {
        let history = h.index.find_by_script(script).expect("lookup");
        let expected = if i < 5 { 2 } else { 1 };
        assert_eq!(history.created.len(), expected, "script {i}");
    }
}

#[test]
fn worker_halts_on_inconsistent_events() {
    let h = harness();
    h.start();

    let script = p2pkh_script(1);
    let block0 = make_block([0u8; 32], 1_700_000_000, vec![coinbase_tx(0, &script)]);
    h.emit_connect(&block0, BlockUndo::default());
    assert!(h.index.block_until_synced_to_current_chain());

    // A block that does not extend the indexed tip halts the worker
    // instead of advancing the marker.
    let orphan = make_block([7u8; 32], 1_700_000_060, vec![coinbase_tx(1, &script)]);
    h.emit_connect(&orphan, BlockUndo::default());
    assert!(!h.index.block_until_synced_to_current_chain());

    let marker = h.index.sync_marker().expect("marker").expect("present");
    assert_eq!(marker.hash, block0.hash());
}

#[test]
fn stop_finishes_cleanly() {
    let h = harness();
    h.start();

    let script = p2pkh_script(2);
    let block0 = make_block([0u8; 32], 1_700_000_000, vec![coinbase_tx(0, &script)]);
    h.emit_connect(&block0, BlockUndo::default());
    assert!(h.index.block_until_synced_to_current_chain());

    h.index.stop();
    assert!(!h.index.block_until_synced_to_current_chain());

    // The indexed data stays queryable after shutdown.
    let history = h.index.find_by_script(&script).expect("lookup");
    assert_eq!(history.created.len(), 1);
}

#[test]
fn seed_persists_across_reopen_and_rotates_on_wipe() {
    let dir = tempfile::tempdir().expect("tempdir");
    let files =
        Arc::new(BlockFileStore::open(dir.path().join("blocks"), 10_000_000).expect("files"));
    let script = p2pkh_script(0x5e);

    let first = {
        let index = AddrIndex::open(
            dir.path(),
            Arc::clone(&files) as Arc<dyn BlockStore>,
            IndexOptions::default(),
        )
        .expect("open");
        index.addr_id(&script)
    };

    let reopened = {
        let index = AddrIndex::open(
            dir.path(),
            Arc::clone(&files) as Arc<dyn BlockStore>,
            IndexOptions::default(),
        )
        .expect("reopen");
        index.addr_id(&script)
    };
    assert_eq!(first, reopened);

    let wiped = AddrIndex::open(
        dir.path(),
        Arc::clone(&files) as Arc<dyn BlockStore>,
        IndexOptions {
            wipe: true,
            ..IndexOptions::default()
        },
    )
    .expect("wipe");
    assert_ne!(wiped.addr_id(&script), first);
}
