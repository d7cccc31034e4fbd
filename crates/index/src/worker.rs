//! Background worker wiring the index to chain events.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use addrindex_log::{log_error, log_info};
use addrindex_primitives::block::Block;
use addrindex_primitives::Hash256;
use addrindex_storage::KeyValueStore;
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};

use crate::addrindex::AddrIndex;
use crate::coins::CoinsView;
use crate::error::IndexError;
use crate::flatfiles::FileLocation;
use crate::undo::BlockUndo;

/// Best-chain membership change for one block.
pub enum ChainEvent {
    BlockConnected {
        block: Block,
        undo: BlockUndo,
        location: FileLocation,
    },
    BlockDisconnected {
        block: Block,
        undo: Option<BlockUndo>,
        location: FileLocation,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChainTip {
    pub hash: Hash256,
    pub height: i32,
}

/// Single-consumer event source. The chain subsystem pushes connects and
/// disconnects in canonical order; the index worker drains them. The tip
/// is updated before the event is enqueued, so the tip observed by a
/// caller always covers every event emitted so far.
pub struct ChainNotifier {
    sender: Sender<ChainEvent>,
    receiver: Mutex<Option<Receiver<ChainEvent>>>,
    tip: Mutex<Option<ChainTip>>,
}

impl Default for ChainNotifier {
    fn default() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            tip: Mutex::new(None),
        }
    }
}

impl ChainNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe(&self) -> Option<Receiver<ChainEvent>> {
        self.receiver.lock().expect("notifier lock").take()
    }

    pub fn tip(&self) -> Option<ChainTip> {
        *self.tip.lock().expect("notifier lock")
    }

    pub fn connect_block(&self, block: Block, undo: BlockUndo, location: FileLocation) {
        let hash = block.header.hash();
        {
            let mut tip = self.tip.lock().expect("notifier lock");
            let height = tip.map(|tip| tip.height + 1).unwrap_or(0);
            *tip = Some(ChainTip { hash, height });
        }
        let _ = self.sender.send(ChainEvent::BlockConnected {
            block,
            undo,
            location,
        });
    }

    pub fn disconnect_block(
        &self,
        block: Block,
        undo: Option<BlockUndo>,
        location: FileLocation,
    ) {
        {
            let mut tip = self.tip.lock().expect("notifier lock");
            *tip = match *tip {
                Some(old) if old.height > 0 => Some(ChainTip {
                    hash: block.header.prev_block,
                    height: old.height - 1,
                }),
                _ => None,
            };
        }
        let _ = self.sender.send(ChainEvent::BlockDisconnected {
            block,
            undo,
            location,
        });
    }
}

#[derive(Default)]
struct SyncInner {
    running: bool,
    failed: bool,
    best: Option<ChainTip>,
}

pub(crate) struct SyncState {
    inner: Mutex<SyncInner>,
    cond: Condvar,
}

impl SyncState {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(SyncInner::default()),
            cond: Condvar::new(),
        }
    }
}

pub(crate) struct WorkerHandle {
    thread: JoinHandle<()>,
    shutdown: Sender<()>,
}

impl<S: KeyValueStore + 'static> AddrIndex<S> {
    /// Starts the background worker on the notifier's event stream.
    /// Blocks the chain connected before the index existed are expected
    /// to be replayed through the notifier by the caller.
    pub fn start(
        self: Arc<Self>,
        notifier: &Arc<ChainNotifier>,
        coins: Arc<dyn CoinsView>,
    ) -> Result<(), IndexError> {
        let events = notifier.subscribe().ok_or_else(|| {
            IndexError::Corruption("chain notifier already has a subscriber".to_string())
        })?;
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        {
            let mut state = self.sync.inner.lock().expect("sync lock");
            state.running = true;
            state.failed = false;
            state.best = self
                .sync_marker()?
                .map(|marker| ChainTip {
                    hash: marker.hash,
                    height: marker.height,
                });
        }
        *self.notifier.lock().expect("notifier slot") = Some(Arc::clone(notifier));

        let index = Arc::clone(&self);
        let thread = thread::Builder::new()
            .name("addrindex".to_string())
            .spawn(move || index.run(events, shutdown_rx, coins))
            .map_err(|err| IndexError::Corruption(format!("spawn addrindex worker: {err}")))?;
        *self.worker.lock().expect("worker slot") = Some(WorkerHandle {
            thread,
            shutdown: shutdown_tx,
        });
        log_info!("addrindex worker started");
        Ok(())
    }

    fn run(
        self: Arc<Self>,
        events: Receiver<ChainEvent>,
        shutdown: Receiver<()>,
        coins: Arc<dyn CoinsView>,
    ) {
        loop {
            select! {
                recv(shutdown) -> _ => break,
                recv(events) -> event => {
                    let event = match event {
                        Ok(event) => event,
                        Err(_) => break,
                    };
                    let result = match event {
                        ChainEvent::BlockConnected { block, undo, location } => {
                            self.connect_block(&block, &undo, location)
                        }
                        ChainEvent::BlockDisconnected { block, undo, location } => {
                            self.disconnect_block(&block, undo.as_ref(), coins.as_ref(), location)
                        }
                    };
                    match result.and_then(|()| self.publish_progress()) {
                        Ok(()) => {}
                        Err(err) => {
                            // Refuse to advance past the failure; the
                            // stalled marker is the caller's signal.
                            log_error!("addrindex halted: {err}");
                            self.mark_failed();
                            return;
                        }
                    }
                }
            }
        }
        self.mark_stopped();
    }

    fn publish_progress(&self) -> Result<(), IndexError> {
        let best = self.sync_marker()?.map(|marker| ChainTip {
            hash: marker.hash,
            height: marker.height,
        });
        let mut state = self.sync.inner.lock().expect("sync lock");
        state.best = best;
        self.sync.cond.notify_all();
        Ok(())
    }

    fn mark_failed(&self) {
        let mut state = self.sync.inner.lock().expect("sync lock");
        state.failed = true;
        state.running = false;
        self.sync.cond.notify_all();
    }

    fn mark_stopped(&self) {
        let mut state = self.sync.inner.lock().expect("sync lock");
        state.running = false;
        self.sync.cond.notify_all();
    }

    /// Asks the worker to exit after the block it is currently on and
    /// waits for it. Never interrupts a batch.
    pub fn stop(&self) {
        let handle = self.worker.lock().expect("worker slot").take();
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(());
            let _ = handle.thread.join();
            log_info!("addrindex worker stopped");
        }
    }

    /// Blocks until the index has processed every block up to the chain
    /// tip observed when the call was made. Returns false if the worker
    /// is not running (never started, stopped, or halted on an error).
    pub fn block_until_synced_to_current_chain(&self) -> bool {
        let target = match self.notifier.lock().expect("notifier slot").as_ref() {
            Some(notifier) => notifier.tip(),
            None => return false,
        };
        let mut state = self.sync.inner.lock().expect("sync lock");
        loop {
            if !state.running || state.failed {
                return false;
            }
            let synced = match (target, state.best) {
                (None, _) => true,
                (Some(target), Some(best)) => {
                    best.hash == target.hash || best.height > target.height
                }
                (Some(_), None) => false,
            };
            if synced {
                return true;
            }
            state = self.sync.cond.wait(state).expect("sync lock");
        }
    }
}
