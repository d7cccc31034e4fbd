//! Spendable outputs as seen by the chainstate.

use std::collections::HashMap;
use std::sync::RwLock;

use addrindex_primitives::encoding::{DecodeError, Decoder, Encoder};
use addrindex_primitives::outpoint::OutPoint;
use addrindex_storage::StoreError;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Coin {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
    pub height: u32,
    pub is_coinbase: bool,
}

impl Coin {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_u32_le(self.height);
        encoder.write_u8(self.is_coinbase as u8);
        encoder.into_inner()
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let height = decoder.read_u32_le()?;
        let is_coinbase = decoder.read_u8()? != 0;
        Ok(Self {
            value,
            script_pubkey,
            height,
            is_coinbase,
        })
    }
}

/// Read access to the UTXO set. Consulted only while disconnecting a
/// block without undo data, which is why a missing coin there is fatal.
pub trait CoinsView: Send + Sync {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError>;
}

#[derive(Default)]
pub struct MemoryCoins {
    inner: RwLock<HashMap<OutPoint, Coin>>,
}

impl MemoryCoins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, outpoint: OutPoint, coin: Coin) {
        let mut inner = self.inner.write().expect("coins lock");
        inner.insert(outpoint, coin);
    }

    pub fn remove(&self, outpoint: &OutPoint) {
        let mut inner = self.inner.write().expect("coins lock");
        inner.remove(outpoint);
    }
}

impl CoinsView for MemoryCoins {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        let inner = self.inner.read().expect("coins lock");
        Ok(inner.get(outpoint).cloned())
    }
}
