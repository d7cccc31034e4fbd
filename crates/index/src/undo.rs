//! Per-block undo data: the coins consumed by each transaction.

use addrindex_primitives::encoding::{DecodeError, Decoder, Encoder};

use crate::coins::Coin;

const BLOCK_UNDO_VERSION: u8 = 1;

/// Prior outputs spent by one transaction's inputs, in input order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TxUndo {
    pub prevouts: Vec<Coin>,
}

/// One record per transaction after the coinbase, mirroring the block's
/// transaction order. Produced by the validation layer at connect time.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockUndo {
    pub tx_undos: Vec<TxUndo>,
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(BLOCK_UNDO_VERSION);
        encoder.write_varint(self.tx_undos.len() as u64);
        for tx_undo in &self.tx_undos {
            encoder.write_varint(tx_undo.prevouts.len() as u64);
            for coin in &tx_undo.prevouts {
                encoder.write_var_bytes(&coin.encode());
            }
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u8()?;
        if version != BLOCK_UNDO_VERSION {
            return Err(DecodeError::InvalidData("unsupported block undo version"));
        }
        let tx_count = decoder.read_varint()? as usize;
        let mut tx_undos = Vec::with_capacity(tx_count);
        for _ in 0..tx_count {
            let prevout_count = decoder.read_varint()? as usize;
            let mut prevouts = Vec::with_capacity(prevout_count);
            for _ in 0..prevout_count {
                let coin_bytes = decoder.read_var_bytes()?;
                let mut coin_decoder = Decoder::new(&coin_bytes);
                let coin = Coin::decode_from(&mut coin_decoder)?;
                if !coin_decoder.is_empty() {
                    return Err(DecodeError::InvalidData("trailing bytes in undo coin"));
                }
                prevouts.push(coin);
            }
            tx_undos.push(TxUndo { prevouts });
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { tx_undos })
    }
}
