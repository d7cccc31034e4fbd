//! Transaction types and serialization.

use crate::encoding::{self, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;
use crate::Hash256;

pub const CURRENT_TX_VERSION: i32 = 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn txid(&self) -> Hash256 {
        sha256d(&encoding::encode(self))
    }

    pub fn serialized_size(&self) -> usize {
        encoding::encode(self).len()
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.consensus_encode(encoder);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            output.consensus_encode(encoder);
        }
        encoder.write_u32_le(self.lock_time);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let vin_len = decoder.read_varint()? as usize;
        let mut vin = Vec::with_capacity(vin_len);
        for _ in 0..vin_len {
            vin.push(TxIn::consensus_decode(decoder)?);
        }
        let vout_len = decoder.read_varint()? as usize;
        let mut vout = Vec::with_capacity(vout_len);
        for _ in 0..vout_len {
            vout.push(TxOut::consensus_decode(decoder)?);
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }
}
