//! Block header and block types.

use crate::encoding::{self, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::transaction::Transaction;
use crate::Hash256;

pub const CURRENT_BLOCK_VERSION: i32 = 4;

/// Serialized header width. The indexing pipeline relies on this when it
/// seeks past the header of a stored block.
pub const HEADER_SIZE: usize = 80;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        sha256d(&encoding::encode(self))
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_block);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let prev_block = decoder.read_hash_le()?;
        let merkle_root = decoder.read_hash_le()?;
        let time = decoder.read_u32_le()?;
        let bits = decoder.read_u32_le()?;
        let nonce = decoder.read_u32_le()?;
        Ok(Self {
            version,
            prev_block,
            merkle_root,
            time,
            bits,
            nonce,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }
}

impl Encodable for Block {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.header.consensus_encode(encoder);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.consensus_encode(encoder);
        }
    }
}

impl Decodable for Block {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode(decoder)?;
        let count = decoder.read_varint()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut transactions = Vec::with_capacity(count);
        for _ in 0..count {
            transactions.push(Transaction::consensus_decode(decoder)?);
        }
        Ok(Self {
            header,
            transactions,
        })
    }
}
