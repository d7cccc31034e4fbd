//! Consensus primitives: serialization, hashes, transactions, blocks.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod transaction;

pub type Hash256 = [u8; 32];
