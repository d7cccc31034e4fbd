use sha2::{Digest, Sha256};

use crate::Hash256;

pub fn sha256(data: &[u8]) -> Hash256 {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

pub fn sha256d(data: &[u8]) -> Hash256 {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(Sha256::digest(data)));
    out
}
