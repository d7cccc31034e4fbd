//! Script-keyed transaction index over an ordered key-value store.

pub mod addrindex;
pub mod coins;
pub mod error;
pub mod fingerprint;
pub mod flatfiles;
pub mod keys;
pub mod undo;
pub mod worker;

pub use addrindex::{AddrIndex, IndexOptions, ScriptHistory, ScriptMatch};
pub use error::IndexError;
