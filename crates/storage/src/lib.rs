//! Ordered key-value storage behind a backend-neutral trait.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    /// Script-keyed index entries plus the fingerprint seed singleton.
    AddrIndex,
    /// Framework records, currently only the sync marker.
    Meta,
}

impl Column {
    pub const ALL: [Column; 2] = [Column::AddrIndex, Column::Meta];

    pub const fn index(self) -> usize {
        match self {
            Column::AddrIndex => 0,
            Column::Meta => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Column::AddrIndex => "addr_index",
            Column::Meta => "meta",
        }
    }
}

#[derive(Clone, Debug)]
pub struct WriteKey(SmallVec<[u8; 64]>);

impl WriteKey {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl AsRef<[u8]> for WriteKey {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for WriteKey {
    fn from(value: Vec<u8>) -> Self {
        Self(SmallVec::from_vec(value))
    }
}

impl From<&[u8]> for WriteKey {
    fn from(value: &[u8]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

impl<const N: usize> From<[u8; N]> for WriteKey {
    fn from(value: [u8; N]) -> Self {
        Self(SmallVec::from_slice(&value))
    }
}

impl<const N: usize> From<&[u8; N]> for WriteKey {
    fn from(value: &[u8; N]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

#[derive(Clone, Debug)]
pub struct WriteValue(SmallVec<[u8; 64]>);

impl WriteValue {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl AsRef<[u8]> for WriteValue {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for WriteValue {
    fn from(value: Vec<u8>) -> Self {
        Self(SmallVec::from_vec(value))
    }
}

impl From<&[u8]> for WriteValue {
    fn from(value: &[u8]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

impl<const N: usize> From<[u8; N]> for WriteValue {
    fn from(value: [u8; N]) -> Self {
        Self(SmallVec::from_slice(&value))
    }
}

#[derive(Clone, Debug)]
pub enum WriteOp {
    Put {
        column: Column,
        key: WriteKey,
        value: WriteValue,
    },
    Delete {
        column: Column,
        key: WriteKey,
    },
}

/// Ordered set of mutations committed atomically by `write_batch`.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, column: Column, key: impl Into<WriteKey>, value: impl Into<WriteValue>) {
        self.ops.push(WriteOp::Put {
            column,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<WriteKey>) {
        self.ops.push(WriteOp::Delete {
            column,
            key: key.into(),
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

pub type ScanResult = Vec<(Vec<u8>, Vec<u8>)>;
pub type PrefixVisitor<'a> = dyn FnMut(&[u8], &[u8]) -> Result<(), StoreError> + 'a;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError>;
    /// Materializes every entry whose key starts with `prefix`, in key
    /// order, from a single consistent view of the column.
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError>;
    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError>;
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.as_ref().get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.as_ref().put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.as_ref().delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.as_ref().scan_prefix(column, prefix)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        self.as_ref().for_each_prefix(column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.as_ref().write_batch(batch)
    }
}
