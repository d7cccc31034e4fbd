use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, PrefixVisitor, StoreError, WriteBatch, WriteOp};

type ColumnMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// BTreeMap-backed store, one ordered map per column. Used by tests and
/// by the in-memory database mode.
pub struct MemoryStore {
    columns: RwLock<[ColumnMap; Column::ALL.len()]>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            columns: RwLock::new(std::array::from_fn(|_| ColumnMap::new())),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn prefix_range<'a>(
    map: &'a ColumnMap,
    prefix: &'a [u8],
) -> impl Iterator<Item = (&'a Vec<u8>, &'a Vec<u8>)> {
    map.range(prefix.to_vec()..)
        .take_while(move |(key, _)| key.starts_with(prefix))
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let columns = self.columns.read().expect("memory store lock");
        Ok(columns[column.index()].get(key).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut columns = self.columns.write().expect("memory store lock");
        columns[column.index()].insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut columns = self.columns.write().expect("memory store lock");
        columns[column.index()].remove(key);
        Ok(())
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let columns = self.columns.read().expect("memory store lock");
        Ok(prefix_range(&columns[column.index()], prefix)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let columns = self.columns.read().expect("memory store lock");
        for (key, value) in prefix_range(&columns[column.index()], prefix) {
            visitor(key, value)?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut columns = self.columns.write().expect("memory store lock");
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    columns[column.index()]
                        .insert(key.as_slice().to_vec(), value.as_slice().to_vec());
                }
                WriteOp::Delete { column, key } => {
                    columns[column.index()].remove(key.as_slice());
                }
            }
        }
        Ok(())
    }
}
