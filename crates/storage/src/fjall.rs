use std::path::Path;

use fjall::{Batch, Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::{Column, KeyValueStore, PrefixVisitor, StoreError, WriteBatch, WriteOp};

#[derive(Clone, Copy, Debug, Default)]
pub struct FjallOptions {
    pub cache_bytes: Option<u64>,
}

/// Fjall keyspace with one partition per column. Batches commit
/// atomically across partitions.
pub struct FjallStore {
    keyspace: Keyspace,
    partitions: Vec<PartitionHandle>,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_options(path, FjallOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: FjallOptions,
    ) -> Result<Self, StoreError> {
        let mut config = Config::new(path);
        if let Some(bytes) = options.cache_bytes {
            config = config.cache_size(bytes);
        }
        let keyspace = config.open().map_err(map_err)?;
        let mut partitions = Vec::with_capacity(Column::ALL.len());
        for column in Column::ALL {
            let handle = keyspace
                .open_partition(column.as_str(), PartitionCreateOptions::default())
                .map_err(map_err)?;
            partitions.push(handle);
        }
        Ok(Self {
            keyspace,
            partitions,
        })
    }

    fn partition(&self, column: Column) -> &PartitionHandle {
        &self.partitions[column.index()]
    }
}

impl KeyValueStore for FjallStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.partition(column).get(key).map_err(map_err)?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.partition(column).insert(key, value).map_err(map_err)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.partition(column).remove(key).map_err(map_err)
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut results = Vec::new();
        for entry in self.partition(column).prefix(prefix) {
            let (key, value) = entry.map_err(map_err)?;
            results.push((key.to_vec(), value.to_vec()));
        }
        Ok(results)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        for entry in self.partition(column).prefix(prefix) {
            let (key, value) = entry.map_err(map_err)?;
            visitor(key.as_ref(), value.as_ref())?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut fjall_batch = Batch::with_capacity(self.keyspace.clone(), batch.len())
            .durability(Some(PersistMode::Buffer));
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    fjall_batch.insert(self.partition(*column), key.as_slice(), value.as_slice());
                }
                WriteOp::Delete { column, key } => {
                    fjall_batch.remove(self.partition(*column), key.as_slice());
                }
            }
        }
        fjall_batch.commit().map_err(map_err)
    }
}

fn map_err(err: fjall::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}
