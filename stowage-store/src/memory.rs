// Copyright 2026 stowage Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{collections::BTreeMap, ops::Bound, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use stowage_common::error::Result;

use crate::store::{BatchOp, KvStore, WriteBatch};

type Table = BTreeMap<Bytes, Bytes>;

/// An in-memory [`KvStore`] backed by an ordered map.
///
/// Clones and realm views share the same table. Realms are stored length-prefixed, so no realm is a key prefix of
/// another one.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    table: Arc<RwLock<Table>>,
    realm: Bytes,
    namespace: Bytes,
}

impl MemoryStore {
    /// Create an empty store with the default (empty) realm.
    pub fn new() -> Self {
        Self {
            table: Arc::default(),
            realm: Bytes::new(),
            namespace: Self::namespace(&[]),
        }
    }

    /// Number of entries across all realms.
    pub fn total_len(&self) -> usize {
        self.table.read().len()
    }

    fn namespace(realm: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(realm.len() + 4);
        buf.put_u32(realm.len() as u32);
        buf.put_slice(realm);
        buf.freeze()
    }

    fn full_key(&self, key: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.namespace.len() + key.len());
        buf.put_slice(&self.namespace);
        buf.put_slice(key);
        buf.freeze()
    }

    fn scan(&self, table: &Table, prefix: &[u8], f: &mut dyn FnMut(&Bytes, &Bytes) -> bool) {
        let start = self.full_key(prefix);
        for (k, v) in table.range::<Bytes, _>((Bound::Included(&start), Bound::Unbounded)) {
            if !k.starts_with(&start) {
                break;
            }
            if !f(k, v) {
                break;
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryStore {
    type Batch = MemoryBatch;

    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.table.read().get(&self.full_key(key)).cloned())
    }

    fn iterate(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8], &[u8]) -> bool) -> Result<()> {
        // Snapshot first so `f` may call back into the store.
        let mut entries = vec![];
        {
            let table = self.table.read();
            self.scan(&table, prefix, &mut |k, v| {
                entries.push((k.slice(self.namespace.len()..), v.clone()));
                true
            });
        }
        for (k, v) in entries {
            if !f(&k, &v) {
                break;
            }
        }
        Ok(())
    }

    fn delete_prefix(&self, prefix: &[u8]) -> Result<bool> {
        let mut table = self.table.write();
        let mut keys = vec![];
        self.scan(&table, prefix, &mut |k, _| {
            keys.push(k.clone());
            true
        });
        for key in keys.iter() {
            table.remove(key);
        }
        tracing::trace!(
            "[memory store]: delete prefix {} in realm {}, removed: {}",
            stowage_common::error::hex(prefix),
            stowage_common::error::hex(&self.realm),
            keys.len()
        );
        Ok(!keys.is_empty())
    }

    fn realm(&self) -> &Bytes {
        &self.realm
    }

    fn with_realm(&self, realm: impl Into<Bytes>) -> Self {
        let realm = realm.into();
        let namespace = Self::namespace(&realm);
        Self {
            table: self.table.clone(),
            realm,
            namespace,
        }
    }

    fn batched(&self) -> Self::Batch {
        MemoryBatch {
            store: self.clone(),
            ops: vec![],
        }
    }
}

/// Write batch of [`MemoryStore`], applied under one write lock.
#[derive(Debug)]
pub struct MemoryBatch {
    store: MemoryStore,
    ops: Vec<BatchOp>,
}

impl MemoryBatch {
    /// Staged operations, in staging order.
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

impl WriteBatch for MemoryBatch {
    fn set(&mut self, key: Bytes, value: Bytes) {
        self.ops.push(BatchOp::Set { key, value });
    }

    fn delete(&mut self, key: Bytes) {
        self.ops.push(BatchOp::Delete { key });
    }

    fn len(&self) -> usize {
        self.ops.len()
    }

    fn commit(self) -> Result<()> {
        let mut table = self.store.table.write();
        for op in self.ops {
            match op {
                BatchOp::Set { key, value } => {
                    table.insert(self.store.full_key(&key), value);
                }
                BatchOp::Delete { key } => {
                    table.remove(&self.store.full_key(&key));
                }
            }
        }
        Ok(())
    }
}
