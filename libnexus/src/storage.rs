// Copyright 2024 Google LLC
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

//! The storage adapter interface a [`crate::table::CachedTable`] persists
//! through, plus a reference in-memory/filesystem adapter good enough to
//! exercise every persistence semantic the table engine promises. A real
//! deployment would swap this out for a database-backed adapter; the core
//! only depends on the trait below.

use std::{
    collections::BTreeMap,
    fs,
    path::PathBuf,
    sync::Mutex,
};

use nexus_protocol::error::BusError;

/// An ordered `bytes -> bytes` mapping a [`crate::table::CachedTable`]
/// persists through. Every method may fail with [`BusError::Storage`]; the
/// table propagates that failure to the caller without firing listeners or
/// clearing the dirty flag (see the table engine's deferred-save docs for
/// why that matters).
///
/// Implementors must preserve insertion order for `fetch_items` to return
/// sane pagination -- a `BTreeMap` or similar sorted structure isn't enough
/// on its own, since table keys are opaque bytes with no meaningful
/// ordering of their own.
pub trait StorageAdapter: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BusError>;
    fn get_all(&self, keys: &[Vec<u8>]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, BusError>;
    fn set_all(&self, items: &[(Vec<u8>, Vec<u8>)]) -> Result<(), BusError>;
    fn remove_all(&self, keys: &[Vec<u8>]) -> Result<(), BusError>;
    fn clear(&self) -> Result<(), BusError>;
    /// Returns up to `before` items preceding `cursor` and up to `after`
    /// items from `cursor` onward, in insertion order. When `cursor` is
    /// `None`, `after` counts from the beginning of the sequence and
    /// `before` counts from the end.
    fn fetch_items(
        &self,
        before: u32,
        after: u32,
        cursor: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, BusError>;
    fn fetch_all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, BusError>;
    fn size(&self) -> Result<u64, BusError>;
    /// Flushes pending mutations to durable storage. Callers needing a
    /// stronger durability guarantee than the table engine's deferred save
    /// task provides should invoke this directly rather than relying on
    /// `mark_changed`'s background loop.
    fn store(&self) -> Result<(), BusError>;
}

/// Reference adapter: an ordered in-memory map, optionally mirrored to a
/// JSON file under a configured root directory on `store()`. Good enough to
/// exercise the table engine in tests and small deployments; not a claim
/// about what a production backend should look like.
pub struct FileBackedAdapter {
    // Preserves insertion order via a side `Vec` of keys; `BTreeMap` alone
    // would reorder by byte value, which would break insertion-order
    // pagination.
    order: Mutex<Vec<Vec<u8>>>,
    values: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    path: Option<PathBuf>,
}

impl FileBackedAdapter {
    /// `path`, when set, is the file this adapter mirrors its contents to
    /// on every `store()` call and loads from at construction.
    pub fn new(path: Option<PathBuf>) -> Result<FileBackedAdapter, BusError> {
        let mut order = Vec::new();
        let mut values = BTreeMap::new();
        if let Some(p) = &path {
            if p.exists() {
                let raw = fs::read(p).map_err(|e| BusError::Storage(format!("reading {:?}: {}", p, e)))?;
                let items: Vec<(Vec<u8>, Vec<u8>)> = serde_json::from_slice(&raw)
                    .map_err(|e| BusError::Storage(format!("parsing {:?}: {}", p, e)))?;
                for (k, v) in items {
                    order.push(k.clone());
                    values.insert(k, v);
                }
            }
        }
        Ok(FileBackedAdapter { order: Mutex::new(order), values: Mutex::new(values), path })
    }

    pub fn in_memory() -> FileBackedAdapter {
        FileBackedAdapter { order: Mutex::new(Vec::new()), values: Mutex::new(BTreeMap::new()), path: None }
    }
}

impl StorageAdapter for FileBackedAdapter {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BusError> {
        Ok(self.values.lock().expect("adapter lock poisoned").get(key).cloned())
    }

    fn get_all(&self, keys: &[Vec<u8>]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, BusError> {
        let values = self.values.lock().expect("adapter lock poisoned");
        Ok(keys.iter().filter_map(|k| values.get(k).map(|v| (k.clone(), v.clone()))).collect())
    }

    fn set_all(&self, items: &[(Vec<u8>, Vec<u8>)]) -> Result<(), BusError> {
        let mut order = self.order.lock().expect("adapter lock poisoned");
        let mut values = self.values.lock().expect("adapter lock poisoned");
        for (k, v) in items {
            if values.insert(k.clone(), v.clone()).is_none() {
                order.push(k.clone());
            }
        }
        Ok(())
    }

    fn remove_all(&self, keys: &[Vec<u8>]) -> Result<(), BusError> {
        let mut order = self.order.lock().expect("adapter lock poisoned");
        let mut values = self.values.lock().expect("adapter lock poisoned");
        for k in keys {
            values.remove(k);
        }
        order.retain(|k| values.contains_key(k));
        Ok(())
    }

    fn clear(&self) -> Result<(), BusError> {
        self.order.lock().expect("adapter lock poisoned").clear();
        self.values.lock().expect("adapter lock poisoned").clear();
        Ok(())
    }

    fn fetch_items(
        &self,
        before: u32,
        after: u32,
        cursor: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, BusError> {
        let order = self.order.lock().expect("adapter lock poisoned");
        let values = self.values.lock().expect("adapter lock poisoned");

        let anchor = match cursor {
            Some(key) => order.iter().position(|k| k.as_slice() == key),
            None => None,
        };

        let out: Vec<Vec<u8>> = match (cursor, anchor) {
            (Some(_), None) => Vec::new(),
            (Some(_), Some(idx)) => {
                let before_start = idx.saturating_sub(before as usize);
                let before_keys = order[before_start..idx].to_vec();
                let after_end = (idx + 1 + after as usize).min(order.len());
                let after_keys = order[(idx + 1)..after_end].to_vec();
                [before_keys, after_keys].concat()
            }
            (None, _) => {
                let after_end = (after as usize).min(order.len());
                let after_keys = order[..after_end].to_vec();
                let before_start = order.len().saturating_sub(before as usize);
                let before_keys = order[before_start..].to_vec();
                [after_keys, before_keys].concat()
            }
        };

        Ok(out.into_iter().filter_map(|k| values.get(&k).map(|v| (k.clone(), v.clone()))).collect())
    }

    fn fetch_all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, BusError> {
        let order = self.order.lock().expect("adapter lock poisoned");
        let values = self.values.lock().expect("adapter lock poisoned");
        Ok(order.iter().filter_map(|k| values.get(k).map(|v| (k.clone(), v.clone()))).collect())
    }

    fn size(&self) -> Result<u64, BusError> {
        Ok(self.values.lock().expect("adapter lock poisoned").len() as u64)
    }

    fn store(&self) -> Result<(), BusError> {
        let Some(path) = &self.path else { return Ok(()) };
        let order = self.order.lock().expect("adapter lock poisoned");
        let values = self.values.lock().expect("adapter lock poisoned");
        let items: Vec<(&Vec<u8>, &Vec<u8>)> =
            order.iter().filter_map(|k| values.get(k).map(|v| (k, v))).collect();
        let bytes = serde_json::to_vec(&items)
            .map_err(|e| BusError::Storage(format!("serializing table contents: {}", e)))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| BusError::Storage(format!("creating {:?}: {}", parent, e)))?;
        }
        fs::write(path, bytes).map_err(|e| BusError::Storage(format!("writing {:?}: {}", path, e)))
    }
}
