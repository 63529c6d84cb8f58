// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Byte-ordered key-value adapter.
//!
//! The header caches need exactly four operations: point get/put/delete
//! and an ascending range scan.  `SledKv` is the durable backend; the
//! `BTreeMap`-backed `MemoryKv` serves tests and the per-peer mirror
//! caches, which are rebuilt from gossip on every start anyway.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{Result, StoreError};

pub trait OrderedKv: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn delete(&self, key: &[u8]) -> Result<()>;
    /// All pairs with `start <= key < limit`, ascending by key bytes.
    fn scan(&self, start: &[u8], limit: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
    /// Make prior writes durable.
    fn flush(&self) -> Result<()>;
}

pub struct SledKv {
    db: sled::Db,
}

impl SledKv {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        Ok(Self { db })
    }
}

impl OrderedKv for SledKv {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.remove(key)?;
        Ok(())
    }

    fn scan(&self, start: &[u8], limit: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.db.range(start..limit) {
            let (k, v) = item?;
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryKv {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OrderedKv for MemoryKv {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map
            .lock()
            .map_err(|_| StoreError::Storage("kv lock poisoned".into()))?
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .map
            .lock()
            .map_err(|_| StoreError::Storage("kv lock poisoned".into()))?
            .get(key)
            .cloned())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.map
            .lock()
            .map_err(|_| StoreError::Storage("kv lock poisoned".into()))?
            .remove(key);
        Ok(())
    }

    fn scan(&self, start: &[u8], limit: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self
            .map
            .lock()
            .map_err(|_| StoreError::Storage("kv lock poisoned".into()))?;
        Ok(map
            .range((Bound::Included(start.to_vec()), Bound::Excluded(limit.to_vec())))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(kv: &dyn OrderedKv) {
        kv.put(b"b1", b"one").expect("put");
        kv.put(b"a9", b"zero").expect("put");
        kv.put(b"b3", b"three").expect("put");
        kv.put(b"c0", b"four").expect("put");

        assert_eq!(kv.get(b"b1").expect("get"), Some(b"one".to_vec()));
        assert_eq!(kv.get(b"zz").expect("get"), None);

        let range = kv.scan(b"b", b"c").expect("scan");
        assert_eq!(
            range,
            vec![
                (b"b1".to_vec(), b"one".to_vec()),
                (b"b3".to_vec(), b"three".to_vec()),
            ]
        );

        kv.delete(b"b1").expect("delete");
        assert_eq!(kv.get(b"b1").expect("get"), None);
        assert_eq!(kv.scan(b"b", b"c").expect("scan").len(), 1);
    }

    #[test]
    fn memory_kv_orders_scans() {
        exercise(&MemoryKv::new());
    }

    #[test]
    fn sled_kv_orders_scans_and_reopens() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let kv = SledKv::open(dir.path()).expect("open");
            exercise(&kv);
            kv.flush().expect("flush");
        }
        let kv = SledKv::open(dir.path()).expect("reopen");
        assert_eq!(kv.get(b"b3").expect("get"), Some(b"three".to_vec()));
    }
}
