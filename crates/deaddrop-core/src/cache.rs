// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Four-way header index over one ordered KV.
//!
//! Every stored header owns four entries, one per subspace:
//!
//! - `D0 || BE32(time)       || I` → header bytes ++ BE32(servertime)
//! - `C0 || BE32(servertime) || I` → `I`             (arrival order)
//! - `E0 || BE32(expire)     || I` → `I`             (eviction order)
//! - `I0 || I`                     → full `D0` key   (presence / dedup)
//!
//! The two-byte ASCII prefixes keep the subspaces disjoint and ordered,
//! so every query is a prefix or range scan.  There is no multi-key
//! transaction underneath; the expiry sweep is idempotent and readers
//! treat a missing `D0` entry as a miss, which together compensate.

use std::sync::{Arc, Mutex};

use crate::error::{Result, StoreError};
use crate::header::MessageHeader;
use crate::kv::OrderedKv;

const PFX_DATE: &[u8; 2] = b"D0";
const PFX_ARRIVAL: &[u8; 2] = b"C0";
const PFX_EXPIRE: &[u8; 2] = b"E0";
const PFX_PRESENCE: &[u8; 2] = b"I0";

fn stamped_key(prefix: &[u8; 2], stamp: u32, i: &[u8; 33]) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + 4 + 33);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&stamp.to_be_bytes());
    key.extend_from_slice(i);
    key
}

fn presence_key(i: &[u8; 33]) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + 33);
    key.extend_from_slice(PFX_PRESENCE);
    key.extend_from_slice(i);
    key
}

/// `[prefix || BE32(stamp), limit)` bounds covering every key whose
/// stamp is `<= stamp`.
fn stamp_scan_bounds(prefix: &[u8; 2], stamp: u32) -> (Vec<u8>, Vec<u8>) {
    let start = prefix.to_vec();
    let limit = match stamp.checked_add(1) {
        Some(next) => {
            let mut k = prefix.to_vec();
            k.extend_from_slice(&next.to_be_bytes());
            k
        }
        None => subspace_end(prefix),
    };
    (start, limit)
}

fn subspace_end(prefix: &[u8; 2]) -> Vec<u8> {
    vec![prefix[0], prefix[1] + 1]
}

/// Header plus the arrival time this node first saw it.
#[derive(Debug, Clone)]
pub struct CachedHeader {
    pub header: MessageHeader,
    pub servertime: u32,
}

pub struct HeaderIndex {
    kv: Arc<dyn OrderedKv>,
    /// Guards the multi-key insert/remove paths and the running count.
    count: Mutex<u64>,
}

impl HeaderIndex {
    /// Open over an existing KV, recovering the count from the presence
    /// subspace.
    pub fn open(kv: Arc<dyn OrderedKv>) -> Result<Self> {
        let present = kv.scan(PFX_PRESENCE, &subspace_end(PFX_PRESENCE))?;
        Ok(Self {
            kv,
            count: Mutex::new(present.len() as u64),
        })
    }

    pub fn count(&self) -> u64 {
        *self.count.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a header first seen at `now`.  Returns `false` without
    /// touching the KV when `I` is already present; expired headers are
    /// rejected.
    pub fn insert(&self, header: &MessageHeader, now: u32) -> Result<bool> {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        let pk = presence_key(header.i_key());
        if self.kv.get(&pk)?.is_some() {
            return Ok(false);
        }
        if header.expire() <= now {
            return Err(StoreError::Expired);
        }

        let date_key = stamped_key(PFX_DATE, header.time(), header.i_key());
        let mut date_value = header.export_bytes();
        date_value.extend_from_slice(&now.to_be_bytes());

        self.kv.put(&date_key, &date_value)?;
        self.kv.put(
            &stamped_key(PFX_ARRIVAL, now, header.i_key()),
            header.i_key(),
        )?;
        self.kv.put(
            &stamped_key(PFX_EXPIRE, header.expire(), header.i_key()),
            header.i_key(),
        )?;
        self.kv.put(&pk, &date_key)?;
        *count += 1;
        Ok(true)
    }

    pub fn contains(&self, i: &[u8; 33]) -> Result<bool> {
        Ok(self.kv.get(&presence_key(i))?.is_some())
    }

    /// Presence lookup followed by the primary `D0` fetch.  A dangling
    /// presence entry (sweep caught mid-flight) reads as a miss.
    pub fn find_by_i(&self, i: &[u8; 33]) -> Result<Option<CachedHeader>> {
        let Some(date_key) = self.kv.get(&presence_key(i))? else {
            return Ok(None);
        };
        let Some(value) = self.kv.get(&date_key)? else {
            return Ok(None);
        };
        decode_date_value(&value).map(Some)
    }

    /// All headers that arrived at or after `since`, ascending by
    /// `(servertime, I)`.
    pub fn find_since(&self, since: u32) -> Result<Vec<CachedHeader>> {
        let mut start = PFX_ARRIVAL.to_vec();
        start.extend_from_slice(&since.to_be_bytes());
        let rows = self.kv.scan(&start, &subspace_end(PFX_ARRIVAL))?;
        let mut out = Vec::with_capacity(rows.len());
        for (_, value) in rows {
            let i = as_i(&value)?;
            if let Some(found) = self.find_by_i(&i)? {
                out.push(found);
            }
        }
        Ok(out)
    }

    /// Evict every header with `expire <= now`, removing all four
    /// entries per header.  Returns the evicted identifiers so the
    /// message store can unlink blobs.  Safe to re-run after a partial
    /// failure: whatever keys remain are removed on the next pass.
    pub fn expire(&self, now: u32) -> Result<Vec<[u8; 33]>> {
        let (start, limit) = stamp_scan_bounds(PFX_EXPIRE, now);
        let rows = self.kv.scan(&start, &limit)?;
        let mut evicted = Vec::new();
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        for (expire_key, value) in rows {
            let i = as_i(&value)?;
            let pk = presence_key(&i);
            let had_presence = match self.kv.get(&pk)? {
                Some(date_key) => {
                    if let Some(date_value) = self.kv.get(&date_key)? {
                        let cached = decode_date_value(&date_value)?;
                        self.kv
                            .delete(&stamped_key(PFX_ARRIVAL, cached.servertime, &i))?;
                    }
                    self.kv.delete(&date_key)?;
                    self.kv.delete(&pk)?;
                    true
                }
                None => false,
            };
            self.kv.delete(&expire_key)?;
            if had_presence {
                *count = count.saturating_sub(1);
                evicted.push(i);
            }
        }
        Ok(evicted)
    }

    /// Drop one header outright (store reconciliation of blobless
    /// entries).  Returns whether it was present.
    pub fn remove(&self, i: &[u8; 33]) -> Result<bool> {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        let pk = presence_key(i);
        let Some(date_key) = self.kv.get(&pk)? else {
            return Ok(false);
        };
        if let Some(date_value) = self.kv.get(&date_key)? {
            let cached = decode_date_value(&date_value)?;
            self.kv
                .delete(&stamped_key(PFX_ARRIVAL, cached.servertime, i))?;
            self.kv
                .delete(&stamped_key(PFX_EXPIRE, cached.header.expire(), i))?;
        }
        self.kv.delete(&date_key)?;
        self.kv.delete(&pk)?;
        *count = count.saturating_sub(1);
        Ok(true)
    }

    pub fn flush(&self) -> Result<()> {
        self.kv.flush()
    }
}

fn decode_date_value(value: &[u8]) -> Result<CachedHeader> {
    if value.len() < 4 {
        return Err(StoreError::Storage("truncated header record".into()));
    }
    let (bytes, stamp) = value.split_at(value.len() - 4);
    let header = MessageHeader::import_bytes(bytes)?;
    let servertime = u32::from_be_bytes([stamp[0], stamp[1], stamp[2], stamp[3]]);
    Ok(CachedHeader { header, servertime })
}

fn as_i(value: &[u8]) -> Result<[u8; 33]> {
    if value.len() != 33 {
        return Err(StoreError::Storage("index value is not an I key".into()));
    }
    let mut i = [0u8; 33];
    i.copy_from_slice(value);
    Ok(i)
}
