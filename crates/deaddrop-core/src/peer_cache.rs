// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Local mirror of one remote peer's advertised header set, fed by HTTP
//! pulls and WS pushes.  An insert returning `true` is the signal that
//! the header is news to that peer, which is what drives gossip fan-out.

use std::sync::{Arc, Mutex};

use crate::cache::HeaderIndex;
use crate::dto::{PeerItemResponse, StatusResponse};
use crate::error::Result;
use crate::header::{unix_now, MessageHeader};
use crate::kv::MemoryKv;

pub struct PeerHeaderCache {
    host: String,
    port: u16,
    index: HeaderIndex,
    status: Mutex<Option<StatusResponse>>,
    /// Remote clock minus ours, from the last time exchange.
    clock_skew: Mutex<i64>,
    /// Arrival-time watermark for `headers?since=` pulls.  Only advanced
    /// after a successful pull, so a transport failure retries the same
    /// window.
    last_seen: Mutex<u32>,
}

impl PeerHeaderCache {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            host: host.into(),
            port,
            index: HeaderIndex::open(Arc::new(MemoryKv::new()))?,
            status: Mutex::new(None),
            clock_skew: Mutex::new(0),
            last_seen: Mutex::new(0),
        }))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Registry key, `host:port`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn item(&self) -> PeerItemResponse {
        PeerItemResponse {
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// Record a header this peer advertised.  `true` means the peer had
    /// not shown it to us before.
    pub fn insert(&self, header: &MessageHeader) -> Result<bool> {
        self.index.insert(header, unix_now())
    }

    pub fn contains(&self, i: &[u8; 33]) -> Result<bool> {
        self.index.contains(i)
    }

    pub fn count(&self) -> u64 {
        self.index.count()
    }

    pub fn set_status(&self, status: StatusResponse) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = Some(status);
    }

    pub fn status(&self) -> Option<StatusResponse> {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Fold in the peer's reported clock against our own.
    pub fn observe_time(&self, reported: u32) {
        let skew = i64::from(reported) - i64::from(unix_now());
        *self.clock_skew.lock().unwrap_or_else(|e| e.into_inner()) = skew;
    }

    pub fn clock_skew(&self) -> i64 {
        *self.clock_skew.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn last_seen(&self) -> u32 {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn advance_last_seen(&self, stamp: u32) {
        let mut seen = self.last_seen.lock().unwrap_or_else(|e| e.into_inner());
        if stamp > *seen {
            *seen = stamp;
        }
    }

    /// Drop this peer's expired headers; the mirror follows the same
    /// lifetime rules as the local set.
    pub fn expire(&self) -> Result<usize> {
        Ok(self.index.expire(unix_now())?.len())
    }
}
