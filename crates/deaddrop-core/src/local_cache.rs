// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! The node's authoritative header set, plus the peer registry and the
//! broadcast bus that fans newly inserted headers out to every connected
//! WS handler.

use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::{CachedHeader, HeaderIndex};
use crate::client::PeerApi;
use crate::dto::PeerItemResponse;
use crate::error::{Result, StoreError};
use crate::header::{unix_now, MessageHeader};
use crate::kv::SledKv;
use crate::peer_cache::PeerHeaderCache;

const BUS_CAPACITY: usize = 256;

pub struct LocalHeaderCache {
    index: HeaderIndex,
    /// Insertion-ordered: fetch walks must not depend on map iteration
    /// order.
    peers: Mutex<Vec<Arc<PeerHeaderCache>>>,
    bus: broadcast::Sender<MessageHeader>,
    api: Arc<dyn PeerApi>,
    opened_at: u32,
    last_refresh: Mutex<u32>,
}

impl LocalHeaderCache {
    /// Open (or create) the backing KV at `path`.  Reopening an existing
    /// directory recovers the header count from the presence subspace.
    pub fn open(path: impl AsRef<Path>, api: Arc<dyn PeerApi>) -> Result<Arc<Self>> {
        let kv = SledKv::open(path.as_ref())?;
        let index = HeaderIndex::open(Arc::new(kv))?;
        let now = unix_now();
        info!(
            path = %path.as_ref().display(),
            headers = index.count(),
            "opened local header cache"
        );
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Ok(Arc::new(Self {
            index,
            peers: Mutex::new(Vec::new()),
            bus,
            api,
            opened_at: now,
            last_refresh: Mutex::new(now),
        }))
    }

    /// Insert and, when the header is new, publish it on the bus.
    /// Duplicates return `false`; expired headers are rejected.
    pub fn insert(&self, header: &MessageHeader) -> Result<bool> {
        let inserted = self.index.insert(header, unix_now())?;
        if inserted {
            // nobody listening is fine; handlers subscribe on connect
            let _ = self.bus.send(header.clone());
        }
        Ok(inserted)
    }

    /// Subscribe to headers inserted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<MessageHeader> {
        self.bus.subscribe()
    }

    pub fn find_by_i(&self, i: &[u8; 33]) -> Result<Option<CachedHeader>> {
        self.index.find_by_i(i)
    }

    pub fn find_since(&self, since: u32) -> Result<Vec<CachedHeader>> {
        self.index.find_since(since)
    }

    pub fn count(&self) -> u64 {
        self.index.count()
    }

    pub fn server_time(&self) -> u32 {
        self.opened_at
    }

    pub fn last_refresh(&self) -> u32 {
        *self.last_refresh.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Idempotent: a second add of `host:port` returns the existing
    /// entry.
    pub fn add_peer(&self, host: &str, port: u16) -> Result<Arc<PeerHeaderCache>> {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = peers
            .iter()
            .find(|p| p.host() == host && p.port() == port)
        {
            return Ok(existing.clone());
        }
        let peer = PeerHeaderCache::new(host, port)?;
        info!(peer = %peer.key(), "added peer");
        peers.push(peer.clone());
        Ok(peer)
    }

    pub fn find_peer(&self, host: &str, port: u16) -> Option<Arc<PeerHeaderCache>> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|p| p.host() == host && p.port() == port)
            .cloned()
    }

    pub fn peers(&self) -> Vec<Arc<PeerHeaderCache>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn list_peers(&self) -> Vec<PeerItemResponse> {
        self.peers().iter().map(|p| p.item()).collect()
    }

    /// One refresh round: expiry sweep, then pull every peer's headers
    /// since its watermark into the local set.  Peer failures degrade
    /// gracefully — the watermark stays put and the window is retried
    /// next round.
    pub async fn sync(&self) {
        let now = unix_now();
        match self.index.expire(now) {
            Ok(evicted) if !evicted.is_empty() => {
                info!(evicted = evicted.len(), "expired headers")
            }
            Ok(_) => {}
            Err(e) => warn!(%e, "header expiry sweep failed"),
        }

        for peer in self.peers() {
            if let Err(e) = self.pull_peer(&peer).await {
                warn!(peer = %peer.key(), %e, "peer header pull failed");
            }
            if let Err(e) = peer.expire() {
                warn!(peer = %peer.key(), %e, "peer mirror sweep failed");
            }
        }

        *self.last_refresh.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    async fn pull_peer(&self, peer: &Arc<PeerHeaderCache>) -> Result<()> {
        let pull_started = unix_now();
        let headers = self
            .api
            .get_headers_since(peer.host(), peer.port(), peer.last_seen())
            .await?;
        let mut merged = 0usize;
        for header in &headers {
            match peer.insert(header) {
                Ok(_) => {}
                Err(StoreError::Expired) => continue,
                Err(e) => return Err(e),
            }
            match self.insert(header) {
                Ok(true) => merged += 1,
                Ok(false) | Err(StoreError::Expired) => {}
                Err(e) => return Err(e),
            }
        }
        peer.advance_last_seen(pull_started);
        debug!(
            peer = %peer.key(),
            pulled = headers.len(),
            merged,
            "peer header pull"
        );
        Ok(())
    }

    /// Peer-list gossip: advertise our own coordinates to every peer and
    /// adopt any peers they advertise that we do not know yet.
    pub async fn discover_peers(&self, my_host: &str, my_port: u16) {
        let me = PeerItemResponse {
            host: my_host.to_string(),
            port: my_port,
        };
        for peer in self.peers() {
            if !my_host.is_empty() {
                if let Err(e) = self.api.post_peer(peer.host(), peer.port(), &me).await {
                    debug!(peer = %peer.key(), %e, "peer announce failed");
                }
            }
            match self.api.get_peers(peer.host(), peer.port()).await {
                Ok(items) => {
                    for item in items {
                        if item.host == my_host && item.port == my_port {
                            continue;
                        }
                        if let Err(e) = self.add_peer(&item.host, item.port) {
                            warn!(peer = %item.host, %e, "adopting gossiped peer failed");
                        }
                    }
                }
                Err(e) => debug!(peer = %peer.key(), %e, "peer list pull failed"),
            }
        }
    }

    pub fn close(&self) -> Result<()> {
        self.index.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testutil::StaticPeerApi;
    use crate::header::testutil::random_header;

    fn open_cache(dir: &Path, api: Arc<dyn PeerApi>) -> Arc<LocalHeaderCache> {
        LocalHeaderCache::open(dir, api).expect("open cache")
    }

    #[test]
    fn insert_publishes_on_bus_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = open_cache(dir.path(), Arc::new(StaticPeerApi::default()));
        let mut rx = cache.subscribe();

        let h = random_header(10, u32::MAX);
        assert!(cache.insert(&h).expect("insert"));
        assert!(!cache.insert(&h).expect("duplicate"));

        let seen = rx.try_recv().expect("bus event");
        assert_eq!(seen, h);
        assert!(rx.try_recv().is_err(), "duplicate must not re-publish");
    }

    #[test]
    fn add_peer_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = open_cache(dir.path(), Arc::new(StaticPeerApi::default()));
        let a = cache.add_peer("peer.example", 8080).expect("add");
        let b = cache.add_peer("peer.example", 8080).expect("add again");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.peers().len(), 1);
        cache.add_peer("peer.example", 8081).expect("other port");
        assert_eq!(cache.peers().len(), 2);
    }

    #[test]
    fn reopen_recovers_count() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let cache = open_cache(dir.path(), Arc::new(StaticPeerApi::default()));
            cache.insert(&random_header(1, u32::MAX)).expect("one");
            cache.insert(&random_header(2, u32::MAX)).expect("two");
            cache.close().expect("close");
        }
        let cache = open_cache(dir.path(), Arc::new(StaticPeerApi::default()));
        assert_eq!(cache.count(), 2);
    }

    #[tokio::test]
    async fn sync_merges_peer_headers_and_advances_watermark() {
        let dir = tempfile::tempdir().expect("tempdir");
        let api = Arc::new(StaticPeerApi::default());
        let h1 = random_header(10, u32::MAX);
        let h2 = random_header(20, u32::MAX);
        api.set_headers(vec![h1.clone(), h2.clone()]);

        let cache = open_cache(dir.path(), api.clone());
        let peer = cache.add_peer("peer.example", 8080).expect("add");

        cache.sync().await;
        assert_eq!(cache.count(), 2);
        assert!(cache.find_by_i(h1.i_key()).expect("find").is_some());
        assert!(peer.contains(h2.i_key()).expect("peer mirror"));
        assert!(peer.last_seen() > 0);

        // failed pull leaves the watermark untouched
        let mark = peer.last_seen();
        api.fail_pulls(true);
        cache.sync().await;
        assert_eq!(peer.last_seen(), mark);
    }

    #[tokio::test]
    async fn discover_adopts_gossiped_peers_but_not_self() {
        let dir = tempfile::tempdir().expect("tempdir");
        let api = Arc::new(StaticPeerApi::default());
        api.set_peers(vec![
            PeerItemResponse {
                host: "third.example".into(),
                port: 8080,
            },
            PeerItemResponse {
                host: "me.example".into(),
                port: 9000,
            },
        ]);
        let cache = open_cache(dir.path(), api.clone());
        cache.add_peer("peer.example", 8080).expect("seed peer");

        cache.discover_peers("me.example", 9000).await;
        let keys: Vec<String> = cache.peers().iter().map(|p| p.key()).collect();
        assert!(keys.contains(&"third.example:8080".to_string()));
        assert!(!keys.contains(&"me.example:9000".to_string()));
        assert_eq!(api.announced(), 1);
    }
}
