// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! File-backed message store.
//!
//! Owns the blob tree, its own header index (the messages this node
//! actually holds, as opposed to the local header cache's full known
//! set), the shard-sector admission gate, the WS handler registry and
//! the refresh loop that keeps both in step with the peer group.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::HeaderIndex;
use crate::client::PeerApi;
use crate::config::{NodeConfig, NODE_VERSION};
use crate::dto::{StatusNetworkResponse, StatusResponse, StatusStorageResponse};
use crate::error::{Result, StoreError};
use crate::header::unix_now;
use crate::kv::SledKv;
use crate::local_cache::LocalHeaderCache;
use crate::message::{blob_path, MessageFile};
use crate::peer_cache::PeerHeaderCache;
use crate::sector::ShardSector;
use crate::ws::WsRegistry;

pub struct MessageStore {
    store_dir: PathBuf,
    index: HeaderIndex,
    lhc: Arc<LocalHeaderCache>,
    sector: Mutex<ShardSector>,
    api: Arc<dyn PeerApi>,
    config: NodeConfig,
    registry: WsRegistry,
    fetch_permits: Arc<Semaphore>,
    /// Arrival-time watermark into the local header cache; sync only
    /// considers headers that appeared since the previous round.
    refresh_cursor: Mutex<u32>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl MessageStore {
    /// Open the store under `dir` and reconcile the blob tree with the
    /// index: orphan blobs are re-inserted, entries whose blob vanished
    /// are dropped.  The sector starts as the full ring (nothing is
    /// discarded at startup); narrow it afterwards with [`set_target`].
    ///
    /// [`set_target`]: MessageStore::set_target
    pub fn open(
        dir: impl AsRef<Path>,
        lhc: Arc<LocalHeaderCache>,
        start_bin: u16,
        api: Arc<dyn PeerApi>,
        config: NodeConfig,
    ) -> Result<Arc<Self>> {
        let dir = dir.as_ref();
        let store_dir = dir.join("store");
        std::fs::create_dir_all(&store_dir)?;
        std::fs::create_dir_all(&config.receive_dir)?;
        let kv = SledKv::open(dir.join("index"))?;
        let index = HeaderIndex::open(Arc::new(kv))?;
        let (shutdown, _) = watch::channel(false);
        let fetch_permits = Arc::new(Semaphore::new(config.fetch_concurrency.max(1)));

        let store = Arc::new(Self {
            store_dir,
            index,
            lhc,
            sector: Mutex::new(ShardSector::full(start_bin)),
            api,
            config,
            registry: WsRegistry::new(),
            fetch_permits,
            refresh_cursor: Mutex::new(0),
            refresh_task: Mutex::new(None),
            shutdown,
        });
        store.reconcile()?;
        info!(
            dir = %dir.display(),
            messages = store.index.count(),
            "opened message store"
        );
        Ok(store)
    }

    fn reconcile(&self) -> Result<()> {
        // pass 1: blobs on disk that the index does not know
        for fanout in std::fs::read_dir(&self.store_dir)? {
            let fanout = fanout?;
            if !fanout.file_type()?.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(fanout.path())? {
                let entry = entry?;
                let path = entry.path();
                let m = match MessageFile::ingest(&path) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(blob = %path.display(), %e, "unreadable blob, skipping");
                        continue;
                    }
                };
                if !self.index.contains(m.header.i_key())? {
                    match self.insert_file(&path) {
                        Ok(_) => debug!(blob = %path.display(), "recovered orphan blob"),
                        Err(StoreError::Duplicate) => {}
                        Err(e) => warn!(blob = %path.display(), %e, "orphan blob rejected"),
                    }
                }
            }
        }
        // pass 2: index entries whose blob vanished
        for cached in self.index.find_since(0)? {
            let path = blob_path(&self.store_dir, cached.header.i_key());
            if !path.exists() {
                self.index.remove(cached.header.i_key())?;
                debug!(i = %hex::encode(cached.header.i_key()), "dropped blobless entry");
            }
        }
        Ok(())
    }

    /// Replace the admission sector.  Takes effect for every subsequent
    /// insert and sync; already-stored blobs are left alone.
    pub fn set_target(&self, target: ShardSector) {
        *self.sector.lock().unwrap_or_else(|e| e.into_inner()) = target;
        info!(start = target.start, ring = target.ring, "sector target set");
    }

    pub fn current_target(&self) -> ShardSector {
        *self.sector.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn in_sector(&self, i: &[u8; 33]) -> bool {
        self.current_target().contains_i(i)
    }

    /// Insert a blob already sitting at its final (or staging) path.
    /// Out-of-sector blobs are unlinked and rejected; duplicates and
    /// expired headers are rejected without touching the file.  Returns
    /// the arrival time recorded for the header.
    pub fn insert_file(&self, path: impl AsRef<Path>) -> Result<u32> {
        let path = path.as_ref();
        let m = MessageFile::ingest(path)?;
        if !self.in_sector(m.header.i_key()) {
            let _ = std::fs::remove_file(path);
            return Err(StoreError::OutOfSector);
        }
        let now = unix_now();
        if !self.index.insert(&m.header, now)? {
            return Err(StoreError::Duplicate);
        }
        // advertise through the local cache; it may already know the header
        match self.lhc.insert(&m.header) {
            Ok(_) | Err(StoreError::Expired) => {}
            Err(e) => return Err(e),
        }
        Ok(now)
    }

    pub fn find_by_i(&self, i: &[u8; 33]) -> Result<Option<MessageFile>> {
        let Some(cached) = self.index.find_by_i(i)? else {
            return Ok(None);
        };
        let filepath = blob_path(&self.store_dir, i);
        if !filepath.exists() {
            return Ok(None);
        }
        Ok(Some(MessageFile {
            header: cached.header,
            servertime: cached.servertime,
            filepath,
        }))
    }

    /// Local lookup, then each peer in registry order: probe the header,
    /// pull the blob, promote it into the store.  Only identifiers the
    /// current sector admits are fetched.
    pub async fn find_or_fetch_by_i(&self, i: &[u8; 33]) -> Result<Option<MessageFile>> {
        if let Some(found) = self.find_by_i(i)? {
            return Ok(Some(found));
        }
        if !self.in_sector(i) {
            return Ok(None);
        }
        for peer in self.lhc.peers() {
            match self.api.get_header(peer.host(), peer.port(), i).await {
                Ok(Some(_)) => match self.fetch_blob(&peer, i).await {
                    Ok(found) => return Ok(Some(found)),
                    Err(e) => {
                        warn!(peer = %peer.key(), i = %hex::encode(i), %e, "blob fetch failed");
                    }
                },
                Ok(None) => {}
                Err(e) => debug!(peer = %peer.key(), %e, "header probe failed"),
            }
        }
        Ok(None)
    }

    async fn fetch_blob(
        &self,
        peer: &Arc<PeerHeaderCache>,
        i: &[u8; 33],
    ) -> Result<MessageFile> {
        let _permit = self
            .fetch_permits
            .acquire()
            .await
            .map_err(|_| StoreError::Transport("store is shutting down".into()))?;
        let bytes = self.api.get_message(peer.host(), peer.port(), i).await?;

        let staging = self.config.receive_dir.join(staging_name());
        tokio::fs::write(&staging, &bytes).await?;
        let mut m = match MessageFile::ingest(&staging) {
            Ok(m) => m,
            Err(e) => {
                let _ = std::fs::remove_file(&staging);
                return Err(e);
            }
        };
        if m.header.i_key() != i {
            let _ = std::fs::remove_file(&staging);
            return Err(StoreError::MalformedHeader(
                "peer served a blob for a different identifier".into(),
            ));
        }

        let dest = blob_path(&self.store_dir, i);
        m.promote(&dest)?;
        match self.insert_file(&dest) {
            Ok(servertime) => {
                m.servertime = servertime;
                Ok(m)
            }
            // lost a race with another fetch of the same blob
            Err(StoreError::Duplicate) => self.find_by_i(i)?.ok_or(StoreError::NotFound),
            Err(e) => Err(e),
        }
    }

    /// Messages that arrived at or after `since`, ascending by arrival.
    pub fn find_since(&self, since: u32) -> Result<Vec<MessageFile>> {
        let cached = self.index.find_since(since)?;
        Ok(cached
            .into_iter()
            .map(|c| {
                let filepath = blob_path(&self.store_dir, c.header.i_key());
                MessageFile {
                    header: c.header,
                    servertime: c.servertime,
                    filepath,
                }
            })
            .collect())
    }

    /// Parse a staged upload without inserting it.
    pub fn ingest(&self, path: impl AsRef<Path>) -> Result<MessageFile> {
        MessageFile::ingest(path)
    }

    /// Drop every message whose header expired by `now`, blobs included.
    pub fn evict_expired(&self, now: u32) -> Result<usize> {
        let evicted = self.index.expire(now)?;
        for i in &evicted {
            let path = blob_path(&self.store_dir, i);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(blob = %path.display(), %e, "failed to unlink expired blob");
                }
            }
        }
        Ok(evicted.len())
    }

    /// One sync round: refresh the header caches, evict expired
    /// messages, then pull every in-sector blob that appeared in the
    /// local header set since the previous round.  Downloads overlap but
    /// are bounded by the fetch semaphore.
    pub async fn sync(&self) {
        self.lhc.sync().await;

        let now = unix_now();
        match self.evict_expired(now) {
            Ok(0) => {}
            Ok(n) => info!(evicted = n, "expired messages"),
            Err(e) => warn!(%e, "message expiry sweep failed"),
        }

        let cursor = *self
            .refresh_cursor
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let candidates = match self.lhc.find_since(cursor) {
            Ok(c) => c,
            Err(e) => {
                warn!(%e, "header scan failed, skipping fetch round");
                return;
            }
        };

        let wanted: Vec<[u8; 33]> = candidates
            .into_iter()
            .map(|cached| *cached.header.i_key())
            .filter(|i| self.in_sector(i) && !self.index.contains(i).unwrap_or(false))
            .collect();
        let scheduled = wanted.len();
        futures_util::future::join_all(wanted.iter().map(|i| async move {
            if let Err(e) = self.find_or_fetch_by_i(i).await {
                debug!(i = %hex::encode(i), %e, "sync fetch failed");
            }
        }))
        .await;
        if scheduled > 0 {
            debug!(scheduled, "sync fetch round complete");
        }

        *self
            .refresh_cursor
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = now;
    }

    /// Start the background refresh loop: sync and peer discovery each
    /// run once per interval, offset by half an interval.
    pub fn spawn_refresh(self: Arc<Self>) {
        let store = Arc::clone(&self);
        let mut shutdown = self.shutdown.subscribe();
        let half = Duration::from_secs((self.config.refresh_interval_secs / 2).max(1));
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(half) => {}
                    _ = shutdown.changed() => break,
                }
                store.sync().await;
                tokio::select! {
                    _ = tokio::time::sleep(half) => {}
                    _ = shutdown.changed() => break,
                }
                store
                    .lhc
                    .discover_peers(&store.config.ext_host, store.config.msg_port)
                    .await;
                info!(
                    headers = store.lhc.count(),
                    messages = store.index.count(),
                    peers = store.lhc.peers().len(),
                    "refresh round"
                );
            }
        });
        *self
            .refresh_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            network: StatusNetworkResponse {
                host: self.config.ext_host.clone(),
                msg_port: self.config.msg_port,
                tok_port: self.config.tok_port,
            },
            pubkey: self.config.pubkey_hex.clone(),
            storage: StatusStorageResponse {
                headers: self.lhc.count(),
                messages: self.index.count(),
                maxfilesize: self.config.max_file_size,
                capacity: self.config.capacity,
                used: 0,
            },
            sector: self.current_target(),
            version: NODE_VERSION.to_string(),
        }
    }

    pub fn count(&self) -> u64 {
        self.index.count()
    }

    pub fn local_cache(&self) -> &Arc<LocalHeaderCache> {
        &self.lhc
    }

    pub fn peer_api(&self) -> &Arc<dyn PeerApi> {
        &self.api
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &WsRegistry {
        &self.registry
    }

    /// Staging path for a fresh upload.
    pub fn staging_path(&self) -> PathBuf {
        self.config.receive_dir.join(staging_name())
    }

    /// Canonical blob path for an identifier.
    pub fn blob_dest(&self, i: &[u8; 33]) -> PathBuf {
        blob_path(&self.store_dir, i)
    }

    /// Stop the refresh loop, close every WS handler, flush the caches.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let task = self
            .refresh_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.registry.disconnect_all();
        if let Err(e) = self.index.flush() {
            warn!(%e, "message index flush failed");
        }
        if let Err(e) = self.lhc.close() {
            warn!(%e, "header cache flush failed");
        }
    }
}

fn staging_name() -> String {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos().to_string())
        .unwrap_or_else(|_| "0".into())
}
